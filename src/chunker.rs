use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Lines per chunk.
pub const CHUNK_LINES: usize = 40;

/// Lines of overlap between consecutive chunks, preserving semantic
/// continuity across chunk boundaries.
pub const CHUNK_OVERLAP: usize = 8;

/// A contiguous slice of a committed file, the unit of embedding and upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Repository-relative path of the owning file.
    pub path: String,
    /// 1-based first line of the slice.
    pub start_line: u32,
    /// Slice text, lines joined with `\n`.
    pub content: String,
    /// Content-addressed id: hex SHA-256 over (path, start_line, content).
    pub id: String,
    /// Git object hash of the committed file version this slice came from.
    pub blob_id: String,
}

impl Chunk {
    pub fn line_count(&self) -> usize {
        self.content.split('\n').count()
    }
}

/// Stable chunk id: a pure function of (path, start_line, content).
/// NUL separators keep `("a", 12)` and `("a1", 2)` from colliding.
pub fn chunk_id(path: &str, start_line: u32, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(start_line.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct Chunker {
    pub chunk_lines: usize,
    pub chunk_overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_lines: CHUNK_LINES,
            chunk_overlap: CHUNK_OVERLAP,
        }
    }
}

impl Chunker {
    pub fn new(chunk_lines: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_lines: chunk_lines.max(1),
            chunk_overlap,
        }
    }

    /// Decode a raw blob and split it into overlapping chunks.
    ///
    /// Blobs containing a NUL byte are treated as binary and rejected with
    /// `UnreadableBlob`; any other invalid UTF-8 decodes lossily (U+FFFD)
    /// before hashing, so ids stay stable across runs and platforms.
    pub fn chunk_blob(&self, path: &str, blob_id: &str, bytes: &[u8]) -> Result<Vec<Chunk>> {
        if bytes.contains(&0) {
            return Err(Error::UnreadableBlob(path.to_string()));
        }
        let text = String::from_utf8_lossy(bytes);
        Ok(self.chunk_text(path, blob_id, &text))
    }

    /// Split decoded text into chunks of at most `chunk_lines` lines with
    /// `chunk_overlap` lines of overlap. Trailing blank lines are retained;
    /// empty text produces zero chunks.
    pub fn chunk_text(&self, path: &str, blob_id: &str, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        // split('\n') keeps trailing blank lines, unlike str::lines().
        let lines: Vec<&str> = text.split('\n').collect();
        let stride = self.chunk_lines.saturating_sub(self.chunk_overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + self.chunk_lines).min(lines.len());
            let content = lines[start..end].join("\n");
            let start_line = (start + 1) as u32;
            chunks.push(Chunk {
                path: path.to_string(),
                start_line,
                id: chunk_id(path, start_line, &content),
                content,
                blob_id: blob_id.to_string(),
            });
            if end >= lines.len() {
                break;
            }
            start += stride;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(n: usize) -> String {
        (1..=n).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn id_is_pure_function_of_inputs() {
        let a = chunk_id("src/a.rs", 1, "fn main() {}");
        let b = chunk_id("src/a.rs", 1, "fn main() {}");
        assert_eq!(a, b);
        assert_ne!(a, chunk_id("src/b.rs", 1, "fn main() {}"));
        assert_ne!(a, chunk_id("src/a.rs", 2, "fn main() {}"));
        assert_ne!(a, chunk_id("src/a.rs", 1, "fn main() { }"));
    }

    #[test]
    fn repeated_chunking_yields_identical_ids() {
        let chunker = Chunker::default();
        let text = text_of(100);
        let first = chunker.chunk_text("src/a.rs", "blob1", &text);
        let second = chunker.chunk_text("src/a.rs", "blob1", &text);
        let ids: Vec<_> = first.iter().map(|c| &c.id).collect();
        let ids2: Vec<_> = second.iter().map(|c| &c.id).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn small_file_is_a_single_chunk() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk_text("a.rs", "b", &text_of(5));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].line_count(), 5);
    }

    #[test]
    fn empty_blob_produces_zero_chunks() {
        let chunker = Chunker::default();
        assert!(chunker.chunk_text("a.rs", "b", "").is_empty());
        assert!(chunker.chunk_blob("a.rs", "b", b"").unwrap().is_empty());
    }

    #[test]
    fn chunks_overlap_by_configured_stride() {
        let chunker = Chunker::new(40, 8);
        let chunks = chunker.chunk_text("a.rs", "b", &text_of(100));
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[1].start_line, 33); // stride = 40 - 8
        assert_eq!(chunks[2].start_line, 65);
        // Last chunk reaches the final line
        let last = chunks.last().unwrap();
        assert_eq!(
            last.start_line as usize + last.line_count() - 1,
            100
        );
    }

    #[test]
    fn single_line_chunks_degenerate_safely() {
        let chunker = Chunker::new(1, 0);
        let chunks = chunker.chunk_text("a.rs", "b", &text_of(4));
        assert_eq!(chunks.len(), 4);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.start_line as usize, i + 1);
            assert_eq!(chunk.line_count(), 1);
        }
        // Overlap >= chunk size must still advance
        let chunker = Chunker::new(1, 8);
        assert_eq!(chunker.chunk_text("a.rs", "b", &text_of(3)).len(), 3);
    }

    #[test]
    fn trailing_blank_lines_are_retained() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk_text("a.rs", "b", "one\ntwo\n\n");
        assert_eq!(chunks[0].line_count(), 4);
    }

    #[test]
    fn nul_byte_is_unreadable() {
        let chunker = Chunker::default();
        let err = chunker.chunk_blob("bin/tool", "b", b"ab\x00cd").unwrap_err();
        assert_eq!(err.kind(), "UnreadableBlob");
    }

    #[test]
    fn invalid_utf8_decodes_lossily_and_stays_stable() {
        let chunker = Chunker::default();
        let bytes = b"caf\xe9\nnext line";
        let a = chunker.chunk_blob("a.rs", "b", bytes).unwrap();
        let b = chunker.chunk_blob("a.rs", "b", bytes).unwrap();
        assert_eq!(a[0].id, b[0].id);
        assert!(a[0].content.contains('\u{FFFD}'));
    }
}
