//! Regex source: a line-indexed in-memory corpus plus an external matcher.
//!
//! The corpus maps `(path, line)` to line text. Matching is delegated
//! through the [`LineMatcher`] seam, which receives the query pattern and
//! the flattened corpus as `<path>:<line>:<content>` lines; matches parse
//! back into hits with score 1.0.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use tracing::debug;

use crate::chunker::Chunk;
use crate::error::{Error, Result};
use crate::sources::{Hit, IndexSource, SourceKind};

/// External matcher seam. The engine only ever hands it a pattern and the
/// flattened corpus; anything that can grep lines can sit behind this.
pub trait LineMatcher: Send + Sync {
    /// Return the subset of `lines` matching `pattern`, in input order.
    fn find_matches(&self, pattern: &str, lines: &[String]) -> Result<Vec<String>>;
}

/// Default matcher backed by the `regex` crate. The pattern is applied to
/// the content field only, so path components never produce false hits.
pub struct RegexMatcher;

impl LineMatcher for RegexMatcher {
    fn find_matches(&self, pattern: &str, lines: &[String]) -> Result<Vec<String>> {
        let re = Regex::new(pattern).map_err(|e| Error::InvalidRegex(e.to_string()))?;
        Ok(lines
            .iter()
            .filter(|line| {
                let content = line
                    .splitn(3, ':')
                    .nth(2)
                    .unwrap_or(line.as_str());
                re.is_match(content)
            })
            .cloned()
            .collect())
    }
}

/// (path, first line, line count) covered by one upserted chunk.
type ChunkSpan = (String, u32, u32);

pub struct RegexSource {
    /// path -> line number -> line text. BTreeMaps keep the flattened
    /// corpus (and therefore match order) deterministic.
    corpus: BTreeMap<String, BTreeMap<u32, String>>,
    spans: HashMap<String, ChunkSpan>,
    matcher: Box<dyn LineMatcher>,
}

impl Default for RegexSource {
    fn default() -> Self {
        Self::new(Box::new(RegexMatcher))
    }
}

impl RegexSource {
    pub fn new(matcher: Box<dyn LineMatcher>) -> Self {
        Self {
            corpus: BTreeMap::new(),
            spans: HashMap::new(),
            matcher,
        }
    }

    /// Drop a whole file from the corpus.
    pub fn purge_path(&mut self, path: &str) {
        self.corpus.remove(path);
        self.spans.retain(|_, (span_path, _, _)| span_path != path);
    }

    pub fn line_text(&self, path: &str, line: u32) -> Option<&str> {
        self.corpus
            .get(path)
            .and_then(|lines| lines.get(&line))
            .map(String::as_str)
    }

    /// Highest line number known for a path (context expansion clips here).
    pub fn last_line(&self, path: &str) -> Option<u32> {
        self.corpus
            .get(path)
            .and_then(|lines| lines.keys().next_back().copied())
    }

    pub fn path_count(&self) -> usize {
        self.corpus.len()
    }

    fn flattened(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (path, file_lines) in &self.corpus {
            for (line_no, text) in file_lines {
                lines.push(format!("{}:{}:{}", path, line_no, text));
            }
        }
        lines
    }
}

impl IndexSource for RegexSource {
    fn upsert(&mut self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            let file_lines = self.corpus.entry(chunk.path.clone()).or_default();
            let mut count = 0u32;
            for (offset, line) in chunk.content.split('\n').enumerate() {
                file_lines.insert(chunk.start_line + offset as u32, line.to_string());
                count += 1;
            }
            self.spans.insert(
                chunk.id.clone(),
                (chunk.path.clone(), chunk.start_line, count),
            );
        }
        Ok(())
    }

    fn query(&self, text: &str, limit: usize) -> Result<Vec<Hit>> {
        let pattern = build_pattern(text);
        let flattened = self.flattened();
        let matches = self.matcher.find_matches(&pattern, &flattened)?;

        let mut hits = Vec::new();
        for matched in matches {
            let Some((path, line)) = parse_match_line(&matched) else {
                debug!("Unparsable matcher output line: {}", matched);
                continue;
            };
            hits.push(Hit {
                path,
                line,
                score: 1.0,
                source: SourceKind::Regex,
            });
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    fn delete(&mut self, chunk_ids: &[String]) -> Result<()> {
        for chunk_id in chunk_ids {
            let Some((path, start, count)) = self.spans.remove(chunk_id) else {
                continue;
            };
            // Overlapping chunks share lines; only drop lines no surviving
            // chunk of the same file still covers.
            let still_covered = |line: u32| {
                self.spans.values().any(|(p, s, c)| {
                    *p == path && *s <= line && line < s + c
                })
            };
            if let Some(file_lines) = self.corpus.get_mut(&path) {
                for line in start..start + count {
                    if !still_covered(line) {
                        file_lines.remove(&line);
                    }
                }
                if file_lines.is_empty() {
                    self.corpus.remove(&path);
                }
            }
        }
        Ok(())
    }
}

impl crate::merge::LineProvider for RegexSource {
    fn line_text(&self, path: &str, line: u32) -> Option<&str> {
        RegexSource::line_text(self, path, line)
    }

    fn last_line(&self, path: &str) -> Option<u32> {
        RegexSource::last_line(self, path)
    }
}

/// Word queries (alphanumerics and spaces only) become a tokenized regex
/// with word boundaries: every token, in order, on one line. Anything else
/// is passed through as a regex.
fn build_pattern(text: &str) -> String {
    let is_word_query = !text.trim().is_empty()
        && text.chars().all(|c| c.is_alphanumeric() || c == ' ');
    if !is_word_query {
        return text.to_string();
    }
    text.split_whitespace()
        .map(|token| format!(r"\b{}\b", regex::escape(token)))
        .collect::<Vec<_>>()
        .join(".*?")
}

/// Parse one `<path>:<line>:<content>` matcher line back into (path, line).
fn parse_match_line(line: &str) -> Option<(String, u32)> {
    let mut parts = line.splitn(3, ':');
    let path = parts.next()?;
    let line_no = parts.next()?.parse::<u32>().ok()?;
    parts.next()?;
    Some((path.to_string(), line_no))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_id;

    fn chunk(path: &str, start: u32, content: &str) -> Chunk {
        Chunk {
            path: path.to_string(),
            start_line: start,
            id: chunk_id(path, start, content),
            content: content.to_string(),
            blob_id: "blob".to_string(),
        }
    }

    fn seeded() -> RegexSource {
        let mut source = RegexSource::default();
        source
            .upsert(&[
                chunk("src/auth.rs", 1, "fn login() {\n    check_password();\n}"),
                chunk("src/db.rs", 10, "fn connect() {\n    open_pool();\n}"),
            ])
            .unwrap();
        source
    }

    #[test]
    fn word_query_matches_with_boundaries() {
        let source = seeded();
        let hits = source.query("login", 100).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/auth.rs");
        assert_eq!(hits[0].line, 1);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[0].source, SourceKind::Regex);

        // "log" must not match inside "login"
        assert!(source.query("log", 100).unwrap().is_empty());
    }

    #[test]
    fn multi_word_query_requires_all_tokens_in_order() {
        let mut source = RegexSource::default();
        source
            .upsert(&[chunk("a.rs", 1, "let pool = open_pool(db, retries);")])
            .unwrap();
        assert_eq!(source.query("pool retries", 100).unwrap().len(), 1);
        assert!(source.query("retries pool", 100).unwrap().is_empty());
    }

    #[test]
    fn regex_query_passes_through() {
        let source = seeded();
        let hits = source.query(r"fn \w+\(\)", 100).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn invalid_regex_is_reported() {
        let source = seeded();
        let err = source.query("foo[", 100).unwrap_err();
        assert_eq!(err.kind(), "InvalidRegex");
    }

    #[test]
    fn pattern_does_not_match_path_components() {
        let source = seeded();
        // "auth" appears only in the path of src/auth.rs, never in content.
        assert!(source.query("auth", 100).unwrap().is_empty());
    }

    #[test]
    fn content_with_colons_parses_back() {
        let mut source = RegexSource::default();
        source
            .upsert(&[chunk("a.rs", 7, "let url = \"http://host:8080\";")])
            .unwrap();
        let hits = source.query("8080", 100).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 7);
    }

    #[test]
    fn upsert_patches_and_purge_removes() {
        let mut source = seeded();
        source
            .upsert(&[chunk("src/auth.rs", 1, "fn signin() {\n    noop();\n}")])
            .unwrap();
        assert_eq!(source.line_text("src/auth.rs", 1), Some("fn signin() {"));

        source.purge_path("src/auth.rs");
        assert!(source.line_text("src/auth.rs", 1).is_none());
        assert_eq!(source.path_count(), 1);
    }

    #[test]
    fn delete_respects_overlapping_spans() {
        let mut source = RegexSource::default();
        let a = chunk("a.rs", 1, "one\ntwo\nthree");
        let b = chunk("a.rs", 3, "three\nfour");
        source.upsert(&[a.clone(), b]).unwrap();

        source.delete(&[a.id.clone()]).unwrap();
        // Lines 1-2 belonged only to chunk a; line 3 is still covered by b.
        assert!(source.line_text("a.rs", 1).is_none());
        assert!(source.line_text("a.rs", 2).is_none());
        assert_eq!(source.line_text("a.rs", 3), Some("three"));
        assert_eq!(source.line_text("a.rs", 4), Some("four"));
    }

    #[test]
    fn line_lookup_serves_context() {
        let source = seeded();
        assert_eq!(source.line_text("src/db.rs", 11), Some("    open_pool();"));
        assert_eq!(source.last_line("src/db.rs"), Some(12));
    }
}
