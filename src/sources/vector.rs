//! Vector source: adapter over the embedding database.
//!
//! Batched upsert of chunks keyed by chunk id, nearest-neighbor query with
//! staleness filtering by blob id, and its own on-disk directory under the
//! cache dir (HNSW index file + JSON metadata sidecar).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::chunker::Chunk;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::sources::{Hit, IndexSource, SourceKind};

/// Attempts per backend call before surfacing `BackendUnavailable`.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between retries.
const RETRY_BASE_DELAY_MS: u64 = 100;

const INDEX_FILE: &str = "index.usearch";
const META_FILE: &str = "metadata.json";

/// Metadata stored alongside each vector key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    chunk_id: String,
    path: String,
    start_line: u32,
    blob_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaSidecar {
    records: HashMap<u64, ChunkRecord>,
    next_key: u64,
}

pub struct VectorSource {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    index: usearch::Index,
    records: HashMap<u64, ChunkRecord>,
    keys_by_chunk: HashMap<String, u64>,
    next_key: u64,
    /// Current blob id per tracked path, pushed by the engine after each
    /// scan. Hits whose stored blob id differs are stale and dropped.
    current_blobs: HashMap<String, String>,
    /// On-disk directory; `None` keeps the source memory-only.
    dir: Option<PathBuf>,
}

impl VectorSource {
    /// Open (or create) a persistent vector source under `dir`.
    pub fn open(dir: PathBuf, embedder: Arc<dyn Embedder>, batch_size: usize) -> Result<Self> {
        let mut source = Self::build(Some(dir), embedder, batch_size)?;
        source.load()?;
        Ok(source)
    }

    /// A memory-only source (tests, throwaway engines).
    pub fn in_memory(embedder: Arc<dyn Embedder>, batch_size: usize) -> Result<Self> {
        Self::build(None, embedder, batch_size)
    }

    fn build(
        dir: Option<PathBuf>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Result<Self> {
        let options = IndexOptions {
            dimensions: embedder.dimensions(),
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = usearch::Index::new(&options)
            .map_err(|e| Error::BackendUnavailable(format!("vector index: {}", e)))?;
        index
            .reserve(65_536)
            .map_err(|e| Error::BackendUnavailable(format!("vector index reserve: {}", e)))?;
        Ok(Self {
            embedder,
            batch_size: batch_size.max(1),
            index,
            records: HashMap::new(),
            keys_by_chunk: HashMap::new(),
            next_key: 0,
            current_blobs: HashMap::new(),
            dir,
        })
    }

    fn load(&mut self) -> Result<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        let index_path = dir.join(INDEX_FILE);
        let meta_path = dir.join(META_FILE);
        if !index_path.exists() || !meta_path.exists() {
            return Ok(());
        }
        if let Err(e) = self.index.load(index_path.to_string_lossy().as_ref()) {
            warn!("Failed to load vector index, rebuilding: {}", e);
            return Ok(());
        }
        let sidecar: MetaSidecar = match std::fs::read_to_string(&meta_path)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
        {
            Some(sidecar) => sidecar,
            None => {
                warn!("Failed to load vector metadata, rebuilding");
                MetaSidecar::default()
            }
        };
        self.keys_by_chunk = sidecar
            .records
            .iter()
            .map(|(key, record)| (record.chunk_id.clone(), *key))
            .collect();
        self.next_key = sidecar.next_key;
        self.records = sidecar.records;
        Ok(())
    }

    /// Flush the index file and metadata sidecar (atomic for the sidecar).
    pub fn persist(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        with_retries("vector index save", || {
            self.index
                .save(dir.join(INDEX_FILE).to_string_lossy().as_ref())
                .map_err(|e| Error::BackendUnavailable(format!("vector index save: {}", e)))
        })?;
        let sidecar = MetaSidecar {
            records: self.records.clone(),
            next_key: self.next_key,
        };
        let json = serde_json::to_string(&sidecar)?;
        let target = dir.join(META_FILE);
        let tmp = dir.join(format!("{}.tmp", META_FILE));
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Push the current head view used by the staleness filter.
    pub fn set_current_blobs(&mut self, blobs: HashMap<String, String>) {
        self.current_blobs = blobs;
    }

    /// Chunk ids currently stored for a path.
    pub fn chunk_ids_for_path(&self, path: &str) -> Vec<String> {
        self.records
            .values()
            .filter(|record| record.path == path)
            .map(|record| record.chunk_id.clone())
            .collect()
    }

    /// Drop every chunk belonging to a path (file removed or re-chunked).
    pub fn purge_path(&mut self, path: &str) {
        let keys: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, record)| record.path == path)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(record) = self.records.remove(&key) {
                self.keys_by_chunk.remove(&record.chunk_id);
            }
            let _ = self.index.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_chunk(&self, chunk_id: &str) -> bool {
        self.keys_by_chunk.contains_key(chunk_id)
    }

    /// Stored blob id for a chunk id, if present (invariant checks).
    pub fn blob_of_chunk(&self, chunk_id: &str) -> Option<&str> {
        self.keys_by_chunk
            .get(chunk_id)
            .and_then(|key| self.records.get(key))
            .map(|record| record.blob_id.as_str())
    }

    /// Blob id this source holds for a path. Chunks of one path never mix
    /// blobs, so any record answers.
    pub fn blob_for_path(&self, path: &str) -> Option<&str> {
        self.records
            .values()
            .find(|record| record.path == path)
            .map(|record| record.blob_id.as_str())
    }

    fn ensure_capacity(&mut self, extra: usize) -> Result<()> {
        let needed = self.index.size() + extra + 1;
        if needed > self.index.capacity() {
            self.index
                .reserve((needed * 2).max(65_536))
                .map_err(|e| Error::BackendUnavailable(format!("vector reserve: {}", e)))?;
        }
        Ok(())
    }

    fn upsert_batch(&mut self, chunks: &[Chunk]) -> Result<()> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = with_retries("embed batch", || self.embedder.embed(&texts))?;
        if embeddings.len() != chunks.len() {
            return Err(Error::Internal(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        self.ensure_capacity(chunks.len())?;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            // Replace-by-id: drop any prior vector for this chunk id first.
            if let Some(old_key) = self.keys_by_chunk.remove(&chunk.id) {
                self.records.remove(&old_key);
                let _ = self.index.remove(old_key);
            }
            let key = self.next_key;
            self.next_key += 1;
            self.index
                .add(key, &embedding)
                .map_err(|e| Error::BackendUnavailable(format!("vector add: {}", e)))?;
            self.records.insert(
                key,
                ChunkRecord {
                    chunk_id: chunk.id.clone(),
                    path: chunk.path.clone(),
                    start_line: chunk.start_line,
                    blob_id: chunk.blob_id.clone(),
                },
            );
            self.keys_by_chunk.insert(chunk.id.clone(), key);
        }
        Ok(())
    }
}

impl IndexSource for VectorSource {
    fn upsert(&mut self, chunks: &[Chunk]) -> Result<()> {
        for batch in chunks.chunks(self.batch_size) {
            self.upsert_batch(batch)?;
        }
        Ok(())
    }

    fn query(&self, text: &str, limit: usize) -> Result<Vec<Hit>> {
        if self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let query = vec![text.to_string()];
        let embeddings = with_retries("embed query", || self.embedder.embed(&query))?;
        let vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("embedder returned no query vector".to_string()))?;

        let matches = with_retries("vector search", || {
            self.index
                .search(&vector, limit)
                .map_err(|e| Error::BackendUnavailable(format!("vector search: {}", e)))
        })?;

        let mut hits = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(record) = self.records.get(key) else {
                continue;
            };
            // Staleness filter: silently drop hits whose stored blob no
            // longer matches the current blob for the path.
            match self.current_blobs.get(&record.path) {
                Some(current) if *current == record.blob_id => {}
                _ => {
                    debug!(
                        "Dropping stale vector hit for {} (blob {})",
                        record.path, record.blob_id
                    );
                    continue;
                }
            }
            let similarity = (1.0 / (1.0 + f64::from(*distance))).clamp(0.0, 1.0) as f32;
            hits.push(Hit {
                path: record.path.clone(),
                line: record.start_line,
                score: similarity,
                source: SourceKind::Vector,
            });
        }
        Ok(hits)
    }

    fn delete(&mut self, chunk_ids: &[String]) -> Result<()> {
        for chunk_id in chunk_ids {
            if let Some(key) = self.keys_by_chunk.remove(chunk_id) {
                self.records.remove(&key);
                let _ = self.index.remove(key);
            }
        }
        Ok(())
    }
}

/// Retry a backend call up to `MAX_ATTEMPTS` times with exponential backoff,
/// then surface the last error. Only `BackendUnavailable` is retried; other
/// kinds surface immediately.
fn with_retries<T>(what: &str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(Error::BackendUnavailable(msg)) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(Error::BackendUnavailable(msg));
                }
                let delay = RETRY_BASE_DELAY_MS * (1 << (attempt - 1));
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    what, attempt, MAX_ATTEMPTS, delay, msg
                );
                std::thread::sleep(Duration::from_millis(delay));
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_id;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic token-bucket projection; equal texts embed equally.
    struct HashEmbedder;

    impl Embedder for HashEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; 16];
                    for token in text.split_whitespace() {
                        let mut h = 0usize;
                        for b in token.bytes() {
                            h = h.wrapping_mul(31).wrapping_add(b as usize);
                        }
                        v[h % 16] += 1.0;
                    }
                    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                    v.iter().map(|x| x / norm).collect()
                })
                .collect())
        }

        fn dimensions(&self) -> usize {
            16
        }
    }

    fn chunk(path: &str, start: u32, content: &str, blob: &str) -> Chunk {
        Chunk {
            path: path.to_string(),
            start_line: start,
            id: chunk_id(path, start, content),
            content: content.to_string(),
            blob_id: blob.to_string(),
        }
    }

    fn source() -> VectorSource {
        VectorSource::in_memory(Arc::new(HashEmbedder), 500).unwrap()
    }

    #[test]
    fn exact_match_scores_near_one() {
        let mut source = source();
        let c = chunk("src/a.rs", 1, "parse incoming request headers", "blobA");
        source.upsert(std::slice::from_ref(&c)).unwrap();
        source.set_current_blobs(HashMap::from([(
            "src/a.rs".to_string(),
            "blobA".to_string(),
        )]));

        let hits = source.query("parse incoming request headers", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/a.rs");
        assert_eq!(hits[0].line, 1);
        assert_eq!(hits[0].source, SourceKind::Vector);
        assert!(hits[0].score > 0.9, "score was {}", hits[0].score);
    }

    #[test]
    fn stale_hits_are_silently_dropped() {
        let mut source = source();
        let c = chunk("src/a.rs", 1, "old content here", "blobX");
        source.upsert(std::slice::from_ref(&c)).unwrap();
        source.set_current_blobs(HashMap::from([(
            "src/a.rs".to_string(),
            "blobY".to_string(),
        )]));

        let hits = source.query("old content here", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn untracked_paths_are_stale() {
        let mut source = source();
        let c = chunk("gone.rs", 1, "deleted file text", "blobX");
        source.upsert(std::slice::from_ref(&c)).unwrap();
        source.set_current_blobs(HashMap::new());

        assert!(source.query("deleted file text", 10).unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_by_chunk_id() {
        let mut source = source();
        let c = chunk("src/a.rs", 1, "same content", "blobA");
        source.upsert(std::slice::from_ref(&c)).unwrap();
        source.upsert(std::slice::from_ref(&c)).unwrap();
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn delete_and_purge_remove_chunks() {
        let mut source = source();
        let a = chunk("src/a.rs", 1, "alpha beta", "blobA");
        let b = chunk("src/b.rs", 1, "gamma delta", "blobB");
        source.upsert(&[a.clone(), b.clone()]).unwrap();

        source.delete(&[a.id.clone()]).unwrap();
        assert!(!source.contains_chunk(&a.id));
        assert!(source.contains_chunk(&b.id));

        source.purge_path("src/b.rs");
        assert!(source.is_empty());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder);
        {
            let mut source =
                VectorSource::open(dir.path().to_path_buf(), embedder.clone(), 500).unwrap();
            let c = chunk("src/a.rs", 1, "persisted chunk body", "blobA");
            source.upsert(std::slice::from_ref(&c)).unwrap();
            source.persist().unwrap();
        }
        let mut reloaded =
            VectorSource::open(dir.path().to_path_buf(), embedder, 500).unwrap();
        assert_eq!(reloaded.len(), 1);
        reloaded.set_current_blobs(HashMap::from([(
            "src/a.rs".to_string(),
            "blobA".to_string(),
        )]));
        let hits = reloaded.query("persisted chunk body", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn retries_then_surfaces_backend_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retries("test call", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::BackendUnavailable("down".to_string()))
        });
        assert_eq!(result.unwrap_err().kind(), "BackendUnavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicUsize::new(0);
        let result = with_retries("test call", || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::BackendUnavailable("blip".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }
}
