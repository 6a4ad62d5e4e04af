//! The engine: orchestrates scanner -> chunker -> sources -> cache.
//!
//! All methods here run on exactly one worker thread (see the task queue);
//! nothing in this module is shared mutably across threads. Analysis is
//! resumable: `begin_analysis` produces a plan and `analyze_step` consumes
//! it a few files at a time, which is how the queue keeps queries from
//! being starved by a long pass.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use globset::GlobSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::chunker::Chunker;
use crate::config::AppConfig;
use crate::embedding::{Embedder, create_embedder};
use crate::error::{Error, Result};
use crate::merge::{self, MergeOptions, QueryResults};
use crate::repository::{GitCli, RepoBackend, RepoScanner, RepoSnapshot};
use crate::sources::regex::RegexSource;
use crate::sources::vector::VectorSource;
use crate::sources::{Hit, IndexSource};

/// Per-source hit limit for one query.
pub const PER_SOURCE_LIMIT: usize = 500;

/// Cooperative cancellation flag checked at coarse yield points: between
/// files and after each upsert batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub limit_lines: usize,
    pub context_above: u32,
    pub context_below: u32,
    pub per_source_limit: usize,
    pub include: Option<GlobSet>,
    pub exclude: Option<GlobSet>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit_lines: merge::DEFAULT_LINE_LIMIT,
            context_above: merge::CONTEXT_LINES,
            context_below: merge::CONTEXT_LINES,
            per_source_limit: PER_SOURCE_LIMIT,
            include: None,
            exclude: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub chunks_analyzed: usize,
    pub total_files: usize,
    pub last_analyzed_at_unix: Option<i64>,
}

/// One file awaiting (re-)analysis.
#[derive(Debug, Clone)]
struct FileJob {
    path: String,
    blob_id: String,
}

/// Remaining work of an analyze pass. Produced by `begin_analysis`,
/// drained by `analyze_step`.
#[derive(Debug, Default)]
pub struct AnalysisPlan {
    jobs: VecDeque<FileJob>,
    state_hash: String,
}

impl AnalysisPlan {
    pub fn remaining_files(&self) -> usize {
        self.jobs.len()
    }
}

pub struct Engine {
    config: AppConfig,
    chunker: Chunker,
    scanner: RepoScanner,
    cache: Cache,
    vector: VectorSource,
    regex: RegexSource,
    snapshot: RepoSnapshot,
    /// Blob each path's corpus lines were materialized from, this process.
    /// The corpus is in-memory, so after a restart every path needs a
    /// materialization pass even when the repo state hash is unchanged.
    corpus_blobs: HashMap<String, String>,
}

impl Engine {
    /// Production engine: git CLI backend, registry embedder, persistent
    /// state under the global cache root.
    pub fn new(config: AppConfig, repo_path: &Path) -> Result<Self> {
        let embedder = create_embedder(&config.server.chroma.embedding_function)?;
        let backend = Box::new(GitCli::new(repo_path));
        Self::with_parts(config, repo_path, backend, embedder, &crate::config::cache_root())
    }

    /// Assemble an engine from explicit collaborators (tests swap in an
    /// in-memory repo backend and a deterministic embedder).
    pub fn with_parts(
        config: AppConfig,
        repo_path: &Path,
        backend: Box<dyn RepoBackend>,
        embedder: Arc<dyn Embedder>,
        cache_root: &Path,
    ) -> Result<Self> {
        let cache = match Cache::open(cache_root, repo_path) {
            Ok(cache) => cache,
            Err(err @ Error::CacheCorrupt(_)) => {
                warn!("Discarding cache: {}", err);
                Cache::fresh(cache_root, repo_path)
            }
            Err(err) => return Err(err),
        };

        let scanner = RepoScanner::new(
            backend,
            &config.server.ignore_patterns,
            config.server.read_max_commits,
        )?;
        let vector = VectorSource::open(
            cache.vectors_dir(),
            embedder,
            config.server.chroma.batch_size,
        )?;

        let mut engine = Self {
            config,
            chunker: Chunker::default(),
            scanner,
            cache,
            vector,
            regex: RegexSource::default(),
            snapshot: RepoSnapshot::default(),
            corpus_blobs: HashMap::new(),
        };
        engine.reconcile()?;
        Ok(engine)
    }

    /// Reconcile persisted state against the current repo before serving
    /// queries: adopt the head view, reuse cached frecency when the state
    /// hash still matches, and arm the staleness filter.
    fn reconcile(&mut self) -> Result<()> {
        let (files, state_hash) = self.scanner.head_state()?;
        let frecency = if self.cache.data.repo_state_hash.as_deref() == Some(&state_hash) {
            self.cache.data.frecency.clone()
        } else {
            HashMap::new()
        };
        self.vector
            .set_current_blobs(files.clone().into_iter().collect());
        self.snapshot = RepoSnapshot {
            files,
            frecency,
            state_hash,
        };
        Ok(())
    }

    /// Compute the current repo state and decide whether a pass is needed.
    /// Returns `None` when the state hash is unchanged and the corpus is
    /// already materialized for every tracked file.
    pub fn begin_analysis(&mut self) -> Result<Option<AnalysisPlan>> {
        let (files, state_hash) = self.scanner.head_state()?;

        let unchanged = self.cache.data.repo_state_hash.as_deref() == Some(&state_hash);
        let materialized = files
            .iter()
            .all(|(path, blob)| self.corpus_blobs.get(path) == Some(blob));
        if unchanged && materialized {
            debug!("Repo state {} unchanged, nothing to analyze", &state_hash[..12]);
            return Ok(None);
        }

        // The history walk is the expensive part; only now that we know a
        // pass will run is it worth paying for.
        let snapshot = self.scanner.scan()?;

        // Purge files that left HEAD from both sources, the analyzed set,
        // and the corpus bookkeeping.
        let gone: Vec<String> = self
            .corpus_blobs
            .keys()
            .chain(self.cache.data.frecency.keys())
            .filter(|path| !snapshot.files.contains_key(*path))
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for path in &gone {
            for chunk_id in self.vector.chunk_ids_for_path(path) {
                self.cache.data.analyzed.remove(&chunk_id);
            }
            self.vector.purge_path(path);
            self.regex.purge_path(path);
            self.corpus_blobs.remove(path);
        }
        if !gone.is_empty() {
            info!("Purged {} files no longer tracked at HEAD", gone.len());
        }

        let jobs: VecDeque<FileJob> = snapshot
            .files
            .iter()
            .filter(|(path, blob)| self.corpus_blobs.get(*path) != Some(blob))
            .map(|(path, blob)| FileJob {
                path: path.clone(),
                blob_id: blob.clone(),
            })
            .collect();

        self.vector
            .set_current_blobs(snapshot.files.clone().into_iter().collect());
        self.snapshot = snapshot;

        info!(
            "Analysis pass: {} files to process, state {}",
            jobs.len(),
            &state_hash[..12]
        );
        Ok(Some(AnalysisPlan { jobs, state_hash }))
    }

    /// Process up to `file_budget` files from the plan. Returns `true` when
    /// the pass is complete (state persisted). Cancellation is honored
    /// between files and between upsert batches.
    pub fn analyze_step(
        &mut self,
        plan: &mut AnalysisPlan,
        file_budget: usize,
        cancel: &CancelToken,
    ) -> Result<bool> {
        for _ in 0..file_budget.max(1) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(job) = plan.jobs.pop_front() else {
                break;
            };
            if let Err(err) = self.analyze_file(&job, cancel) {
                match err {
                    Error::Cancelled => return Err(Error::Cancelled),
                    Error::UnreadableBlob(_) => {
                        warn!("Skipping {}: {}", job.path, err);
                        // Marked materialized so the pass completes; the
                        // file is retried when its blob changes.
                        self.corpus_blobs.insert(job.path, job.blob_id);
                    }
                    other => {
                        warn!("Skipping {}: {}", job.path, other);
                        self.corpus_blobs.insert(job.path, job.blob_id);
                    }
                }
            }
        }

        if !plan.jobs.is_empty() {
            return Ok(false);
        }
        self.finish_analysis(plan)?;
        Ok(true)
    }

    /// Run a full pass to completion (startup and tests; the task queue
    /// uses the stepwise form).
    pub fn analyze(&mut self, cancel: &CancelToken) -> Result<bool> {
        let Some(mut plan) = self.begin_analysis()? else {
            return Ok(false);
        };
        while !self.analyze_step(&mut plan, usize::MAX, cancel)? {}
        Ok(true)
    }

    fn analyze_file(&mut self, job: &FileJob, cancel: &CancelToken) -> Result<()> {
        let bytes = self.scanner.read_blob(&job.blob_id)?;
        let chunks = self
            .chunker
            .chunk_blob(&job.path, &job.blob_id, &bytes)?;

        // Only a changed blob costs embeddings; an unchanged one (corpus
        // rebuild after restart) just refreshes the in-memory lines.
        if self.vector.blob_for_path(&job.path) != Some(&job.blob_id) {
            for chunk_id in self.vector.chunk_ids_for_path(&job.path) {
                self.cache.data.analyzed.remove(&chunk_id);
            }
            self.vector.purge_path(&job.path);

            let batch_size = self.config.server.chroma.batch_size.max(1);
            for batch in chunks.chunks(batch_size) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.vector.upsert(batch)?;
                for chunk in batch {
                    self.cache.data.analyzed.insert(chunk.id.clone());
                }
            }
        } else {
            // Already embedded; make sure the analyzed set agrees.
            for chunk in &chunks {
                self.cache.data.analyzed.insert(chunk.id.clone());
            }
        }

        self.regex.purge_path(&job.path);
        self.regex.upsert(&chunks)?;
        self.corpus_blobs
            .insert(job.path.clone(), job.blob_id.clone());
        Ok(())
    }

    fn finish_analysis(&mut self, plan: &AnalysisPlan) -> Result<()> {
        self.cache.data.frecency = self.snapshot.frecency.clone();
        self.cache.data.repo_state_hash = Some(plan.state_hash.clone());
        self.cache.data.last_analyzed_at = Some(chrono::Utc::now().timestamp());
        self.persist()?;
        info!(
            "Analysis complete: {} chunks analyzed across {} files",
            self.cache.data.analyzed.len(),
            self.snapshot.files.len()
        );
        Ok(())
    }

    /// Fan out to both sources concurrently and merge. One failing source
    /// degrades the response to `partial` instead of failing the query.
    pub fn query(&self, text: &str, options: &QueryOptions) -> Result<QueryResults> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let limit = options.per_source_limit;
        let vector = &self.vector;
        let regex = &self.regex;
        let (vector_result, regex_result) = rayon::join(
            || vector.query(trimmed, limit),
            || regex.query(trimmed, limit),
        );

        let mut partial = false;
        let mut regex_error = None;
        let mut hits: Vec<Hit> = Vec::new();

        match (vector_result, regex_result) {
            (Ok(vector_hits), Ok(regex_hits)) => {
                hits.extend(vector_hits);
                hits.extend(regex_hits);
            }
            (Ok(vector_hits), Err(err)) => {
                debug!("Regex side failed, serving vector only: {}", err);
                hits.extend(vector_hits);
                partial = true;
                regex_error = Some(err.kind().to_string());
            }
            (Err(err), Ok(regex_hits)) => {
                warn!("Vector side failed, serving regex only: {}", err);
                hits.extend(regex_hits);
                partial = true;
            }
            (Err(vector_err), Err(regex_err)) => {
                warn!("Both sources failed: {} / {}", vector_err, regex_err);
                return Err(vector_err);
            }
        }

        if options.include.is_some() || options.exclude.is_some() {
            hits.retain(|hit| {
                let included = options
                    .include
                    .as_ref()
                    .map(|globs| globs.is_match(&hit.path))
                    .unwrap_or(true);
                let excluded = options
                    .exclude
                    .as_ref()
                    .map(|globs| globs.is_match(&hit.path))
                    .unwrap_or(false);
                included && !excluded
            });
        }

        let merge_options = MergeOptions {
            limit_lines: options.limit_lines,
            context_above: options.context_above,
            context_below: options.context_below,
        };
        let mut results = merge::merge(&hits, &self.snapshot.frecency, &self.regex, &merge_options);
        results.partial = partial;
        results.regex_error = regex_error;
        Ok(results)
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            chunks_analyzed: self.cache.data.analyzed.len(),
            total_files: self.snapshot.files.len(),
            last_analyzed_at_unix: self.cache.data.last_analyzed_at,
        }
    }

    /// True when the cached state hash no longer matches the live repo.
    pub fn is_stale(&self) -> bool {
        match self.scanner.head_state() {
            Ok((_, hash)) => self.cache.data.repo_state_hash.as_deref() != Some(&hash),
            Err(_) => true,
        }
    }

    /// Persist the cache payload and flush the vector store.
    pub fn persist(&self) -> Result<()> {
        self.cache.persist()?;
        self.vector.persist()?;
        Ok(())
    }

    #[doc(hidden)]
    pub fn vector_chunk_blob(&self, chunk_id: &str) -> Option<String> {
        self.vector.blob_of_chunk(chunk_id).map(str::to_string)
    }

    #[doc(hidden)]
    pub fn analyzed_chunk_count(&self) -> usize {
        self.cache.data.analyzed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepoBackend;
    use std::collections::HashMap as Map;

    /// In-memory repo the tests mutate between passes.
    #[derive(Default, Clone)]
    struct FakeRepo {
        files: Map<String, String>,
        blobs: Map<String, Vec<u8>>,
        commits: Map<String, Vec<i64>>,
    }

    impl FakeRepo {
        fn put(&mut self, path: &str, blob_id: &str, content: &[u8]) {
            self.files.insert(path.to_string(), blob_id.to_string());
            self.blobs.insert(blob_id.to_string(), content.to_vec());
        }
    }

    struct SharedRepo(std::sync::Arc<parking_lot::Mutex<FakeRepo>>);

    impl RepoBackend for SharedRepo {
        fn head_files(&self) -> Result<Vec<(String, String)>> {
            Ok(self
                .0
                .lock()
                .files
                .iter()
                .map(|(p, b)| (p.clone(), b.clone()))
                .collect())
        }

        fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
            self.0
                .lock()
                .blobs
                .get(blob_id)
                .cloned()
                .ok_or_else(|| Error::BackendUnavailable(format!("no blob {}", blob_id)))
        }

        fn commit_times(&self, _max: usize) -> Result<Map<String, Vec<i64>>> {
            Ok(self.0.lock().commits.clone())
        }
    }

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

    fn engine_over(
        repo: std::sync::Arc<parking_lot::Mutex<FakeRepo>>,
        cache_root: &Path,
        repo_path: &Path,
    ) -> Engine {
        Engine::with_parts(
            AppConfig::default(),
            repo_path,
            Box::new(SharedRepo(repo)),
            Arc::new(HashEmbedder),
            cache_root,
        )
        .unwrap()
    }

    #[test]
    fn analyze_twice_without_changes_is_a_noop() {
        let mut repo = FakeRepo::default();
        repo.put("src/a.rs", "blobA", b"fn alpha() {}\nfn beta() {}");
        let repo = std::sync::Arc::new(parking_lot::Mutex::new(repo));
        let cache_root = tempfile::TempDir::new().unwrap();
        let repo_dir = tempfile::TempDir::new().unwrap();

        let mut engine = engine_over(repo, cache_root.path(), repo_dir.path());
        let cancel = CancelToken::new();
        assert!(engine.analyze(&cancel).unwrap());
        let analyzed = engine.analyzed_chunk_count();
        let stats = engine.get_stats();

        assert!(!engine.analyze(&cancel).unwrap());
        assert_eq!(engine.analyzed_chunk_count(), analyzed);
        assert_eq!(engine.get_stats().total_files, stats.total_files);
    }

    #[test]
    fn unreadable_blob_does_not_abort_the_pass() {
        let mut repo = FakeRepo::default();
        repo.put("src/good.rs", "blobG", b"fn fine() {}");
        repo.put("src/bad.rs", "blobB", b"\x00\x01binary");
        let repo = std::sync::Arc::new(parking_lot::Mutex::new(repo));
        let cache_root = tempfile::TempDir::new().unwrap();
        let repo_dir = tempfile::TempDir::new().unwrap();

        let mut engine = engine_over(repo, cache_root.path(), repo_dir.path());
        engine.analyze(&CancelToken::new()).unwrap();

        let results = engine
            .query("fine", &QueryOptions::default())
            .unwrap();
        assert_eq!(results.results[0].path, "src/good.rs");
    }

    #[test]
    fn removed_files_are_purged_from_both_sources() {
        let mut repo = FakeRepo::default();
        repo.put("src/a.rs", "blobA", b"let the_needle = 1;");
        let repo = std::sync::Arc::new(parking_lot::Mutex::new(repo));
        let cache_root = tempfile::TempDir::new().unwrap();
        let repo_dir = tempfile::TempDir::new().unwrap();

        let mut engine = engine_over(repo.clone(), cache_root.path(), repo_dir.path());
        engine.analyze(&CancelToken::new()).unwrap();
        assert!(engine.analyzed_chunk_count() > 0);

        repo.lock().files.clear();
        engine.analyze(&CancelToken::new()).unwrap();
        assert_eq!(engine.analyzed_chunk_count(), 0);
        let results = engine
            .query("the_needle", &QueryOptions::default())
            .unwrap();
        assert!(results.results.is_empty());
    }

    #[test]
    fn empty_query_is_rejected() {
        let repo = std::sync::Arc::new(parking_lot::Mutex::new(FakeRepo::default()));
        let cache_root = tempfile::TempDir::new().unwrap();
        let repo_dir = tempfile::TempDir::new().unwrap();
        let engine = engine_over(repo, cache_root.path(), repo_dir.path());

        let err = engine.query("   \n\t ", &QueryOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "EmptyQuery");
    }

    #[test]
    fn cancellation_stops_between_files() {
        let mut repo = FakeRepo::default();
        for i in 0..5 {
            repo.put(
                &format!("src/f{}.rs", i),
                &format!("blob{}", i),
                format!("fn body_{}() {{}}", i).as_bytes(),
            );
        }
        let repo = std::sync::Arc::new(parking_lot::Mutex::new(repo));
        let cache_root = tempfile::TempDir::new().unwrap();
        let repo_dir = tempfile::TempDir::new().unwrap();

        let mut engine = engine_over(repo, cache_root.path(), repo_dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine.analyze(&cancel).unwrap_err();
        assert_eq!(err.kind(), "Cancelled");
    }
}
