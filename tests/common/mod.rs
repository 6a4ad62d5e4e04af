#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use seagoat::config::AppConfig;
use seagoat::embedding::Embedder;
use seagoat::engine::Engine;
use seagoat::error::{Error, Result};
use seagoat::repository::RepoBackend;

pub const DAY: i64 = 86_400;

/// In-memory stand-in for the git backend; tests mutate it between passes.
#[derive(Default)]
pub struct FakeRepo {
    pub files: HashMap<String, String>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub commits: HashMap<String, Vec<i64>>,
}

impl FakeRepo {
    pub fn put(&mut self, path: &str, blob_id: &str, content: &str) {
        self.files.insert(path.to_string(), blob_id.to_string());
        self.blobs
            .insert(blob_id.to_string(), content.as_bytes().to_vec());
    }

    pub fn remove(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn commit(&mut self, path: &str, timestamps: &[i64]) {
        self.commits.insert(path.to_string(), timestamps.to_vec());
    }
}

pub type SharedRepo = Arc<Mutex<FakeRepo>>;

pub struct FakeBackend(pub SharedRepo);

impl RepoBackend for FakeBackend {
    fn head_files(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .0
            .lock()
            .files
            .iter()
            .map(|(path, blob)| (path.clone(), blob.clone()))
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

    fn commit_times(&self, _max_commits: usize) -> Result<HashMap<String, Vec<i64>>> {
        Ok(self.0.lock().commits.clone())
    }
}

/// Deterministic token-bucket projection. Counts embed calls (and can slow
/// them down) so tests can observe how much embedding work a pass did.
pub struct HashEmbedder {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
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

pub fn shared_repo() -> SharedRepo {
    Arc::new(Mutex::new(FakeRepo::default()))
}

pub fn build_engine(
    repo: SharedRepo,
    embedder: Arc<dyn Embedder>,
    cache_root: &Path,
    repo_dir: &Path,
) -> Engine {
    Engine::with_parts(
        AppConfig::default(),
        repo_dir,
        Box::new(FakeBackend(repo)),
        embedder,
        cache_root,
    )
    .expect("engine construction")
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
