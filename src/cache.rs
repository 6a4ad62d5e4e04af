use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Cache format version. Bumping it routes every repository to a fresh
/// cache directory, implicitly invalidating all prior caches.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Magic tag at the head of the cache payload.
const CACHE_MAGIC: &[u8; 4] = b"SGOC";

const CACHE_FILE: &str = "cache.bin";

/// Everything one analyze pass persists: the set of chunk ids already
/// embedded and upserted, the last-observed frecency map, and the repo
/// state hash the pass observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheData {
    pub analyzed: HashSet<String>,
    pub frecency: HashMap<String, f32>,
    pub repo_state_hash: Option<String>,
    pub last_analyzed_at: Option<i64>,
}

#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    pub data: CacheData,
}

/// Cache directory for a repository under the given root:
/// `<root>/<hex(sha256(CACHE_FORMAT_VERSION || canonical(repo_path)))>`.
pub fn cache_dir(cache_root: &Path, repo_path: &Path, format_version: u32) -> PathBuf {
    let canonical = dunce::canonicalize(repo_path).unwrap_or_else(|_| repo_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(format_version.to_be_bytes());
    hasher.update(canonical.to_string_lossy().as_bytes());
    cache_root.join(format!("{:x}", hasher.finalize()))
}

impl Cache {
    /// Open the cache for a repository. An absent or unreadable payload
    /// yields an empty cache; a present but malformed payload fails with
    /// `CacheCorrupt` so the caller can discard and rebuild.
    pub fn open(cache_root: &Path, repo_path: &Path) -> Result<Self> {
        let dir = cache_dir(cache_root, repo_path, CACHE_FORMAT_VERSION);
        let file = dir.join(CACHE_FILE);
        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Ok(Self {
                    dir,
                    data: CacheData::default(),
                });
            }
        };
        let data = decode_payload(&bytes)?;
        Ok(Self { dir, data })
    }

    /// An empty cache at the same location, used after corruption.
    pub fn fresh(cache_root: &Path, repo_path: &Path) -> Self {
        Self {
            dir: cache_dir(cache_root, repo_path, CACHE_FORMAT_VERSION),
            data: CacheData::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The vector source keeps its own on-disk state next to the payload.
    pub fn vectors_dir(&self) -> PathBuf {
        self.dir.join("vectors")
    }

    /// Atomic write: temp file then rename, so concurrent readers outside
    /// the engine only ever observe a complete payload or none.
    pub fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(CACHE_FILE);
        let tmp = self.dir.join(format!("{}.tmp", CACHE_FILE));
        std::fs::write(&tmp, encode_payload(&self.data)?)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }
}

fn encode_payload(data: &CacheData) -> Result<Vec<u8>> {
    let body = bincode::serialize(data)
        .map_err(|e| Error::Internal(format!("cache encode: {}", e)))?;
    let mut bytes = Vec::with_capacity(body.len() + 8);
    bytes.extend_from_slice(CACHE_MAGIC);
    bytes.extend_from_slice(&CACHE_FORMAT_VERSION.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode_payload(bytes: &[u8]) -> Result<CacheData> {
    if bytes.len() < 8 || &bytes[..4] != CACHE_MAGIC {
        return Err(Error::CacheCorrupt("bad magic".to_string()));
    }
    let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != CACHE_FORMAT_VERSION {
        return Err(Error::CacheCorrupt(format!(
            "payload version {} does not match {}",
            version, CACHE_FORMAT_VERSION
        )));
    }
    bincode::deserialize(&bytes[8..]).map_err(|e| Error::CacheCorrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_disk() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();

        let mut cache = Cache::open(root.path(), repo.path()).unwrap();
        assert!(cache.data.analyzed.is_empty());

        cache.data.analyzed.insert("chunk1".to_string());
        cache.data.frecency.insert("a.rs".to_string(), 1.0);
        cache.data.repo_state_hash = Some("deadbeef".to_string());
        cache.data.last_analyzed_at = Some(1_700_000_000);
        cache.persist().unwrap();

        let reloaded = Cache::open(root.path(), repo.path()).unwrap();
        assert!(reloaded.data.analyzed.contains("chunk1"));
        assert_eq!(reloaded.data.frecency["a.rs"], 1.0);
        assert_eq!(reloaded.data.repo_state_hash.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn absent_payload_is_an_empty_cache() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let cache = Cache::open(root.path(), repo.path()).unwrap();
        assert!(cache.data.repo_state_hash.is_none());
    }

    #[test]
    fn malformed_payload_is_corrupt() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let dir = cache_dir(root.path(), repo.path(), CACHE_FORMAT_VERSION);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CACHE_FILE), b"not a cache payload").unwrap();

        let err = Cache::open(root.path(), repo.path()).unwrap_err();
        assert_eq!(err.kind(), "CacheCorrupt");
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();

        let mut cache = Cache::open(root.path(), repo.path()).unwrap();
        cache.data.analyzed.insert("chunk1".to_string());
        cache.persist().unwrap();

        let file = cache.dir().join(CACHE_FILE);
        let bytes = std::fs::read(&file).unwrap();
        std::fs::write(&file, &bytes[..bytes.len() - 3]).unwrap();

        let err = Cache::open(root.path(), repo.path()).unwrap_err();
        assert_eq!(err.kind(), "CacheCorrupt");
    }

    #[test]
    fn version_bump_routes_to_a_new_directory() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let v1 = cache_dir(root.path(), repo.path(), 1);
        let v2 = cache_dir(root.path(), repo.path(), 2);
        assert_ne!(v1, v2);
    }
}
