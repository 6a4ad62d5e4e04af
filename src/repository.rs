use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::is_supported_extension;
use crate::error::{Error, Result};

/// Half-life of a commit's frecency contribution, in days.
const FRECENCY_HALF_LIFE_DAYS: f64 = 90.0;

/// What the engine needs from version control: the tracked working set at
/// HEAD, blob contents by object id, and commit history per file. The
/// production implementation shells out to git; tests substitute an
/// in-memory backend.
pub trait RepoBackend: Send {
    /// Tracked files at HEAD as (repo-relative path, blob id) pairs.
    fn head_files(&self) -> Result<Vec<(String, String)>>;

    /// Raw bytes of a blob object.
    fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>>;

    /// Unix timestamps of commits touching each path, newest first,
    /// walking at most `max_commits` commits from HEAD.
    fn commit_times(&self, max_commits: usize) -> Result<HashMap<String, Vec<i64>>>;
}

/// Immutable view of the repository produced by one scan.
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    /// Admitted tracked files: path -> blob id.
    pub files: BTreeMap<String, String>,
    /// Normalized frecency per path, in [0, 1].
    pub frecency: HashMap<String, f32>,
    /// Digest of the sorted (path, blob id) pairs at HEAD.
    pub state_hash: String,
}

pub struct RepoScanner {
    backend: Box<dyn RepoBackend>,
    ignore: GlobSet,
    read_max_commits: usize,
}

impl RepoScanner {
    pub fn new(
        backend: Box<dyn RepoBackend>,
        ignore_patterns: &[String],
        read_max_commits: usize,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            ignore: build_globset(ignore_patterns)?,
            read_max_commits,
        })
    }

    /// Cheap head view: admitted files and their state hash, no history walk.
    /// Maintenance uses this to short-circuit when nothing changed.
    pub fn head_state(&self) -> Result<(BTreeMap<String, String>, String)> {
        let mut files = BTreeMap::new();
        for (path, blob_id) in self.backend.head_files()? {
            if self.admits(&path) {
                files.insert(path, blob_id);
            }
        }
        let hash = state_hash(&files);
        Ok((files, hash))
    }

    /// Full scan: head view plus frecency from the commit history walk.
    pub fn scan(&self) -> Result<RepoSnapshot> {
        let (files, hash) = self.head_state()?;
        let commits = self.backend.commit_times(self.read_max_commits)?;
        let now = chrono::Utc::now().timestamp();
        let frecency = frecency_scores(&files, &commits, now);
        Ok(RepoSnapshot {
            files,
            frecency,
            state_hash: hash,
        })
    }

    pub fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        self.backend.read_blob(blob_id)
    }

    /// A file exists in the index iff its extension is in the allowed set
    /// (path-only check) and no ignore pattern matches its path.
    pub fn admits(&self, path: &str) -> bool {
        let ext = Path::new(path)
            .extension()
            .unwrap_or_default()
            .to_string_lossy()
            .to_lowercase();
        if !is_supported_extension(&ext) {
            return false;
        }
        !self.ignore.is_match(path)
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("Bad ignore pattern '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(e.to_string()))
}

/// Digest of the sorted (path, blob id) pairs; the engine compares this to
/// the cached value to decide whether an analyze pass has any work.
pub fn state_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, blob_id) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(blob_id.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// Frecency: sum over commits of `exp(-lambda * age_days)`, with lambda set
/// so a 90-day-old commit contributes half as much as one from today, then
/// normalized so the maximum across files equals 1. No commits -> 0.
pub fn frecency_scores(
    files: &BTreeMap<String, String>,
    commits: &HashMap<String, Vec<i64>>,
    now: i64,
) -> HashMap<String, f32> {
    let lambda = std::f64::consts::LN_2 / FRECENCY_HALF_LIFE_DAYS;

    let mut raw: HashMap<String, f64> = HashMap::with_capacity(files.len());
    let mut max = 0.0f64;
    for path in files.keys() {
        let score = commits
            .get(path)
            .map(|times| {
                times
                    .iter()
                    .map(|ts| {
                        let age_days = ((now - ts).max(0) as f64) / 86_400.0;
                        (-lambda * age_days).exp()
                    })
                    .sum()
            })
            .unwrap_or(0.0);
        if score > max {
            max = score;
        }
        raw.insert(path.clone(), score);
    }

    raw.into_iter()
        .map(|(path, score)| {
            let normalized = if max > 0.0 { score / max } else { 0.0 };
            (path, normalized.clamp(0.0, 1.0) as f32)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Git CLI backend
// ---------------------------------------------------------------------------

/// Marker prefix for commit timestamp lines in `git log` output; never
/// appears in path names.
const LOG_TS_PREFIX: char = '\x01';

/// Production backend composing two external git invocations: a file lister
/// (`ls-tree`) and a history walker (`log --name-only`), plus `cat-file`
/// for blob contents.
pub struct GitCli {
    repo_path: PathBuf,
}

impl GitCli {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .map_err(|e| Error::BackendUnavailable(format!("git: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::BackendUnavailable(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RepoBackend for GitCli {
    fn head_files(&self) -> Result<Vec<(String, String)>> {
        let out = self.git(&["ls-tree", "-r", "HEAD"])?;
        Ok(parse_ls_tree(&out))
    }

    fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(["cat-file", "blob", blob_id])
            .output()
            .map_err(|e| Error::BackendUnavailable(format!("git: {}", e)))?;
        if !output.status.success() {
            return Err(Error::BackendUnavailable(format!(
                "git cat-file {} failed",
                blob_id
            )));
        }
        Ok(output.stdout)
    }

    fn commit_times(&self, max_commits: usize) -> Result<HashMap<String, Vec<i64>>> {
        let limit = format!("-n{}", max_commits);
        let format = format!("--format={}%ct", LOG_TS_PREFIX);
        let out = self.git(&["log", &limit, &format, "--name-only"])?;
        Ok(parse_log(&out))
    }
}

/// Parse `git ls-tree -r HEAD` output: `<mode> blob <sha>\t<path>` per line.
fn parse_ls_tree(output: &str) -> Vec<(String, String)> {
    let mut files = Vec::new();
    for line in output.lines() {
        let Some((meta, path)) = line.split_once('\t') else {
            continue;
        };
        let mut fields = meta.split_whitespace();
        let _mode = fields.next();
        let kind = fields.next();
        let sha = fields.next();
        if kind != Some("blob") {
            continue;
        }
        if let Some(sha) = sha {
            files.push((path.to_string(), sha.to_string()));
        }
    }
    files
}

/// Parse `git log --format=<TS_PREFIX>%ct --name-only` output into a map of
/// path -> commit timestamps, newest first (git log order).
fn parse_log(output: &str) -> HashMap<String, Vec<i64>> {
    let mut commits: HashMap<String, Vec<i64>> = HashMap::new();
    let mut current_ts: Option<i64> = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix(LOG_TS_PREFIX) {
            current_ts = rest.trim().parse::<i64>().ok();
            if current_ts.is_none() {
                debug!("Unparsable commit timestamp line: {}", line);
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }
        if let Some(ts) = current_ts {
            commits.entry(line.to_string()).or_default().push(ts);
        }
    }
    commits
}
