use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Maximum allowed length for search queries (characters).
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Canonical list of file extensions admitted into the index.
/// Both index sources consume files through the same scanner, so this
/// single list keeps them from diverging.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // JavaScript / TypeScript
    "ts", "tsx", "js", "jsx", "mjs", "cjs",
    // Systems / compiled
    "rs", "py", "go", "java", "c", "cpp", "h", "hpp",
    "cs", "rb", "php", "swift", "kt", "scala",
    // Web
    "html", "css", "scss", "less", "sass",
    // Data / config
    "json", "yaml", "yml", "toml", "xml",
    // Documentation
    "md", "mdx", "txt", "rst",
    // Query / schema
    "sql", "graphql", "gql",
    // Shell
    "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd",
    // Frontend frameworks
    "vue", "svelte", "astro",
    // Misc languages
    "lua", "zig", "nim", "dart", "elixir", "ex", "exs",
    "r", "jl", "clj", "cljs", "cljc", "erl", "hrl",
    // Infra / IPC
    "tf", "hcl", "proto",
    // Dotfiles / config
    "env", "ini", "cfg", "conf",
];

/// Check whether a file extension (without leading dot, lowercase) is in the
/// shared supported-extensions list.
pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

/// Name of the per-repository configuration file.
pub const REPO_CONFIG_FILE: &str = ".seagoat.yml";

fn default_port() -> u16 {
    9747
}

fn default_read_max_commits() -> usize {
    10_000
}

fn default_embedding_function() -> String {
    "qwen3-embedding-0.6b".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_host() -> String {
    format!("http://localhost:{}", default_port())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChromaConfig {
    /// Named embedding model resolved through the embedder registry.
    pub embedding_function: String,
    /// Max chunks per upsert batch.
    pub batch_size: usize,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            embedding_function: default_embedding_function(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Transport listen port.
    pub port: u16,
    /// Glob patterns excluded from indexing (repo-relative paths).
    pub ignore_patterns: Vec<String>,
    /// History depth for frecency scoring.
    pub read_max_commits: usize,
    pub chroma: ChromaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ignore_patterns: Vec::new(),
            read_max_commits: default_read_max_commits(),
            chroma: ChromaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Transport target for the CLI.
    pub host: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    /// Load configuration for a repository: the global file merged with the
    /// in-repo `.seagoat.yml`, the repo file winning on conflict. Missing
    /// files contribute nothing; unknown keys warn but never fail.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let global = global_config_file()
            .filter(|p| p.exists())
            .map(|p| read_yaml(&p))
            .transpose()?;
        let repo_file = repo_path.join(REPO_CONFIG_FILE);
        let repo = if repo_file.exists() {
            Some(read_yaml(&repo_file)?)
        } else {
            None
        };

        let merged = match (global, repo) {
            (Some(g), Some(r)) => merge_values(g, r),
            (Some(g), None) => g,
            (None, Some(r)) => r,
            (None, None) => serde_yaml::Value::Mapping(Default::default()),
        };

        for key in unknown_keys(&merged) {
            warn!("Unknown configuration key: {}", key);
        }

        serde_yaml::from_value(merged).map_err(|e| Error::Config(e.to_string()))
    }

    /// Parse a single YAML document (tests and `reload_config` payloads).
    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        for key in unknown_keys(&value) {
            warn!("Unknown configuration key: {}", key);
        }
        serde_yaml::from_value(value).map_err(|e| Error::Config(e.to_string()))
    }
}

fn global_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SEAGOAT_CONFIG_FILE") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|d| d.join("seagoat").join("config.yml"))
}

/// Root directory for persisted engine state (cache + vector store).
pub fn cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var("SEAGOAT_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("seagoat"))
        .unwrap_or_else(|| PathBuf::from(".seagoat-cache"))
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&text)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Deep-merge two YAML values; `over` wins on conflicting scalar keys,
/// mappings merge recursively, everything else is replaced wholesale.
fn merge_values(base: serde_yaml::Value, over: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, over) {
        (Value::Mapping(mut b), Value::Mapping(o)) => {
            for (k, v) in o {
                let merged = match b.remove(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => v,
                };
                b.insert(k, merged);
            }
            Value::Mapping(b)
        }
        (_, over) => over,
    }
}

/// Collect dotted paths of keys the schema does not recognize.
fn unknown_keys(value: &serde_yaml::Value) -> Vec<String> {
    const TOP: &[&str] = &["server", "client"];
    const SERVER: &[&str] = &["port", "ignorePatterns", "readMaxCommits", "chroma"];
    const CHROMA: &[&str] = &["embeddingFunction", "batchSize"];
    const CLIENT: &[&str] = &["host"];

    let mut out = Vec::new();
    let Some(map) = value.as_mapping() else {
        return out;
    };
    for (key, val) in map {
        let Some(name) = key.as_str() else { continue };
        if !TOP.contains(&name) {
            out.push(name.to_string());
            continue;
        }
        let (known, prefix): (&[&str], &str) = match name {
            "server" => (SERVER, "server"),
            _ => (CLIENT, "client"),
        };
        if let Some(section) = val.as_mapping() {
            for (k, v) in section {
                let Some(n) = k.as_str() else { continue };
                if !known.contains(&n) {
                    out.push(format!("{}.{}", prefix, n));
                } else if n == "chroma" {
                    if let Some(chroma) = v.as_mapping() {
                        for ck in chroma.keys() {
                            if let Some(cn) = ck.as_str() {
                                if !CHROMA.contains(&cn) {
                                    out.push(format!("server.chroma.{}", cn));
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    out.sort();
    out
}

/// Collect the dotted unknown keys without logging (used by tests).
#[doc(hidden)]
pub fn unknown_keys_of(value: &serde_yaml::Value) -> BTreeSet<String> {
    unknown_keys(value).into_iter().collect()
}
