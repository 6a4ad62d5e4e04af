//! Embedding layer: the named-function registry behind
//! `server.chroma.embeddingFunction`.
//!
//! The core treats the embedding function as opaque: a deterministic map
//! from text to a fixed-dimension vector. The production implementation is
//! Qwen3-Embedding-0.6B via fastembed's candle backend, lazily initialized
//! on first use; tests substitute their own `Embedder`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device};
use fastembed::Qwen3TextEmbedding;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Error, Result};

/// Embedding dimension for Qwen3-Embedding-0.6B (`config.hidden_size`).
const EMBEDDING_DIM: usize = 1024;

/// HuggingFace model repository for Qwen3-Embedding-0.6B.
const QWEN3_REPO_ID: &str = "Qwen/Qwen3-Embedding-0.6B";

/// Token truncation length. Qwen3 supports 32768; 8192 balances quality and
/// CPU memory for code chunks.
const QWEN3_MAX_LENGTH: usize = 8192;

/// A deterministic map from text to a fixed-dimension vector. Equal inputs
/// must produce equal outputs within one process lifetime.
pub trait Embedder: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

/// Resolve a named embedding function from configuration.
pub fn create_embedder(name: &str) -> Result<Arc<dyn Embedder>> {
    match name {
        "qwen3-embedding-0.6b" | "qwen3" => Ok(Arc::new(Qwen3Embedder::new())),
        other => Err(Error::Config(format!(
            "Unknown embedding function: {}",
            other
        ))),
    }
}

pub struct Qwen3Embedder {
    /// Wrapped in Mutex because `embed()` takes `&self` but the tokenizer
    /// is not Sync.
    model: Mutex<Option<Qwen3TextEmbedding>>,
    initialized: AtomicBool,
}

impl Default for Qwen3Embedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Qwen3Embedder {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Lazily initialize the model (downloads weights on first use).
    fn ensure_model(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut guard = self.model.lock();
        if guard.is_some() {
            self.initialized.store(true, Ordering::Release);
            return Ok(());
        }

        info!(
            "Initializing {} ({}d, max_len={})...",
            QWEN3_REPO_ID, EMBEDDING_DIM, QWEN3_MAX_LENGTH
        );

        let device = Device::Cpu;
        let model =
            Qwen3TextEmbedding::from_hf(QWEN3_REPO_ID, &device, DType::F32, QWEN3_MAX_LENGTH)
                .map_err(|e| {
                    Error::BackendUnavailable(format!("embedding model init: {}", e))
                })?;

        let actual_dim = model.config().hidden_size;
        if actual_dim != EMBEDDING_DIM {
            return Err(Error::Internal(format!(
                "Model dimension mismatch: expected {} but got {}",
                EMBEDDING_DIM, actual_dim
            )));
        }

        *guard = Some(model);
        self.initialized.store(true, Ordering::Release);
        info!("{} initialized ({}d, candle CPU)", QWEN3_REPO_ID, EMBEDDING_DIM);
        Ok(())
    }
}

impl Embedder for Qwen3Embedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.ensure_model()?;
        let guard = self.model.lock();
        let model = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("embedding model not initialized".to_string()))?;
        let docs: Vec<String> = texts.to_vec();
        model
            .embed(&docs)
            .map_err(|e| Error::BackendUnavailable(format!("embedding failed: {}", e)))
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}
