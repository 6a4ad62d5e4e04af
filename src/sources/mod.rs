//! The two heterogeneous index sources behind the engine.
//!
//! Both satisfy the same capability set (upsert chunks, query for hits,
//! delete by chunk id), and the merger consumes only tagged [`Hit`]s, never
//! a concrete source.

pub mod regex;
pub mod vector;

use serde::Serialize;

use crate::chunker::Chunk;
use crate::error::Result;

/// Which source produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Vector,
    Regex,
}

/// A single match returned by a source. `score` is the source-specific raw
/// similarity in [0, 1]: vector distance converted to similarity, regex
/// producing 1.0 on exact match.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub path: String,
    pub line: u32,
    pub score: f32,
    pub source: SourceKind,
}

/// Capability set shared by both index sources.
pub trait IndexSource {
    fn upsert(&mut self, chunks: &[Chunk]) -> Result<()>;
    fn query(&self, text: &str, limit: usize) -> Result<Vec<Hit>>;
    fn delete(&mut self, chunk_ids: &[String]) -> Result<()>;
}
