//! Result merger: fuses vector and regex hits into ranked, context-bearing
//! blocks.
//!
//! Scoring combines semantic similarity with file frecency; each hit is
//! expanded into a context window, nearby runs are bridged into one maximal
//! block, and blocks rank by their strongest line so a good hit promotes its
//! whole block without weak surroundings diluting it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::sources::{Hit, SourceKind};

/// Weight of semantic similarity in the composite line score.
pub const SIMILARITY_WEIGHT: f32 = 0.7;

/// Weight of file frecency in the composite line score.
pub const FRECENCY_WEIGHT: f32 = 0.3;

/// Context window radius, in lines, on each side of a hit.
pub const CONTEXT_LINES: u32 = 3;

/// Score decay per line of distance for context lines.
pub const CONTEXT_DECAY: f32 = 0.8;

/// Two runs within this many lines of each other merge into one block.
pub const BRIDGE_GAP: u32 = 2;

/// Bridge lines score `min(neighbors) * BRIDGE_PENALTY`.
pub const BRIDGE_PENALTY: f32 = 0.5;

/// Default cap on total result lines per query.
pub const DEFAULT_LINE_LIMIT: usize = 500;

/// How a line earned its place in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// The line contributed an actual hit.
    Result,
    /// An expansion line around a hit.
    Context,
    /// A synthetic line filling the gap between two nearby runs.
    Bridge,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultLine {
    pub line: u32,
    pub line_text: String,
    pub score: f32,
    pub result_types: BTreeSet<ResultType>,
    pub sources: BTreeSet<SourceKind>,
}

/// A maximal contiguous run of result lines from one file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBlock {
    pub first_line: u32,
    pub last_line: u32,
    pub score: f32,
    pub lines: Vec<ResultLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileResults {
    pub path: String,
    pub blocks: Vec<ResultBlock>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    pub results: Vec<FileResults>,
    /// True when one source failed and only the other's hits are present.
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_error: Option<String>,
}

impl QueryResults {
    pub fn line_count(&self) -> usize {
        self.results
            .iter()
            .flat_map(|file| &file.blocks)
            .map(|block| block.lines.len())
            .sum()
    }
}

/// Line text and file extent lookups, served by the regex corpus. Blocks
/// reference lines by (path, line) through this seam, never by back-pointer.
pub trait LineProvider {
    fn line_text(&self, path: &str, line: u32) -> Option<&str>;
    fn last_line(&self, path: &str) -> Option<u32>;
}

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub limit_lines: usize,
    pub context_above: u32,
    pub context_below: u32,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            limit_lines: DEFAULT_LINE_LIMIT,
            context_above: CONTEXT_LINES,
            context_below: CONTEXT_LINES,
        }
    }
}

/// Scratch entry for one (path, line) while merging.
#[derive(Debug, Clone, Default)]
struct LineEntry {
    score: f32,
    result_types: BTreeSet<ResultType>,
    sources: BTreeSet<SourceKind>,
}

/// Merge hit lists into ranked blocks. Pure over its inputs: the same hits,
/// frecency map, and corpus produce an identical result.
pub fn merge(
    hits: &[Hit],
    frecency: &HashMap<String, f32>,
    provider: &dyn LineProvider,
    options: &MergeOptions,
) -> QueryResults {
    // Fuse hits per (path, line): the higher similarity wins, source tags
    // accumulate.
    let mut fused: BTreeMap<(String, u32), (f32, BTreeSet<SourceKind>)> = BTreeMap::new();
    for hit in hits {
        let entry = fused
            .entry((hit.path.clone(), hit.line))
            .or_insert_with(|| (0.0, BTreeSet::new()));
        entry.0 = entry.0.max(hit.score);
        entry.1.insert(hit.source);
    }

    // Composite scores plus context expansion, per path.
    let mut per_path: BTreeMap<String, BTreeMap<u32, LineEntry>> = BTreeMap::new();
    for ((path, line), (similarity, sources)) in &fused {
        let file_frecency = frecency.get(path).copied().unwrap_or(0.0);
        let composite = SIMILARITY_WEIGHT * similarity + FRECENCY_WEIGHT * file_frecency;
        let lines = per_path.entry(path.clone()).or_default();

        {
            let entry = lines.entry(*line).or_default();
            entry.score = entry.score.max(composite);
            entry.result_types.insert(ResultType::Result);
            entry.sources.extend(sources.iter().copied());
        }

        // No known extent for the path means no context to expand into.
        let Some(last) = provider.last_line(path) else {
            continue;
        };
        let first_ctx = line.saturating_sub(options.context_above).max(1);
        let last_ctx = line.saturating_add(options.context_below).min(last);
        for ctx_line in first_ctx..=last_ctx {
            if ctx_line == *line {
                continue;
            }
            let distance = ctx_line.abs_diff(*line);
            let decayed = composite * CONTEXT_DECAY.powi(distance as i32);
            let entry = lines.entry(ctx_line).or_default();
            entry.score = entry.score.max(decayed);
            entry.result_types.insert(ResultType::Context);
        }
    }

    // Bridge gaps of at most BRIDGE_GAP lines between otherwise-separate
    // runs. One pass over the sorted lines is idempotent and yields the
    // maximal block directly.
    for lines in per_path.values_mut() {
        let present: Vec<(u32, f32)> = lines.iter().map(|(l, e)| (*l, e.score)).collect();
        for window in present.windows(2) {
            let (prev_line, prev_score) = window[0];
            let (next_line, next_score) = window[1];
            let gap = next_line - prev_line - 1;
            if gap == 0 || gap > BRIDGE_GAP {
                continue;
            }
            let bridge_score = prev_score.min(next_score) * BRIDGE_PENALTY;
            for line in prev_line + 1..next_line {
                let entry = lines.entry(line).or_default();
                entry.score = entry.score.max(bridge_score);
                entry.result_types.insert(ResultType::Bridge);
            }
        }
    }

    // Cut contiguous runs into blocks.
    let mut blocks: Vec<(String, ResultBlock)> = Vec::new();
    for (path, lines) in per_path {
        let mut current: Vec<ResultLine> = Vec::new();
        let mut flush = |current: &mut Vec<ResultLine>, blocks: &mut Vec<(String, ResultBlock)>| {
            if current.is_empty() {
                return;
            }
            let score = current
                .iter()
                .map(|l| l.score)
                .fold(0.0f32, f32::max);
            blocks.push((
                path.clone(),
                ResultBlock {
                    first_line: current.first().map(|l| l.line).unwrap_or(0),
                    last_line: current.last().map(|l| l.line).unwrap_or(0),
                    score,
                    lines: std::mem::take(current),
                },
            ));
        };

        let mut previous: Option<u32> = None;
        for (line, entry) in lines {
            if previous.is_some_and(|p| line != p + 1) {
                flush(&mut current, &mut blocks);
            }
            previous = Some(line);
            current.push(ResultLine {
                line,
                line_text: provider
                    .line_text(&path, line)
                    .unwrap_or_default()
                    .to_string(),
                score: entry.score,
                result_types: entry.result_types,
                sources: entry.sources,
            });
        }
        flush(&mut current, &mut blocks);
    }

    // Rank: block score desc, path asc, first line asc.
    blocks.sort_by(|(path_a, a), (path_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| path_a.cmp(path_b))
            .then_with(|| a.first_line.cmp(&b.first_line))
    });

    // Line budget: every emitted line counts, bridges included. The final
    // block may be cut mid-way.
    let mut budget = options.limit_lines;
    let mut kept: Vec<(String, ResultBlock)> = Vec::new();
    for (path, mut block) in blocks {
        if budget == 0 {
            break;
        }
        if block.lines.len() > budget {
            block.lines.truncate(budget);
            block.last_line = block.lines.last().map(|l| l.line).unwrap_or(block.first_line);
            block.score = block.lines.iter().map(|l| l.score).fold(0.0f32, f32::max);
        }
        budget -= block.lines.len();
        kept.push((path, block));
    }

    // Group blocks by path, preserving rank order of files and of blocks
    // within a file.
    let mut results: Vec<FileResults> = Vec::new();
    let mut index_by_path: HashMap<String, usize> = HashMap::new();
    for (path, block) in kept {
        match index_by_path.get(&path) {
            Some(&i) => results[i].blocks.push(block),
            None => {
                index_by_path.insert(path.clone(), results.len());
                results.push(FileResults {
                    path,
                    blocks: vec![block],
                });
            }
        }
    }

    QueryResults {
        results,
        partial: false,
        regex_error: None,
    }
}
