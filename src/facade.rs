//! The transport-independent request surface.
//!
//! Owns the task queue and the engine worker; translates requests into
//! enqueued tasks and hands back completion handles. The transport layer
//! (HTTP routes, CLI) never touches the engine directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::engine::{Engine, QueryOptions};
use crate::error::Result;
use crate::merge::{self, QueryResults};
use crate::queue::{
    self, DEFAULT_QUEUE_CAPACITY, EngineFactory, StatusReport, TaskHandle, TaskQueue,
};
use crate::repository::build_globset;

/// Optional per-query filters carried alongside the query text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryFilters {
    /// Path globs a result must match (empty = everything).
    pub include: Vec<String>,
    /// Path globs that remove results.
    pub exclude: Vec<String>,
    /// Cap on total result lines.
    pub limit_lines: Option<usize>,
    pub context_above: Option<u32>,
    pub context_below: Option<u32>,
    /// Milliseconds the query may wait before execution begins.
    pub timeout_ms: Option<u64>,
}

pub(crate) fn filters_to_options(filters: &QueryFilters) -> Result<QueryOptions> {
    let include = if filters.include.is_empty() {
        None
    } else {
        Some(build_globset(&filters.include)?)
    };
    let exclude = if filters.exclude.is_empty() {
        None
    } else {
        Some(build_globset(&filters.exclude)?)
    };
    Ok(QueryOptions {
        limit_lines: filters.limit_lines.unwrap_or(merge::DEFAULT_LINE_LIMIT),
        context_above: filters.context_above.unwrap_or(merge::CONTEXT_LINES),
        context_below: filters.context_below.unwrap_or(merge::CONTEXT_LINES),
        include,
        exclude,
        ..QueryOptions::default()
    })
}

pub struct SearchFacade {
    queue: Arc<TaskQueue>,
    worker: Option<JoinHandle<()>>,
    repo_path: PathBuf,
}

impl SearchFacade {
    /// Start the facade for a repository: builds the production engine,
    /// spawns the worker, and kicks off the first maintenance pass.
    pub fn start(config: AppConfig, repo_path: &Path) -> Result<Self> {
        let engine = Engine::new(config, repo_path)?;
        let path = repo_path.to_path_buf();
        let factory: EngineFactory = Box::new(move |new_config| Engine::new(new_config, &path));
        Ok(Self::start_with(engine, factory, repo_path))
    }

    /// Start from an already-built engine and reload factory (tests inject
    /// in-memory collaborators here).
    pub fn start_with(engine: Engine, factory: EngineFactory, repo_path: &Path) -> Self {
        let queue = Arc::new(TaskQueue::new(DEFAULT_QUEUE_CAPACITY));
        let worker = queue::spawn_worker(engine, queue.clone(), factory);
        // Analyze promptly instead of waiting out the first idle interval.
        queue::request_maintenance(&queue);
        info!("Search facade started for {}", repo_path.display());
        Self {
            queue,
            worker: Some(worker),
            repo_path: repo_path.to_path_buf(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Enqueue a query; the handle resolves with ranked blocks or a typed
    /// error. Queries run at the highest priority and preempt analysis.
    pub fn submit_query(
        &self,
        text: &str,
        filters: &QueryFilters,
    ) -> Result<TaskHandle<QueryResults>> {
        let options = filters_to_options(filters)?;
        let deadline = filters
            .timeout_ms
            .map(|ms| Instant::now() + std::time::Duration::from_millis(ms));
        queue::query_handle(
            &self.queue,
            text.to_string(),
            options,
            deadline,
            Default::default(),
        )
    }

    pub fn get_status(&self) -> Result<TaskHandle<StatusReport>> {
        queue::stats_handle(&self.queue)
    }

    /// Swap in a freshly-built engine under the new configuration. Runs at
    /// maintenance priority, so queries already queued drain first.
    pub fn reload_config(&self, config: AppConfig) -> Result<TaskHandle<()>> {
        queue::reload_handle(&self.queue, config)
    }

    /// Ask for an analysis pass without waiting for the idle interval.
    pub fn request_maintenance(&self) {
        queue::request_maintenance(&self.queue);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Close the queue, join the worker, persist engine state.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.queue.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Engine worker panicked during shutdown");
            }
        }
    }
}

impl Drop for SearchFacade {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_map_onto_query_options() {
        let filters = QueryFilters {
            include: vec!["src/**".to_string()],
            exclude: vec!["src/vendor/**".to_string()],
            limit_lines: Some(42),
            context_above: Some(1),
            context_below: Some(0),
            timeout_ms: None,
        };
        let options = filters_to_options(&filters).unwrap();
        assert_eq!(options.limit_lines, 42);
        assert_eq!(options.context_above, 1);
        assert_eq!(options.context_below, 0);
        assert!(options.include.unwrap().is_match("src/a.rs"));
        assert!(options.exclude.unwrap().is_match("src/vendor/a.rs"));
    }

    #[test]
    fn default_filters_fall_back_to_defaults() {
        let options = filters_to_options(&QueryFilters::default()).unwrap();
        assert_eq!(options.limit_lines, 500);
        assert_eq!(options.context_above, 3);
        assert_eq!(options.context_below, 3);
        assert!(options.include.is_none());
        assert!(options.exclude.is_none());
    }

    #[test]
    fn bad_globs_fail_fast() {
        let filters = QueryFilters {
            include: vec!["src/[".to_string()],
            ..Default::default()
        };
        assert!(filters_to_options(&filters).is_err());
    }
}
