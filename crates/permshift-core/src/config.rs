//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound for the default worker count
const MAX_DEFAULT_WORKERS: usize = 16;

/// Outcomes between two progress notifications
const DEFAULT_PROGRESS_EVERY: u64 = 500;

const DEFAULT_RETAIN_FINISHED: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker threads applying mutations
    pub concurrency: usize,
    /// Capacity of the bounded node queue; enumeration blocks when it is full
    pub queue_capacity: usize,
    /// Maximum recursion depth below the root (unbounded when `None`)
    pub max_depth: Option<usize>,
    /// Descend into directories reached through symbolic links
    pub follow_links: bool,
    /// Push a progress notification every N outcomes
    pub progress_every: u64,
    /// Finished batches kept in memory for `progress`/`result` lookups
    pub retain_finished: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, MAX_DEFAULT_WORKERS);

        Self {
            concurrency: workers,
            queue_capacity: 1024,
            max_depth: None,
            follow_links: false,
            progress_every: DEFAULT_PROGRESS_EVERY,
            retain_finished: DEFAULT_RETAIN_FINISHED,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.progress_every == 0 {
            return Err(ConfigError::ZeroProgressInterval);
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn with_progress_every(mut self, every: u64) -> Self {
        self.progress_every = every;
        self
    }

    pub fn with_retain_finished(mut self, count: usize) -> Self {
        self.retain_finished = count;
        self
    }
}
