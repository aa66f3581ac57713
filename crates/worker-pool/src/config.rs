use serde::{Deserialize, Serialize};

/// Upper bound on the default worker count.
pub const MAX_WORKERS: usize = 3;

/// Worker pool settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Explicit worker count. `None` uses [`default_worker_count`].
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl PoolConfig {
    /// Number of workers the pool will try to start (at least 1).
    pub fn worker_count(&self) -> usize {
        self.max_workers.unwrap_or_else(default_worker_count).max(1)
    }
}

/// Available hardware parallelism, capped at [`MAX_WORKERS`].
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_WORKERS)
}
