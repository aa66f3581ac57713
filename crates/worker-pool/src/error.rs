use imgup_hasher::HashError;

/// Errors returned to callers of [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("worker pool terminated")]
    Terminated,

    #[error("worker panicked while running {0}")]
    WorkerPanicked(&'static str),

    #[error("no hash worker available: {0}")]
    Unavailable(String),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}
