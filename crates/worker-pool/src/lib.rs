//! Worker pool hosting one hasher per background thread.
//!
//! Callers submit [`HashRequest`](imgup_hasher::HashRequest)s from async
//! code; each runs on a dedicated OS thread so digesting large files never
//! blocks the runtime. A worker runs exactly one task at a time, and work
//! beyond the pool size waits in a FIFO overflow queue.
//!
//! There is no per-task cancellation. [`WorkerPool::destroy`] abandons all
//! in-flight and queued work at once.

mod config;
mod error;
mod pool;
mod worker;

pub use config::{MAX_WORKERS, PoolConfig, default_worker_count};
pub use error::PoolError;
pub use pool::{PoolStatus, ServiceFactory, WorkerPool};
