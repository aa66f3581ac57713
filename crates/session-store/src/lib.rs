//! Resumable upload sessions persisted across restarts.
//!
//! Sessions live under a single storage key as one JSON document. Every
//! operation is a synchronous read-modify-write under one lock, and
//! persistence failures are logged and absorbed: losing resumability must
//! never fail an upload.

mod backend;
mod session;
mod store;
mod sweeper;

pub use backend::{FileBackend, MemoryBackend, StorageBackend, default_config_dir, default_session_dir};
pub use session::{AccessLevel, UploadOptions, UploadSession};
pub use store::SessionStore;
pub use sweeper::{DEFAULT_SWEEP_INTERVAL, spawn_sweeper};

use std::time::Duration;

/// Storage key holding every session.
pub const STORAGE_KEY: &str = "upload_sessions";

/// Current on-disk format version.
pub const FORMAT_VERSION: u64 = 1;

/// Sessions older than this (by creation time) are discarded.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from the persistence layer.
///
/// [`SessionStore`] logs these instead of returning them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported session format version {0}")]
    UnsupportedVersion(u64),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
