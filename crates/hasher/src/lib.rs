//! Content hashing and chunking for resumable uploads.
//!
//! Every digest is a hex-encoded SHA-256 over raw bytes, so a chunk digest
//! and a whole-file digest over the same bytes compare equal. Files are
//! streamed in [`HASH_WINDOW_SIZE`] windows and never loaded whole.

mod chunker;
mod digest;
mod service;
mod source;

pub use chunker::{ChunkDescriptor, ChunkPayload, split_file, split_file_with_progress, total_chunks};
pub use digest::{ContentHash, digest_bytes, digest_file, digest_file_with_progress, verify_file};
pub use service::{ContentHasher, HashRequest, HashResponse, HashService, ProgressFn};
pub use source::SourceFile;

/// Read window used while streaming a file through the hasher: 2 MiB.
///
/// Purely an I/O window; unrelated to the upload chunk size.
pub const HASH_WINDOW_SIZE: usize = 2 * 1024 * 1024;

/// Default upload chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced while hashing or chunking.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("file changed while reading: expected {expected} bytes, read {actual}")]
    SizeChanged { expected: u64, actual: u64 },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}
