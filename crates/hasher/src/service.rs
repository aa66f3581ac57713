//! Request/response messages for running the hasher behind a worker.
//!
//! Everything here is moved by value across the worker boundary; nothing
//! borrows from the caller.

use std::path::PathBuf;

use crate::{ChunkDescriptor, ContentHash, HashError};

/// Progress callback, called with a percentage in `[0, 100]`.
pub type ProgressFn = Box<dyn FnMut(f64) + Send>;

/// A unit of hashing work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashRequest {
    /// Digest a whole file.
    Digest { path: PathBuf },
    /// Digest an in-memory blob (typically one chunk).
    DigestOf { bytes: Vec<u8> },
    /// Split a file into chunks and digest each.
    Split { path: PathBuf, chunk_size: u64 },
    /// Recompute a file digest and compare.
    Verify { path: PathBuf, expected: ContentHash },
}

impl HashRequest {
    /// Short method name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Digest { .. } => "digest",
            Self::DigestOf { .. } => "digest_of",
            Self::Split { .. } => "split",
            Self::Verify { .. } => "verify",
        }
    }
}

/// Result of a [`HashRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashResponse {
    Digest(ContentHash),
    Chunks(Vec<ChunkDescriptor>),
    Verified(bool),
}

/// Executes hash requests synchronously on the calling thread.
pub trait HashService: Send {
    fn handle(
        &mut self,
        request: HashRequest,
        progress: &mut dyn FnMut(f64),
    ) -> Result<HashResponse, HashError>;
}

/// The SHA-256 hasher/chunker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHasher;

impl HashService for ContentHasher {
    fn handle(
        &mut self,
        request: HashRequest,
        progress: &mut dyn FnMut(f64),
    ) -> Result<HashResponse, HashError> {
        match request {
            HashRequest::Digest { path } => {
                crate::digest_file_with_progress(&path, progress).map(HashResponse::Digest)
            }
            HashRequest::DigestOf { bytes } => {
                let digest = crate::digest_bytes(&bytes);
                progress(100.0);
                Ok(HashResponse::Digest(digest))
            }
            HashRequest::Split { path, chunk_size } => {
                crate::split_file_with_progress(&path, chunk_size, progress)
                    .map(HashResponse::Chunks)
            }
            HashRequest::Verify { path, expected } => {
                crate::verify_file(&path, &expected, progress).map(HashResponse::Verified)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_every_method() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pic.png");
        std::fs::write(&path, b"pixels").unwrap();
        let expected = crate::digest_bytes(b"pixels");

        let mut hasher = ContentHasher;
        let mut ignore = |_: f64| {};

        let resp = hasher
            .handle(HashRequest::Digest { path: path.clone() }, &mut ignore)
            .unwrap();
        assert_eq!(resp, HashResponse::Digest(expected.clone()));

        let resp = hasher
            .handle(HashRequest::DigestOf { bytes: b"pixels".to_vec() }, &mut ignore)
            .unwrap();
        assert_eq!(resp, HashResponse::Digest(expected.clone()));

        let resp = hasher
            .handle(
                HashRequest::Split {
                    path: path.clone(),
                    chunk_size: 4,
                },
                &mut ignore,
            )
            .unwrap();
        let HashResponse::Chunks(chunks) = resp else {
            panic!("expected chunks");
        };
        assert_eq!(chunks.len(), 2);

        let resp = hasher
            .handle(HashRequest::Verify { path, expected }, &mut ignore)
            .unwrap();
        assert_eq!(resp, HashResponse::Verified(true));
    }

    #[test]
    fn read_error_is_returned_not_swallowed() {
        let mut hasher = ContentHasher;
        let result = hasher.handle(
            HashRequest::Digest {
                path: PathBuf::from("/nonexistent/imgup/missing.png"),
            },
            &mut |_| {},
        );
        assert!(matches!(result, Err(HashError::Io(_))));
    }

    #[test]
    fn method_names() {
        assert_eq!(HashRequest::DigestOf { bytes: vec![] }.method(), "digest_of");
        assert_eq!(
            HashRequest::Split {
                path: PathBuf::new(),
                chunk_size: 1
            }
            .method(),
            "split"
        );
    }
}
