use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::digest::percent;
use crate::{ContentHash, HASH_WINDOW_SIZE, HashError};

/// Lazy reference to a byte range of a source file.
///
/// Bytes are re-read from disk by [`read`](Self::read) rather than held in
/// memory, so a chunk plan for a large file stays small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    path: Arc<PathBuf>,
    start: u64,
    end: u64,
}

impl ChunkPayload {
    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Source file the range points into.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the range from disk.
    pub fn read(&self) -> Result<Vec<u8>, HashError> {
        let mut file = std::fs::File::open(self.path.as_path())?;
        file.seek(SeekFrom::Start(self.start))?;
        let mut buf = vec![0u8; self.len() as usize];
        read_range(&mut file, &mut buf, self.end)?;
        Ok(buf)
    }
}

/// One fixed-size range of a file with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Zero-based position in the chunk plan.
    pub index: u64,
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
    pub payload: ChunkPayload,
    pub digest: ContentHash,
}

impl ChunkDescriptor {
    /// Length of the chunk in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of chunks needed to cover `file_size` bytes: `ceil(file_size / chunk_size)`.
///
/// Returns 0 when `chunk_size` is 0.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// Splits `path` into contiguous `chunk_size` ranges covering the whole file.
pub fn split_file(path: &Path, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, HashError> {
    split_file_with_progress(path, chunk_size, |_| {})
}

/// Splits `path` into `chunk_size` ranges and digests each one up front.
///
/// The last chunk holds the remainder. A zero-length file yields no chunks.
/// `progress` receives the percentage of bytes digested after every chunk.
pub fn split_file_with_progress(
    path: &Path,
    chunk_size: u64,
    mut progress: impl FnMut(f64),
) -> Result<Vec<ChunkDescriptor>, HashError> {
    if chunk_size == 0 {
        return Err(HashError::InvalidChunkSize(chunk_size));
    }

    let mut file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();
    let count = total_chunks(file_size, chunk_size);
    let shared_path = Arc::new(path.to_path_buf());

    let mut chunks = Vec::with_capacity(count as usize);
    let mut window = vec![0u8; chunk_size.min(HASH_WINDOW_SIZE as u64) as usize];

    for index in 0..count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(file_size);
        let digest = digest_next(&mut file, end - start, &mut window, file_size)?;

        chunks.push(ChunkDescriptor {
            index,
            start,
            end,
            payload: ChunkPayload {
                path: Arc::clone(&shared_path),
                start,
                end,
            },
            digest,
        });
        progress(percent(end, file_size));
    }

    tracing::debug!(
        path = %path.display(),
        file_size,
        chunk_size,
        chunks = chunks.len(),
        "file split"
    );
    Ok(chunks)
}

/// Streams the next `len` bytes of `file` through SHA-256, one `window` at a time.
fn digest_next(
    file: &mut std::fs::File,
    len: u64,
    window: &mut [u8],
    expected_end: u64,
) -> Result<ContentHash, HashError> {
    let mut hasher = Sha256::new();
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(window.len() as u64) as usize;
        read_range(file, &mut window[..n], expected_end)?;
        hasher.update(&window[..n]);
        remaining -= n as u64;
    }
    Ok(ContentHash::from_digest(hasher.finalize()))
}

/// Fills `buf` exactly; a short file surfaces as [`HashError::SizeChanged`].
fn read_range(file: &mut std::fs::File, buf: &mut [u8], expected_end: u64) -> Result<(), HashError> {
    let n = crate::digest::fill_window(file, buf)?;
    if n < buf.len() {
        let position = file.stream_position()?;
        return Err(HashError::SizeChanged {
            expected: expected_end,
            actual: position,
        });
    }
    Ok(())
}
