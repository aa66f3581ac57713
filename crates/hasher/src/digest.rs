use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{HASH_WINDOW_SIZE, HashError};

/// Hex-encoded SHA-256 digest identifying content by its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of the hex representation (32 bytes).
    pub const HEX_LEN: usize = 64;

    pub(crate) fn from_digest(bytes: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(bytes))
    }

    /// Returns the lowercase hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Computes the digest of an in-memory blob.
pub fn digest_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_digest(Sha256::digest(data))
}

/// Computes the digest of an entire file.
pub fn digest_file(path: &Path) -> Result<ContentHash, HashError> {
    digest_file_with_progress(path, |_| {})
}

/// Streams `path` through SHA-256 in [`HASH_WINDOW_SIZE`] windows.
///
/// `progress` receives the percentage read (0-100) after every window and
/// never decreases. An empty file reports a single `100.0`.
pub fn digest_file_with_progress(
    path: &Path,
    mut progress: impl FnMut(f64),
) -> Result<ContentHash, HashError> {
    let mut file = std::fs::File::open(path)?;
    let total = file.metadata()?.len();
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_WINDOW_SIZE];
    let mut read_bytes: u64 = 0;

    loop {
        let n = fill_window(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_bytes += n as u64;
        if read_bytes > total {
            return Err(HashError::SizeChanged {
                expected: total,
                actual: read_bytes,
            });
        }
        progress(percent(read_bytes, total));
    }

    if read_bytes != total {
        return Err(HashError::SizeChanged {
            expected: total,
            actual: read_bytes,
        });
    }
    if total == 0 {
        progress(100.0);
    }

    tracing::debug!(path = %path.display(), bytes = total, "file digested");
    Ok(ContentHash::from_digest(hasher.finalize()))
}

/// Recomputes the digest of `path` and compares it to `expected`.
///
/// A mismatch is a normal `Ok(false)`; only read failures are errors.
pub fn verify_file(
    path: &Path,
    expected: &ContentHash,
    progress: impl FnMut(f64),
) -> Result<bool, HashError> {
    let actual = digest_file_with_progress(path, progress)?;
    if &actual != expected {
        tracing::debug!(
            path = %path.display(),
            %expected,
            %actual,
            "digest mismatch"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Reads until `buf` is full or EOF. Returns the number of bytes read.
pub(crate) fn fill_window(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 * 100.0 / total as f64).min(100.0)
}
