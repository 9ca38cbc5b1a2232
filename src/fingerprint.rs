//! # Content Fingerprinting
//!
//! Deterministic BLAKE3 content digests used for change detection. A
//! fingerprint is not an authentication tag; it only answers "is this the
//! same content?".
//!
//! The empty fingerprint doubles as the sentinel for "directory" and "file
//! does not exist", so callers can compare states without special cases.
//! A file that exists but cannot be read is reported as
//! [`SyncError::IntegrityFailure`], never as empty content.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 64 * 1024; // 64KB reads

/// Content digest. Empty means "no content known" (directory or absent file).
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "Fingerprint(<empty>)")
        } else {
            write!(f, "Fingerprint({})", self.to_hex())
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<blake3::Hash> for Fingerprint {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash.as_bytes().to_vec())
    }
}

/// Fingerprint an in-memory buffer.
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    blake3::hash(data).into()
}

/// Fingerprint a stream without buffering it. Produces the same digest as
/// [`fingerprint`] over the same bytes.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> std::io::Result<Fingerprint> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

/// Fingerprint a file on disk.
///
/// Directories and missing paths yield the empty fingerprint.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Fingerprint::empty());
        }
        Err(e) => return Err(SyncError::integrity(path, e)),
    };

    if metadata.is_dir() {
        return Ok(Fingerprint::empty());
    }

    let file = File::open(path).map_err(|e| SyncError::integrity(path, e))?;
    let digest = fingerprint_reader(file).map_err(|e| SyncError::integrity(path, e))?;

    debug!("Fingerprinted {} ({})", path.display(), digest);
    Ok(digest)
}

/// Same as [`fingerprint_file`], run on the blocking pool.
pub async fn fingerprint_file_async(path: &Path) -> Result<Fingerprint> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_file(&owned))
        .await
        .map_err(|e| {
            SyncError::integrity(path, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?
}

/// Symmetric comparison where an absent digest equals an empty one.
pub fn equal(a: Option<&Fingerprint>, b: Option<&Fingerprint>) -> bool {
    let empty = Fingerprint::empty();
    a.unwrap_or(&empty) == b.unwrap_or(&empty)
}

/// Does the file at `path` match `expected`?
///
/// An absent file matches an empty/absent expectation and directories always
/// match.
pub fn file_matches(path: &Path, expected: Option<&Fingerprint>) -> Result<bool> {
    if !path.exists() {
        return Ok(expected.map_or(true, Fingerprint::is_empty));
    }
    if path.is_dir() {
        return Ok(true);
    }

    let actual = fingerprint_file(path)?;
    Ok(equal(Some(&actual), expected))
}
