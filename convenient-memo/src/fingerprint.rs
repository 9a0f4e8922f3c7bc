//! Content fingerprinting with an mtime + size shortcut
//!
//! The SHA-256 content hash is authoritative. Modification time and size only
//! decide whether a previously computed hash may be reused without rereading
//! the file.

use crate::error::{MemoError, MemoResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Files modified this close to the moment their hash was recorded are
/// always re-hashed: a rewrite inside the same timestamp tick would
/// otherwise keep the old mtime and go unnoticed.
pub const DEFAULT_RACY_WINDOW: Duration = Duration::from_secs(2);

/// Identity of a file's contents at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Absolute path
    pub path: PathBuf,
    /// Hex SHA-256 of the contents
    pub hash: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch
    pub mtime_ns: u64,
}

impl FileFingerprint {
    /// Whether two fingerprints describe the same content at the same path.
    ///
    /// Modification time is deliberately left out.
    pub fn matches(&self, other: &FileFingerprint) -> bool {
        self.path == other.path && self.size == other.size && self.hash == other.hash
    }
}

/// Size and mtime of a regular file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch
    pub mtime_ns: u64,
}

impl FileStat {
    /// Stat `path`, failing with [`MemoError::Access`] unless it is a regular file
    pub fn of(path: &Path) -> MemoResult<Self> {
        let meta = fs::metadata(path).map_err(|e| MemoError::access(path, e))?;
        if !meta.is_file() {
            return Err(MemoError::access(
                path,
                io::Error::other("not a regular file"),
            ));
        }
        Ok(Self {
            size: meta.len(),
            mtime_ns: meta.modified().map(system_time_ns).unwrap_or(0),
        })
    }
}

/// Computes [`FileFingerprint`]s
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    racy_window: Duration,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter {
    /// Fingerprinter with [`DEFAULT_RACY_WINDOW`]
    pub fn new() -> Self {
        Self::with_racy_window(DEFAULT_RACY_WINDOW)
    }

    /// Fingerprinter with a custom racy window
    pub fn with_racy_window(racy_window: Duration) -> Self {
        Self { racy_window }
    }

    /// Hash `path` from scratch
    pub fn fingerprint(&self, path: &Path) -> MemoResult<FileFingerprint> {
        let stat = FileStat::of(path)?;
        let hash = hash_file(path)?;
        Ok(FileFingerprint {
            path: path.to_path_buf(),
            hash,
            size: stat.size,
            mtime_ns: stat.mtime_ns,
        })
    }

    /// Current fingerprint of `previous.path`.
    ///
    /// Reuses `previous.hash` when size and mtime are unchanged and the mtime
    /// lies outside the racy window before `recorded_at_ns`; re-hashes otherwise.
    pub fn refresh(
        &self,
        previous: &FileFingerprint,
        recorded_at_ns: u64,
    ) -> MemoResult<FileFingerprint> {
        let stat = FileStat::of(&previous.path)?;
        let settled = previous.mtime_ns != 0
            && previous
                .mtime_ns
                .saturating_add(self.racy_window.as_nanos() as u64)
                <= recorded_at_ns;

        if settled && stat.size == previous.size && stat.mtime_ns == previous.mtime_ns {
            return Ok(previous.clone());
        }

        let hash = hash_file(&previous.path)?;
        Ok(FileFingerprint {
            path: previous.path.clone(),
            hash,
            size: stat.size,
            mtime_ns: stat.mtime_ns,
        })
    }
}

/// Streaming SHA-256 of a file's contents, as a hex string
fn hash_file(path: &Path) -> MemoResult<String> {
    let mut file = File::open(path).map_err(|e| MemoError::access(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| MemoError::access(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn system_time_ns(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in nanoseconds since the Unix epoch
pub(crate) fn now_ns() -> u64 {
    system_time_ns(SystemTime::now())
}
