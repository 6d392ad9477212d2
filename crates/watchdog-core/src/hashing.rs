//! Streaming multi-algorithm hashing and metadata snapshots.
//!
//! Files are read once in 64 KiB blocks and every requested digest is updated
//! from the same buffer, so memory stays bounded and hashing N algorithms
//! costs one pass over the file.

use crate::error::{Result, WatchdogError};
use crate::models::{FileMetadata, HashAlgorithm};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;

/// Block size for streaming reads (64KB)
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Hashes and metadata captured from one open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hashes: BTreeMap<HashAlgorithm, String>,
    pub metadata: FileMetadata,
}

enum RunningDigest {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl RunningDigest {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, block: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(block),
            Self::Sha512(h) => h.update(block),
            Self::Blake3(h) => {
                h.update(block);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

fn digests_for(algorithms: &[HashAlgorithm]) -> Result<Vec<(HashAlgorithm, RunningDigest)>> {
    let unique: BTreeSet<HashAlgorithm> = algorithms.iter().copied().collect();
    if unique.is_empty() {
        return Err(WatchdogError::Config(
            "at least one hash algorithm is required".into(),
        ));
    }
    Ok(unique
        .into_iter()
        .map(|algo| (algo, RunningDigest::new(algo)))
        .collect())
}

/// Stream `reader` through one running digest per algorithm.
pub fn hash_reader<R: Read>(
    reader: &mut R,
    algorithms: &[HashAlgorithm],
) -> std::io::Result<BTreeMap<HashAlgorithm, String>> {
    let mut digests = digests_for(algorithms)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let mut buffer = vec![0u8; BLOCK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        for (_, digest) in digests.iter_mut() {
            digest.update(&buffer[..n]);
        }
    }
    Ok(digests
        .into_iter()
        .map(|(algo, digest)| (algo, digest.finalize_hex()))
        .collect())
}

/// Compute every requested digest of the file at `path`.
pub fn compute_hashes(
    path: &Path,
    algorithms: &[HashAlgorithm],
) -> Result<BTreeMap<HashAlgorithm, String>> {
    digests_for(algorithms)?;
    let (mut file, _) = open_regular(path)?;
    hash_reader(&mut file, algorithms).map_err(|e| WatchdogError::file(path, e))
}

/// Metadata of the file at `path`, following symlinks.
pub fn snapshot_metadata(path: &Path) -> Result<FileMetadata> {
    let meta = fs::metadata(path).map_err(|e| WatchdogError::file(path, e))?;
    Ok(metadata_from(&meta))
}

/// Open `path` once, read its metadata from the handle, then hash it.
pub fn fingerprint(path: &Path, algorithms: &[HashAlgorithm]) -> Result<Fingerprint> {
    digests_for(algorithms)?;
    let (mut file, meta) = open_regular(path)?;
    let metadata = metadata_from(&meta);
    let hashes = hash_reader(&mut file, algorithms).map_err(|e| WatchdogError::file(path, e))?;
    Ok(Fingerprint { hashes, metadata })
}

fn not_regular() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "not a regular file")
}

/// Open `path` for reading only if it is a regular file.
///
/// The type is checked before opening so FIFOs and devices are never opened,
/// and the handle is opened non-blocking on unix so a swap between the check
/// and the open cannot block. The handle's own metadata must still describe
/// the same regular file.
fn open_regular(path: &Path) -> Result<(File, fs::Metadata)> {
    let before = fs::metadata(path).map_err(|e| WatchdogError::file(path, e))?;
    if !before.is_file() {
        return Err(WatchdogError::file(path, not_regular()));
    }

    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NONBLOCK);
    }
    let file = options.open(path).map_err(|e| WatchdogError::file(path, e))?;

    let meta = file.metadata().map_err(|e| WatchdogError::file(path, e))?;
    if !meta.is_file() {
        return Err(WatchdogError::file(path, not_regular()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if (meta.dev(), meta.ino()) != (before.dev(), before.ino()) {
            return Err(WatchdogError::file(
                path,
                io::Error::new(io::ErrorKind::Other, "file replaced while opening"),
            ));
        }
    }
    Ok((file, meta))
}

pub fn metadata_from(meta: &fs::Metadata) -> FileMetadata {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileMetadata {
            size: meta.len(),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            mode: meta.mode(),
            file_id: meta.ino(),
        }
    }
    #[cfg(not(unix))]
    {
        let to_utc = |t: std::io::Result<std::time::SystemTime>| {
            t.map(DateTime::<Utc>::from).unwrap_or_default()
        };
        FileMetadata {
            size: meta.len(),
            mtime: to_utc(meta.modified()),
            atime: to_utc(meta.accessed()),
            ctime: to_utc(meta.created()),
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            file_id: 0,
        }
    }
}

#[cfg(unix)]
fn unix_time(secs: i64, nsecs: i64) -> DateTime<Utc> {
    use chrono::TimeZone;
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    Utc.timestamp_opt(secs, nsecs).single().unwrap_or_default()
}
