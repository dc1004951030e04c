//! Fingerprinter (C3): produces the FileEntry `checksum` in one of three
//! modes, backed by a bounded, concurrency-safe cache.

pub mod cache;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::config::ChecksumMode;

pub use cache::{CacheStats, ChecksumCache};

const FAST_MODE_SMALL_FILE_THRESHOLD: u64 = 64 * 1024;
const FAST_MODE_EDGE_SAMPLE: usize = 8 * 1024;

pub struct Fingerprinter {
    mode: ChecksumMode,
    cache: ChecksumCache,
}

impl Fingerprinter {
    pub fn new(mode: ChecksumMode) -> Self {
        Self { mode, cache: ChecksumCache::new() }
    }

    pub fn cache(&self) -> &ChecksumCache {
        &self.cache
    }

    /// Computes (or retrieves from cache) the checksum for a regular file.
    pub fn fingerprint_file(
        &self,
        abs_path: &Path,
        rel_path: &str,
        size: u64,
        mtime: DateTime<Utc>,
        mode_string: &str,
    ) -> anyhow::Result<[u8; 32]> {
        let mode = self.mode;
        let abs_path_owned = abs_path.to_path_buf();
        let rel_path = rel_path.to_string();
        let mode_string = mode_string.to_string();
        self.cache.get_or_compute(abs_path, size, mtime, move || {
            compute_file_checksum(&abs_path_owned, &rel_path, size, mtime, &mode_string, mode)
        })
    }

    /// Directories are always fingerprinted the same way regardless of mode.
    pub fn fingerprint_directory(rel_path: &str, mode_string: &str, mtime: DateTime<Utc>) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(rel_path.as_bytes());
        hasher.update(mode_string.as_bytes());
        hasher.update(mtime.to_rfc3339().as_bytes());
        hasher.finalize().into()
    }
}

fn compute_file_checksum(
    abs_path: &Path,
    rel_path: &str,
    size: u64,
    mtime: DateTime<Utc>,
    mode_string: &str,
    mode: ChecksumMode,
) -> anyhow::Result<[u8; 32]> {
    match mode {
        ChecksumMode::Full => hash_whole_file(abs_path),
        ChecksumMode::Fast => {
            if size < FAST_MODE_SMALL_FILE_THRESHOLD {
                hash_whole_file(abs_path)
            } else {
                hash_fast(abs_path, size, mtime)
            }
        }
        ChecksumMode::Metadata => Ok(hash_metadata(rel_path, size, mtime, mode_string)),
    }
}

fn hash_whole_file(abs_path: &Path) -> anyhow::Result<[u8; 32]> {
    let mut file = File::open(abs_path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn hash_fast(abs_path: &Path, size: u64, mtime: DateTime<Utc>) -> anyhow::Result<[u8; 32]> {
    let mut file = File::open(abs_path)?;
    let mut hasher = Sha256::new();
    hasher.update(size.to_string().as_bytes());
    hasher.update(mtime.timestamp().to_string().as_bytes());

    let mut head = vec![0u8; FAST_MODE_EDGE_SAMPLE.min(size as usize)];
    file.read_exact(&mut head)?;
    hasher.update(&head);

    if size as usize > FAST_MODE_EDGE_SAMPLE {
        let tail_len = FAST_MODE_EDGE_SAMPLE.min(size as usize);
        file.seek(SeekFrom::End(-(tail_len as i64)))?;
        let mut tail = vec![0u8; tail_len];
        file.read_exact(&mut tail)?;
        hasher.update(&tail);
    }

    Ok(hasher.finalize().into())
}

fn hash_metadata(rel_path: &str, size: u64, mtime: DateTime<Utc>, mode_string: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(rel_path.as_bytes());
    hasher.update(size.to_string().as_bytes());
    hasher.update(mtime.timestamp().to_string().as_bytes());
    hasher.update(mode_string.as_bytes());
    hasher.finalize().into()
}
