//! Pipeline (C6): the central backup workflow. Walks the source tree,
//! fingerprints every entry, diffs the result against the most recent prior
//! snapshot, and uploads only what changed through a bounded worker pool
//! (spec §4.6, §5).

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex as PlMutex};
use pathpatterns::{MatchEntry, MatchList, MatchPattern, MatchType, Pattern};
use walkdir::WalkDir;

use crate::codec::chunker::FixedSizeChunker;
use crate::codec::Codec;
use crate::config::{Config, SYSTEM_ROOTS};
use crate::diff::{self, DiffResult};
use crate::error::{BackupError, Result};
use crate::fingerprint::{ChecksumCache, Fingerprinter};
use crate::index::{chunk_storage_key, new_backup_id, storage_key, ChunkRef, FileEntry, SnapshotIndex};
use crate::store::{ObjectStore, OBJECT_PREFIX};

const WORK_QUEUE_CAPACITY: usize = 256;

/// Cooperative cancellation: workers finish the file/chunk in flight but
/// start nothing new once set (spec §5 "cancellation is not atomic").
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Soft cap (spec §9 / SPEC_FULL §4.6) on bytes concurrently held by
/// in-flight upload buffers, distinct from `max_workers`'s bound on
/// concurrency itself: many small workers can still blow past a memory
/// budget if every one of them is holding a large chunk at once.
struct MemoryBudget {
    limit: u64,
    used: PlMutex<u64>,
    available: Condvar,
}

impl MemoryBudget {
    fn new(limit: u64) -> Self {
        Self { limit: limit.max(1), used: PlMutex::new(0), available: Condvar::new() }
    }

    /// Blocks until `bytes` fits under the budget, then reserves it. A
    /// request larger than the whole budget is let through alone once no
    /// other buffer is outstanding, rather than deadlocking forever.
    fn acquire(&self, bytes: u64) {
        let mut used = self.used.lock();
        while *used > 0 && *used + bytes > self.limit {
            self.available.wait(&mut used);
        }
        *used += bytes;
    }

    fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
        drop(used);
        self.available.notify_all();
    }
}

#[derive(Debug, Default, Clone)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

#[derive(Debug, Default, Clone)]
pub struct BackupReport {
    pub backup_id: String,
    pub diff: DiffSummary,
    pub uploaded_objects: u64,
    pub skipped_existing: u64,
    pub failed_files: Vec<(String, String)>,
    /// True iff the index object was uploaded (spec §6 exit semantics).
    pub completed: bool,
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn ObjectStore>,
    fingerprinter: Fingerprinter,
    codec: Arc<Codec>,
    skip_matchers: Vec<MatchEntry>,
    memory_budget: Arc<MemoryBudget>,
}

impl Pipeline {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let codec = Codec::new(
            &config.backup.encryption_key,
            config.backup.encryption_algo,
            config.backup.compression_level,
        )
        .map_err(BackupError::Other)?;
        let fingerprinter = Fingerprinter::new(config.backup.checksum_mode);
        let skip_matchers = build_skip_matchers(&config.skip_patterns());
        let memory_budget = Arc::new(MemoryBudget::new(config.backup.memory_limit));
        Ok(Self {
            config,
            store,
            fingerprinter,
            codec: Arc::new(codec),
            skip_matchers,
            memory_budget,
        })
    }

    pub fn checksum_cache(&self) -> &ChecksumCache {
        self.fingerprinter.cache()
    }

    pub fn run(&self, source_path: &Path) -> Result<BackupReport> {
        self.run_cancellable(source_path, &CancellationToken::new())
    }

    pub fn run_cancellable(&self, source_path: &Path, cancel: &CancellationToken) -> Result<BackupReport> {
        let backup_id = new_backup_id();
        let mut current = SnapshotIndex::new(backup_id.clone(), source_path.to_string_lossy().to_string());

        for entry in self.walk(source_path)? {
            current.files.push(entry);
        }
        current.total_files = current.files.iter().filter(|f| !f.is_directory).count() as u64;
        current.total_size = current.files.iter().map(|f| f.size).sum();

        let previous = self.latest_index()?;
        let diff_result = diff::diff(&current, previous.as_ref());
        let diff_summary = DiffSummary {
            added: diff_result.added.len(),
            modified: diff_result.modified.len(),
            deleted: diff_result.deleted.len(),
        };
        info!(
            "backup {backup_id}: {} added, {} modified, {} deleted",
            diff_summary.added, diff_summary.modified, diff_summary.deleted
        );

        let to_upload = pending_uploads(diff_result);
        let outcome = self.upload_all(source_path, to_upload, cancel);

        let updated_by_path: HashMap<String, FileEntry> =
            outcome.entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        for entry in current.files.iter_mut() {
            if let Some(updated) = updated_by_path.get(&entry.path) {
                *entry = updated.clone();
            }
        }

        let failed_paths: HashSet<String> = outcome.failed.iter().map(|(p, _)| p.clone()).collect();
        if !failed_paths.is_empty() {
            current.files.retain(|f| !failed_paths.contains(&f.path));
            current.total_files = current.files.iter().filter(|f| !f.is_directory).count() as u64;
        }
        current.compressed_size = current.files.iter().map(|f| f.compressed_size).sum();
        current.encrypted_size = current.files.iter().map(|f| f.encrypted_size).sum();

        if self.config.backup.strict && !outcome.failed.is_empty() {
            return Err(BackupError::StoragePermanent(format!(
                "{} file(s) failed during strict backup",
                outcome.failed.len()
            )));
        }

        if cancel.is_cancelled() {
            warn!("backup {backup_id}: cancelled before index upload, no snapshot emitted");
            return Ok(BackupReport {
                backup_id,
                diff: diff_summary,
                uploaded_objects: outcome.uploaded,
                skipped_existing: outcome.skipped,
                failed_files: outcome.failed,
                completed: false,
            });
        }

        current.save(self.store.as_ref())?;

        Ok(BackupReport {
            backup_id,
            diff: diff_summary,
            uploaded_objects: outcome.uploaded,
            skipped_existing: outcome.skipped,
            failed_files: outcome.failed,
            completed: true,
        })
    }

    fn latest_index(&self) -> Result<Option<SnapshotIndex>> {
        let indexes = SnapshotIndex::list_all(self.store.as_ref())?;
        Ok(indexes.into_iter().max_by_key(|idx| idx.created_at))
    }

    /// Enumerates `source_path` in directory-first order, applying the skip
    /// policy, and fingerprints every eligible entry.
    fn walk(&self, source_path: &Path) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        let mut it = WalkDir::new(source_path).follow_links(false).into_iter();
        while let Some(dir_entry) = it.next() {
            let dir_entry = match dir_entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("walk error: {err}");
                    continue;
                }
            };

            let abs_path = dir_entry.path();
            if abs_path == source_path {
                continue;
            }
            let rel_path = match abs_path.strip_prefix(source_path) {
                Ok(p) => normalize_path(p),
                Err(_) => continue,
            };
            if rel_path.is_empty() {
                continue;
            }
            if is_hidden(&rel_path) || is_system_root(abs_path) || is_skipped(&self.skip_matchers, &rel_path) {
                if dir_entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }

            let metadata = match dir_entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!("cannot stat '{}': {err}", rel_path);
                    continue;
                }
            };
            let mtime: DateTime<Utc> = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            let mode_string = format!("{:o}", metadata.permissions().mode() & 0o7777);

            if metadata.is_dir() {
                let checksum = Fingerprinter::fingerprint_directory(&rel_path, &mode_string, mtime);
                entries.push(FileEntry {
                    path: rel_path.clone(),
                    size: 0,
                    mtime,
                    checksum: hex::encode(checksum),
                    is_directory: true,
                    permissions: mode_string,
                    owner: "unknown".into(),
                    group: "unknown".into(),
                    storage_key: String::new(),
                    compressed_size: 0,
                    encrypted_size: 0,
                    chunks: None,
                });
                continue;
            }

            if !metadata.is_file() {
                continue; // symlinks, devices, sockets: not modeled by the spec's FileEntry
            }

            let size = metadata.len();
            let checksum = match self.fingerprinter.fingerprint_file(abs_path, &rel_path, size, mtime, &mode_string) {
                Ok(c) => c,
                Err(err) => {
                    warn!("cannot fingerprint '{}': {err}", rel_path);
                    continue;
                }
            };
            let key = storage_key(&checksum, &rel_path);

            entries.push(FileEntry {
                path: rel_path.clone(),
                size,
                mtime,
                checksum: hex::encode(checksum),
                is_directory: false,
                permissions: mode_string,
                owner: "unknown".into(),
                group: "unknown".into(),
                storage_key: key,
                compressed_size: 0,
                encrypted_size: 0,
                chunks: None,
            });
        }

        Ok(entries)
    }

    /// Uploads every entry in `pending` through a bounded worker pool,
    /// returning updated entries (with observed sizes and chunk lists) plus
    /// per-file failures. Never aborts on its own; strict-mode abort is the
    /// caller's decision once every worker has finished.
    fn upload_all(&self, source_path: &Path, pending: Vec<FileEntry>, cancel: &CancellationToken) -> UploadOutcome {
        let (tx, rx) = bounded::<FileEntry>(WORK_QUEUE_CAPACITY);
        let uploaded = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let updated = Arc::new(Mutex::new(Vec::with_capacity(pending.len())));
        let failed = Arc::new(Mutex::new(Vec::new()));

        let worker_count = self.config.backup.max_workers.max(1);
        let handles: Vec<_> = (0..worker_count)
            .map(|_| {
                let rx = rx.clone();
                let store = Arc::clone(&self.store);
                let codec = Arc::clone(&self.codec);
                let source_path = source_path.to_path_buf();
                let chunk_size = self.config.backup.chunk_size;
                let ultra_large = self.config.backup.ultra_large_threshold;
                let uploaded = Arc::clone(&uploaded);
                let skipped = Arc::clone(&skipped);
                let updated = Arc::clone(&updated);
                let failed = Arc::clone(&failed);
                let cancel = cancel.clone();
                let memory_budget = Arc::clone(&self.memory_budget);

                std::thread::spawn(move || {
                    for entry in rx.iter() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let abs_path = source_path.join(&entry.path);
                        match upload_one(
                            store.as_ref(),
                            codec.as_ref(),
                            &abs_path,
                            &entry,
                            chunk_size,
                            ultra_large,
                            &cancel,
                            memory_budget.as_ref(),
                        ) {
                            Ok((result, was_skip)) => {
                                if was_skip {
                                    skipped.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    uploaded.fetch_add(1, Ordering::Relaxed);
                                }
                                updated.lock().unwrap().push(result);
                            }
                            Err(err) => {
                                error!("upload failed for '{}': {err}", entry.path);
                                failed.lock().unwrap().push((entry.path.clone(), err.to_string()));
                            }
                        }
                    }
                })
            })
            .collect();

        for entry in pending {
            if tx.send(entry).is_err() {
                break;
            }
        }
        drop(tx);

        for handle in handles {
            let _ = handle.join();
        }

        UploadOutcome {
            entries: Arc::try_unwrap(updated).unwrap().into_inner().unwrap(),
            failed: Arc::try_unwrap(failed).unwrap().into_inner().unwrap(),
            uploaded: uploaded.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
        }
    }
}

struct UploadOutcome {
    entries: Vec<FileEntry>,
    failed: Vec<(String, String)>,
    uploaded: u64,
    skipped: u64,
}

fn pending_uploads(diff: DiffResult) -> Vec<FileEntry> {
    let mut pending = Vec::with_capacity(diff.added.len() + diff.modified.len());
    pending.extend(diff.added);
    pending.extend(diff.modified);
    pending.retain(|e| !e.is_directory);
    pending
}

/// Uploads one non-directory entry, choosing whole-buffer or streaming
/// chunked encoding per spec §4.2. Returns the updated entry plus whether
/// the payload was already present (skip-upload dedup, spec §4.6 step 6).
fn upload_one(
    store: &dyn ObjectStore,
    codec: &Codec,
    abs_path: &Path,
    entry: &FileEntry,
    chunk_size: u64,
    ultra_large_threshold: u64,
    cancel: &CancellationToken,
    memory_budget: &MemoryBudget,
) -> Result<(FileEntry, bool)> {
    let mut result = entry.clone();

    if entry.size >= chunk_size || entry.size >= ultra_large_threshold {
        let file = File::open(abs_path)?;
        let mut chunker = FixedSizeChunker::new(file, chunk_size as usize);
        let mut checksum_bytes = [0u8; 32];
        hex::decode_to_slice(&entry.checksum, &mut checksum_bytes)
            .map_err(|e| BackupError::Other(anyhow::anyhow!("invalid checksum hex for '{}': {e}", entry.path)))?;

        let mut chunks = Vec::new();
        let mut total_compressed = 0u64;
        let mut total_encrypted = 0u64;
        let mut index = 0u32;
        let mut all_skipped = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            memory_budget.acquire(chunk_size);
            let chunk = chunker.next_chunk()?;
            let chunk = match chunk {
                Some(c) => c,
                None => {
                    memory_budget.release(chunk_size);
                    break;
                }
            };
            let key = chunk_storage_key(&checksum_bytes, &entry.path, index);
            let object_key = format!("{OBJECT_PREFIX}{key}");

            let result_sizes = (|| -> Result<(u64, u64)> {
                if store.exists(&object_key)? {
                    // size unknown without a head-with-size call beyond the narrow
                    // §4.1 contract; existence under a content-addressed key is
                    // treated as sufficient evidence of correct content.
                    Ok((0, 0))
                } else {
                    all_skipped = false;
                    let encoded = codec
                        .encode(&chunk)
                        .map_err(|e| BackupError::CodecCorruption { path: entry.path.clone(), reason: e.to_string() })?;
                    store.put(&object_key, &encoded.bytes, None)?;
                    Ok((encoded.compressed_size, encoded.encrypted_size))
                }
            })();
            memory_budget.release(chunk_size);
            let (compressed_size, encrypted_size) = result_sizes?;

            total_compressed += compressed_size;
            total_encrypted += encrypted_size;
            chunks.push(ChunkRef { index, storage_key: key, encrypted_size });
            index += 1;
        }

        result.compressed_size = total_compressed;
        result.encrypted_size = total_encrypted;
        result.chunks = Some(chunks);
        return Ok((result, all_skipped));
    }

    let object_key = format!("{OBJECT_PREFIX}{}", entry.storage_key);
    if store.exists(&object_key)? {
        return Ok((result, true));
    }

    memory_budget.acquire(entry.size);
    let outcome = (|| -> Result<_> {
        let mut file = File::open(abs_path)?;
        let mut plaintext = Vec::with_capacity(entry.size as usize);
        file.read_to_end(&mut plaintext)?;

        let encoded = codec
            .encode(&plaintext)
            .map_err(|e| BackupError::CodecCorruption { path: entry.path.clone(), reason: e.to_string() })?;
        store.put(&object_key, &encoded.bytes, None)?;
        Ok((encoded.compressed_size, encoded.encrypted_size))
    })();
    memory_budget.release(entry.size);
    let (compressed_size, encrypted_size) = outcome?;

    result.compressed_size = compressed_size;
    result.encrypted_size = encrypted_size;
    Ok((result, false))
}

fn normalize_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A path is hidden if *any* component starts with `.`, not just its
/// basename — otherwise `.git/config` would be indexed because `config`
/// itself isn't a dotfile, defeating the point of skipping `.git/` entirely.
fn is_hidden(rel_path: &str) -> bool {
    rel_path.split('/').any(|component| component.starts_with('.'))
}

fn is_system_root(abs_path: &Path) -> bool {
    SYSTEM_ROOTS.iter().any(|root| abs_path.starts_with(root))
}

fn build_skip_matchers(patterns: &[String]) -> Vec<MatchEntry> {
    patterns
        .iter()
        .filter_map(|pattern| {
            Pattern::path(pattern.as_bytes())
                .ok()
                .map(|compiled| MatchEntry::new(MatchPattern::Pattern(compiled), MatchType::Exclude))
        })
        .collect()
}

fn is_skipped(matchers: &[MatchEntry], rel_path: &str) -> bool {
    matches!(matchers.matches(rel_path.as_bytes(), None), Some(MatchType::Exclude))
}
