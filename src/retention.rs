//! Retention (C8): selects snapshots for expiry under an age/count policy
//! and deletes them through the safe-deletion protocol of spec §4.8 —
//! payloads before the index, so a crash between the two cannot orphan a
//! reference held by a remaining snapshot.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::RetentionConfig;
use crate::error::{BackupError, Result};
use crate::index::SnapshotIndex;
use crate::store::{ObjectStore, OBJECT_PREFIX};

#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub total_size: u64,
}

#[derive(Debug, Default, Clone)]
pub struct RetentionPlan {
    pub keep: Vec<SnapshotSummary>,
    pub delete: Vec<SnapshotSummary>,
    pub estimated_reclaimed_bytes: u64,
}

pub struct Retention<'a> {
    store: &'a dyn ObjectStore,
    policy: RetentionConfig,
}

impl<'a> Retention<'a> {
    pub fn new(store: &'a dyn ObjectStore, policy: RetentionConfig) -> Self {
        Self { store, policy }
    }

    /// `info` mode (spec §4.8): reports what would be deleted and an
    /// estimate of reclaimed bytes, without mutating anything. Always
    /// succeeds, even when the selection would empty the snapshot set —
    /// refusal is `apply`'s job, since `plan` never mutates state.
    pub fn plan(&self) -> Result<RetentionPlan> {
        let mut indexes = SnapshotIndex::list_all(self.store)?;
        indexes.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let to_delete_ids = select_for_deletion(&indexes, &self.policy);

        let live_keys: HashSet<String> = indexes
            .iter()
            .filter(|idx| !to_delete_ids.contains(&idx.backup_id))
            .flat_map(|idx| idx.referenced_keys())
            .collect();

        let mut key_sizes: HashMap<String, u64> = HashMap::new();
        for idx in &indexes {
            for file in &idx.files {
                if let Some(chunks) = &file.chunks {
                    for chunk in chunks {
                        key_sizes.insert(chunk.storage_key.clone(), chunk.encrypted_size);
                    }
                } else if !file.is_directory {
                    key_sizes.insert(file.storage_key.clone(), file.encrypted_size);
                }
            }
        }

        let mut deleted_only_keys: HashSet<String> = HashSet::new();
        for idx in indexes.iter().filter(|idx| to_delete_ids.contains(&idx.backup_id)) {
            deleted_only_keys.extend(idx.referenced_keys().into_iter().filter(|k| !live_keys.contains(k)));
        }
        let estimated_reclaimed_bytes = deleted_only_keys.iter().filter_map(|k| key_sizes.get(k)).sum();

        let mut keep = Vec::new();
        let mut delete = Vec::new();
        for idx in &indexes {
            let summary = SnapshotSummary {
                backup_id: idx.backup_id.clone(),
                created_at: idx.created_at,
                total_size: idx.total_size,
            };
            if to_delete_ids.contains(&idx.backup_id) {
                delete.push(summary);
            } else {
                keep.push(summary);
            }
        }

        Ok(RetentionPlan { keep, delete, estimated_reclaimed_bytes })
    }

    /// Apply mode: executes the safe-deletion protocol for everything
    /// `plan` selected. Re-derives live keys from a fresh listing rather
    /// than trusting the plan's snapshot of the world, since `plan` and
    /// `apply` may run arbitrarily far apart under the single-writer
    /// assumption (spec §9 open question on concurrent writers).
    ///
    /// Refuses (`PolicyViolation`) a plan that would delete every
    /// remaining snapshot unless `force` is set (spec §7); `plan` itself
    /// never refuses since it only reports.
    pub fn apply(&self, plan: &RetentionPlan, force: bool) -> Result<()> {
        let to_delete_ids: HashSet<String> = plan.delete.iter().map(|s| s.backup_id.clone()).collect();
        if to_delete_ids.is_empty() {
            return Ok(());
        }
        if !force && plan.keep.is_empty() {
            return Err(BackupError::PolicyViolation(
                "retention policy selected every remaining snapshot for deletion; pass force=true to proceed".into(),
            ));
        }

        let indexes = SnapshotIndex::list_all(self.store)?;
        let live_keys: HashSet<String> = indexes
            .iter()
            .filter(|idx| !to_delete_ids.contains(&idx.backup_id))
            .flat_map(|idx| idx.referenced_keys())
            .collect();

        for idx in indexes.iter().filter(|idx| to_delete_ids.contains(&idx.backup_id)) {
            for key in idx.referenced_keys().difference(&live_keys) {
                self.store.delete(&format!("{OBJECT_PREFIX}{key}"))?;
            }
            self.store.delete(&SnapshotIndex::key(&idx.backup_id))?;
        }

        Ok(())
    }
}

/// A snapshot is eligible iff `days` is set and its age exceeds it, OR
/// `max_backups` is set and its newest-first position exceeds it. Whether
/// a full-deletion selection is actually refused is `apply`'s call (spec
/// §7's `force` override), not this pure selection function's.
fn select_for_deletion(indexes: &[SnapshotIndex], policy: &RetentionConfig) -> HashSet<String> {
    let now = Utc::now();
    let mut to_delete = HashSet::new();

    for (position, idx) in indexes.iter().enumerate() {
        let age_expired = policy
            .days
            .map(|days| (now - idx.created_at).num_days() > days as i64)
            .unwrap_or(false);
        let count_expired = policy.max_backups.map(|max| position >= max as usize).unwrap_or(false);
        if age_expired || count_expired {
            to_delete.insert(idx.backup_id.clone());
        }
    }

    to_delete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ChunkRef, FileEntry};
    use crate::store::ObjectMeta;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    struct MemStore(Mutex<StdHashMap<String, Vec<u8>>>);

    impl MemStore {
        fn new() -> Self {
            Self(Mutex::new(StdHashMap::new()))
        }
    }

    impl ObjectStore for MemStore {
        fn put(&self, key: &str, bytes: &[u8], _storage_class: Option<&crate::store::StorageClassHint>) -> Result<()> {
            self.0.lock().unwrap().insert(key.to_string(), bytes.to_vec());
            Ok(())
        }
        fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.0.lock().unwrap().get(key).cloned().ok_or_else(|| BackupError::StoragePermanent(key.to_string()))
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.0.lock().unwrap().remove(key);
            Ok(())
        }
        fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .map(|k| ObjectMeta { key: k.clone(), size: 0, last_modified: Utc::now() })
                .collect())
        }
        fn exists(&self, key: &str) -> Result<bool> {
            Ok(self.0.lock().unwrap().contains_key(key))
        }
        fn test_connectivity(&self) -> Result<()> {
            Ok(())
        }
    }

    fn file_entry(path: &str, key: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.into(),
            size,
            mtime: Utc::now(),
            checksum: format!("checksum-{path}"),
            is_directory: false,
            permissions: "644".into(),
            owner: "unknown".into(),
            group: "unknown".into(),
            storage_key: key.into(),
            compressed_size: size,
            encrypted_size: size + 28,
            chunks: None,
        }
    }

    fn push_index(store: &MemStore, backup_id: &str, created_at: DateTime<Utc>, files: Vec<FileEntry>) {
        let mut idx = SnapshotIndex::new(backup_id.into(), "/src".into());
        idx.created_at = created_at;
        idx.files = files;
        idx.save(store).unwrap();
        for file in &idx.files {
            let key = format!("{OBJECT_PREFIX}{}", file.storage_key);
            if !store.0.lock().unwrap().contains_key(&key) {
                store.put(&key, b"payload", None).unwrap();
            }
        }
    }

    #[test]
    fn deleting_s1_does_not_delete_keys_shared_with_s2() {
        let store = MemStore::new();
        let now = Utc::now();
        push_index(&store, "backup-1", now - chrono::Duration::days(2), vec![file_entry("a.txt", "key-a", 5)]);
        push_index(
            &store,
            "backup-2",
            now,
            vec![file_entry("a.txt", "key-a", 5), file_entry("b.txt", "key-b", 9)],
        );

        let retention = Retention::new(&store, RetentionConfig { days: None, max_backups: Some(1) });
        let plan = retention.plan().unwrap();
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].backup_id, "backup-1");

        retention.apply(&plan, false).unwrap();

        assert!(store.exists(&format!("{OBJECT_PREFIX}key-a")).unwrap());
        assert!(store.exists(&format!("{OBJECT_PREFIX}key-b")).unwrap());
        assert!(!store.exists(&SnapshotIndex::key("backup-1")).unwrap());
        assert!(store.exists(&SnapshotIndex::key("backup-2")).unwrap());
    }

    #[test]
    fn deleting_both_snapshots_removes_shared_and_extra_keys() {
        let store = MemStore::new();
        let now = Utc::now();
        push_index(&store, "backup-1", now - chrono::Duration::days(2), vec![file_entry("a.txt", "key-a", 5)]);
        push_index(
            &store,
            "backup-2",
            now,
            vec![file_entry("a.txt", "key-a", 5), file_entry("b.txt", "key-b", 9)],
        );

        let retention = Retention::new(&store, RetentionConfig { days: Some(0), max_backups: None });
        let mut plan = retention.plan().unwrap();
        // force both: simulate a second run after backup-2 has also aged out
        plan.delete = plan.keep.drain(..).chain(plan.delete.drain(..)).collect();
        retention.apply(&plan, true).unwrap();

        assert!(!store.exists(&format!("{OBJECT_PREFIX}key-a")).unwrap());
        assert!(!store.exists(&format!("{OBJECT_PREFIX}key-b")).unwrap());
    }

    #[test]
    fn refuses_to_delete_every_snapshot_unless_forced() {
        let store = MemStore::new();
        let now = Utc::now();
        push_index(&store, "backup-1", now - chrono::Duration::days(40), vec![file_entry("a.txt", "key-a", 5)]);

        let retention = Retention::new(&store, RetentionConfig { days: Some(1), max_backups: None });
        let plan = retention.plan().unwrap();
        assert_eq!(plan.delete.len(), 1);
        assert!(plan.keep.is_empty());

        assert!(matches!(retention.apply(&plan, false), Err(BackupError::PolicyViolation(_))));
        assert!(store.exists(&SnapshotIndex::key("backup-1")).unwrap());

        retention.apply(&plan, true).unwrap();
        assert!(!store.exists(&SnapshotIndex::key("backup-1")).unwrap());
    }

    #[test]
    fn chunked_entries_contribute_their_chunk_keys_to_reclaim_estimate() {
        let store = MemStore::new();
        let now = Utc::now();
        let mut chunked = file_entry("big.bin", "unused", 0);
        chunked.chunks = Some(vec![
            ChunkRef { index: 0, storage_key: "chunk-0".into(), encrypted_size: 100 },
            ChunkRef { index: 1, storage_key: "chunk-1".into(), encrypted_size: 50 },
        ]);
        push_index(&store, "backup-1", now - chrono::Duration::days(40), vec![chunked]);
        push_index(&store, "backup-2", now, vec![file_entry("other.txt", "key-other", 3)]);

        let retention = Retention::new(&store, RetentionConfig { days: None, max_backups: Some(1) });
        let plan = retention.plan().unwrap();
        assert_eq!(plan.estimated_reclaimed_bytes, 150);
    }
}
