//! Differ (C5): a pure function over two indexes, deterministic and
//! order-independent in its result (output sets are sorted by path).

use std::collections::HashMap;

use crate::index::{FileEntry, SnapshotIndex};

#[derive(Debug, Default)]
pub struct DiffResult {
    pub added: Vec<FileEntry>,
    pub modified: Vec<FileEntry>,
    pub deleted: Vec<FileEntry>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Two entries for the same path are "unchanged" iff checksum, size and
/// mtime are all equal; any mismatch classifies the path as modified.
fn unchanged(a: &FileEntry, b: &FileEntry) -> bool {
    a.checksum == b.checksum && a.size == b.size && a.mtime == b.mtime
}

pub fn diff(current: &SnapshotIndex, previous: Option<&SnapshotIndex>) -> DiffResult {
    let previous_by_path: HashMap<&str, &FileEntry> = match previous {
        Some(idx) => idx.files.iter().map(|f| (f.path.as_str(), f)).collect(),
        None => HashMap::new(),
    };
    let current_by_path: HashMap<&str, &FileEntry> = current.files.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut result = DiffResult::default();

    let mut current_paths: Vec<&str> = current_by_path.keys().copied().collect();
    current_paths.sort_unstable();
    for path in current_paths {
        let cur = current_by_path[path];
        match previous_by_path.get(path) {
            None => result.added.push(cur.clone()),
            Some(prev) if !unchanged(cur, prev) => result.modified.push(cur.clone()),
            Some(_) => {}
        }
    }

    let mut deleted_paths: Vec<&str> = previous_by_path
        .keys()
        .filter(|p| !current_by_path.contains_key(*p))
        .copied()
        .collect();
    deleted_paths.sort_unstable();
    for path in deleted_paths {
        result.deleted.push(previous_by_path[path].clone());
    }

    result
}
