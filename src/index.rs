//! IndexModel (C4): the snapshot index data structure plus its
//! (de)serialization and storage-key derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};
use crate::store::{ObjectStore, INDEX_PREFIX};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    pub index: u32,
    pub storage_key: String,
    pub encrypted_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub checksum: String,
    pub is_directory: bool,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub storage_key: String,
    pub compressed_size: u64,
    pub encrypted_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkRef>>,
}

impl FileEntry {
    /// All object-store keys a live entry references (whole-file key, or one
    /// per chunk). Directory entries reference nothing.
    pub fn referenced_keys(&self) -> Vec<String> {
        if self.is_directory {
            return Vec::new();
        }
        match &self.chunks {
            Some(chunks) => chunks.iter().map(|c| c.storage_key.clone()).collect(),
            None => vec![self.storage_key.clone()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotIndex {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub source_path: String,
    pub total_files: u64,
    pub total_size: u64,
    pub compressed_size: u64,
    pub encrypted_size: u64,
    pub files: Vec<FileEntry>,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl SnapshotIndex {
    pub fn new(backup_id: String, source_path: String) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            backup_id,
            created_at: Utc::now(),
            source_path,
            total_files: 0,
            total_size: 0,
            compressed_size: 0,
            encrypted_size: 0,
            files: Vec::new(),
        }
    }

    pub fn key(backup_id: &str) -> String {
        format!("{INDEX_PREFIX}{backup_id}.json")
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self).map_err(|e| BackupError::Other(e.into()))?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BackupError::Other(e.into()))
    }

    pub fn save(&self, store: &dyn ObjectStore) -> Result<()> {
        let bytes = self.to_json()?;
        store.put(&Self::key(&self.backup_id), &bytes, None)
    }

    pub fn load(store: &dyn ObjectStore, backup_id: &str) -> Result<Self> {
        let bytes = store.get(&Self::key(backup_id))?;
        Self::from_json(&bytes)
    }

    /// All keys referenced by any entry in this snapshot (referential
    /// integrity set — retention must never delete one while this index is
    /// live).
    pub fn referenced_keys(&self) -> std::collections::HashSet<String> {
        self.files.iter().flat_map(|f| f.referenced_keys()).collect()
    }

    /// `backup_id`s of every snapshot currently stored, derived from the
    /// `indexes/` prefix without loading any index body.
    pub fn list_ids(store: &dyn ObjectStore) -> Result<Vec<String>> {
        let entries = store.list(INDEX_PREFIX)?;
        Ok(entries
            .into_iter()
            .filter_map(|meta| meta.key.strip_suffix(".json").map(|s| s.trim_start_matches(INDEX_PREFIX).to_string()))
            .collect())
    }

    /// Loads every snapshot's full index. Accepted cost per spec §4.4:
    /// indexes are small relative to payload.
    pub fn list_all(store: &dyn ObjectStore) -> Result<Vec<SnapshotIndex>> {
        let ids = Self::list_ids(store)?;
        ids.iter().map(|id| Self::load(store, id)).collect()
    }
}

/// `storage_key = hex(SHA256(checksum ‖ "_" ‖ path))`. Deterministic in
/// (checksum, path); stable across snapshots, disambiguates identical
/// content at different paths.
pub fn storage_key(checksum: &[u8; 32], path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hex::encode(checksum).as_bytes());
    hasher.update(b"_");
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Chunk keys derive from the same scheme as whole-file keys, with the
/// chunk index folded in so that two chunks of the same file never collide.
pub fn chunk_storage_key(file_checksum: &[u8; 32], path: &str, chunk_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hex::encode(file_checksum).as_bytes());
    hasher.update(b"_");
    hasher.update(path.as_bytes());
    hasher.update(b"_");
    hasher.update(chunk_index.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// `backup-YYYYMMDD-HHMMSS-<rand>`, monotonic under normal clocks.
pub fn new_backup_id() -> String {
    let now = Utc::now();
    let rand_suffix: String = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..6).map(|_| rng.sample(rand::distributions::Alphanumeric) as char).collect()
    };
    format!("backup-{}-{}", now.format("%Y%m%d-%H%M%S"), rand_suffix.to_lowercase())
}
