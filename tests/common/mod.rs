//! Shared test support for the end-to-end scenario tests: an in-memory
//! `ObjectStore` double (spec §9's `MemoryStore`, never compiled into the
//! library's public surface) plus small helpers for building a throwaway
//! `Config` and reading back a source tree's bytes for comparison.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bcrdf::config::{BackupConfig, ChecksumMode, Config, EncryptionAlgo, RetentionConfig, StorageConfig, WebDavConfig};
use bcrdf::error::{BackupError, Result};
use bcrdf::store::{ObjectMeta, ObjectStore, StorageClassHint};

/// Best-effort `env_logger` init so `RUST_LOG=debug cargo test` surfaces the
/// same `log` output the pipeline/restorer/retention emit in production;
/// ignored if already initialized by a prior test in the same binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object_count_under(&self, prefix: &str) -> usize {
        self.objects.lock().unwrap().keys().filter(|k| k.starts_with(prefix)).count()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8], _storage_class: Option<&StorageClassHint>) -> Result<()> {
        self.objects.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| BackupError::StoragePermanent(format!("no such object: {key}")))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| ObjectMeta { key: k.clone(), size: 0, last_modified: chrono::Utc::now() })
            .collect())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn test_connectivity(&self) -> Result<()> {
        Ok(())
    }
}

/// A config with small-ish defaults so scenario tests stay fast: 1 MiB
/// chunk size (instead of the 64 MiB production default) and a single
/// worker, since these tests don't exercise the worker pool's scale.
pub fn test_config(checksum_mode: ChecksumMode) -> Config {
    Config {
        storage: StorageConfig::Webdav(WebDavConfig {
            endpoint: "https://example.invalid/dav/".into(),
            username: None,
            password: None,
        }),
        backup: BackupConfig {
            encryption_key: "f".repeat(64),
            encryption_algo: EncryptionAlgo::Aes256Gcm,
            compression_level: 3,
            max_workers: 4,
            checksum_mode,
            chunk_size: 1024 * 1024,
            ultra_large_threshold: 64 * 1024 * 1024,
            memory_limit: 64 * 1024 * 1024,
            network_timeout: 30,
            retry_attempts: 3,
            retry_delay: 1,
            skip_patterns: vec![],
            strict: false,
        },
        retention: RetentionConfig::default(),
    }
}
