//! ObjectStore (C1): the narrow key -> bytes interface the rest of the
//! engine consumes. `indexes/` and `objects/` are the only two key prefixes
//! the engine writes to; the store itself is oblivious to what they mean.

mod retry;
mod s3;
mod webdav;

pub use retry::{with_retry, RetryPolicy};
pub use s3::S3Store;
pub use webdav::WebDavStore;

use crate::config::{BackupConfig, StorageConfig};
use crate::error::Result;

pub const INDEX_PREFIX: &str = "indexes/";
pub const OBJECT_PREFIX: &str = "objects/";

/// One entry returned by `ObjectStore::list`.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

/// Optional storage-class hint passed to `put`; backends that don't support
/// storage classes (WebDAV) ignore it.
#[derive(Debug, Clone)]
pub struct StorageClassHint(pub String);

/// The minimal object-store contract described in spec §4.1. Implementations
/// are expected to retry transient failures internally (see `with_retry`);
/// callers only ever see `StorageTransient` after retries are exhausted
/// (converted by the backend into `StoragePermanent`), or `StoragePermanent`
/// directly for non-retryable failures.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], storage_class: Option<&StorageClassHint>) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn test_connectivity(&self) -> Result<()>;
}

/// Build an `ObjectStore` from configuration, selecting the backend by
/// `storage.type`. `backup` supplies the retry/timeout knobs (spec §4.1,
/// §6: `retry_attempts`, `retry_delay`, `network_timeout`) that are common
/// to every backend rather than specific to one storage type.
pub fn build(config: &StorageConfig, backup: &BackupConfig) -> Result<Box<dyn ObjectStore>> {
    match config {
        StorageConfig::S3(s3_config) => Ok(Box::new(S3Store::new(s3_config, backup)?)),
        StorageConfig::Webdav(dav_config) => Ok(Box::new(WebDavStore::new(dav_config, backup)?)),
    }
}
