//! Immutable configuration surface consumed by the pipeline, restorer and
//! retention constructors (see DESIGN NOTES: "pass an immutable
//! configuration value into the pipeline constructor; avoid hidden
//! singletons"). Loading this from a file format and the interactive setup
//! wizard are external collaborators (out of scope); this module only
//! validates and normalizes a structured value that caller already built.

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_ULTRA_LARGE_THRESHOLD: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_WORKERS: usize = 32;
const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;
const DEFAULT_NETWORK_TIMEOUT: u64 = 300;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: u64 = 5;
const DEFAULT_COMPRESSION_LEVEL: u32 = 3;

pub const DEFAULT_SKIP_PATTERNS: &[&str] = &[
    "*.zip", "*.tar.gz", "*.rar", "*.7z", "*.iso", "*.vmdk", "*.vdi", "*.qcow2", "*.raw",
];

pub const SYSTEM_ROOTS: &[&str] = &["/proc", "/sys", "/dev", "/tmp", "/var/tmp"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    S3(S3Config),
    Webdav(WebDavConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionAlgo {
    Aes256Gcm,
    XChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    Full,
    Fast,
    Metadata,
}

impl Default for ChecksumMode {
    fn default() -> Self {
        ChecksumMode::Fast
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub encryption_key: String,
    pub encryption_algo: EncryptionAlgo,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub checksum_mode: ChecksumMode,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_ultra_large_threshold")]
    pub ultra_large_threshold: u64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,
    #[serde(default = "default_network_timeout")]
    pub network_timeout: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    #[serde(default)]
    pub strict: bool,
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_ultra_large_threshold() -> u64 {
    DEFAULT_ULTRA_LARGE_THRESHOLD
}
fn default_memory_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT
}
fn default_network_timeout() -> u64 {
    DEFAULT_NETWORK_TIMEOUT
}
fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}
fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub days: Option<u32>,
    pub max_backups: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Resolve credentials from the environment when the structured config
    /// left them unset, then validate. Never overrides an explicit value.
    pub fn finalize(mut self) -> Result<Self> {
        if let StorageConfig::S3(ref mut s3) = self.storage {
            if s3.access_key.is_none() {
                s3.access_key = std::env::var("AWS_ACCESS_KEY_ID").ok();
            }
            if s3.secret_key.is_none() {
                s3.secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
            }
        }
        if let StorageConfig::Webdav(ref mut dav) = self.storage {
            if dav.username.is_none() {
                dav.username = std::env::var("BCRDF_WEBDAV_USERNAME").ok();
            }
            if dav.password.is_none() {
                dav.password = std::env::var("BCRDF_WEBDAV_PASSWORD").ok();
            }
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        match &self.storage {
            StorageConfig::S3(s3) => {
                if s3.bucket.is_empty() {
                    return Err(BackupError::ConfigInvalid("storage.bucket must not be empty".into()));
                }
                if s3.access_key.is_none() || s3.secret_key.is_none() {
                    return Err(BackupError::ConfigInvalid(
                        "s3 credentials missing (set storage.access_key/secret_key or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY)".into(),
                    ));
                }
            }
            StorageConfig::Webdav(dav) => {
                if !dav.endpoint.ends_with('/') {
                    return Err(BackupError::ConfigInvalid("webdav.endpoint must end with '/'".into()));
                }
                url::Url::parse(&dav.endpoint)
                    .map_err(|e| BackupError::ConfigInvalid(format!("webdav.endpoint is not a valid URL: {e}")))?;
            }
        }

        if let StorageConfig::S3(S3Config { endpoint: Some(endpoint), .. }) = &self.storage {
            url::Url::parse(endpoint)
                .map_err(|e| BackupError::ConfigInvalid(format!("storage.endpoint is not a valid URL: {e}")))?;
        }

        if !(1..=9).contains(&self.backup.compression_level) {
            return Err(BackupError::ConfigInvalid(
                "backup.compression_level must be between 1 and 9".into(),
            ));
        }
        if self.backup.max_workers == 0 {
            return Err(BackupError::ConfigInvalid("backup.max_workers must be positive".into()));
        }
        if self.backup.encryption_key.len() != 64 && self.backup.encryption_key.as_bytes().len() != 32 {
            return Err(BackupError::ConfigInvalid(
                "backup.encryption_key must be 64 hex characters or 32 raw bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn skip_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = DEFAULT_SKIP_PATTERNS.iter().map(|s| s.to_string()).collect();
        patterns.extend(self.backup.skip_patterns.iter().cloned());
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            storage: StorageConfig::Webdav(WebDavConfig {
                endpoint: "https://example.com/dav/".into(),
                username: None,
                password: None,
            }),
            backup: BackupConfig {
                encryption_key: "a".repeat(64),
                encryption_algo: EncryptionAlgo::Aes256Gcm,
                compression_level: 3,
                max_workers: 4,
                checksum_mode: ChecksumMode::Fast,
                chunk_size: DEFAULT_CHUNK_SIZE,
                ultra_large_threshold: DEFAULT_ULTRA_LARGE_THRESHOLD,
                memory_limit: DEFAULT_MEMORY_LIMIT,
                network_timeout: DEFAULT_NETWORK_TIMEOUT,
                retry_attempts: DEFAULT_RETRY_ATTEMPTS,
                retry_delay: DEFAULT_RETRY_DELAY,
                skip_patterns: vec![],
                strict: false,
            },
            retention: RetentionConfig::default(),
        }
    }

    #[test]
    fn rejects_bad_compression_level() {
        let mut cfg = base_config();
        cfg.backup.compression_level = 0;
        assert!(cfg.finalize().is_err());
    }

    #[test]
    fn rejects_webdav_endpoint_without_trailing_slash() {
        let mut cfg = base_config();
        if let StorageConfig::Webdav(ref mut dav) = cfg.storage {
            dav.endpoint = "https://example.com/dav".into();
        }
        assert!(cfg.finalize().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base_config().finalize().is_ok());
    }
}
