//! S3-compatible backend. Built on `aws-sdk-s3`; the trait surface the rest
//! of the engine talks to is synchronous (see §5's thread-based concurrency
//! model), so this backend owns a small multi-thread Tokio runtime and
//! bridges every call through `block_on`.

use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{TimeZone, Utc};

use crate::config::{BackupConfig, S3Config};
use crate::error::{BackupError, Result};

use super::retry::{with_retry, RetryPolicy};
use super::{ObjectMeta, ObjectStore, StorageClassHint};

const MULTIPART_PART_SIZE: usize = 64 * 1024 * 1024;
const MULTIPART_CONCURRENCY: usize = 10;

pub struct S3Store {
    client: Client,
    bucket: String,
    runtime: tokio::runtime::Runtime,
    retry: RetryPolicy,
}

impl S3Store {
    pub fn new(config: &S3Config, backup: &BackupConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(MULTIPART_CONCURRENCY)
            .enable_all()
            .build()
            .map_err(|e| BackupError::Other(anyhow::anyhow!("failed to start S3 runtime: {e}")))?;

        let access_key = config
            .access_key
            .clone()
            .ok_or_else(|| BackupError::ConfigInvalid("s3 access_key missing".into()))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| BackupError::ConfigInvalid("s3 secret_key missing".into()))?;

        let region = config.region.clone();
        let endpoint = config.endpoint.clone();
        let network_timeout = Duration::from_secs(backup.network_timeout);

        let client = runtime.block_on(async move {
            let creds = Credentials::new(access_key, secret_key, None, None, "bcrdf-static");
            let timeout_config = TimeoutConfig::builder()
                .operation_timeout(network_timeout)
                .operation_attempt_timeout(network_timeout)
                .build();
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(region))
                .credentials_provider(creds)
                .timeout_config(timeout_config);
            if let Some(endpoint) = endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            let sdk_config = loader.load().await;
            Client::new(&sdk_config)
        });

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            runtime,
            retry: RetryPolicy::new(backup.retry_attempts, backup.retry_delay),
        })
    }

    fn classify(err: impl std::fmt::Display) -> BackupError {
        BackupError::StorageTransient(err.to_string())
    }

    async fn put_small(&self, key: &str, bytes: &[u8], storage_class: Option<&StorageClassHint>) -> Result<()> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()));
        if let Some(hint) = storage_class {
            req = req.storage_class(hint.0.as_str().into());
        }
        req.send().await.map_err(Self::classify)?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, bytes: &[u8], storage_class: Option<&StorageClassHint>) -> Result<()> {
        let mut create_req = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
        if let Some(hint) = storage_class {
            create_req = create_req.storage_class(hint.0.as_str().into());
        }
        let create = create_req.send().await.map_err(Self::classify)?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| BackupError::StoragePermanent("missing upload_id from create_multipart_upload".into()))?
            .to_string();

        let chunks: Vec<&[u8]> = bytes.chunks(MULTIPART_PART_SIZE).collect();
        let mut completed: Vec<CompletedPart> = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(MULTIPART_CONCURRENCY) {
            let mut handles = Vec::with_capacity(batch.len());
            for (offset, chunk) in batch.iter().enumerate() {
                let part_number = (handles.len() + offset) as i32 + 1;
                let client = self.client.clone();
                let bucket = self.bucket.clone();
                let key = key.to_string();
                let upload_id = upload_id.clone();
                let data = chunk.to_vec();
                handles.push(tokio::spawn(async move {
                    let resp = client
                        .upload_part()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(data))
                        .send()
                        .await?;
                    Ok::<_, aws_sdk_s3::Error>((part_number, resp.e_tag().map(|s| s.to_string())))
                }));
            }
            for handle in handles {
                let (part_number, e_tag) = handle
                    .await
                    .map_err(|e| BackupError::StoragePermanent(format!("upload_part task panicked: {e}")))?
                    .map_err(Self::classify)?;
                completed.push(CompletedPart::builder().part_number(part_number).set_e_tag(e_tag).build());
            }
        }

        completed.sort_by_key(|p| p.part_number());

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(completed)).build())
            .send()
            .await
            .map_err(Self::classify)?;

        Ok(())
    }
}

impl ObjectStore for S3Store {
    fn put(&self, key: &str, bytes: &[u8], storage_class: Option<&StorageClassHint>) -> Result<()> {
        with_retry(&self.retry, "s3.put", || {
            self.runtime.block_on(async {
                if bytes.len() > MULTIPART_PART_SIZE {
                    self.put_multipart(key, bytes, storage_class).await
                } else {
                    self.put_small(key, bytes, storage_class).await
                }
            })
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        with_retry(&self.retry, "s3.get", || {
            self.runtime.block_on(async {
                let resp = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(Self::classify)?;
                let data = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackupError::StoragePermanent(format!("failed reading body for {key}: {e}")))?;
                Ok(data.into_bytes().to_vec())
            })
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        with_retry(&self.retry, "s3.delete", || {
            self.runtime.block_on(async {
                match self.client.delete_object().bucket(&self.bucket).key(key).send().await {
                    Ok(_) => Ok(()),
                    Err(err) => Err(Self::classify(err)),
                }
            })
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        with_retry(&self.retry, "s3.list", || {
            self.runtime.block_on(async {
                let mut out = Vec::new();
                let mut continuation: Option<String> = None;
                loop {
                    let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
                    if let Some(token) = continuation.clone() {
                        req = req.continuation_token(token);
                    }
                    let resp = req.send().await.map_err(Self::classify)?;
                    for obj in resp.contents() {
                        let key = obj.key().unwrap_or_default().to_string();
                        let size = obj.size().unwrap_or(0).max(0) as u64;
                        let last_modified = obj
                            .last_modified()
                            .and_then(|t| Utc.timestamp_opt(t.secs(), 0).single())
                            .unwrap_or_else(Utc::now);
                        out.push(ObjectMeta { key, size, last_modified });
                    }
                    if resp.is_truncated().unwrap_or(false) {
                        continuation = resp.next_continuation_token().map(|s| s.to_string());
                    } else {
                        break;
                    }
                }
                Ok(out)
            })
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.runtime.block_on(async {
            match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(err) => {
                    let svc_err = err.into_service_error();
                    if svc_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(BackupError::StorageTransient(svc_err.to_string()))
                    }
                }
            }
        })
    }

    fn test_connectivity(&self) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| BackupError::StoragePermanent(format!("cannot reach bucket '{}': {e}", self.bucket)))?;
            Ok(())
        })
    }
}
