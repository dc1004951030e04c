//! WebDAV backend. PUT/GET/DELETE plus PROPFIND (Depth: 1) for listing;
//! parent collections are created idempotently with MKCOL before every PUT,
//! tolerating 405 (Method Not Allowed) / 409 (Conflict) as "already exists".

use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::blocking::{Client, Response};
use reqwest::{Method, StatusCode};

use crate::config::{BackupConfig, WebDavConfig};
use crate::error::{BackupError, Result};

use super::retry::{with_retry, RetryPolicy};
use super::{ObjectMeta, ObjectStore, StorageClassHint};

const WEBDAV_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'%').add(b'<').add(b'>').add(b'?').add(b'`');

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:getcontentlength/>
    <D:getlastmodified/>
    <D:resourcetype/>
  </D:prop>
</D:propfind>"#;

pub struct WebDavStore {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    retry: RetryPolicy,
}

impl WebDavStore {
    pub fn new(config: &WebDavConfig, backup: &BackupConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(backup.network_timeout))
            .build()
            .map_err(|e| BackupError::Other(anyhow::anyhow!("failed to build webdav client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.endpoint.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            retry: RetryPolicy::new(backup.retry_attempts, backup.retry_delay),
        })
    }

    /// Percent-encodes each path segment independently so a `/` in
    /// `storage_key` or `backup_id` never collapses with the separator.
    fn url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, WEBDAV_SEGMENT).to_string())
            .collect();
        format!("{}{}", self.base_url, encoded.join("/"))
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match (&self.username, &self.password) {
            (Some(user), pass) => req.basic_auth(user, pass.clone()),
            _ => req,
        }
    }

    fn classify(status: StatusCode, context: &str) -> BackupError {
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
            BackupError::StorageTransient(format!("{context}: {status}"))
        } else {
            BackupError::StoragePermanent(format!("{context}: {status}"))
        }
    }

    /// Idempotently creates every parent collection of `key`, tolerating
    /// 405/409 ("already exists").
    fn mkcol_parents(&self, key: &str) -> Result<()> {
        let mut prefix = String::new();
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() <= 1 {
            return Ok(());
        }
        for segment in &parts[..parts.len() - 1] {
            prefix.push_str(segment);
            prefix.push('/');
            let url = self.url(&prefix);
            let resp = self
                .authed(self.client.request(Method::from_bytes(b"MKCOL").unwrap(), &url))
                .send()
                .map_err(|e| BackupError::StorageTransient(e.to_string()))?;
            match resp.status() {
                StatusCode::CREATED
                | StatusCode::METHOD_NOT_ALLOWED
                | StatusCode::CONFLICT
                | StatusCode::OK => {}
                other => return Err(Self::classify(other, &format!("mkcol {prefix}"))),
            }
        }
        Ok(())
    }

    fn read_body(resp: Response, context: &str) -> Result<Vec<u8>> {
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status(), context));
        }
        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|e| BackupError::StorageTransient(format!("{context}: {e}")))
    }
}

impl ObjectStore for WebDavStore {
    fn put(&self, key: &str, bytes: &[u8], _storage_class: Option<&StorageClassHint>) -> Result<()> {
        with_retry(&self.retry, "webdav.put", || {
            self.mkcol_parents(key)?;
            let url = self.url(key);
            let resp = self
                .authed(self.client.put(&url))
                .body(bytes.to_vec())
                .send()
                .map_err(|e| BackupError::StorageTransient(e.to_string()))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(Self::classify(resp.status(), &format!("put {key}")))
            }
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        with_retry(&self.retry, "webdav.get", || {
            let url = self.url(key);
            let resp = self
                .authed(self.client.get(&url))
                .send()
                .map_err(|e| BackupError::StorageTransient(e.to_string()))?;
            Self::read_body(resp, &format!("get {key}"))
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        with_retry(&self.retry, "webdav.delete", || {
            let url = self.url(key);
            let resp = self
                .authed(self.client.delete(&url))
                .send()
                .map_err(|e| BackupError::StorageTransient(e.to_string()))?;
            match resp.status() {
                s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
                other => Err(Self::classify(other, &format!("delete {key}"))),
            }
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        with_retry(&self.retry, "webdav.list", || {
            let url = self.url(prefix);
            let resp = self
                .authed(
                    self.client
                        .request(Method::from_bytes(b"PROPFIND").unwrap(), &url)
                        .header("Depth", "1")
                        .header("Content-Type", "application/xml"),
                )
                .body(PROPFIND_BODY)
                .send()
                .map_err(|e| BackupError::StorageTransient(e.to_string()))?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if resp.status() != StatusCode::MULTI_STATUS && !resp.status().is_success() {
                return Err(Self::classify(resp.status(), &format!("propfind {prefix}")));
            }
            let body = resp
                .text()
                .map_err(|e| BackupError::StorageTransient(format!("propfind {prefix}: {e}")))?;
            Ok(parse_propfind(&body, &self.base_url))
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let url = self.url(key);
        let resp = self
            .authed(self.client.head(&url))
            .send()
            .map_err(|e| BackupError::StorageTransient(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(Self::classify(other, &format!("exists {key}"))),
        }
    }

    fn test_connectivity(&self) -> Result<()> {
        let resp = self
            .authed(
                self.client
                    .request(Method::from_bytes(b"PROPFIND").unwrap(), &self.base_url)
                    .header("Depth", "0")
                    .header("Content-Type", "application/xml"),
            )
            .body(PROPFIND_BODY)
            .send()
            .map_err(|e| BackupError::StoragePermanent(format!("cannot reach webdav endpoint: {e}")))?;
        if resp.status().is_success() || resp.status() == StatusCode::MULTI_STATUS {
            Ok(())
        } else {
            Err(Self::classify(resp.status(), "test_connectivity"))
        }
    }
}

/// Minimal PROPFIND response parser: extracts `href`, `getcontentlength` and
/// `getlastmodified` per `<D:response>` entry. Collection entries (their own
/// href equal to the requested prefix) are skipped.
///
/// Servers commonly return `href` as a server-root-relative path (e.g.
/// `/dav/objects/xxx`) rather than an absolute URL, so the match is done
/// against `base_url`'s path component, not the full scheme+host+path string.
fn parse_propfind(body: &str, base_url: &str) -> Vec<ObjectMeta> {
    let base_path = url::Url::parse(base_url).map(|u| u.path().to_string()).unwrap_or_else(|_| base_url.to_string());

    let mut out = Vec::new();
    for entry in body.split("<D:response>").skip(1) {
        let entry = entry.split("</D:response>").next().unwrap_or("");
        let href = extract_tag(entry, "href");
        let href = match href {
            Some(h) => h,
            None => continue,
        };
        let href = percent_encoding::percent_decode_str(&href).decode_utf8_lossy().into_owned();
        let href_path = url::Url::parse(&href).map(|u| u.path().to_string()).unwrap_or(href);
        let key = href_path.trim_start_matches(&base_path).trim_start_matches('/').to_string();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }
        let size = extract_tag(entry, "getcontentlength")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let last_modified = extract_tag(entry, "getlastmodified")
            .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        out.push(ObjectMeta { key, size, last_modified });
    }
    out
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    for prefix in &["D:", ""] {
        let open = format!("<{prefix}{tag}>");
        let close = format!("</{prefix}{tag}>");
        if let Some(start) = xml.find(&open) {
            let rest = &xml[start + open.len()..];
            if let Some(end) = rest.find(&close) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}
