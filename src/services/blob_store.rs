//! Blob storage for image content.
//!
//! `LocalBlobStore` keeps payloads on disk sharded beneath
//! `base_path/{shard}/{shard}/{key}` and hands out HMAC-signed, time-limited
//! URLs that the service itself can verify and serve.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_BLOB_KEY_LEN: usize = 1024;
const MAX_FILENAME_LEN: usize = 200;
/// Longer suffixes are not treated as an extension when truncating.
const MAX_EXTENSION_LEN: usize = 16;
const KEY_PREFIX: &str = "images";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key")]
    InvalidKey,
    #[error("access handle for `{0}` is expired")]
    HandleExpired(String),
    #[error("access handle for `{0}` has a bad signature")]
    BadSignature(String),
    #[error("failed to sign access handle")]
    Signing,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// A time-bounded, read-only reference to a blob.
#[derive(Debug, Clone, Serialize)]
pub struct AccessHandle {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Binary content storage used by the coordination layer.
///
/// Implementations keep no per-request state, so one instance can be shared
/// across every request.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` for image `id`. The key depends only on `id` and `filename`.
    async fn put(&self, owner: &str, id: Uuid, filename: &str, bytes: Bytes) -> BlobResult<String>;

    async fn get(&self, key: &str) -> BlobResult<Bytes>;

    /// Remove a blob. Removing a key that is already gone succeeds.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Produce a read-only URL for `key` valid for `ttl`. Never touches storage.
    async fn access_handle(&self, key: &str, ttl: Duration) -> BlobResult<AccessHandle>;

    /// Check a handle previously produced by `access_handle`.
    fn verify_handle(&self, key: &str, expires: i64, signature: &str) -> BlobResult<()>;

    /// Cheap write/read/delete round trip used by the readiness probe.
    async fn probe(&self) -> BlobResult<()>;
}

/// Derive the blob key for an image. Keys are never reused because `id` is unique.
pub fn blob_key(id: Uuid, filename: &str) -> String {
    format!("{}/{}/{}", KEY_PREFIX, id, sanitize_filename(filename))
}

/// Reduce a client-supplied filename to `[A-Za-z0-9._-]`.
///
/// Path separators and other characters become `_`; leading dots and
/// underscores are dropped so the result is never hidden or relative.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        return "image".into();
    }
    if trimmed.len() > MAX_FILENAME_LEN {
        // keep the extension, it drives content-type and format checks
        let ext = Path::new(trimmed)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.len() <= MAX_EXTENSION_LEN);
        let Some(ext) = ext else {
            return trimmed[..MAX_FILENAME_LEN].to_string();
        };
        let keep = MAX_FILENAME_LEN - ext.len() - 1;
        return format!("{}.{}", &trimmed[..keep], ext);
    }
    trimmed.to_string()
}

/// Disk-backed blob store with self-served signed URLs.
pub struct LocalBlobStore {
    /// Base directory on disk where blob payloads are stored.
    base_path: PathBuf,

    /// Scheme + authority prefixed to every access handle.
    public_url: String,

    secret: Vec<u8>,
}

impl LocalBlobStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_url: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    /// Reject keys that could escape `base_path`.
    fn ensure_key_safe(&self, key: &str) -> BlobResult<()> {
        if key.is_empty() || key.len() > MAX_BLOB_KEY_LEN {
            return Err(BlobError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(BlobError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidKey);
        }
        Ok(())
    }

    /// Two-level shard directories taken from MD5(key), lowercase hex.
    fn key_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::key_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn sign(&self, key: &str, expires: i64) -> BlobResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| BlobError::Signing)?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Remove empty directories from `start` upwards, stopping at `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    /// Writes to a temp file, fsyncs, then renames into place so readers never
    /// observe a partial blob.
    async fn put(&self, owner: &str, id: Uuid, filename: &str, bytes: Bytes) -> BlobResult<String> {
        let key = blob_key(id, filename);
        self.ensure_key_safe(&key)?;

        let file_path = self.blob_path(&key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        debug!(%owner, %key, size = bytes.len(), "stored blob");
        Ok(key)
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        self.ensure_key_safe(key)?;
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.ensure_key_safe(key)?;
        let file_path = self.blob_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob file {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    async fn access_handle(&self, key: &str, ttl: Duration) -> BlobResult<AccessHandle> {
        self.ensure_key_safe(key)?;
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| BlobError::Signing)?;
        let expires_at = Utc::now() + ttl;
        let expires = expires_at.timestamp();
        let sig = URL_SAFE_NO_PAD.encode(self.sign(key, expires)?.finalize().into_bytes());
        Ok(AccessHandle {
            url: format!(
                "{}/blobs/{}?expires={}&sig={}",
                self.public_url, key, expires, sig
            ),
            expires_at,
        })
    }

    fn verify_handle(&self, key: &str, expires: i64, signature: &str) -> BlobResult<()> {
        self.ensure_key_safe(key)?;
        if expires <= Utc::now().timestamp() {
            return Err(BlobError::HandleExpired(key.to_string()));
        }
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BlobError::BadSignature(key.to_string()))?;
        self.sign(key, expires)?
            .verify_slice(&provided)
            .map_err(|_| BlobError::BadSignature(key.to_string()))
    }

    async fn probe(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(BlobError::Io(io::Error::other("probe content mismatch")));
        }
        Ok(())
    }
}
