//! src/services/image_service.rs
//!
//! ImageService sequences every mutation across the blob store and the
//! metadata index. The two stores share no transaction, so consistency comes
//! from ordering plus one compensating action:
//!
//! - upload: blob first, then record; a failed record write deletes the blob
//! - delete: record first, then blob; a stray blob is dead data, a record
//!   pointing at nothing is not
//!
//! Writes run on their own task. A write that outlives the per-call timeout
//! may still land, so the caller gets an error at once while a background
//! task waits for the write to settle and undoes whatever it left behind.
//!
//! A blob that cannot be cleaned up is logged as orphaned and never surfaces
//! to the caller.

use crate::{
    config::ImageConfig,
    models::image::{
        FilterMode, ImageList, ImagePatch, ImageRecord, ImageView, NewImage, parse_tag_list,
    },
    services::{
        blob_store::{self, BlobError, BlobStore},
        metadata_index::{IndexError, MetadataIndex},
    },
};
use bytes::Bytes;
use futures::future::join_all;
use std::{fmt, future::Future, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Caller mistakes detected before any store is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidInput {
    #[error("caller identity is required")]
    MissingOwner,
    #[error("no file provided")]
    MissingPayload,
    #[error("file type not allowed. Allowed types: {allowed}")]
    UnsupportedFormat { allowed: String },
    #[error("file too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("{0} parameter required for {0} filter")]
    MissingFilterValue(&'static str),
    #[error("unknown filter `{0}`. Use owner, tags or title")]
    UnknownFilter(String),
    #[error("limit must be a non-negative integer, got `{0}`")]
    BadLimit(String),
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),
    #[error("image not found")]
    NotFound,
    #[error("blob storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("metadata store error: {0}")]
    PersistenceError(String),
    #[error("access handle rejected")]
    HandleRejected,
}

pub type ImageResult<T> = Result<T, ImageError>;

/// Outcome of a store call bounded by the configured timeout.
#[derive(Debug)]
pub enum CallError<E> {
    Store(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Store(err) => write!(f, "{}", err),
            CallError::TimedOut(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

impl From<CallError<IndexError>> for ImageError {
    fn from(err: CallError<IndexError>) -> Self {
        match err {
            CallError::Store(IndexError::NotFound(_)) => ImageError::NotFound,
            other => ImageError::PersistenceError(other.to_string()),
        }
    }
}

impl From<CallError<BlobError>> for ImageError {
    fn from(err: CallError<BlobError>) -> Self {
        match err {
            CallError::Store(BlobError::NotFound(_)) => ImageError::NotFound,
            CallError::Store(
                BlobError::HandleExpired(_) | BlobError::BadSignature(_) | BlobError::InvalidKey,
            ) => ImageError::HandleRejected,
            other => ImageError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Where a spawned store write stands once the per-call timeout is up.
enum Settled<T, E> {
    Finished(Result<T, E>),
    /// The write task panicked or was cancelled.
    Aborted(String),
    /// Still running; the handle resolves when the write lands or fails.
    Pending(JoinHandle<Result<T, E>>),
}

/// Steps of the upload saga, recorded in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Validating,
    BlobWriting,
    RecordWriting,
    BlobCompensating,
    RecordRetracting,
    Done,
    Failed,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::Validating => "validating",
            UploadStage::BlobWriting => "blob_writing",
            UploadStage::RecordWriting => "record_writing",
            UploadStage::BlobCompensating => "blob_compensating",
            UploadStage::RecordRetracting => "record_retracting",
            UploadStage::Done => "done",
            UploadStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// List request after the shell has parsed it.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub mode: FilterMode,
    /// Owner to list for `Owner`, comma-separated tags for `Tags`, exact title for `Title`.
    pub value: Option<String>,
    pub limit: Option<usize>,
}

/// Readiness of both stores, `Err` carrying the failure text.
#[derive(Debug)]
pub struct Readiness {
    pub metadata: Result<(), String>,
    pub blobs: Result<(), String>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.metadata.is_ok() && self.blobs.is_ok()
    }
}

/// Coordination layer over a blob store and a metadata index.
///
/// Holds only shared, immutable handles; clones are cheap and every request
/// runs independently.
#[derive(Clone)]
pub struct ImageService {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn MetadataIndex>,
    config: Arc<ImageConfig>,
}

impl ImageService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn MetadataIndex>,
        config: ImageConfig,
    ) -> Self {
        Self {
            blobs,
            index,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Run one store call under the per-call timeout.
    async fn bounded<T, E>(
        &self,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, CallError<E>> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(CallError::Store),
            Err(_) => Err(CallError::TimedOut(self.config.store_timeout)),
        }
    }

    /// Run a store write on its own task under the per-call timeout. Unlike
    /// [`Self::bounded`], a timed-out write is not dropped.
    async fn spawn_bounded<T, E>(
        &self,
        write: impl Future<Output = Result<T, E>> + Send + 'static,
    ) -> Settled<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut task = tokio::spawn(write);
        match tokio::time::timeout(self.config.store_timeout, &mut task).await {
            Ok(Ok(result)) => Settled::Finished(result),
            Ok(Err(join)) => Settled::Aborted(join.to_string()),
            Err(_) => Settled::Pending(task),
        }
    }

    fn timed_out(&self) -> String {
        CallError::<IndexError>::TimedOut(self.config.store_timeout).to_string()
    }

    fn ensure_owner(owner: &str) -> ImageResult<()> {
        if owner.trim().is_empty() {
            return Err(InvalidInput::MissingOwner.into());
        }
        Ok(())
    }

    fn validate_upload(&self, owner: &str, image: &NewImage) -> ImageResult<()> {
        Self::ensure_owner(owner)?;
        if image.filename.trim().is_empty() || image.bytes.is_empty() {
            return Err(InvalidInput::MissingPayload.into());
        }

        let extension = Path::new(&image.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        if !self.config.is_allowed_format(extension) {
            let allowed = self
                .config
                .allowed_formats
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            return Err(InvalidInput::UnsupportedFormat { allowed }.into());
        }

        if image.bytes.len() > self.config.max_bytes {
            return Err(InvalidInput::TooLarge {
                size: image.bytes.len(),
                max: self.config.max_bytes,
            }
            .into());
        }
        Ok(())
    }

    /// Store the blob, then its record. Either both exist afterwards or the
    /// caller gets an error and no record exists.
    pub async fn upload(&self, owner: &str, image: NewImage) -> ImageResult<ImageRecord> {
        debug!(%owner, stage = %UploadStage::Validating, filename = %image.filename);
        self.validate_upload(owner, &image)?;

        let id = Uuid::new_v4();
        let NewImage {
            filename,
            bytes,
            title,
            description,
            tags,
        } = image;

        debug!(%id, stage = %UploadStage::BlobWriting, size = bytes.len());
        let put = {
            let blobs = self.blobs.clone();
            let owner = owner.to_string();
            let filename = filename.clone();
            async move { blobs.put(&owner, id, &filename, bytes).await }
        };
        let blob_key = match self.spawn_bounded(put).await {
            Settled::Finished(Ok(key)) => key,
            Settled::Finished(Err(err)) => {
                warn!(%id, stage = %UploadStage::Failed, "blob write failed: {}", err);
                return Err(ImageError::StorageUnavailable(err.to_string()));
            }
            Settled::Aborted(reason) => {
                warn!(%id, stage = %UploadStage::Failed, "blob write aborted: {}", reason);
                self.compensate(&blob_store::blob_key(id, &filename), id).await;
                return Err(ImageError::StorageUnavailable(reason));
            }
            Settled::Pending(task) => {
                warn!(%id, stage = %UploadStage::Failed, "blob write timed out");
                let service = self.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(key)) = task.await {
                        service.compensate(&key, id).await;
                    }
                });
                return Err(ImageError::StorageUnavailable(self.timed_out()));
            }
        };

        let record = ImageRecord::new(id, owner, blob_key, title, description, tags);
        debug!(%id, stage = %UploadStage::RecordWriting, blob_key = %record.blob_key);
        let create = {
            let index = self.index.clone();
            let record = record.clone();
            async move { index.create(&record).await }
        };
        match self.spawn_bounded(create).await {
            Settled::Finished(Ok(())) => {}
            Settled::Finished(Err(err)) => {
                warn!(%id, stage = %UploadStage::BlobCompensating, "record write failed: {}", err);
                self.compensate(&record.blob_key, id).await;
                debug!(%id, stage = %UploadStage::Failed);
                return Err(ImageError::PersistenceError(err.to_string()));
            }
            Settled::Aborted(reason) => {
                warn!(%id, stage = %UploadStage::RecordRetracting, "record write aborted: {}", reason);
                self.retract(&record).await;
                return Err(ImageError::PersistenceError(reason));
            }
            Settled::Pending(task) => {
                warn!(%id, stage = %UploadStage::RecordRetracting, "record write timed out");
                let service = self.clone();
                let pending = record.clone();
                tokio::spawn(async move {
                    match task.await {
                        Ok(Ok(())) => service.retract(&pending).await,
                        _ => service.compensate(&pending.blob_key, pending.id).await,
                    }
                });
                return Err(ImageError::PersistenceError(self.timed_out()));
            }
        }

        info!(%id, %owner, blob_key = %record.blob_key, stage = %UploadStage::Done, "image uploaded");
        Ok(record)
    }

    /// Best-effort removal of a blob whose record does not exist.
    async fn compensate(&self, blob_key: &str, id: Uuid) {
        if let Err(err) = self.bounded(self.blobs.delete(blob_key)).await {
            error!(
                %id,
                %blob_key,
                "orphaned blob: compensating delete failed: {}",
                err
            );
        }
    }

    /// Undo a record write whose outcome the caller never saw, then its blob.
    /// If the record cannot be removed the blob stays so the record still
    /// resolves.
    async fn retract(&self, record: &ImageRecord) {
        let id = record.id;
        match self.bounded(self.index.delete(id, &record.owner)).await {
            Ok(_) | Err(CallError::Store(IndexError::NotFound(_))) => {
                self.compensate(&record.blob_key, id).await;
                debug!(%id, stage = %UploadStage::Failed, "upload rolled back");
            }
            Err(err) => {
                error!(
                    %id,
                    owner = %record.owner,
                    blob_key = %record.blob_key,
                    "orphaned record: retracting failed upload failed: {}",
                    err
                );
            }
        }
    }

    /// Dispatch a list request to the matching index path and attach download links.
    pub async fn list(&self, owner: &str, query: ListQuery) -> ImageResult<ImageList> {
        Self::ensure_owner(owner)?;
        let limit = self.config.clamp_limit(query.limit);
        let value = query.value.filter(|v| !v.is_empty());

        let mut records = match query.mode {
            FilterMode::Owner => {
                let target = value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .unwrap_or(owner);
                self.bounded(self.index.list_by_owner(target, limit)).await?
            }
            FilterMode::Tags => {
                let tags = value.as_deref().map(parse_tag_list).unwrap_or_default();
                if tags.is_empty() {
                    return Err(InvalidInput::MissingFilterValue("tags").into());
                }
                self.bounded(self.index.list_by_tags(owner, &tags, limit))
                    .await?
            }
            // titles match byte for byte, surrounding whitespace included
            FilterMode::Title => {
                let Some(title) = value else {
                    return Err(InvalidInput::MissingFilterValue("title").into());
                };
                self.bounded(self.index.list_by_title(&title, limit)).await?
            }
        };
        records.truncate(limit);

        let images = join_all(records.into_iter().map(|record| self.with_handle(record))).await;
        debug!(%owner, filter = query.mode.as_str(), count = images.len(), "listed images");

        Ok(ImageList {
            count: images.len(),
            filter: query.mode,
            images,
        })
    }

    /// Attach an access handle; a failure leaves `url` empty instead of failing the query.
    async fn with_handle(&self, record: ImageRecord) -> ImageView {
        let ttl = self.config.access_handle_ttl;
        let url = match self
            .bounded(self.blobs.access_handle(&record.blob_key, ttl))
            .await
        {
            Ok(handle) => Some(handle.url),
            Err(err) => {
                warn!(id = %record.id, blob_key = %record.blob_key, "access handle unavailable: {}", err);
                None
            }
        };
        ImageView { record, url }
    }

    /// Load an image's record and content.
    pub async fn fetch(&self, id: Uuid, owner: &str) -> ImageResult<(ImageRecord, Bytes)> {
        Self::ensure_owner(owner)?;
        let record = self.bounded(self.index.get(id, owner)).await?;
        match self.bounded(self.blobs.get(&record.blob_key)).await {
            Ok(bytes) => Ok((record, bytes)),
            Err(CallError::Store(BlobError::NotFound(key))) => {
                error!(%id, blob_key = %key, "record points at a missing blob");
                Err(ImageError::StorageUnavailable(format!(
                    "blob `{}` missing for image {}",
                    key, id
                )))
            }
            Err(err) => Err(ImageError::StorageUnavailable(err.to_string())),
        }
    }

    /// Change metadata only; the blob is never touched.
    pub async fn update(&self, id: Uuid, owner: &str, patch: ImagePatch) -> ImageResult<ImageRecord> {
        Self::ensure_owner(owner)?;
        let patch = patch.normalized();
        let record = self.bounded(self.index.update(id, owner, &patch)).await?;
        info!(%id, %owner, "image metadata updated");
        Ok(record)
    }

    /// Delete the record, then the blob it referenced.
    pub async fn remove(&self, id: Uuid, owner: &str) -> ImageResult<()> {
        Self::ensure_owner(owner)?;
        let record = self.bounded(self.index.delete(id, owner)).await?;

        // The image is gone for callers from here on.
        if let Err(err) = self.bounded(self.blobs.delete(&record.blob_key)).await {
            error!(
                %id,
                blob_key = %record.blob_key,
                "orphaned blob: delete after record removal failed: {}",
                err
            );
        }
        info!(%id, %owner, "image deleted");
        Ok(())
    }

    /// Serve content for a signed access handle.
    pub async fn fetch_by_handle(
        &self,
        blob_key: &str,
        expires: i64,
        signature: &str,
    ) -> ImageResult<Bytes> {
        self.blobs
            .verify_handle(blob_key, expires, signature)
            .map_err(|err| ImageError::from(CallError::Store(err)))?;
        Ok(self.bounded(self.blobs.get(blob_key)).await?)
    }

    pub async fn readiness(&self) -> Readiness {
        let metadata = self
            .bounded(self.index.ping())
            .await
            .map_err(|e| e.to_string());
        let blobs = self
            .bounded(self.blobs.probe())
            .await
            .map_err(|e| e.to_string());
        Readiness { metadata, blobs }
    }
}
