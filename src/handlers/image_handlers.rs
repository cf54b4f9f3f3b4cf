//! HTTP handlers for image upload, listing, download, update and delete.
//! Every route except the probes and signed blob links requires `X-User-ID`;
//! storage sequencing is delegated to `ImageService`.

use crate::{
    errors::AppError,
    models::image::{FilterMode, ImageList, ImagePatch, ImageRecord, NewImage, parse_tag_list},
    services::image_service::{ImageError, ImageService, InvalidInput, ListQuery},
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Multipart, Path, Query, State, rejection::QueryRejection},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity taken from the `X-User-ID` header.
#[derive(Debug, Clone)]
pub struct CallerId(pub String);

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "X-User-ID header is required"))
    }
}

/// Query params accepted by `GET /api/v1/images`.
///
/// Kept as raw strings so bad values surface as `InvalidInput`.
#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    pub filter_by: Option<String>,
    pub user_id: Option<String>,
    pub tags: Option<String>,
    pub title: Option<String>,
    pub limit: Option<String>,
}

impl ListImagesQuery {
    fn into_list_query(self) -> Result<ListQuery, InvalidInput> {
        let mode = match self.filter_by.as_deref() {
            None | Some("") => FilterMode::Owner,
            Some(raw) => {
                FilterMode::parse(raw).ok_or_else(|| InvalidInput::UnknownFilter(raw.to_string()))?
            }
        };
        let limit = match self.limit.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<usize>()
                    .map_err(|_| InvalidInput::BadLimit(raw.to_string()))?,
            ),
        };
        let value = match mode {
            FilterMode::Owner => self.user_id,
            FilterMode::Tags => self.tags,
            FilterMode::Title => self.title,
        };
        Ok(ListQuery { mode, value, limit })
    }
}

/// Signature parameters carried by an access handle URL.
#[derive(Debug, Deserialize)]
pub struct HandleQuery {
    pub expires: i64,
    pub sig: String,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub image: ImageRecord,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// `POST /api/v1/images/upload` — multipart with `file`, `title`, `description`, `tags`.
pub async fn upload_image(
    State(service): State<ImageService>,
    CallerId(owner): CallerId,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let max_bytes = service.config().max_bytes;
    let mut upload = NewImage {
        filename: String::new(),
        bytes: Bytes::new(),
        title: None,
        description: None,
        tags: Vec::new(),
    };

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                upload.filename = field.file_name().unwrap_or_default().to_string();
                // stop reading as soon as the ceiling is crossed
                let mut buf = BytesMut::new();
                while let Some(chunk) = field.chunk().await? {
                    if buf.len() + chunk.len() > max_bytes {
                        return Err(ImageError::from(InvalidInput::TooLarge {
                            size: buf.len() + chunk.len(),
                            max: max_bytes,
                        })
                        .into());
                    }
                    buf.extend_from_slice(&chunk);
                }
                upload.bytes = buf.freeze();
            }
            Some("title") => upload.title = Some(field.text().await?),
            Some("description") => upload.description = Some(field.text().await?),
            Some("tags") => upload.tags = parse_tag_list(&field.text().await?),
            _ => {}
        }
    }

    let image = service.upload(&owner, upload).await?;
    Ok((
        StatusCode::CREATED,
        Json(ImageResponse {
            message: "Image uploaded successfully",
            image,
        }),
    ))
}

/// `GET /api/v1/images` — `?filter_by=owner|tags|title&user_id=&tags=&title=&limit=`
pub async fn list_images(
    State(service): State<ImageService>,
    CallerId(owner): CallerId,
    query: Result<Query<ListImagesQuery>, QueryRejection>,
) -> Result<Json<ImageList>, AppError> {
    let Query(q) = query?;
    let query = q.into_list_query().map_err(ImageError::from)?;
    let list = service.list(&owner, query).await?;
    Ok(Json(list))
}

/// `GET /api/v1/images/{id}` — download the image content.
pub async fn get_image(
    State(service): State<ImageService>,
    CallerId(owner): CallerId,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let (record, bytes) = service.fetch(id, &owner).await?;
    Ok(blob_response(&record.blob_key, bytes, true))
}

/// `PUT /api/v1/images/{id}` — JSON body with any of `title`, `description`, `tags`.
pub async fn update_image(
    State(service): State<ImageService>,
    CallerId(owner): CallerId,
    Path(id): Path<String>,
    Json(patch): Json<ImagePatch>,
) -> Result<Json<ImageResponse>, AppError> {
    let id = parse_id(&id)?;
    let image = service.update(id, &owner, patch).await?;
    Ok(Json(ImageResponse {
        message: "Metadata updated successfully",
        image,
    }))
}

/// `DELETE /api/v1/images/{id}`
pub async fn delete_image(
    State(service): State<ImageService>,
    CallerId(owner): CallerId,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let id = parse_id(&id)?;
    service.remove(id, &owner).await?;
    Ok(Json(MessageResponse {
        message: "Image deleted successfully",
    }))
}

/// `GET /blobs/{*key}?expires=&sig=` — serve a signed access handle.
pub async fn get_blob(
    State(service): State<ImageService>,
    Path(key): Path<String>,
    query: Result<Query<HandleQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(q) = query?;
    let bytes = service.fetch_by_handle(&key, q.expires, &q.sig).await?;
    Ok(blob_response(&key, bytes, false))
}

/// A malformed id cannot belong to anyone, so it reads as absent.
fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::from(ImageError::NotFound))
}

fn blob_response(blob_key: &str, bytes: Bytes, attachment: bool) -> Response {
    let filename = blob_key.rsplit('/').next().unwrap_or(blob_key);
    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(filename)),
    );
    if attachment {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    *response.status_mut() = StatusCode::OK;
    response
}

fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
