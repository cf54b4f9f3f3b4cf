//! Defines routes for the image service.
//!
//! ## Structure
//! - **Probes** (no identity required)
//!   - `GET    /health`, `/healthz` — liveness
//!   - `GET    /readyz` — readiness
//!
//! - **Image endpoints** (`X-User-ID` required)
//!   - `POST   /api/v1/images/upload` — multipart upload
//!   - `GET    /api/v1/images` — list by owner, tags or title
//!   - `GET    /api/v1/images/{id}` — download content
//!   - `PUT    /api/v1/images/{id}` — update metadata
//!   - `DELETE /api/v1/images/{id}` — delete image
//!
//! - **Access handles**
//!   - `GET    /blobs/{*key}?expires=&sig=` — signed, time-limited download

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{
            delete_image, get_blob, get_image, list_images, update_image, upload_image,
        },
    },
    services::image_service::ImageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart framing and text fields on top of the file itself.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Build and return the router for all image routes.
///
/// The router carries shared state (`ImageService`) to all handlers.
/// `max_upload_bytes` sizes the request body limit.
pub fn routes(max_upload_bytes: usize) -> Router<ImageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/health", get(healthz))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/images/upload", post(upload_image))
        .route("/api/v1/images", get(list_images))
        .route(
            "/api/v1/images/{id}",
            get(get_image).put(update_image).delete(delete_image),
        )
        .route("/blobs/{*key}", get(get_blob))
        .layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES),
        ))
}
