//! Core data models for the image service.
//!
//! `ImageRecord` maps to the `images` table via `sqlx::FromRow` and
//! serializes as JSON via `serde`. Image bytes are never part of a model.

pub mod image;
