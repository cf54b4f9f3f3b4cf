//! Metadata index for image records, backed by SQLite.
//!
//! Three read paths exist, each bound to what a single-attribute index can do:
//! - by owner, via `idx_images_owner_created`
//! - by exact title, via `idx_images_title_created`
//! - by tags, owner-scoped: pages through the owner path and filters in memory
//!
//! All paths return newest records first.

use crate::models::image::{ImagePatch, ImageRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Rows fetched per round trip while scanning an owner's images for tags.
const TAG_SCAN_PAGE: i64 = 100;

const RECORD_COLUMNS: &str =
    "id, owner, blob_key, title, description, tags, created_at, updated_at";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("image `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Structured storage for image records.
///
/// Every single-record operation is scoped to `(id, owner)`; a record owned by
/// someone else is indistinguishable from a missing one.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn create(&self, record: &ImageRecord) -> IndexResult<()>;

    async fn get(&self, id: Uuid, owner: &str) -> IndexResult<ImageRecord>;

    /// Apply the supplied fields and refresh `updated_at`.
    async fn update(&self, id: Uuid, owner: &str, patch: &ImagePatch) -> IndexResult<ImageRecord>;

    /// Remove the record and return what was stored, including its blob key.
    async fn delete(&self, id: Uuid, owner: &str) -> IndexResult<ImageRecord>;

    async fn list_by_owner(&self, owner: &str, limit: usize) -> IndexResult<Vec<ImageRecord>>;

    async fn list_by_title(&self, title: &str, limit: usize) -> IndexResult<Vec<ImageRecord>>;

    /// Records of `owner` carrying at least one of `tags`.
    async fn list_by_tags(
        &self,
        owner: &str,
        tags: &[String],
        limit: usize,
    ) -> IndexResult<Vec<ImageRecord>>;

    /// Lightweight connectivity check for readiness probes.
    async fn ping(&self) -> IndexResult<()>;
}

#[derive(Clone)]
pub struct SqliteMetadataIndex {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
}

impl SqliteMetadataIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is `IF NOT EXISTS`, so this is
    /// safe to run on each start.
    pub async fn migrate(&self) -> IndexResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn owner_page(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> IndexResult<Vec<ImageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM images WHERE owner = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(owner)
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn create(&self, record: &ImageRecord) -> IndexResult<()> {
        sqlx::query(
            "INSERT INTO images (id, owner, blob_key, title, description, tags, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.owner)
        .bind(&record.blob_key)
        .bind(&record.title)
        .bind(&record.description)
        .bind(Json(&record.tags))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid, owner: &str) -> IndexResult<ImageRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM images WHERE id = ? AND owner = ?");
        sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(IndexError::NotFound(id))
    }

    async fn update(&self, id: Uuid, owner: &str, patch: &ImagePatch) -> IndexResult<ImageRecord> {
        let sql = format!(
            "UPDATE images SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                tags = COALESCE(?, tags),
                updated_at = ?
             WHERE id = ? AND owner = ?
             RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(patch.title.as_deref())
            .bind(patch.description.as_deref())
            .bind(patch.tags.as_ref().map(Json))
            .bind(Utc::now())
            .bind(id)
            .bind(owner)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(IndexError::NotFound(id))
    }

    async fn delete(&self, id: Uuid, owner: &str) -> IndexResult<ImageRecord> {
        let sql = format!("DELETE FROM images WHERE id = ? AND owner = ? RETURNING {RECORD_COLUMNS}");
        sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(IndexError::NotFound(id))
    }

    async fn list_by_owner(&self, owner: &str, limit: usize) -> IndexResult<Vec<ImageRecord>> {
        self.owner_page(owner, limit as i64, 0).await
    }

    async fn list_by_title(&self, title: &str, limit: usize) -> IndexResult<Vec<ImageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM images WHERE title = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ImageRecord>(&sql)
            .bind(title)
            .bind(limit as i64)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    async fn list_by_tags(
        &self,
        owner: &str,
        tags: &[String],
        limit: usize,
    ) -> IndexResult<Vec<ImageRecord>> {
        let mut matched = Vec::new();
        if tags.is_empty() || limit == 0 {
            return Ok(matched);
        }

        let mut offset = 0;
        loop {
            let page = self.owner_page(owner, TAG_SCAN_PAGE, offset).await?;
            let exhausted = (page.len() as i64) < TAG_SCAN_PAGE;
            offset += page.len() as i64;

            for record in page {
                if record.has_any_tag(tags) {
                    matched.push(record);
                    if matched.len() == limit {
                        return Ok(matched);
                    }
                }
            }
            if exhausted {
                return Ok(matched);
            }
        }
    }

    async fn ping(&self) -> IndexResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh in-memory index. A single connection keeps every query on the
    /// same database.
    pub(crate) async fn memory_index() -> SqliteMetadataIndex {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let index = SqliteMetadataIndex::new(Arc::new(pool));
        index.migrate().await.unwrap();
        index
    }

    fn record(owner: &str, title: &str, tags: &[&str]) -> ImageRecord {
        let id = Uuid::new_v4();
        ImageRecord::new(
            id,
            owner,
            format!("images/{}/x.png", id),
            Some(title.to_string()),
            None,
            tags.iter().map(|t| t.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn create_then_get_scoped_to_owner() {
        let index = memory_index().await;
        let rec = record("u1", "Trip", &["beach"]);
        index.create(&rec).await.unwrap();

        let fetched = index.get(rec.id, "u1").await.unwrap();
        assert_eq!(fetched.blob_key, rec.blob_key);
        assert_eq!(fetched.tags, vec!["beach"]);

        assert!(matches!(
            index.get(rec.id, "u2").await,
            Err(IndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_changes_only_supplied_fields() {
        let index = memory_index().await;
        let mut rec = record("u1", "Trip", &["beach"]);
        rec.description = "sunny".into();
        index.create(&rec).await.unwrap();

        let patch = ImagePatch {
            title: Some("Holiday".into()),
            ..Default::default()
        };
        let updated = index.update(rec.id, "u1", &patch).await.unwrap();
        assert_eq!(updated.title, "Holiday");
        assert_eq!(updated.description, "sunny");
        assert_eq!(updated.tags, vec!["beach"]);
        assert_eq!(updated.created_at, rec.created_at);
        assert!(updated.updated_at >= rec.updated_at);

        let patch = ImagePatch {
            tags: Some(vec!["city".into()]),
            ..Default::default()
        };
        let updated = index.update(rec.id, "u1", &patch).await.unwrap();
        assert_eq!(updated.title, "Holiday");
        assert_eq!(updated.tags, vec!["city"]);
    }

    #[tokio::test]
    async fn update_by_other_owner_is_not_found() {
        let index = memory_index().await;
        let rec = record("u1", "Trip", &[]);
        index.create(&rec).await.unwrap();

        let patch = ImagePatch {
            title: Some("stolen".into()),
            ..Default::default()
        };
        assert!(matches!(
            index.update(rec.id, "u2", &patch).await,
            Err(IndexError::NotFound(_))
        ));
        assert_eq!(index.get(rec.id, "u1").await.unwrap().title, "Trip");
    }

    #[tokio::test]
    async fn delete_returns_record_and_is_not_idempotent() {
        let index = memory_index().await;
        let rec = record("u1", "Trip", &[]);
        index.create(&rec).await.unwrap();

        assert!(matches!(
            index.delete(rec.id, "u2").await,
            Err(IndexError::NotFound(_))
        ));
        let deleted = index.delete(rec.id, "u1").await.unwrap();
        assert_eq!(deleted.blob_key, rec.blob_key);
        assert!(matches!(
            index.delete(rec.id, "u1").await,
            Err(IndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn owner_listing_is_newest_first_and_limited() {
        let index = memory_index().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let rec = record("u1", &format!("t{i}"), &[]);
            ids.push(rec.id);
            index.create(&rec).await.unwrap();
        }
        index.create(&record("u2", "other", &[])).await.unwrap();

        let listed = index.list_by_owner("u1", 3).await.unwrap();
        let listed_ids: Vec<_> = listed.iter().map(|r| r.id).collect();
        assert_eq!(listed_ids, vec![ids[4], ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn title_listing_is_exact_and_global() {
        let index = memory_index().await;
        let a = record("u1", "Sunset", &[]);
        let b = record("u2", "Sunset", &[]);
        index.create(&a).await.unwrap();
        index.create(&b).await.unwrap();
        index.create(&record("u1", "Sunset 2", &[])).await.unwrap();
        index.create(&record("u1", "sunset", &[])).await.unwrap();

        let listed = index.list_by_title("Sunset", 10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn tag_listing_matches_any_tag_within_owner() {
        let index = memory_index().await;
        let beach = record("u1", "a", &["beach"]);
        let work = record("u1", "b", &["work"]);
        let both = record("u1", "c", &["beach", "work"]);
        let foreign = record("u2", "d", &["beach"]);
        for rec in [&beach, &work, &both, &foreign] {
            index.create(rec).await.unwrap();
        }

        let listed = index
            .list_by_tags("u1", &["beach".to_string()], 10)
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![both.id, beach.id]);
    }

    #[tokio::test]
    async fn tag_listing_scans_past_first_page() {
        let index = memory_index().await;
        let tagged = record("u1", "old", &["rare"]);
        index.create(&tagged).await.unwrap();
        for i in 0..(TAG_SCAN_PAGE + 5) {
            index
                .create(&record("u1", &format!("n{i}"), &["common"]))
                .await
                .unwrap();
        }

        let listed = index
            .list_by_tags("u1", &["rare".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, tagged.id);

        let limited = index
            .list_by_tags("u1", &["common".to_string()], 7)
            .await
            .unwrap();
        assert_eq!(limited.len(), 7);
    }

    #[tokio::test]
    async fn ping_succeeds_on_live_pool() {
        let index = memory_index().await;
        index.ping().await.unwrap();
    }
}
