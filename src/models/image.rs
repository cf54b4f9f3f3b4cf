//! Represents an image record and the inputs that create or change it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Title stored when an upload does not provide one.
pub const UNTITLED: &str = "Untitled";

/// Metadata for a single uploaded image.
///
/// The record never holds the image bytes; `blob_key` points into the blob
/// store and is the only link between the two.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ImageRecord {
    /// Identifier generated at upload time.
    pub id: Uuid,

    /// Caller that uploaded the image. Never changes.
    pub owner: String,

    /// Key of the blob holding the image content.
    pub blob_key: String,

    pub title: String,

    pub description: String,

    /// De-duplicated tags, in the order they were first supplied.
    #[sqlx(json)]
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every metadata change.
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build a fresh record for an image whose blob already exists.
    pub fn new(
        id: Uuid,
        owner: impl Into<String>,
        blob_key: impl Into<String>,
        title: Option<String>,
        description: Option<String>,
        tags: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner: owner.into(),
            blob_key: blob_key.into(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            description: description.unwrap_or_default(),
            tags: normalize_tags(tags),
            created_at: now,
            updated_at: now,
        }
    }

    /// True if any of `wanted` appears among this record's tags.
    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        self.tags.iter().any(|tag| wanted.contains(tag))
    }
}

/// Fields a metadata update may change. `None` leaves the stored value alone.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ImagePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl ImagePatch {
    /// Return the patch with its tag list trimmed and de-duplicated.
    pub fn normalized(mut self) -> Self {
        self.tags = self.tags.map(normalize_tags);
        self
    }
}

/// Everything the shell hands over for a single upload.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub filename: String,
    pub bytes: bytes::Bytes,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Query dimension for listing images.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[serde(alias = "user")]
    Owner,
    Tags,
    Title,
}

impl FilterMode {
    /// Case-insensitive lookup accepting `user` as an alias for `owner`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "owner" | "user" => Some(FilterMode::Owner),
            "tags" => Some(FilterMode::Tags),
            "title" => Some(FilterMode::Title),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Owner => "owner",
            FilterMode::Tags => "tags",
            FilterMode::Title => "title",
        }
    }
}

/// A record as returned from a list query, with an optional download link.
#[derive(Serialize, Clone, Debug)]
pub struct ImageView {
    #[serde(flatten)]
    pub record: ImageRecord,

    /// Time-limited link to the blob. Absent when it could not be generated.
    pub url: Option<String>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ImageList {
    pub count: usize,
    pub filter: FilterMode,
    pub images: Vec<ImageView>,
}

/// Trim tags, drop blanks and repeated values while keeping first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Parse the comma-separated tag format used by form fields and query strings.
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    normalize_tags(raw.split(','))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_applies_defaults() {
        let record = ImageRecord::new(Uuid::new_v4(), "u1", "images/x/a.png", None, None, vec![]);
        assert_eq!(record.title, UNTITLED);
        assert_eq!(record.description, "");
        assert!(record.tags.is_empty());
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn tags_are_trimmed_and_deduplicated_in_order() {
        let tags = parse_tag_list(" beach, 2024,,beach , work");
        assert_eq!(tags, vec!["beach", "2024", "work"]);
    }

    #[test]
    fn filter_mode_accepts_user_alias() {
        let mode: FilterMode = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(mode, FilterMode::Owner);
        let mode: FilterMode = serde_json::from_str("\"tags\"").unwrap();
        assert_eq!(mode.as_str(), "tags");
    }

    #[test]
    fn filter_mode_parse_ignores_case() {
        assert_eq!(FilterMode::parse("User"), Some(FilterMode::Owner));
        assert_eq!(FilterMode::parse("TAGS"), Some(FilterMode::Tags));
        assert_eq!(FilterMode::parse(" title "), Some(FilterMode::Title));
        assert_eq!(FilterMode::parse("color"), None);
    }

    #[test]
    fn tag_intersection_needs_one_match() {
        let record = ImageRecord::new(
            Uuid::new_v4(),
            "u1",
            "k",
            None,
            None,
            vec!["beach".into(), "work".into()],
        );
        assert!(record.has_any_tag(&["work".into(), "city".into()]));
        assert!(!record.has_any_tag(&["city".into()]));
    }
}
