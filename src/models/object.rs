//! Represents an object (file) stored in a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a single object within a container.
///
/// The `guid` is the on-disk filename; the `key` is what clients address the
/// object by and may change through a rename without touching the file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectMetadata {
    pub guid: Uuid,

    /// Lowercase key, unique within the container.
    pub key: String,

    pub content_type: String,

    /// Size in bytes.
    pub content_length: i64,

    /// Hex MD5 of the full object content.
    pub md5: String,

    pub tags: Vec<String>,

    pub created_utc: DateTime<Utc>,
    pub last_update_utc: DateTime<Utc>,
    pub last_access_utc: DateTime<Utc>,
}

/// Row shape of the per-container objects table. Tags are stored as a JSON
/// array string.
#[derive(FromRow, Debug)]
pub(crate) struct ObjectRow {
    pub guid: Uuid,
    pub object_key: String,
    pub content_type: String,
    pub content_length: i64,
    pub md5: String,
    pub tags: String,
    pub created_utc: DateTime<Utc>,
    pub last_update_utc: DateTime<Utc>,
    pub last_access_utc: DateTime<Utc>,
}

impl From<ObjectRow> for ObjectMetadata {
    fn from(row: ObjectRow) -> Self {
        let tags = serde_json::from_str(&row.tags).unwrap_or_default();
        Self {
            guid: row.guid,
            key: row.object_key,
            content_type: row.content_type,
            content_length: row.content_length,
            md5: row.md5,
            tags,
            created_utc: row.created_utc,
            last_update_utc: row.last_update_utc,
            last_access_utc: row.last_access_utc,
        }
    }
}

/// Normalize a client-supplied key: keys are case-insensitive.
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}
