//! Append-only audit trail entries kept per container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Rename,
    Enumerate,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct AuditLogEntry {
    pub guid: Uuid,
    pub object_key: Option<String>,
    pub action: AuditAction,
    pub metadata: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Filter for reading back audit entries; newest first.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AuditLogQuery {
    pub object_key: Option<String>,
    pub action: Option<AuditAction>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub index_start: Option<i64>,
    pub max_results: Option<i64>,
}
