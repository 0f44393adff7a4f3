//! Represents a container, a per-user namespace for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// How mutations on a container are propagated to the replica set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Mutations stay on this node.
    #[default]
    None,
    /// Each replica is contacted before the caller gets an answer.
    Sync,
    /// Fire-and-forget; failed sends are queued for retry.
    Async,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Sync => f.write_str("sync"),
            Self::Async => f.write_str("async"),
        }
    }
}

/// A storage container owned by a single user.
///
/// The GUID is fixed for the container's lifetime and is what per-container
/// metadata tables and the objects directory are derived from.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Container {
    pub guid: Uuid,

    /// GUID of the owning user.
    pub user_guid: String,

    /// Name, unique per user.
    pub name: String,

    /// Directory holding the object files, one per object GUID.
    pub objects_directory: String,

    pub enable_audit_logging: bool,
    pub is_public_read: bool,
    pub is_public_write: bool,

    pub replication: ReplicationMode,

    pub created_utc: DateTime<Utc>,
}

impl Container {
    /// Build a fresh container rooted under `storage_root/{user}/{name}`.
    pub fn new(
        user_guid: impl Into<String>,
        name: impl Into<String>,
        storage_root: &std::path::Path,
    ) -> Self {
        let user_guid = user_guid.into();
        let name = name.into();
        let objects_directory = storage_root
            .join(&user_guid)
            .join(&name)
            .to_string_lossy()
            .into_owned();
        Self {
            guid: Uuid::new_v4(),
            user_guid,
            name,
            objects_directory,
            enable_audit_logging: false,
            is_public_read: false,
            is_public_write: false,
            replication: ReplicationMode::None,
            created_utc: Utc::now(),
        }
    }

    pub fn with_replication(mut self, mode: ReplicationMode) -> Self {
        self.replication = mode;
        self
    }

    pub fn with_audit_logging(mut self, enabled: bool) -> Self {
        self.enable_audit_logging = enabled;
        self
    }

    /// Suffix used for this container's metadata tables.
    pub fn table_suffix(&self) -> String {
        self.guid.simple().to_string()
    }
}

/// Mutable settings accepted by a container update.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContainerSettings {
    pub enable_audit_logging: Option<bool>,
    pub is_public_read: Option<bool>,
    pub is_public_write: Option<bool>,
    pub replication: Option<ReplicationMode>,
}

impl ContainerSettings {
    pub fn apply(&self, container: &mut Container) {
        if let Some(v) = self.enable_audit_logging {
            container.enable_audit_logging = v;
        }
        if let Some(v) = self.is_public_read {
            container.is_public_read = v;
        }
        if let Some(v) = self.is_public_write {
            container.is_public_write = v;
        }
        if let Some(v) = self.replication {
            container.replication = v;
        }
    }
}

impl From<&Container> for ContainerSettings {
    fn from(c: &Container) -> Self {
        Self {
            enable_audit_logging: Some(c.enable_audit_logging),
            is_public_read: Some(c.is_public_read),
            is_public_write: Some(c.is_public_write),
            replication: Some(c.replication),
        }
    }
}
