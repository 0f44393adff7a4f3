//! Cluster members and the user records ownership is computed for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A storage node in the fixed topology.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Node {
    pub node_id: i64,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub certificate: Option<String>,

    /// Consecutive failed health checks.
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub last_attempt_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_utc: Option<DateTime<Utc>>,

    #[serde(default)]
    pub neighbors: Vec<i64>,
}

impl Node {
    pub fn new(node_id: i64, name: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            name: name.into(),
            hostname: hostname.into(),
            port,
            ssl: false,
            certificate: None,
            failures: 0,
            last_attempt_utc: None,
            last_success_utc: None,
            neighbors: Vec::new(),
        }
    }

    /// Base URL of the node's mesh listener.
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.hostname, self.port)
    }
}

/// The part of a user record that placement cares about.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserRecord {
    pub guid: String,
    /// Static placement pin; overrides the hash-based owner.
    #[serde(default)]
    pub node_id: Option<i64>,
}

impl UserRecord {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            node_id: None,
        }
    }

    pub fn pinned(guid: impl Into<String>, node_id: i64) -> Self {
        Self {
            guid: guid.into(),
            node_id: Some(node_id),
        }
    }
}
