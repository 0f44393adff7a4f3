//! Persisted record of work that could not be completed immediately.

use super::message::Message;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskType {
    /// Deliver the embedded message to the recipient node.
    Message,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskObject {
    pub task_type: TaskType,
    pub recipient_node_id: i64,
    pub data: Message,
    pub created_utc: DateTime<Utc>,
    pub expiration_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_utc: Option<DateTime<Utc>>,
}

impl TaskObject {
    /// Wrap a message that failed delivery. `ttl` of `None` never expires.
    pub fn message(msg: Message, ttl: Option<Duration>) -> Self {
        let created_utc = Utc::now();
        Self {
            task_type: TaskType::Message,
            recipient_node_id: msg.to.node_id,
            data: msg,
            created_utc,
            expiration_utc: ttl.map(|ttl| created_utc + ttl),
            completion_utc: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_utc.is_some_and(|exp| exp <= now)
    }
}
