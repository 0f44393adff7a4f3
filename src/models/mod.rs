//! Core data models for the storage node.
//!
//! Containers and objects map to SQLite rows via `sqlx::FromRow`; messages and
//! tasks serialize as JSON via `serde` for the mesh and the retry queue.

pub mod audit;
pub mod container;
pub mod enumeration;
pub mod message;
pub mod node;
pub mod object;
pub mod task;
