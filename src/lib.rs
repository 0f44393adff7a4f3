//! A storage node for a small replicated object store.
//!
//! Each node hosts per-user containers of objects (bytes on disk, metadata in
//! SQLite), forwards mutations to its replica set over the mesh, queues
//! undeliverable replication messages for retry and can pull a peer's state
//! back in through resync.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
