//! src/services/mesh.rs
//!
//! Node-to-node transport. `MeshTransport` is the seam the topology talks
//! through; `HttpMesh` is the production implementation, which posts message
//! bytes to a peer's `/mesh/sync` and `/mesh/async` endpoints and tracks
//! per-peer health from the outcome of every send.

use crate::models::node::Node;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::RwLock,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Timeout applied to fire-and-forget sends; they only wait for the peer to
/// accept the bytes.
const ASYNC_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Start tracking a peer.
    fn add_peer(&self, node: &Node);

    fn remove_peer(&self, node_id: i64);

    /// Send `payload` and wait up to `timeout` for the peer's reply.
    async fn send_sync(&self, node: &Node, timeout: Duration, payload: Vec<u8>) -> Option<Vec<u8>>;

    /// Hand `payload` to the peer. `true` means the peer accepted it, not
    /// that it has been processed.
    async fn send_async(&self, node: &Node, payload: Vec<u8>) -> bool;

    fn is_healthy(&self, node_id: i64) -> bool;
}

struct PeerState {
    node: Node,
    healthy: bool,
}

pub struct HttpMesh {
    client: reqwest::Client,
    peers: RwLock<HashMap<i64, PeerState>>,
}

impl HttpMesh {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record a send outcome and log connect/disconnect transitions.
    fn record(&self, node_id: i64, ok: bool) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let Some(peer) = peers.get_mut(&node_id) else {
            return;
        };
        if peer.healthy != ok {
            peer.healthy = ok;
            if ok {
                info!("peer {} ({}) connected", peer.node.name, peer.node.base_url());
            } else {
                warn!(
                    "peer {} ({}) disconnected",
                    peer.node.name,
                    peer.node.base_url()
                );
            }
        }
    }

    async fn post(
        &self,
        node: &Node,
        path: &str,
        timeout: Duration,
        payload: Vec<u8>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", node.base_url(), path);
        self.client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .timeout(timeout)
            .send()
            .await
    }
}

impl Default for HttpMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshTransport for HttpMesh {
    fn add_peer(&self, node: &Node) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(
            node.node_id,
            PeerState {
                node: node.clone(),
                healthy: false,
            },
        );
        debug!("tracking peer {} at {}", node.name, node.base_url());
    }

    fn remove_peer(&self, node_id: i64) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.remove(&node_id) {
            debug!("stopped tracking peer {}", peer.node.name);
        }
    }

    async fn send_sync(&self, node: &Node, timeout: Duration, payload: Vec<u8>) -> Option<Vec<u8>> {
        let response = match self.post(node, "/mesh/sync", timeout, payload).await {
            Ok(response) => response,
            Err(err) => {
                debug!("sync send to {} failed: {}", node.name, err);
                self.record(node.node_id, false);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("sync send to {} returned {}", node.name, response.status());
            self.record(node.node_id, true);
            return None;
        }
        match response.bytes().await {
            Ok(body) => {
                self.record(node.node_id, true);
                Some(body.to_vec())
            }
            Err(err) => {
                debug!("reading sync reply from {} failed: {}", node.name, err);
                self.record(node.node_id, false);
                None
            }
        }
    }

    async fn send_async(&self, node: &Node, payload: Vec<u8>) -> bool {
        match self
            .post(node, "/mesh/async", ASYNC_SEND_TIMEOUT, payload)
            .await
        {
            Ok(response) => {
                self.record(node.node_id, true);
                response.status().is_success()
            }
            Err(err) => {
                debug!("async send to {} failed: {}", node.name, err);
                self.record(node.node_id, false);
                false
            }
        }
    }

    fn is_healthy(&self, node_id: i64) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(&node_id).is_some_and(|peer| peer.healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_peer_is_unhealthy() {
        let mesh = HttpMesh::new();
        // Port 9 on loopback is discard; nothing listens there in CI.
        let node = Node::new(7, "ghost", "127.0.0.1", 9);
        mesh.add_peer(&node);
        assert!(!mesh.is_healthy(7));

        let reply = mesh
            .send_sync(&node, Duration::from_millis(200), b"{}".to_vec())
            .await;
        assert!(reply.is_none());
        assert!(!mesh.send_async(&node, b"{}".to_vec()).await);
        assert!(!mesh.is_healthy(7));
    }

    #[test]
    fn untracked_peer_is_never_healthy() {
        let mesh = HttpMesh::new();
        assert!(!mesh.is_healthy(42));
        mesh.record(42, true);
        assert!(!mesh.is_healthy(42));
    }

    #[test]
    fn record_flips_health() {
        let mesh = HttpMesh::new();
        mesh.add_peer(&Node::new(3, "gamma", "127.0.0.1", 8003));
        mesh.record(3, true);
        assert!(mesh.is_healthy(3));
        mesh.record(3, false);
        assert!(!mesh.is_healthy(3));
        mesh.remove_peer(3);
        assert!(!mesh.is_healthy(3));
    }
}
