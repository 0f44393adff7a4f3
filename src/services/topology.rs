//! src/services/topology.rs
//!
//! TopologyResolver: the fixed node list, the replica set, user placement and
//! the message send path. The node list is held behind an `Arc` and replaced
//! wholesale by the health loop so readers always see a complete snapshot.

use crate::{
    models::{
        message::{Message, MessageType},
        node::{Node, UserRecord},
    },
    services::mesh::MeshTransport,
};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology has no nodes")]
    EmptyNodeList,
    #[error("local node {0} is not in the node list")]
    LocalNodeMissing(i64),
    #[error("replica {0} is not in the node list")]
    UnknownReplica(i64),
    #[error("node id {0} appears more than once")]
    DuplicateNode(i64),
    #[error("reading topology file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing topology file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk shape of the topology file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TopologyConfig {
    pub local_node_id: i64,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub replicas: Vec<i64>,
}

impl TopologyConfig {
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| TopologyError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::EmptyNodeList);
        }
        let mut ids: Vec<i64> = self.nodes.iter().map(|n| n.node_id).collect();
        ids.sort_unstable();
        if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(TopologyError::DuplicateNode(dup[0]));
        }
        if ids.binary_search(&self.local_node_id).is_err() {
            return Err(TopologyError::LocalNodeMissing(self.local_node_id));
        }
        if let Some(missing) = self
            .replicas
            .iter()
            .find(|id| ids.binary_search(*id).is_err())
        {
            return Err(TopologyError::UnknownReplica(*missing));
        }
        Ok(())
    }
}

pub struct Topology {
    local_id: i64,
    nodes: RwLock<Arc<Vec<Node>>>,
    replica_ids: Vec<i64>,
    mesh: Arc<dyn MeshTransport>,
}

impl Topology {
    /// Validate `config` and register every peer with the transport.
    pub fn new(config: TopologyConfig, mesh: Arc<dyn MeshTransport>) -> Result<Self, TopologyError> {
        config.validate()?;
        for node in config.nodes.iter().filter(|n| n.node_id != config.local_node_id) {
            mesh.add_peer(node);
        }
        info!(
            "topology: local node {}, {} nodes, replicas {:?}",
            config.local_node_id,
            config.nodes.len(),
            config.replicas
        );
        Ok(Self {
            local_id: config.local_node_id,
            nodes: RwLock::new(Arc::new(config.nodes)),
            replica_ids: config.replicas,
            mesh,
        })
    }

    /// Current node list snapshot.
    pub fn nodes(&self) -> Arc<Vec<Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn node(&self, node_id: i64) -> Option<Node> {
        self.nodes().iter().find(|n| n.node_id == node_id).cloned()
    }

    pub fn local_id(&self) -> i64 {
        self.local_id
    }

    pub fn local_node(&self) -> Node {
        // Construction guarantees the local node is present and the health
        // loop never removes nodes.
        self.node(self.local_id)
            .unwrap_or_else(|| Node::new(self.local_id, "local", "127.0.0.1", 0))
    }

    /// The node responsible for `user`.
    ///
    /// A pinned user lives on its pinned node. Everyone else is placed by
    /// `md5(guid) mod n` over the node list sorted by name, which every node
    /// computes identically without coordination.
    pub fn determine_owner(&self, user: &UserRecord) -> Node {
        let nodes = self.nodes();
        if let Some(pin) = user.node_id {
            if pin == self.local_id {
                return self.local_node();
            }
            match nodes.iter().find(|n| n.node_id == pin) {
                Some(node) => return node.clone(),
                None => warn!("user {} pinned to unknown node {}", user.guid, pin),
            }
        }
        if nodes.is_empty() {
            return self.local_node();
        }

        let mut sorted: Vec<&Node> = nodes.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then(a.node_id.cmp(&b.node_id)));
        let index = (owner_hash(&user.guid) % sorted.len() as u64) as usize;
        sorted[index].clone()
    }

    pub fn is_local_owner(&self, user: &UserRecord) -> bool {
        self.determine_owner(user).node_id == self.local_id
    }

    /// Nodes in the configured replica set.
    pub fn get_replicas(&self) -> Vec<Node> {
        self.nodes()
            .iter()
            .filter(|n| self.replica_ids.contains(&n.node_id))
            .cloned()
            .collect()
    }

    /// Send `msg` to `msg.to` and wait for the reply. `None` on transport
    /// failure, timeout or an undecodable reply.
    pub async fn send_sync(&self, msg: &Message, timeout: Duration) -> Option<Message> {
        let payload = match msg.to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("encoding {:?} for node {} failed: {}", msg.msg_type, msg.to.node_id, err);
                return None;
            }
        };
        let reply = self.mesh.send_sync(&msg.to, timeout, payload).await?;
        match Message::from_bytes(&reply) {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(
                    "undecodable {:?} reply from node {}: {}",
                    msg.msg_type, msg.to.node_id, err
                );
                None
            }
        }
    }

    pub async fn send_async(&self, msg: &Message) -> bool {
        match msg.to_bytes() {
            Ok(payload) => self.mesh.send_async(&msg.to, payload).await,
            Err(err) => {
                warn!("encoding {:?} for node {} failed: {}", msg.msg_type, msg.to.node_id, err);
                false
            }
        }
    }

    pub fn is_node_healthy(&self, node_id: i64) -> bool {
        node_id == self.local_id || self.mesh.is_healthy(node_id)
    }

    /// Echo every peer concurrently and publish a node list with updated
    /// counters.
    pub async fn check_peers(&self, timeout: Duration) {
        let local = self.local_node();
        let mut updated: Vec<Node> = self.nodes().as_ref().clone();
        let now = Utc::now();

        let echoes = updated
            .iter()
            .filter(|n| n.node_id != self.local_id)
            .map(|node| {
                let echo = Message::new(local.clone(), node.clone(), MessageType::Echo, b"ping".to_vec());
                async move {
                    let ok = matches!(self.send_sync(&echo, timeout).await, Some(reply) if reply.is_success());
                    (echo.to.node_id, ok)
                }
            });
        let results: HashMap<i64, bool> = join_all(echoes).await.into_iter().collect();

        for node in updated.iter_mut() {
            let Some(ok) = results.get(&node.node_id) else {
                continue;
            };
            node.last_attempt_utc = Some(now);
            if *ok {
                if node.failures > 0 {
                    info!("node {} reachable again after {} failures", node.name, node.failures);
                }
                node.failures = 0;
                node.last_success_utc = Some(now);
            } else {
                node.failures = node.failures.saturating_add(1);
                debug!("health check of node {} failed ({} in a row)", node.name, node.failures);
            }
        }

        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        *nodes = Arc::new(updated);
    }

    /// Run `check_peers` every `interval` until `token` is cancelled.
    pub async fn run_health_loop(
        self: Arc<Self>,
        interval: Duration,
        timeout: Duration,
        token: CancellationToken,
    ) {
        info!("peer health loop started, interval {:?}", interval);
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = timer.tick() => self.check_peers(timeout).await,
            }
        }
        info!("peer health loop stopped");
    }
}

/// First eight bytes of md5(guid) as a big-endian integer.
fn owner_hash(guid: &str) -> u64 {
    let digest = md5::compute(guid.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(head)
}
