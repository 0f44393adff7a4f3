//! Shared harness for the integration tests.
//!
//! This module provides:
//! - `LoopbackMesh`, an in-process `MeshTransport` whose links can be cut
//! - `Cluster`, a set of fully wired nodes sharing one loopback mesh

#![allow(dead_code)]

use async_trait::async_trait;
use object_node::{
    models::node::Node,
    services::{
        container_manager::ContainerManager,
        dispatcher::Dispatcher,
        mesh::MeshTransport,
        object_handler::ObjectHandler,
        outbound::Outbound,
        retry_queue::RetryQueue,
        topology::{Topology, TopologyConfig},
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

/// Delivers messages straight into the target node's dispatcher.
#[derive(Default)]
pub struct LoopbackMesh {
    dispatchers: RwLock<HashMap<i64, Arc<Dispatcher>>>,
    cut: RwLock<HashSet<i64>>,
    sends: AtomicUsize,
}

impl LoopbackMesh {
    pub fn register(&self, node_id: i64, dispatcher: Arc<Dispatcher>) {
        self.dispatchers.write().unwrap().insert(node_id, dispatcher);
    }

    /// Make `node_id` unreachable for every sender.
    pub fn cut(&self, node_id: i64) {
        self.cut.write().unwrap().insert(node_id);
    }

    pub fn restore(&self, node_id: i64) {
        self.cut.write().unwrap().remove(&node_id);
    }

    /// Messages the transport accepted so far.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn target(&self, node_id: i64) -> Option<Arc<Dispatcher>> {
        if self.cut.read().unwrap().contains(&node_id) {
            return None;
        }
        self.dispatchers.read().unwrap().get(&node_id).cloned()
    }
}

#[async_trait]
impl MeshTransport for LoopbackMesh {
    fn add_peer(&self, _node: &Node) {}

    fn remove_peer(&self, _node_id: i64) {}

    async fn send_sync(&self, node: &Node, _timeout: Duration, payload: Vec<u8>) -> Option<Vec<u8>> {
        let dispatcher = self.target(node.node_id)?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        dispatcher.handle_sync(&payload).await
    }

    async fn send_async(&self, node: &Node, payload: Vec<u8>) -> bool {
        let Some(dispatcher) = self.target(node.node_id) else {
            return false;
        };
        self.sends.fetch_add(1, Ordering::SeqCst);
        // Applied inline so tests can assert right after the call.
        dispatcher.handle_async(&payload).await;
        true
    }

    fn is_healthy(&self, node_id: i64) -> bool {
        self.target(node_id).is_some()
    }
}

pub struct TestNode {
    pub id: i64,
    pub node: Node,
    pub manager: Arc<ContainerManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub topology: Arc<Topology>,
    pub retry: Arc<RetryQueue>,
    pub outbound: Arc<Outbound>,
    pub handler: ObjectHandler,
    pub dir: TempDir,
}

impl TestNode {
    pub fn tasks_dir(&self) -> PathBuf {
        self.dir.path().join("tasks")
    }
}

pub struct Cluster {
    pub mesh: Arc<LoopbackMesh>,
    pub nodes: Vec<TestNode>,
}

fn node_list(count: usize) -> Vec<Node> {
    (1..=count as i64)
        .map(|id| Node::new(id, format!("node-{}", id), "127.0.0.1", 9000 + id as u16))
        .collect()
}

impl Cluster {
    /// `count` nodes; every node replicates to all the others.
    pub async fn new(count: usize) -> Self {
        Self::with_replicas(count, |local| {
            (1..=count as i64).filter(|id| *id != local).collect()
        })
        .await
    }

    /// `count` nodes with no replica sets.
    pub async fn isolated(count: usize) -> Self {
        Self::with_replicas(count, |_| Vec::new()).await
    }

    pub async fn with_replicas<F>(count: usize, replicas: F) -> Self
    where
        F: Fn(i64) -> Vec<i64>,
    {
        let mesh = Arc::new(LoopbackMesh::default());
        let nodes = node_list(count);
        let mut built = Vec::with_capacity(count);

        for node in &nodes {
            let dir = tempfile::tempdir().unwrap();
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .unwrap();
            let manager = Arc::new(ContainerManager::new(
                Arc::new(pool),
                dir.path().join("containers"),
            ));
            manager.init_schema().await.unwrap();

            let dispatcher = Arc::new(Dispatcher::new(manager.clone()));
            mesh.register(node.node_id, dispatcher.clone());

            let config = TopologyConfig {
                local_node_id: node.node_id,
                nodes: nodes.clone(),
                replicas: replicas(node.node_id),
            };
            let transport: Arc<dyn MeshTransport> = mesh.clone();
            let topology = Arc::new(Topology::new(config, transport).unwrap());
            let retry = Arc::new(RetryQueue::new(
                dir.path().join("tasks"),
                topology.clone(),
                dispatcher.clone(),
            ));
            let outbound = Arc::new(Outbound::new(
                topology.clone(),
                retry.clone(),
                Duration::from_secs(2),
                None,
            ));
            let handler = ObjectHandler::new(manager.clone(), outbound.clone());

            built.push(TestNode {
                id: node.node_id,
                node: node.clone(),
                manager,
                dispatcher,
                topology,
                retry,
                outbound,
                handler,
                dir,
            });
        }

        Self { mesh, nodes: built }
    }

    pub fn node(&self, id: i64) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .expect("node id in cluster")
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
