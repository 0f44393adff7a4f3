//! src/services/outbound.rs
//!
//! Outbound side of the replication protocol: direct queries against a single
//! peer, and fan-out of local mutations to the replica set.

use crate::{
    models::{
        container::{Container, ReplicationMode},
        enumeration::{ContainerMetadata, EnumerationQuery},
        message::{Message, MessageType, ObjectRequest, RequestMetadata},
        node::Node,
        object::ObjectMetadata,
        task::TaskObject,
    },
    services::{retry_queue::RetryQueue, topology::Topology},
};
use chrono::Duration as TaskTtl;
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

pub struct Outbound {
    topology: Arc<Topology>,
    retry: Arc<RetryQueue>,
    sync_timeout: Duration,
    task_ttl: Option<TaskTtl>,
}

impl Outbound {
    pub fn new(
        topology: Arc<Topology>,
        retry: Arc<RetryQueue>,
        sync_timeout: Duration,
        task_ttl: Option<TaskTtl>,
    ) -> Self {
        Self {
            topology,
            retry,
            sync_timeout,
            task_ttl,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Send a query and return the reply only if the peer reports success.
    async fn query(
        &self,
        node: &Node,
        msg_type: MessageType,
        request: &RequestMetadata,
    ) -> Option<Message> {
        let msg = match Message::with_payload(self.topology.local_node(), node.clone(), msg_type, request) {
            Ok(msg) => msg,
            Err(err) => {
                error!("encoding {:?} request failed: {}", msg_type, err);
                return None;
            }
        };
        match self.topology.send_sync(&msg, self.sync_timeout).await {
            Some(reply) if reply.is_success() => Some(reply),
            Some(reply) => {
                debug!(
                    "{:?} on node {} answered {:?}",
                    msg_type, node.node_id, reply.error
                );
                None
            }
            None => {
                warn!("{:?} to node {} got no reply", msg_type, node.node_id);
                None
            }
        }
    }

    async fn query_json<T: DeserializeOwned>(
        &self,
        node: &Node,
        msg_type: MessageType,
        request: &RequestMetadata,
    ) -> Option<T> {
        let reply = self.query(node, msg_type, request).await?;
        match reply.payload() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("bad {:?} reply from node {}: {}", msg_type, node.node_id, err);
                None
            }
        }
    }

    pub async fn container_list(&self, node: &Node, user_guid: Option<&str>) -> Option<Vec<Container>> {
        let request = RequestMetadata {
            user_guid: user_guid.map(str::to_string),
            ..Default::default()
        };
        self.query_json(node, MessageType::ContainerList, &request)
            .await
    }

    pub async fn container_enumerate(
        &self,
        node: &Node,
        user_guid: &str,
        container_name: &str,
        query: EnumerationQuery,
    ) -> Option<ContainerMetadata> {
        let request = RequestMetadata {
            query: Some(query),
            ..RequestMetadata::for_container(user_guid, container_name)
        };
        self.query_json(node, MessageType::ContainerEnumerate, &request)
            .await
    }

    pub async fn container_exists(&self, node: &Node, user_guid: &str, container_name: &str) -> bool {
        let request = RequestMetadata::for_container(user_guid, container_name);
        self.query(node, MessageType::ContainerExists, &request)
            .await
            .is_some()
    }

    pub async fn object_exists(
        &self,
        node: &Node,
        user_guid: &str,
        container_name: &str,
        key: &str,
    ) -> bool {
        let request = RequestMetadata::for_object(user_guid, container_name, ObjectRequest::key(key));
        self.query(node, MessageType::ObjectExists, &request)
            .await
            .is_some()
    }

    /// Fetch object bytes; `range` is `(position, count)`.
    pub async fn object_read(
        &self,
        node: &Node,
        user_guid: &str,
        container_name: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Option<Vec<u8>> {
        let object = ObjectRequest {
            position: range.map(|(position, _)| position),
            count: range.map(|(_, count)| count),
            ..ObjectRequest::key(key)
        };
        let request = RequestMetadata::for_object(user_guid, container_name, object);
        self.query(node, MessageType::ObjectRead, &request)
            .await
            .map(|reply| reply.data)
    }

    pub async fn object_metadata(
        &self,
        node: &Node,
        user_guid: &str,
        container_name: &str,
        key: &str,
    ) -> Option<ObjectMetadata> {
        let request = RequestMetadata::for_object(user_guid, container_name, ObjectRequest::key(key));
        self.query_json(node, MessageType::ObjectMetadata, &request)
            .await
    }

    /// Propagate a mutation to every replica.
    ///
    /// `Sync` is the AND of every replica's answer. `Async` queues a retry
    /// task for any replica whose transport refuses the send and still
    /// reports success.
    pub async fn replicate(
        &self,
        mode: ReplicationMode,
        msg_type: MessageType,
        request: &RequestMetadata,
    ) -> bool {
        if mode == ReplicationMode::None {
            return true;
        }
        let replicas: Vec<Node> = self
            .topology
            .get_replicas()
            .into_iter()
            .filter(|n| n.node_id != self.topology.local_id())
            .collect();
        if replicas.is_empty() {
            debug!("no replicas configured, {:?} stays local", msg_type);
            return true;
        }

        let local = self.topology.local_node();
        let mut all_ok = true;
        for node in replicas {
            let msg = match Message::with_payload(local.clone(), node.clone(), msg_type, request) {
                Ok(msg) => msg,
                Err(err) => {
                    error!("encoding {:?} for node {} failed: {}", msg_type, node.node_id, err);
                    all_ok = false;
                    continue;
                }
            };

            match mode {
                ReplicationMode::Sync => match self.topology.send_sync(&msg, self.sync_timeout).await {
                    Some(reply) if reply.is_success() => {
                        debug!("{:?} replicated to node {}", msg_type, node.node_id);
                    }
                    Some(reply) => {
                        warn!(
                            "{:?} rejected by node {}: {:?}",
                            msg_type, node.node_id, reply.error
                        );
                        all_ok = false;
                    }
                    None => {
                        warn!("{:?} to node {} got no reply", msg_type, node.node_id);
                        all_ok = false;
                    }
                },
                ReplicationMode::Async => {
                    if self.topology.send_async(&msg).await {
                        debug!("{:?} handed to node {}", msg_type, node.node_id);
                        continue;
                    }
                    warn!(
                        "{:?} to node {} not accepted, queueing for retry",
                        msg_type, node.node_id
                    );
                    let task = TaskObject::message(msg, self.task_ttl);
                    if let Err(err) = self.retry.add(&task).await {
                        error!(
                            "could not queue {:?} for node {}: {}",
                            msg_type, node.node_id, err
                        );
                        all_ok = false;
                    }
                }
                ReplicationMode::None => {}
            }
        }
        all_ok
    }
}
