mod common;

use bytes::Bytes;
use common::Cluster;
use object_node::models::{
    container::{Container, ReplicationMode},
    message::{Message, MessageType, RequestMetadata},
    task::TaskObject,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn async_cluster() -> Cluster {
    let cluster = Cluster::new(3).await;
    let origin = cluster.node(1);
    let container = Container::new("alice", "docs", origin.manager.storage_root())
        .with_replication(ReplicationMode::Async);
    origin.handler.create_container(container).await.unwrap();
    cluster
}

#[tokio::test]
async fn failed_async_send_is_queued_then_delivered() {
    let cluster = async_cluster().await;
    let origin = cluster.node(1);
    cluster.mesh.cut(3);

    origin
        .handler
        .write_object(
            "alice",
            "docs",
            "readme",
            "text/plain",
            Bytes::from_static(b"hello world"),
            Vec::new(),
        )
        .await
        .unwrap();

    assert!(cluster.node(2).handler.exists("alice", "docs", "readme").await);
    assert!(!cluster.node(3).handler.exists("alice", "docs", "readme").await);

    let pending = origin.retry.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].starts_with(origin.tasks_dir().join("3")));

    // Still unreachable: the task stays put.
    let summary = origin.retry.process_once().await.unwrap();
    assert_eq!(summary.pending, 1);
    assert!(pending[0].exists());

    cluster.mesh.restore(3);
    let summary = origin.retry.process_once().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert!(!pending[0].exists());
    assert!(origin.retry.pending().await.unwrap().is_empty());
    assert!(cluster.node(3).handler.exists("alice", "docs", "readme").await);
}

#[tokio::test]
async fn expired_tasks_are_discarded_undelivered() {
    let cluster = Cluster::new(2).await;
    let origin = cluster.node(1);
    let msg = Message::with_payload(
        origin.node.clone(),
        cluster.node(2).node.clone(),
        MessageType::ContainerDelete,
        &RequestMetadata::for_container("alice", "docs"),
    )
    .unwrap();

    let task = TaskObject::message(msg, Some(chrono::Duration::seconds(-1)));
    let path = origin.retry.add(&task).await.unwrap();
    let sends = cluster.mesh.sends();

    let summary = origin.retry.process_once().await.unwrap();
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.delivered, 0);
    assert!(!path.exists());
    assert_eq!(cluster.mesh.sends(), sends);
}

#[tokio::test]
async fn identical_timestamps_get_distinct_files() {
    let cluster = Cluster::new(2).await;
    let origin = cluster.node(1);
    let msg = Message::with_payload(
        origin.node.clone(),
        cluster.node(2).node.clone(),
        MessageType::ContainerDelete,
        &RequestMetadata::for_container("alice", "docs"),
    )
    .unwrap();
    let task = TaskObject::message(msg, None);

    let first = origin.retry.add(&task).await.unwrap();
    let second = origin.retry.add(&task).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(first.parent(), second.parent());
    assert_eq!(origin.retry.pending().await.unwrap(), vec![first, second]);
}

#[tokio::test]
async fn local_tasks_are_dispatched_in_process() {
    let cluster = Cluster::isolated(1).await;
    let node = cluster.node(1);
    let container = Container::new("carol", "photos", node.manager.storage_root());
    let request = RequestMetadata {
        container: Some(container.clone()),
        ..RequestMetadata::for_container("carol", "photos")
    };
    let msg = Message::with_payload(
        node.node.clone(),
        node.node.clone(),
        MessageType::ContainerCreate,
        &request,
    )
    .unwrap();

    let path = node.retry.add(&TaskObject::message(msg, None)).await.unwrap();
    assert!(path.starts_with(node.tasks_dir().join("local")));

    let summary = node.retry.process_once().await.unwrap();
    assert_eq!(summary.delivered, 1);
    let created = node.manager.get_container("carol", "photos").await.unwrap();
    assert_eq!(created.guid, container.guid);
    assert_eq!(cluster.mesh.sends(), 0);
}

#[tokio::test]
async fn unreadable_task_files_are_left_in_place() {
    let cluster = Cluster::new(2).await;
    let origin = cluster.node(1);
    let dir = origin.tasks_dir().join("2");
    std::fs::create_dir_all(&dir).unwrap();
    let junk = dir.join("00000000000000000001.json");
    std::fs::write(&junk, b"not json").unwrap();

    let summary = origin.retry.process_once().await.unwrap();
    assert_eq!(summary.corrupt, 1);
    assert!(junk.exists());
}

#[tokio::test]
async fn run_loop_stops_on_cancel() {
    let cluster = Cluster::new(2).await;
    let retry = cluster.node(1).retry.clone();
    let token = CancellationToken::new();

    let handle = tokio::spawn(retry.run(Duration::from_secs(60), token.clone()));
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("retry loop did not stop")
        .unwrap();
}
