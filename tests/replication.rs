mod common;

use bytes::Bytes;
use common::{Cluster, md5_hex};
use object_node::models::{
    container::{Container, ContainerSettings, ReplicationMode},
    enumeration::EnumerationQuery,
};
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;

async fn sync_cluster() -> Cluster {
    let cluster = Cluster::new(3).await;
    let origin = cluster.node(1);
    let container = Container::new("alice", "docs", origin.manager.storage_root())
        .with_replication(ReplicationMode::Sync);
    origin.handler.create_container(container).await.unwrap();
    cluster
}

#[tokio::test]
async fn container_create_reaches_every_replica_with_same_guid() {
    let cluster = sync_cluster().await;
    let guid = cluster
        .node(1)
        .manager
        .get_container("alice", "docs")
        .await
        .unwrap()
        .guid;

    for id in [2, 3] {
        let replica = cluster.node(id).manager.get_container("alice", "docs").await.unwrap();
        assert_eq!(replica.guid, guid);
        assert_eq!(replica.replication, ReplicationMode::Sync);
        assert!(
            replica
                .objects_directory
                .starts_with(&*cluster.node(id).dir.path().to_string_lossy())
        );
    }
}

#[tokio::test]
async fn sync_write_is_readable_locally_and_on_replicas() {
    let cluster = sync_cluster().await;
    let origin = cluster.node(1);

    let meta = origin
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
    assert_eq!(meta.content_length, 11);
    assert!(origin.handler.exists("alice", "docs", "readme").await);

    let mut stream = origin.handler.read_object("alice", "docs", "readme").await.unwrap();
    assert_eq!(stream.content_type, "text/plain");
    assert_eq!(stream.length, 11);
    let mut body = Vec::new();
    stream.file.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"hello world");

    for id in [2, 3] {
        let replica = &cluster.node(id).node;
        assert!(
            origin
                .outbound
                .object_exists(replica, "alice", "docs", "readme")
                .await
        );
        let remote = origin
            .outbound
            .object_metadata(replica, "alice", "docs", "readme")
            .await
            .unwrap();
        assert_eq!(remote.md5, meta.md5);
    }
}

#[tokio::test]
async fn range_write_replicates_full_file_hash() {
    let cluster = sync_cluster().await;
    let origin = cluster.node(1);
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

    let updated = origin
        .handler
        .write_range_object("alice", "docs", "readme", 6, Bytes::from_static(b"WORLD!"))
        .await
        .unwrap();
    assert_eq!(updated.content_length, 12);
    assert_eq!(updated.md5, md5_hex(b"hello WORLD!"));

    for id in [2, 3] {
        let store = cluster.node(id).manager.get("alice", "docs").await.unwrap();
        let (meta, bytes) = store.read_object_bytes("readme").await.unwrap();
        assert_eq!(&bytes[..], b"hello WORLD!");
        assert_eq!(meta.md5, updated.md5);
    }
}

#[tokio::test]
async fn metadata_rename_and_delete_replicate() {
    let cluster = sync_cluster().await;
    let origin = cluster.node(1);
    origin
        .handler
        .write_object(
            "alice",
            "docs",
            "draft",
            "text/plain",
            Bytes::from_static(b"v1"),
            Vec::new(),
        )
        .await
        .unwrap();

    origin
        .handler
        .write_object_tags("alice", "docs", "draft", vec!["wip".into()])
        .await
        .unwrap();
    let mut pairs = BTreeMap::new();
    pairs.insert("owner".to_string(), "alice".to_string());
    origin
        .handler
        .write_object_key_value_pairs("alice", "docs", "draft", pairs.clone())
        .await
        .unwrap();
    origin
        .handler
        .write_container_key_value_pairs("alice", "docs", pairs.clone())
        .await
        .unwrap();
    origin
        .handler
        .rename_object("alice", "docs", "draft", "final")
        .await
        .unwrap();

    let replica = cluster.node(2).manager.get("alice", "docs").await.unwrap();
    assert!(!replica.exists("draft").await);
    let meta = replica.read_object_metadata("final").await.unwrap();
    assert_eq!(meta.tags, vec!["wip".to_string()]);
    assert_eq!(replica.read_object_key_value_pairs("final").await.unwrap(), pairs);
    assert_eq!(replica.read_container_key_value_pairs().await.unwrap(), pairs);

    origin
        .handler
        .delete_object("alice", "docs", "final")
        .await
        .unwrap();
    assert!(!replica.exists("final").await);
    assert!(!cluster.node(3).handler.exists("alice", "docs", "final").await);
}

#[tokio::test]
async fn unreachable_replica_does_not_fail_the_client() {
    let cluster = sync_cluster().await;
    cluster.mesh.cut(3);

    let origin = cluster.node(1);
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

    assert!(origin.handler.exists("alice", "docs", "readme").await);
    assert!(cluster.node(2).handler.exists("alice", "docs", "readme").await);
    assert!(!cluster.node(3).handler.exists("alice", "docs", "readme").await);

    // Sync mode never queues retries.
    assert!(origin.retry.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn local_failure_is_not_replicated() {
    let cluster = sync_cluster().await;
    let origin = cluster.node(1);
    origin
        .handler
        .write_object(
            "alice",
            "docs",
            "readme",
            "text/plain",
            Bytes::from_static(b"first"),
            Vec::new(),
        )
        .await
        .unwrap();
    let sends = cluster.mesh.sends();

    let err = origin
        .handler
        .write_object(
            "alice",
            "docs",
            "readme",
            "text/plain",
            Bytes::from_static(b"second"),
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), object_node::errors::ErrorKind::AlreadyExists);
    assert_eq!(cluster.mesh.sends(), sends);
}

#[tokio::test]
async fn replication_mode_none_stays_local() {
    let cluster = Cluster::new(2).await;
    let origin = cluster.node(1);
    origin
        .handler
        .create_container(Container::new("bob", "music", origin.manager.storage_root()))
        .await
        .unwrap();
    origin
        .handler
        .write_object(
            "bob",
            "music",
            "song",
            "audio/mpeg",
            Bytes::from_static(b"la la"),
            Vec::new(),
        )
        .await
        .unwrap();

    assert!(!cluster.node(2).manager.exists("bob", "music").await);
    assert_eq!(cluster.mesh.sends(), 0);
}

#[tokio::test]
async fn settings_update_and_delete_propagate() {
    let cluster = sync_cluster().await;
    let origin = cluster.node(1);

    origin
        .handler
        .update_container(
            "alice",
            "docs",
            ContainerSettings {
                enable_audit_logging: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let replica = cluster.node(2).manager.get_container("alice", "docs").await.unwrap();
    assert!(replica.enable_audit_logging);

    origin.handler.delete_container("alice", "docs").await.unwrap();
    for id in [1, 2, 3] {
        assert!(!cluster.node(id).manager.exists("alice", "docs").await);
    }
}

#[tokio::test]
async fn remote_queries_see_replica_state() {
    let cluster = sync_cluster().await;
    let origin = cluster.node(1);
    for key in ["a", "b", "c"] {
        origin
            .handler
            .write_object(
                "alice",
                "docs",
                key,
                "text/plain",
                Bytes::from_static(b"xyz"),
                Vec::new(),
            )
            .await
            .unwrap();
    }

    let replica = &cluster.node(2).node;
    assert!(origin.outbound.container_exists(replica, "alice", "docs").await);
    assert!(!origin.outbound.container_exists(replica, "alice", "nope").await);

    let listed = origin
        .outbound
        .container_list(replica, Some("alice"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let page = origin
        .outbound
        .container_enumerate(replica, "alice", "docs", EnumerationQuery::default())
        .await
        .unwrap();
    assert_eq!(page.object_count, 3);
    assert_eq!(page.bytes_total, 9);

    let bytes = origin
        .outbound
        .object_read(replica, "alice", "docs", "b", Some((1, 10)))
        .await
        .unwrap();
    assert_eq!(bytes, b"yz");
}
