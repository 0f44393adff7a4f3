use anyhow::{Context, Result};
use axum::Router;
use chrono::Utc;
use object_node::{
    config::AppConfig,
    routes,
    services::{
        container_manager::ContainerManager,
        dispatcher::Dispatcher,
        mesh::{HttpMesh, MeshTransport},
        outbound::Outbound,
        resync::{ResyncKey, ResyncManager, ResyncWorker},
        retry_queue::RetryQueue,
        topology::{Topology, TopologyConfig},
    },
    state::AppState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + startup actions ---
    let (cfg, actions) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-node with config: {:?}", cfg);

    // --- Ensure storage and task directories exist ---
    for dir in [&cfg.storage_dir, &cfg.tasks_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url `{}`", cfg.database_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    let manager = Arc::new(ContainerManager::new(db.clone(), &cfg.storage_dir));
    manager.init_schema().await?;

    // --- Handle schema-only mode ---
    if actions.init_schema {
        tracing::info!("Metadata schema ready.");
        return Ok(());
    }

    // --- Wire up the node ---
    let topology_config = TopologyConfig::load(Path::new(&cfg.topology_file))?;
    let mesh: Arc<dyn MeshTransport> = Arc::new(HttpMesh::new());
    let topology = Arc::new(Topology::new(topology_config, mesh)?);
    let dispatcher = Arc::new(Dispatcher::new(manager.clone()));
    let retry = Arc::new(RetryQueue::new(
        &cfg.tasks_dir,
        topology.clone(),
        dispatcher.clone(),
    ));
    let task_ttl = cfg
        .task_expiration
        .map(chrono::Duration::from_std)
        .transpose()
        .context("task expiration out of range")?;
    let outbound = Arc::new(Outbound::new(
        topology.clone(),
        retry.clone(),
        cfg.sync_timeout,
        task_ttl,
    ));
    let resync = Arc::new(ResyncManager::new(Arc::new(ResyncWorker::new(
        manager.clone(),
        outbound.clone(),
        cfg.max_transfer,
    ))));

    // --- Background loops ---
    let shutdown = CancellationToken::new();
    tokio::spawn(topology.clone().run_health_loop(
        cfg.health_interval,
        cfg.sync_timeout,
        shutdown.child_token(),
    ));
    tokio::spawn(retry.clone().run(cfg.retry_interval, shutdown.child_token()));

    if let Some(source_id) = actions.resync_from {
        let source = topology
            .node(source_id)
            .with_context(|| format!("resync source {} is not in the topology", source_id))?;
        let key = ResyncKey::new(source_id, None, None, Utc::now());
        if resync.add(key.clone(), source) {
            resync.start(&key);
        }
    }

    // --- Build router ---
    let state = AppState {
        db: db.clone(),
        storage_root: manager.storage_root().to_path_buf(),
        dispatcher,
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Node {} listening on http://{}", topology.local_id(), listener.local_addr()?);
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            token.cancel();
        })
        .await?;

    for key in resync.list() {
        resync.stop(&key);
    }
    shutdown.cancel();
    Ok(())
}
