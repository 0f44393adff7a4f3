use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized node configuration.
/// CLI arguments win over `OBJECT_NODE_*` environment variables, which win
/// over the defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub tasks_dir: String,
    pub topology_file: String,
    pub retry_interval: Duration,
    pub health_interval: Duration,
    pub sync_timeout: Duration,
    pub max_transfer: u64,
    /// `None` keeps retry tasks forever.
    pub task_expiration: Option<Duration>,
}

/// What the binary should do after loading its configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupActions {
    pub init_schema: bool,
    pub resync_from: Option<i64>,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Replicated object storage node")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_NODE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_NODE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding container directories (overrides OBJECT_NODE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides OBJECT_NODE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory for queued retry tasks (overrides OBJECT_NODE_TASKS_DIR)
    #[arg(long)]
    pub tasks_dir: Option<String>,

    /// Topology JSON file (overrides OBJECT_NODE_TOPOLOGY)
    #[arg(long)]
    pub topology: Option<String>,

    /// Seconds between retry passes (overrides OBJECT_NODE_RETRY_INTERVAL)
    #[arg(long)]
    pub retry_interval: Option<u64>,

    /// Seconds between peer health checks (overrides OBJECT_NODE_HEALTH_INTERVAL)
    #[arg(long)]
    pub health_interval: Option<u64>,

    /// Milliseconds to wait for a synchronous reply (overrides OBJECT_NODE_SYNC_TIMEOUT_MS)
    #[arg(long)]
    pub sync_timeout_ms: Option<u64>,

    /// Largest single object transfer during resync, in bytes (overrides OBJECT_NODE_MAX_TRANSFER)
    #[arg(long)]
    pub max_transfer: Option<u64>,

    /// Seconds a retry task stays valid, 0 for never (overrides OBJECT_NODE_TASK_EXPIRATION)
    #[arg(long)]
    pub task_expiration: Option<u64>,

    /// Create the metadata tables and exit
    #[arg(long)]
    pub init_schema: bool,

    /// Pull every container from this node id once at startup
    #[arg(long)]
    pub resync_from: Option<i64>,
}

/// Floor applied to the background loop intervals.
const MIN_INTERVAL_SECS: u64 = 10;

impl AppConfig {
    /// Parse environment variables + CLI args into the config and startup actions.
    pub fn from_env_and_args() -> Result<(Self, StartupActions)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, StartupActions)> {
        let env_host = env::var("OBJECT_NODE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("OBJECT_NODE_PORT", 8000u16)?;
        let env_storage =
            env::var("OBJECT_NODE_STORAGE_DIR").unwrap_or_else(|_| "./data/containers".into());
        let env_db = env::var("OBJECT_NODE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_node.db".into());
        let env_tasks = env::var("OBJECT_NODE_TASKS_DIR").unwrap_or_else(|_| "./data/tasks".into());
        let env_topology =
            env::var("OBJECT_NODE_TOPOLOGY").unwrap_or_else(|_| "./topology.json".into());
        let env_retry = env_parse("OBJECT_NODE_RETRY_INTERVAL", 30u64)?;
        let env_health = env_parse("OBJECT_NODE_HEALTH_INTERVAL", 15u64)?;
        let env_timeout = env_parse("OBJECT_NODE_SYNC_TIMEOUT_MS", 10_000u64)?;
        let env_transfer = env_parse("OBJECT_NODE_MAX_TRANSFER", 4 * 1024 * 1024u64)?;
        let env_expiration = env_parse("OBJECT_NODE_TASK_EXPIRATION", 86_400u64)?;

        let max_transfer = args.max_transfer.unwrap_or(env_transfer);
        if max_transfer == 0 {
            anyhow::bail!("max transfer size must be greater than zero");
        }
        let task_expiration = args.task_expiration.unwrap_or(env_expiration);

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            tasks_dir: args.tasks_dir.unwrap_or(env_tasks),
            topology_file: args.topology.unwrap_or(env_topology),
            retry_interval: Duration::from_secs(
                args.retry_interval.unwrap_or(env_retry).max(MIN_INTERVAL_SECS),
            ),
            health_interval: Duration::from_secs(
                args.health_interval.unwrap_or(env_health).max(MIN_INTERVAL_SECS),
            ),
            sync_timeout: Duration::from_millis(args.sync_timeout_ms.unwrap_or(env_timeout)),
            max_transfer,
            task_expiration: (task_expiration > 0).then(|| Duration::from_secs(task_expiration)),
        };
        let actions = StartupActions {
            init_schema: args.init_schema,
            resync_from: args.resync_from,
        };

        Ok((cfg, actions))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_win_and_floors_apply() {
        let args = Args {
            port: Some(9100),
            retry_interval: Some(1),
            health_interval: Some(60),
            task_expiration: Some(0),
            resync_from: Some(2),
            ..Default::default()
        };
        let (cfg, actions) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.retry_interval, Duration::from_secs(10));
        assert_eq!(cfg.health_interval, Duration::from_secs(60));
        assert_eq!(cfg.task_expiration, None);
        assert_eq!(actions.resync_from, Some(2));
        assert!(!actions.init_schema);
    }

    #[test]
    fn zero_transfer_is_rejected() {
        let args = Args {
            max_transfer: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn cli_parses_flags() {
        let args = Args::parse_from([
            "object-node",
            "--init-schema",
            "--topology",
            "/etc/object-node/topology.json",
        ]);
        assert!(args.init_schema);
        assert_eq!(args.topology.as_deref(), Some("/etc/object-node/topology.json"));
    }
}
