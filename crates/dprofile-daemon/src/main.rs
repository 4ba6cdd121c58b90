//! Device Profile Daemon - the profile service process
//!
//! This binary hosts:
//! - The trust ledger over the relational store
//! - The dynamic profile engine over the replicated KV store
//! - The KV change listener feeding the subscription registry
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! Both managers are constructed explicitly and share the subscription
//! registry. The listener runs as its own task; everything is stopped
//! through one `CancellationToken` triggered by SIGTERM or SIGINT.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dprofile_core::config::Config;
use dprofile_core::domain::{anonymize, BindType};
use dprofile_core::ports::{IDeviceManager, IKvStore, IRelationalStore, ISubscriptionRegistry};
use dprofile_store::{SqliteKvStore, SqliteRelationalStore};
use dprofile_sync::{
    DeviceProfileManager, KvDataChangeListener, SubscribeProfileManager, SyncAdapterSource,
};
use dprofile_trust::TrustProfileManager;

/// Events buffered per in-process subscriber
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "dprofiled", version, about = "Distributed device profile service")]
struct Args {
    /// Configuration file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

// ============================================================================
// Device manager collaborator
// ============================================================================

/// Device manager stand-in that records new ACLs in the log
struct LoggingDeviceManager;

#[async_trait::async_trait]
impl IDeviceManager for LoggingDeviceManager {
    async fn on_acl_added(&self, access_control_id: i64, trust_device_id: &str, bind_type: BindType) {
        info!(
            access_control_id,
            device = %anonymize(trust_device_id),
            ?bind_type,
            "ACL added"
        );
    }
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns the managers and the shutdown token
struct DaemonService {
    kv: Arc<SqliteKvStore>,
    trust: Arc<TrustProfileManager>,
    profiles: Arc<DeviceProfileManager>,
    listener: Arc<KvDataChangeListener>,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Builds the stores and managers; nothing is opened yet
    async fn new(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        for path in [&config.store.rdb_path, &config.store.kv_path] {
            ensure_parent_dir(path).await?;
        }

        let relational: Arc<dyn IRelationalStore> = Arc::new(
            SqliteRelationalStore::new(&config.store.rdb_path, &config.store.backup_path)
                .with_init_retry(
                    config.store.init_max_attempts,
                    Duration::from_millis(config.store.init_retry_interval_ms),
                ),
        );
        let kv = Arc::new(SqliteKvStore::new(
            config.store.kv_store_id.clone(),
            config.device.uuid.clone(),
            config.store.kv_path.clone(),
        ));
        let registry: Arc<dyn ISubscriptionRegistry> =
            Arc::new(SubscribeProfileManager::new(SUBSCRIBER_CHANNEL_CAPACITY));

        let trust = Arc::new(TrustProfileManager::new(
            relational,
            Arc::clone(&registry),
            Arc::new(LoggingDeviceManager),
            config.profile.max_string_len,
        ));
        let profiles = Arc::new(DeviceProfileManager::new(
            Arc::clone(&kv) as Arc<dyn IKvStore>,
            config,
            SyncAdapterSource::Unavailable,
            None,
        ));
        let listener = Arc::new(KvDataChangeListener::new(
            Arc::clone(&kv) as Arc<dyn IKvStore>,
            registry,
            config,
        ));

        Ok(Self {
            kv,
            trust,
            profiles,
            listener,
            shutdown,
        })
    }

    /// Opens both stores, runs until shutdown, then closes them
    async fn run(&self) -> Result<()> {
        self.trust
            .init()
            .await
            .context("Failed to initialize trust ledger")?;
        self.profiles
            .init()
            .await
            .context("Failed to initialize device profile manager")?;

        let listener = Arc::clone(&self.listener);
        let changes = self.kv.subscribe();
        let listener_token = self.shutdown.child_token();
        let listener_task =
            tokio::spawn(async move { listener.run(changes, listener_token).await });

        info!("Device profile service ready");
        self.shutdown.cancelled().await;
        info!("Shutdown signal received");

        if let Err(e) = listener_task.await {
            warn!(error = %e, "Listener task ended abnormally");
        }
        if let Err(e) = self.profiles.uninit().await {
            warn!(error = %e, "Failed to stop device profile manager");
        }
        if let Err(e) = self.trust.uninit().await {
            warn!(error = %e, "Failed to close trust ledger");
        }
        Ok(())
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Loads the config file, falling back to defaults when it is absent
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid configuration: {}", details.join("; "));
    }
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, config.logging.json);

    info!(
        udid = %anonymize(&config.device.udid),
        "Device profile daemon starting (dprofiled)"
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(&config, shutdown_token).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("Device profile daemon shut down gracefully"),
        Err(e) => error!(error = %e, "Device profile daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["dprofiled", "--config", "/etc/dp.yaml", "--log-level", "debug"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/dp.yaml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let file = write_config("device:\n  udid: \"bad#udid\"\n  uuid: \"uuid-local\"\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("device.udid"));
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        assert!(load_config(Some(Path::new("/nonexistent/dprofile.yaml"))).is_err());
    }

    #[tokio::test]
    async fn test_service_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(&format!(
            "device:\n  udid: \"udid-local\"\n  uuid: \"uuid-local\"\nstore:\n  rdb_path: \"{0}/rdb/trust.db\"\n  kv_path: \"{0}/kv/dp.db\"\n  backup_path: \"{0}/rdb/trust.db.bak\"\n",
            dir.path().display()
        ));
        let config = load_config(Some(file.path())).unwrap();

        let shutdown = CancellationToken::new();
        let service = DaemonService::new(&config, shutdown.clone()).await.unwrap();
        assert!(dir.path().join("rdb").is_dir());

        shutdown.cancel();
        service.run().await.unwrap();
    }
}
