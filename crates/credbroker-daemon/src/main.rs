mod dispatcher;
mod hardening;
mod protocol;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use credbroker_core::audit::{Action, AuditEntry, AuditLog};
use credbroker_core::config::Config;
use credbroker_core::heartbeat::HeartbeatMonitor;
use credbroker_core::identity::Identity;
use credbroker_core::killswitch::Killswitch;
use credbroker_core::lease::{self, LeaseManager};
use credbroker_core::rotation::RotationExecutor;
use credbroker_core::store::Store;
use tokio::sync::watch;

use crate::dispatcher::Dispatcher;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    hardening::apply(config.disable_mlock);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("failed to create {}", config.directory.display()))?;
    set_dir_mode(&config.directory)?;

    let identity_path = config.identity_path();
    let identity = if identity_path.exists() {
        Identity::load(&identity_path, config.allow_insecure_permissions)
            .context("failed to load identity")?
    } else {
        let identity = Identity::generate().context("failed to generate identity")?;
        identity.save(&identity_path).context("failed to save identity")?;
        identity
    };

    let store_path = config.store_path();
    let store = Arc::new(if store_path.exists() {
        Store::load(&store_path, identity, config.allow_insecure_permissions)
            .context("failed to load store")?
    } else {
        Store::init(&store_path, identity, config.allow_insecure_permissions)
            .context("failed to initialize store")?
    });

    let leases = Arc::new(
        LeaseManager::load(config.leases_path()).context("failed to load leases")?,
    );
    let rotation = Arc::new(RotationExecutor::new(
        store.clone(),
        Duration::from_secs(config.rotation_timeout_secs),
    ));
    let audit = Arc::new(AuditLog::new(config.audit_path()));
    let killswitch = Arc::new(Killswitch::new(
        leases.clone(),
        rotation.clone(),
        store.clone(),
        audit.clone(),
    ));

    audit
        .append(&AuditEntry::new(Action::DaemonStart, true))
        .await
        .context("failed to write startup audit entry")?;

    let heartbeat_monitor = if config.heartbeat.enabled {
        let url = config
            .heartbeat
            .url
            .clone()
            .context("heartbeat.enabled is true but heartbeat.url is unset")?;
        Some(Arc::new(HeartbeatMonitor::new(
            url,
            Duration::from_secs(config.heartbeat.interval_secs),
            Duration::from_secs(config.heartbeat.timeout_secs),
            config.heartbeat.fail_action,
        )))
    } else {
        None
    };

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        leases: leases.clone(),
        rotation,
        audit: audit.clone(),
        killswitch: killswitch.clone(),
        heartbeat: heartbeat_monitor.clone(),
        started_at: Utc::now(),
    };

    let (stop_tx, stop_rx) = watch::channel(false);

    let lease_worker = lease::spawn_cleanup_loop(
        leases,
        audit.clone(),
        config.lease_scan_interval_secs,
        stop_rx.clone(),
    );

    let heartbeat_handle = match heartbeat_monitor {
        Some(monitor) => Some(monitor.start(killswitch, audit.clone(), stop_rx.clone())?),
        None => None,
    };

    let dispatcher = Arc::new(Dispatcher::new(state));
    let socket_path = config.socket_path();

    tracing::info!(socket = %socket_path.display(), "credbroker daemon starting");

    let serve_socket_path = socket_path.clone();
    let serve_stop_rx = stop_rx.clone();
    let serve_handle =
        tokio::spawn(async move { dispatcher.serve(&serve_socket_path, serve_stop_rx).await });

    shutdown_signal().await;
    let _ = stop_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(10), serve_handle).await {
        Ok(Ok(result)) => result.context("dispatcher loop exited with an error")?,
        Ok(Err(join_err)) => tracing::warn!(error = %join_err, "dispatcher task panicked"),
        Err(_) => tracing::warn!("dispatcher did not drain in-flight connections in time"),
    }

    if tokio::time::timeout(Duration::from_secs(10), lease_worker)
        .await
        .is_err()
    {
        tracing::warn!("lease cleanup worker did not stop within the shutdown grace period");
    }
    if let Some(handle) = heartbeat_handle
        && tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .is_err()
    {
        tracing::warn!("heartbeat monitor did not stop within the shutdown grace period");
    }

    audit
        .append(&AuditEntry::new(Action::DaemonStop, true))
        .await
        .ok();

    Ok(())
}

fn load_config() -> Result<Config> {
    let path = std::env::var("CREDBROKER_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| Config::default().config_path());
    Config::load(&path).context("failed to load configuration")
}

#[cfg(unix)]
fn set_dir_mode(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .context("failed to set data directory permissions")
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            std::future::pending::<()>().await;
            return;
        };
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
