//! Shared handles wired together once at startup and cloned into every
//! connection-handling task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use credbroker_core::audit::AuditLog;
use credbroker_core::config::Config;
use credbroker_core::heartbeat::HeartbeatMonitor;
use credbroker_core::killswitch::Killswitch;
use credbroker_core::lease::LeaseManager;
use credbroker_core::rotation::RotationExecutor;
use credbroker_core::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub leases: Arc<LeaseManager>,
    pub rotation: Arc<RotationExecutor>,
    pub audit: Arc<AuditLog>,
    pub killswitch: Arc<Killswitch>,
    pub heartbeat: Option<Arc<HeartbeatMonitor>>,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
