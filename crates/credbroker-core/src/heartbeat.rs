//! Watches a remote heartbeat URL; on the first failed probe, fires the
//! killswitch and stops. Single-shot, not a continuous alarm.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::{Action, AuditEntry, AuditLog};
use crate::config::KillswitchOptions;
use crate::error::HeartbeatError;
use crate::killswitch::Killswitch;

pub struct HeartbeatMonitor {
    url: String,
    interval: Duration,
    timeout: Duration,
    fail_action: KillswitchOptions,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(
        url: String,
        interval: Duration,
        timeout: Duration,
        fail_action: KillswitchOptions,
    ) -> Self {
        Self {
            url,
            interval,
            timeout,
            fail_action,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the probe loop. Idempotent: calling `start` while already
    /// running returns an error rather than spawning a second loop.
    pub fn start(
        self: &Arc<Self>,
        killswitch: Arc<Killswitch>,
        audit: Arc<AuditLog>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, HeartbeatError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HeartbeatError::AlreadyRunning);
        }

        let monitor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if probe(&monitor.url, monitor.timeout).await.is_err() {
                            let entry = AuditEntry::new(Action::HeartbeatFail, false);
                            if let Err(err) = audit.append(&entry).await {
                                tracing::warn!(error = %err, "failed to audit heartbeat failure");
                            }
                            if let Err(err) = killswitch.activate(monitor.fail_action).await {
                                tracing::error!(error = %err, "killswitch activation after heartbeat loss failed");
                            }
                            monitor.running.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    _ = stop_rx.changed() => {
                        monitor.running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }))
    }
}

#[cfg(feature = "heartbeat")]
async fn probe(url: &str, timeout: Duration) -> Result<(), HeartbeatError> {
    let client = reqwest::Client::new();
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| HeartbeatError::Timeout {
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|e| HeartbeatError::ProbeFailed {
            reason: e.to_string(),
        })?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(HeartbeatError::ProbeFailed {
            reason: format!("status {}", response.status()),
        })
    }
}

#[cfg(not(feature = "heartbeat"))]
async fn probe(_url: &str, _timeout: Duration) -> Result<(), HeartbeatError> {
    Err(HeartbeatError::ProbeFailed {
        reason: "heartbeat feature disabled".to_string(),
    })
}
