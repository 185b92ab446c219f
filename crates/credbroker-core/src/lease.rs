//! Time-bounded leases over secrets. Active leases are persisted as a
//! single JSON array; a background loop sweeps out expired ones.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{Action, AuditEntry, AuditLog};
use crate::error::LeaseError;
use crate::secret_ref::SecretRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub namespace: String,
    pub secret_name: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Lease {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now)
    }
}

pub struct LeaseManager {
    path: PathBuf,
    leases: Mutex<HashMap<String, Lease>>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Loads `path` if it exists, dropping any lease that is already
    /// expired or revoked (their expiry was already audited when it
    /// originally happened, so it is not re-audited here).
    pub fn load(path: PathBuf) -> Result<Self, LeaseError> {
        let leases = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let all: Vec<Lease> = serde_json::from_str(&raw)?;
            let now = Utc::now();
            all.into_iter()
                .filter(|l| l.is_active(now))
                .map(|l| (l.id.clone(), l))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            leases: Mutex::new(leases),
        })
    }

    pub async fn acquire(
        &self,
        reference: &SecretRef,
        client_id: &str,
        requested_ttl_secs: i64,
        default_ttl_secs: i64,
        max_ttl_secs: i64,
    ) -> Result<Lease, LeaseError> {
        let ttl_secs = if requested_ttl_secs <= 0 {
            default_ttl_secs
        } else {
            requested_ttl_secs
        };

        if ttl_secs > max_ttl_secs {
            return Err(LeaseError::InvalidTtl {
                ttl_secs,
                max_ttl_secs,
            });
        }

        let now = Utc::now();
        let lease = Lease {
            id: Uuid::new_v4().to_string(),
            namespace: reference.namespace.clone(),
            secret_name: reference.name.clone(),
            client_id: client_id.to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            revoked: false,
        };

        let mut guard = self.leases.lock().await;
        guard.insert(lease.id.clone(), lease.clone());
        self.persist(&guard)?;
        Ok(lease)
    }

    pub async fn get(&self, id: &str) -> Result<Lease, LeaseError> {
        self.leases
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: id.to_string(),
            })
    }

    pub async fn list(&self) -> Vec<Lease> {
        let now = Utc::now();
        self.leases
            .lock()
            .await
            .values()
            .filter(|l| l.is_active(now))
            .cloned()
            .collect()
    }

    pub async fn revoke(&self, id: &str) -> Result<(), LeaseError> {
        let mut guard = self.leases.lock().await;
        let lease = guard.get_mut(id).ok_or_else(|| LeaseError::NotFound {
            lease_id: id.to_string(),
        })?;
        if lease.revoked {
            return Err(LeaseError::AlreadyRevoked {
                lease_id: id.to_string(),
            });
        }
        lease.revoked = true;
        self.persist(&guard)?;
        Ok(())
    }

    /// Revokes every active lease, returning the count revoked.
    pub async fn revoke_all(&self) -> Result<u64, LeaseError> {
        let mut guard = self.leases.lock().await;
        let now = Utc::now();
        let mut count = 0u64;
        for lease in guard.values_mut() {
            if lease.is_active(now) {
                lease.revoked = true;
                count += 1;
            }
        }
        self.persist(&guard)?;
        Ok(count)
    }

    pub async fn revoke_by_secret(&self, reference: &SecretRef) -> Result<u64, LeaseError> {
        let mut guard = self.leases.lock().await;
        let now = Utc::now();
        let mut count = 0u64;
        for lease in guard.values_mut() {
            if lease.is_active(now)
                && lease.namespace == reference.namespace
                && lease.secret_name == reference.name
            {
                lease.revoked = true;
                count += 1;
            }
        }
        self.persist(&guard)?;
        Ok(count)
    }

    pub async fn revoke_by_namespace(&self, namespace: &str) -> Result<u64, LeaseError> {
        let mut guard = self.leases.lock().await;
        let now = Utc::now();
        let mut count = 0u64;
        for lease in guard.values_mut() {
            if lease.is_active(now) && lease.namespace == namespace {
                lease.revoked = true;
                count += 1;
            }
        }
        self.persist(&guard)?;
        Ok(count)
    }

    /// Removes every lease that has newly expired, returning them so the
    /// caller can audit each one.
    pub async fn cleanup_expired(&self) -> Result<Vec<Lease>, LeaseError> {
        let mut guard = self.leases.lock().await;
        let now = Utc::now();
        let expired: Vec<Lease> = guard
            .values()
            .filter(|l| !l.revoked && l.is_expired(now))
            .cloned()
            .collect();

        for lease in &expired {
            guard.remove(&lease.id);
        }
        // Also drop already-revoked leases so the persisted file only ever
        // holds the active subset, per the on-disk contract.
        guard.retain(|_, l| l.is_active(now));

        if !expired.is_empty() {
            self.persist(&guard)?;
        }
        Ok(expired)
    }

    fn persist(&self, leases: &HashMap<String, Lease>) -> Result<(), LeaseError> {
        let now = Utc::now();
        let active: Vec<&Lease> = leases.values().filter(|l| l.is_active(now)).collect();
        let json = serde_json::to_string(&active)?;
        std::fs::write(&self.path, json)?;
        set_mode(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path) -> Result<(), LeaseError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path) -> Result<(), LeaseError> {
    Ok(())
}

/// Spawns the background lease-expiry sweep. Cancellation is cooperative:
/// observed at the next tick after `stop_rx` changes, and the daemon's
/// shutdown path awaits the returned handle before exiting.
pub fn spawn_cleanup_loop(
    manager: Arc<LeaseManager>,
    audit: Arc<AuditLog>,
    interval_secs: u64,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match manager.cleanup_expired().await {
                        Ok(expired) => {
                            for lease in expired {
                                let entry = AuditEntry::new(Action::LeaseExpire, true)
                                    .with_namespace(lease.namespace)
                                    .with_secret_name(lease.secret_name)
                                    .with_lease_id(lease.id);
                                if let Err(err) = audit.append(&entry).await {
                                    tracing::warn!(error = %err, "failed to audit lease expiry");
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "lease cleanup sweep failed");
                        }
                    }
                }
                _ = stop_rx.changed() => {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reference() -> SecretRef {
        SecretRef::parse("prod::db-password").unwrap()
    }

    #[tokio::test]
    async fn acquire_defaults_ttl_when_non_positive() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let lease = manager.acquire(&reference(), "client-a", 0, 300, 3600).await.unwrap();
        let ttl = (lease.expires_at - lease.created_at).num_seconds();
        assert_eq!(ttl, 300);
    }

    #[tokio::test]
    async fn acquire_rejects_ttl_over_max() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let result = manager.acquire(&reference(), "client-a", 10_000, 300, 3600).await;
        assert!(matches!(result, Err(LeaseError::InvalidTtl { .. })));
    }

    #[tokio::test]
    async fn revoke_marks_inactive() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let lease = manager.acquire(&reference(), "client-a", 300, 300, 3600).await.unwrap();
        manager.revoke(&lease.id).await.unwrap();
        assert_eq!(manager.list().await.len(), 0);
    }

    #[tokio::test]
    async fn revoke_twice_fails() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let lease = manager.acquire(&reference(), "client-a", 300, 300, 3600).await.unwrap();
        manager.revoke(&lease.id).await.unwrap();
        assert!(matches!(
            manager.revoke(&lease.id).await,
            Err(LeaseError::AlreadyRevoked { .. })
        ));
    }

    #[tokio::test]
    async fn revoke_all_revokes_every_active_lease() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        manager.acquire(&reference(), "a", 300, 300, 3600).await.unwrap();
        manager.acquire(&reference(), "b", 300, 300, 3600).await.unwrap();
        let count = manager.revoke_all().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(manager.list().await.len(), 0);
    }

    #[tokio::test]
    async fn revoke_by_secret_only_affects_matching_leases() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let other = SecretRef::parse("prod::other-secret").unwrap();
        manager.acquire(&reference(), "a", 300, 300, 3600).await.unwrap();
        manager.acquire(&other, "b", 300, 300, 3600).await.unwrap();

        let count = manager.revoke_by_secret(&reference()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn revoke_by_namespace_leaves_other_namespaces_active() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let production = SecretRef::parse("production::api").unwrap();
        let staging = SecretRef::parse("staging::api").unwrap();
        let default_ns = SecretRef::parse("api").unwrap();
        manager.acquire(&production, "a", 300, 300, 3600).await.unwrap();
        manager.acquire(&staging, "b", 300, 300, 3600).await.unwrap();
        manager.acquire(&default_ns, "c", 300, 300, 3600).await.unwrap();

        let count = manager.revoke_by_namespace("staging").await.unwrap();
        assert_eq!(count, 1);

        let remaining = manager.list().await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|l| l.namespace != "staging"));
    }

    #[tokio::test]
    async fn cleanup_expired_removes_past_leases() {
        let dir = tempdir().unwrap();
        let manager = LeaseManager::load(dir.path().join("leases.json")).unwrap();
        let lease = manager.acquire(&reference(), "a", 1, 1, 3600).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let expired = manager.cleanup_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, lease.id);
        assert_eq!(manager.list().await.len(), 0);
    }

    #[tokio::test]
    async fn load_drops_already_expired_leases_silently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leases.json");
        let stale = Lease {
            id: "stale".to_string(),
            namespace: "default".to_string(),
            secret_name: "x".to_string(),
            client_id: "c".to_string(),
            created_at: Utc::now() - Duration::hours(2),
            expires_at: Utc::now() - Duration::hours(1),
            revoked: false,
        };
        std::fs::write(&path, serde_json::to_string(&vec![stale]).unwrap()).unwrap();

        let manager = LeaseManager::load(path).unwrap();
        assert_eq!(manager.list().await.len(), 0);
    }
}
