//! Emergency revocation: revoke every lease, rotate every secret, and
//! optionally wipe the store, in that fixed order.

use std::sync::Arc;

use crate::audit::{Action, AuditEntry, AuditLog};
use crate::config::KillswitchOptions;
use crate::error::KillswitchError;
use crate::lease::LeaseManager;
use crate::rotation::RotationExecutor;
use crate::store::Store;

pub struct Killswitch {
    leases: Arc<LeaseManager>,
    rotation: Arc<RotationExecutor>,
    store: Arc<Store>,
    audit: Arc<AuditLog>,
}

impl std::fmt::Debug for Killswitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Killswitch").finish_non_exhaustive()
    }
}

impl Killswitch {
    #[must_use]
    pub fn new(
        leases: Arc<LeaseManager>,
        rotation: Arc<RotationExecutor>,
        store: Arc<Store>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            leases,
            rotation,
            store,
            audit,
        }
    }

    /// Runs revoke → rotate → wipe in order. Every requested sub-action is
    /// attempted even if an earlier one failed; errors are collected into
    /// one diagnostic string, and exactly one audit entry is written.
    pub async fn activate(&self, options: KillswitchOptions) -> Result<(), KillswitchError> {
        let mut errors = Vec::new();

        if options.revoke_all
            && let Err(err) = self.leases.revoke_all().await
        {
            errors.push(format!("revoke_all: {err}"));
        }

        if options.rotate_all {
            for result in self.rotation.rotate_all().await {
                if !result.success {
                    errors.push(format!(
                        "rotate {}: {}",
                        result.reference,
                        result.error.unwrap_or_default()
                    ));
                }
            }
        }

        if options.wipe_store
            && let Err(err) = self.store.wipe_all().await
        {
            errors.push(format!("wipe_store: {err}"));
        }

        let success = errors.is_empty();
        let mut entry = AuditEntry::new(Action::Killswitch, success);
        if !success {
            entry = entry.with_details(errors.join("; "));
        }
        if let Err(err) = self.audit.append(&entry).await {
            tracing::warn!(error = %err, "failed to audit killswitch activation");
        }

        if success {
            Ok(())
        } else {
            Err(KillswitchError::PartialFailure(errors.join("; ")))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::secret_ref::SecretRef;
    use crate::store::SecretValue;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn harness() -> (Killswitch, Arc<LeaseManager>, Arc<Store>, Arc<AuditLog>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::init(
                &dir.path().join("secrets.blob"),
                Identity::generate().unwrap(),
                false,
            )
            .unwrap(),
        );
        let leases = Arc::new(LeaseManager::load(dir.path().join("leases.json")).unwrap());
        let rotation = Arc::new(RotationExecutor::new(store.clone(), Duration::from_secs(5)));
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log")));
        let killswitch = Killswitch::new(leases.clone(), rotation, store.clone(), audit.clone());
        (killswitch, leases, store, audit)
    }

    #[tokio::test]
    async fn activate_revokes_all_active_leases() {
        let (killswitch, leases, store, _audit) = harness().await;
        let reference = SecretRef::parse("db-password").unwrap();
        store
            .add(&reference, SecretValue::new("hunter2"), None)
            .await
            .unwrap();
        leases
            .acquire(&reference, "client-a", 300, 300, 3600)
            .await
            .unwrap();

        killswitch
            .activate(KillswitchOptions {
                revoke_all: true,
                rotate_all: false,
                wipe_store: false,
            })
            .await
            .unwrap();

        assert_eq!(leases.list().await.len(), 0);
    }

    #[tokio::test]
    async fn activate_wipe_clears_store() {
        let (killswitch, _leases, store, _audit) = harness().await;
        store
            .add(&SecretRef::parse("a").unwrap(), SecretValue::new("x"), None)
            .await
            .unwrap();

        killswitch
            .activate(KillswitchOptions {
                revoke_all: false,
                rotate_all: false,
                wipe_store: true,
            })
            .await
            .unwrap();

        assert_eq!(store.list(None).await.len(), 0);
    }

    #[tokio::test]
    async fn activate_writes_one_audit_entry() {
        let (killswitch, _leases, _store, audit) = harness().await;
        killswitch
            .activate(KillswitchOptions {
                revoke_all: true,
                rotate_all: true,
                wipe_store: true,
            })
            .await
            .unwrap();

        let entries = audit.tail(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, Action::Killswitch);
        assert!(entries[0].success);
    }

    #[tokio::test]
    async fn activate_continues_past_a_failing_sub_action() {
        let (killswitch, _leases, store, audit) = harness().await;
        let reference = SecretRef::parse("bad").unwrap();
        store
            .add(&reference, SecretValue::new("v1"), Some("exit 1".to_string()))
            .await
            .unwrap();

        let result = killswitch
            .activate(KillswitchOptions {
                revoke_all: true,
                rotate_all: true,
                wipe_store: true,
            })
            .await;

        assert!(result.is_err());
        // wipe_store still ran despite the rotation failure.
        assert_eq!(store.list(None).await.len(), 0);
        let entries = audit.tail(10).await.unwrap();
        assert!(!entries[0].success);
    }
}
