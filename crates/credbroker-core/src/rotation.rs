//! Executes a secret's rotation hook: a shell command, run with a bounded
//! timeout, whose combined output is captured for the audit trail.

#![cfg_attr(unix, allow(unsafe_code))]

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::RotationError;
use crate::secret_ref::SecretRef;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RotationResult {
    pub reference: SecretRef,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Serializes rotation executions so one never observes a mid-write store.
pub struct RotationExecutor {
    store: Arc<Store>,
    timeout: Duration,
    lock: Mutex<()>,
}

impl std::fmt::Debug for RotationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationExecutor").finish_non_exhaustive()
    }
}

impl RotationExecutor {
    #[must_use]
    pub fn new(store: Arc<Store>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub async fn rotate(&self, reference: &SecretRef) -> Result<RotationResult, RotationError> {
        let _guard = self.lock.lock().await;

        let secret = self.store.get(reference).await.map_err(|_| {
            RotationError::SecretNotFound {
                reference: reference.to_string(),
            }
        })?;

        let Some(command) = secret.rotate_via.clone() else {
            return Err(RotationError::NoHook {
                reference: reference.to_string(),
            });
        };

        let executed_at = Utc::now();
        match run_with_timeout(&command, self.timeout).await {
            Ok(output) => {
                self.store
                    .mark_rotated(reference)
                    .await
                    .map_err(RotationError::from)?;
                Ok(RotationResult {
                    reference: reference.clone(),
                    success: true,
                    output,
                    error: None,
                    executed_at,
                })
            }
            Err(err) => Ok(RotationResult {
                reference: reference.clone(),
                success: false,
                output: String::new(),
                error: Some(err.to_string()),
                executed_at,
            }),
        }
    }

    /// Rotates every secret with a configured hook. One failure does not
    /// stop the rest; each secret yields its own [`RotationResult`].
    pub async fn rotate_all(&self) -> Vec<RotationResult> {
        let references = self.store.list_with_rotation_hook().await;
        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            match self.rotate(&reference).await {
                Ok(result) => results.push(result),
                Err(err) => results.push(RotationResult {
                    reference,
                    success: false,
                    output: String::new(),
                    error: Some(err.to_string()),
                    executed_at: Utc::now(),
                }),
            }
        }
        results
    }
}

#[cfg(unix)]
async fn run_with_timeout(command: &str, timeout: Duration) -> Result<String, RotationError> {
    use std::os::unix::process::CommandExt as _;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // SAFETY: pre_exec runs in the forked child before exec, only calling
    // setpgid on its own pid so the whole process tree can be signaled.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(RotationError::Spawn)?;
    let pid = child.id();

    let wait = async {
        let output = child
            .wait_with_output()
            .await
            .map_err(RotationError::Spawn)?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(RotationError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => {
            if let Some(pid) = pid {
                // SAFETY: killpg targets the process group created above by
                // setpgid, not an arbitrary pid.
                unsafe {
                    libc::killpg(pid as i32, libc::SIGKILL);
                }
            }
            Err(RotationError::Timeout {
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

#[cfg(not(unix))]
async fn run_with_timeout(command: &str, timeout: Duration) -> Result<String, RotationError> {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(RotationError::Spawn)?;
    let wait = async {
        let output = child
            .wait_with_output()
            .await
            .map_err(RotationError::Spawn)?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(RotationError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(RotationError::Timeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::store::SecretValue;
    use tempfile::tempdir;

    async fn store_with_hook(command: &str) -> (Arc<Store>, SecretRef) {
        let dir = tempdir().unwrap();
        let store = Store::init(
            &dir.path().join("secrets.blob"),
            Identity::generate().unwrap(),
            false,
        )
        .unwrap();
        let reference = SecretRef::parse("rotatable").unwrap();
        store
            .add(&reference, SecretValue::new("v1"), Some(command.to_string()))
            .await
            .unwrap();
        (Arc::new(store), reference)
    }

    #[tokio::test]
    async fn rotate_success_marks_secret_rotated() {
        let (store, reference) = store_with_hook("echo rotated").await;
        let executor = RotationExecutor::new(store.clone(), Duration::from_secs(5));
        let result = executor.rotate(&reference).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("rotated"));
        let secret = store.get(&reference).await.unwrap();
        assert!(secret.last_rotated.is_some());
    }

    #[tokio::test]
    async fn rotate_nonzero_exit_is_reported_as_failure() {
        let (store, reference) = store_with_hook("exit 1").await;
        let executor = RotationExecutor::new(store, Duration::from_secs(5));
        let result = executor.rotate(&reference).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn rotate_without_hook_fails_immediately() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::init(
                &dir.path().join("secrets.blob"),
                Identity::generate().unwrap(),
                false,
            )
            .unwrap(),
        );
        let reference = SecretRef::parse("no-hook").unwrap();
        store
            .add(&reference, SecretValue::new("v1"), None)
            .await
            .unwrap();

        let executor = RotationExecutor::new(store, Duration::from_secs(5));
        let result = executor.rotate(&reference).await;
        assert!(matches!(result, Err(RotationError::NoHook { .. })));
    }

    #[tokio::test]
    async fn rotate_times_out_long_running_commands() {
        let (store, reference) = store_with_hook("sleep 5").await;
        let executor = RotationExecutor::new(store, Duration::from_millis(100));
        let result = executor.rotate(&reference).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn rotate_all_continues_after_one_failure() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::init(
                &dir.path().join("secrets.blob"),
                Identity::generate().unwrap(),
                false,
            )
            .unwrap(),
        );
        store
            .add(
                &SecretRef::parse("good").unwrap(),
                SecretValue::new("v1"),
                Some("echo ok".to_string()),
            )
            .await
            .unwrap();
        store
            .add(
                &SecretRef::parse("bad").unwrap(),
                SecretValue::new("v1"),
                Some("exit 1".to_string()),
            )
            .await
            .unwrap();

        let executor = RotationExecutor::new(store, Duration::from_secs(5));
        let results = executor.rotate_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.success));
        assert!(results.iter().any(|r| !r.success));
    }
}
