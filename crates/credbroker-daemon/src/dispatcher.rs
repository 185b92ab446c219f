//! Accepts connections on the broker's Unix socket and dispatches one
//! newline-delimited JSON request at a time per connection.

use std::sync::Arc;

use credbroker_core::audit::{Action, AuditEntry};
use credbroker_core::config::KillswitchOptions;
use credbroker_core::secret_ref::SecretRef;
use credbroker_core::store::SecretValue;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::protocol::{DispatchError, Request, Response};
use crate::state::AppState;

const SOCKET_MODE: u32 = 0o600;

pub struct Dispatcher {
    state: AppState,
}

impl Dispatcher {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Binds the socket, accepting connections until `stop_rx` fires, then
    /// waits for every in-flight connection task to finish before
    /// returning.
    pub async fn serve(
        self: Arc<Self>,
        socket_path: &std::path::Path,
        mut stop_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        set_socket_mode(socket_path)?;

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, _addr)) = accepted else { continue };
                    let dispatcher = Arc::clone(&self);
                    tasks.spawn(async move {
                        dispatcher.handle_connection(stream).await;
                    });
                }
                _ = stop_rx.changed() => {
                    break;
                }
            }
        }

        drop(listener);
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "connection read error");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    let id = request.id.clone();
                    match self.dispatch(request).await {
                        Ok(result) => Response::ok(id, result),
                        Err(error) => Response::err(id, error),
                    }
                }
                Err(err) => Response::err(
                    Value::Null,
                    DispatchError::InvalidRequest(err.to_string()),
                ),
            };

            let Ok(mut serialized) = serde_json::to_vec(&response) else {
                return;
            };
            serialized.push(b'\n');
            if writer.write_all(&serialized).await.is_err() || writer.flush().await.is_err() {
                return;
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value, DispatchError> {
        match request.method.as_str() {
            "init" => self.handle_init().await,
            "add" => self.handle_add(request.params).await,
            "delete" => self.handle_delete(request.params).await,
            "list" => self.handle_list(request.params).await,
            "lease" => self.handle_lease(request.params).await,
            "revoke" => self.handle_revoke(request.params).await,
            "revokeAll" => self.handle_revoke_all(request.params).await,
            "rotate" => self.handle_rotate(request.params).await,
            "audit" => self.handle_audit(request.params).await,
            "status" => self.handle_status().await,
            "get" => Err(DispatchError::Unauthorized),
            other => Err(DispatchError::InvalidRequest(format!(
                "unknown method: {other}"
            ))),
        }
    }

    async fn handle_init(&self) -> Result<Value, DispatchError> {
        Ok(json!({
            "success": true,
            "message": "broker initialized",
            "recipient": self.state.store.recipient(),
        }))
    }

    async fn handle_add(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize)]
        struct Params {
            reference: String,
            value: String,
            #[serde(default)]
            rotate_via: Option<String>,
        }
        let params: Params = parse_params(params)?;
        let reference = parse_reference(&params.reference)?;

        let result = self
            .state
            .store
            .add(&reference, SecretValue::new(params.value), params.rotate_via)
            .await;

        self.audit(Action::SecretAdd, result.is_ok(), Some(&reference), None, None)
            .await;
        result
            .map(|()| {
                json!({
                    "success": true,
                    "message": format!("secret {reference} added"),
                })
            })
            .map_err(Into::into)
    }

    async fn handle_delete(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize)]
        struct Params {
            reference: String,
        }
        let params: Params = parse_params(params)?;
        let reference = parse_reference(&params.reference)?;

        let delete_result = self.state.store.delete(&reference).await;
        let mut details = None;
        if delete_result.is_ok()
            && let Err(err) = self.state.leases.revoke_by_secret(&reference).await
        {
            tracing::warn!(error = %err, "failed to revoke leases during delete");
            details = Some(err.to_string());
        }

        self.audit_with_details(
            Action::SecretDelete,
            delete_result.is_ok(),
            Some(&reference),
            None,
            None,
            details,
        )
        .await;
        delete_result
            .map(|()| {
                json!({
                    "success": true,
                    "message": format!("secret {reference} deleted"),
                })
            })
            .map_err(Into::into)
    }

    async fn handle_list(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            namespace: Option<String>,
        }
        let params: Params = parse_params(params)?;
        let secrets = self.state.store.list(params.namespace.as_deref()).await;
        Ok(json!({ "secrets": secrets }))
    }

    async fn handle_lease(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize)]
        struct Params {
            reference: String,
            client_id: String,
            #[serde(default)]
            ttl_secs: i64,
        }
        let params: Params = parse_params(params)?;
        let reference = parse_reference(&params.reference)?;

        let result = self
            .state
            .leases
            .acquire(
                &reference,
                &params.client_id,
                params.ttl_secs,
                self.state.config.default_lease_ttl_secs,
                self.state.config.max_lease_ttl_secs,
            )
            .await;

        self.audit(
            Action::LeaseAcquire,
            result.is_ok(),
            Some(&reference),
            Some(&params.client_id),
            result.as_ref().ok().map(|l| l.id.as_str()),
        )
        .await;

        let lease = result.map_err(DispatchError::from)?;
        let secret = self.state.store.get(&reference).await?;
        Ok(json!({
            "lease_id": lease.id,
            "expires_at": lease.expires_at,
            "value": secret.value.expose(),
        }))
    }

    async fn handle_revoke(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize)]
        struct Params {
            lease_id: String,
        }
        let params: Params = parse_params(params)?;
        let result = self.state.leases.revoke(&params.lease_id).await;

        let entry = AuditEntry::new(Action::LeaseRevoke, result.is_ok())
            .with_lease_id(params.lease_id.clone());
        self.write_audit(entry).await;

        result
            .map(|()| {
                json!({
                    "success": true,
                    "message": format!("lease {} revoked", params.lease_id),
                })
            })
            .map_err(Into::into)
    }

    async fn handle_revoke_all(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            namespace: Option<String>,
        }
        let params: Params = parse_params(params)?;

        let result = if let Some(ref namespace) = params.namespace {
            self.state.leases.revoke_by_namespace(namespace).await
        } else {
            self.state.leases.revoke_all().await
        };

        let mut entry = AuditEntry::new(Action::LeaseRevoke, result.is_ok());
        if let Some(namespace) = params.namespace {
            entry = entry.with_namespace(namespace);
        }
        self.write_audit(entry).await;

        let count = result?;
        Ok(json!({
            "success": true,
            "leases_revoked": count,
            "message": format!("revoked {count} lease(s)"),
        }))
    }

    async fn handle_rotate(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            reference: Option<String>,
        }
        let params: Params = parse_params(params)?;

        if let Some(raw) = params.reference {
            let reference = parse_reference(&raw)?;
            let result = self.state.rotation.rotate(&reference).await;
            let success = result.as_ref().map(|r| r.success).unwrap_or(false);
            let details = result.as_ref().ok().and_then(|r| r.error.clone());
            self.audit_with_details(
                Action::SecretRotate,
                success,
                Some(&reference),
                None,
                None,
                details,
            )
            .await;
            let rotation = result?;
            return Ok(json!({
                "success": rotation.success,
                "output": rotation.output,
                "error": rotation.error,
                "executed_at": rotation.executed_at,
            }));
        }

        let results = self.state.rotation.rotate_all().await;
        for r in &results {
            let entry = AuditEntry::new(Action::SecretRotate, r.success)
                .with_secret_name(r.reference.name.clone())
                .with_namespace(r.reference.namespace.clone());
            self.write_audit(entry).await;
        }
        Ok(json!({ "results": results.iter().map(|r| json!({
            "reference": r.reference.to_string(),
            "success": r.success,
            "error": r.error,
        })).collect::<Vec<_>>() }))
    }

    async fn handle_audit(&self, params: Value) -> Result<Value, DispatchError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            tail: Option<usize>,
        }
        let params: Params = parse_params(params)?;
        let entries = self.state.audit.tail(params.tail.unwrap_or(0)).await?;
        Ok(json!({ "entries": entries }))
    }

    async fn handle_status(&self) -> Result<Value, DispatchError> {
        let heartbeat = self.state.heartbeat.as_ref().map(|monitor| {
            json!({
                "enabled": true,
                "running": monitor.is_running(),
            })
        });
        Ok(json!({
            "running": true,
            "started_at": self.state.started_at,
            "secrets_count": self.state.store.secret_count().await,
            "active_leases": self.state.leases.list().await.len(),
            "heartbeat": heartbeat,
            "recipient": self.state.store.recipient(),
        }))
    }

    async fn audit(
        &self,
        action: Action,
        success: bool,
        reference: Option<&SecretRef>,
        client_id: Option<&str>,
        lease_id: Option<&str>,
    ) {
        self.audit_with_details(action, success, reference, client_id, lease_id, None)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_with_details(
        &self,
        action: Action,
        success: bool,
        reference: Option<&SecretRef>,
        client_id: Option<&str>,
        lease_id: Option<&str>,
        details: Option<String>,
    ) {
        let mut entry = AuditEntry::new(action, success);
        if let Some(r) = reference {
            entry = entry.with_namespace(r.namespace.clone()).with_secret_name(r.name.clone());
        }
        if let Some(c) = client_id {
            entry = entry.with_client_id(c);
        }
        if let Some(l) = lease_id {
            entry = entry.with_lease_id(l);
        }
        if let Some(d) = details {
            entry = entry.with_details(d);
        }
        self.write_audit(entry).await;
    }

    async fn write_audit(&self, entry: AuditEntry) {
        if let Err(err) = self.state.audit.append(&entry).await {
            tracing::warn!(error = %err, "failed to write audit entry");
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, DispatchError> {
    serde_json::from_value(params).map_err(|e| DispatchError::InvalidRequest(e.to_string()))
}

fn parse_reference(raw: &str) -> Result<SecretRef, DispatchError> {
    SecretRef::parse(raw).map_err(DispatchError::InvalidRequest)
}

#[cfg(unix)]
fn set_socket_mode(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
