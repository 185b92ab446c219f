//! Append-only audit log: one JSON object per line, fsynced before the
//! caller that triggered it is acknowledged.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::AuditError;

const AUDIT_MODE: u32 = 0o600;
const DEFAULT_TAIL: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SecretAdd,
    SecretDelete,
    SecretRotate,
    LeaseAcquire,
    LeaseRevoke,
    LeaseExpire,
    Killswitch,
    DaemonStart,
    DaemonStop,
    HeartbeatFail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(action: Action, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            success,
            namespace: None,
            secret_name: None,
            client_id: None,
            lease_id: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Conjunctive filter over audit entries; every `Some` field must match.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub action: Option<Action>,
    pub namespace: Option<String>,
    pub secret_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(action) = self.action
            && action != entry.action
        {
            return false;
        }
        if let Some(ref ns) = self.namespace
            && entry.namespace.as_deref() != Some(ns.as_str())
        {
            return false;
        }
        if let Some(ref name) = self.secret_name
            && entry.secret_name.as_deref() != Some(name.as_str())
        {
            return false;
        }
        if let Some(start) = self.start_time
            && entry.timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end_time
            && entry.timestamp > end
        {
            return false;
        }
        true
    }
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
        }
    }

    /// Appends `entry`, flushing and fsyncing before returning so the
    /// caller's acknowledgment implies durability.
    pub async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = open_for_append(&self.path).await?;
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("just initialized above");

        file.write_all(&line)
            .await
            .map_err(|e| AuditError::AppendFailed {
                reason: e.to_string(),
            })?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// The last `n` entries, in chronological order. `n == 0` falls back to
    /// [`DEFAULT_TAIL`] rather than returning nothing. Malformed lines are
    /// skipped rather than failing the whole read.
    pub async fn tail(&self, n: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let n = if n == 0 { DEFAULT_TAIL } else { n };
        let entries = self.read_all().await?;
        let start = entries.len().saturating_sub(n);
        Ok(entries[start..].to_vec())
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.read_all().await?;
        Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
    }

    async fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

async fn open_for_append(path: &Path) -> Result<tokio::fs::File, AuditError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| AuditError::OpenFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    set_mode(path)?;
    Ok(file)
}

#[cfg(unix)]
fn set_mode(path: &Path) -> Result<(), AuditError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(AUDIT_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> Result<(), AuditError> {
    Ok(())
}
