//! The wire protocol: newline-delimited JSON requests and responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use credbroker_core::error::{
    AuditError, HeartbeatError, IdentityError, KillswitchError, LeaseError, RotationError,
    StoreError,
};

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    #[must_use]
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn err(id: Value, error: DispatchError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ResponseError {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
}

/// Every error surfaced to a client, mapped to a stable numeric code.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("secret not found: {0}")]
    SecretNotFound(String),
    #[error("secret already exists: {0}")]
    SecretExists(String),
    #[error("store has not been initialized")]
    StoreNotInitialized,
    #[error("store is corrupted: {0}")]
    StoreCorrupted(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("lease not found: {0}")]
    LeaseNotFound(String),
    #[error("lease expired: {0}")]
    LeaseExpired(String),
    #[error("lease revoked: {0}")]
    LeaseRevoked(String),
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    #[error("rotation failed: {0}")]
    RotationFailed(String),
    #[error("rotation timed out: {0}")]
    RotationTimeout(String),
    #[error("no rotation hook configured: {0}")]
    NoRotationHook(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("insecure permissions: {0}")]
    InsecurePermissions(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::SecretNotFound(_) => 1001,
            Self::SecretExists(_) => 1002,
            Self::StoreNotInitialized => 1003,
            Self::StoreCorrupted(_) => 1004,
            Self::EncryptionFailed(_) => 1005,
            Self::DecryptionFailed(_) => 1006,
            Self::InvalidIdentity(_) => 1007,
            Self::IdentityNotFound(_) => 1008,
            Self::LeaseNotFound(_) => 1101,
            Self::LeaseExpired(_) => 1102,
            Self::LeaseRevoked(_) => 1103,
            Self::InvalidTtl(_) => 1104,
            Self::RotationFailed(_) => 1201,
            Self::RotationTimeout(_) => 1202,
            Self::NoRotationHook(_) => 1203,
            Self::Unauthorized => 1301,
            Self::InsecurePermissions(_) => 1302,
            Self::InvalidRequest(_) => 1900,
            Self::Internal(_) => 1999,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { reference } => Self::SecretNotFound(reference),
            StoreError::AlreadyExists { reference } => Self::SecretExists(reference),
            StoreError::NotInitialized => Self::StoreNotInitialized,
            StoreError::AlreadyInitialized => {
                Self::Internal("store already initialized".to_string())
            }
            StoreError::Corrupted { reason } => Self::StoreCorrupted(reason),
            StoreError::InsecurePermissions { path, mode, expected } => Self::InsecurePermissions(
                format!("{path} has mode {mode:o}, expected {expected:o}"),
            ),
            StoreError::InvalidReference { reference } => Self::InvalidRequest(reference),
            StoreError::Crypto(e) => Self::EncryptionFailed(e.to_string()),
            StoreError::Identity(e) => Self::InvalidIdentity(e.to_string()),
            StoreError::Io(e) => Self::Internal(e.to_string()),
            StoreError::Serde(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<IdentityError> for DispatchError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound { path } => Self::IdentityNotFound(path),
            IdentityError::Malformed { reason } => Self::InvalidIdentity(reason),
            IdentityError::InsecurePermissions { path, mode, expected } => Self::InsecurePermissions(
                format!("{path} has mode {mode:o}, expected {expected:o}"),
            ),
            IdentityError::Crypto(e) => Self::DecryptionFailed(e.to_string()),
            IdentityError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<LeaseError> for DispatchError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::NotFound { lease_id } => Self::LeaseNotFound(lease_id),
            LeaseError::AlreadyRevoked { lease_id } => Self::LeaseRevoked(lease_id),
            LeaseError::Expired { lease_id } => Self::LeaseExpired(lease_id),
            LeaseError::InvalidTtl { ttl_secs, max_ttl_secs } => Self::InvalidTtl(format!(
                "{ttl_secs}s exceeds max {max_ttl_secs}s"
            )),
            LeaseError::Io(e) => Self::Internal(e.to_string()),
            LeaseError::Serde(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<RotationError> for DispatchError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::SecretNotFound { reference } => Self::SecretNotFound(reference),
            RotationError::NoHook { reference } => Self::NoRotationHook(reference),
            RotationError::NonZeroExit { code, output } => {
                Self::RotationFailed(format!("exit {code}: {output}"))
            }
            RotationError::Timeout { timeout_secs } => {
                Self::RotationTimeout(format!("{timeout_secs}s"))
            }
            RotationError::Spawn(e) => Self::Internal(e.to_string()),
            RotationError::Store(e) => e.into(),
        }
    }
}

impl From<KillswitchError> for DispatchError {
    fn from(err: KillswitchError) -> Self {
        match err {
            KillswitchError::PartialFailure(reason) => Self::Internal(reason),
        }
    }
}

impl From<AuditError> for DispatchError {
    fn from(err: AuditError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<HeartbeatError> for DispatchError {
    fn from(err: HeartbeatError) -> Self {
        Self::Internal(err.to_string())
    }
}
