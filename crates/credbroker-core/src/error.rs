//! Per-component error types.
//!
//! Each broker component owns a narrow [`thiserror::Error`] enum. Callers at
//! the transport boundary (the daemon's dispatcher) map these onto stable
//! numeric codes; nothing in this crate knows about that mapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity file not found at {path}")]
    NotFound { path: String },

    #[error("identity file is malformed: {reason}")]
    Malformed { reason: String },

    #[error("identity file at {path} has mode {mode:o}, expected {expected:o}")]
    InsecurePermissions {
        path: String,
        mode: u32,
        expected: u32,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store has not been initialized")]
    NotInitialized,

    #[error("store is already initialized")]
    AlreadyInitialized,

    #[error("secret not found: {reference}")]
    NotFound { reference: String },

    #[error("secret already exists: {reference}")]
    AlreadyExists { reference: String },

    #[error("store file is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("{path} has mode {mode:o}, expected {expected:o}")]
    InsecurePermissions {
        path: String,
        mode: u32,
        expected: u32,
    },

    #[error("invalid secret reference: {reference}")]
    InvalidReference { reference: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log at {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("failed to append audit entry: {reason}")]
    AppendFailed { reason: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    #[error("lease already revoked: {lease_id}")]
    AlreadyRevoked { lease_id: String },

    #[error("lease expired: {lease_id}")]
    Expired { lease_id: String },

    #[error("invalid ttl {ttl_secs}s: must be between 1 and {max_ttl_secs}s")]
    InvalidTtl { ttl_secs: i64, max_ttl_secs: i64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("secret not found: {reference}")]
    SecretNotFound { reference: String },

    #[error("secret {reference} has no rotation hook configured")]
    NoHook { reference: String },

    #[error("rotation command exited with status {code}: {output}")]
    NonZeroExit { code: i32, output: String },

    #[error("rotation command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("failed to spawn rotation command: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum KillswitchError {
    #[error("killswitch actions failed: {0}")]
    PartialFailure(String),
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("probe request failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("probe timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("heartbeat is already running")]
    AlreadyRunning,
}
