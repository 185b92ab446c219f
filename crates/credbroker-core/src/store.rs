//! The encrypted secret store: one AES-256-GCM blob on disk holding every
//! secret, guarded in memory by a single read/write lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto;
use crate::error::StoreError;
use crate::identity::Identity;
use crate::secret_ref::SecretRef;

const CURRENT_VERSION: u32 = 2;
const STORE_MODE: u32 = 0o600;

/// A secret's value. Zeroized on drop; never appears in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(String);

impl SecretValue {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(\"[REDACTED]\")")
    }
}

impl Serialize for SecretValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

/// A stored secret, including its (decrypted, in-memory-only) value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default = "crate::secret_ref::default_namespace")]
    pub namespace: String,
    pub name: String,
    pub value: SecretValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_rotated: Option<DateTime<Utc>>,
    pub rotate_via: Option<String>,
}

/// Metadata about a secret, without its value. What `list()` returns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub namespace: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_rotated: Option<DateTime<Utc>>,
    pub has_rotation_hook: bool,
}

impl From<&Secret> for SecretMetadata {
    fn from(s: &Secret) -> Self {
        Self {
            namespace: s.namespace.clone(),
            name: s.name.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            last_rotated: s.last_rotated,
            has_rotation_hook: s.rotate_via.is_some(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    secrets: HashMap<String, Secret>,
}

/// In-memory secret map plus the identity and path needed to persist it.
pub struct Store {
    path: PathBuf,
    identity: Identity,
    secrets: RwLock<HashMap<String, Secret>>,
    allow_insecure_permissions: bool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Initializes a fresh store at `path`: fails if one already exists.
    /// Writes an empty encrypted blob immediately, so a second `init()`
    /// against the same path always fails.
    pub fn init(
        path: &Path,
        identity: Identity,
        allow_insecure_permissions: bool,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyInitialized);
        }
        let store = Self {
            path: path.to_path_buf(),
            identity,
            secrets: RwLock::new(HashMap::new()),
            allow_insecure_permissions,
        };
        store.persist(&HashMap::new())?;
        Ok(store)
    }

    /// Loads an existing store file, decrypting it with `identity`.
    ///
    /// Transparently migrates the V1 flat-key layout (no namespace) into
    /// V2 composite keys under the default namespace; the next `save()`
    /// persists V2.
    pub fn load(
        path: &Path,
        identity: Identity,
        allow_insecure_permissions: bool,
    ) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotInitialized);
        }
        if !allow_insecure_permissions {
            check_mode(path, STORE_MODE)?;
        }

        let ciphertext = std::fs::read(path)?;
        let plaintext = crypto::decrypt(identity.key(), &ciphertext)
            .map_err(|_| StoreError::Corrupted {
                reason: "decryption failed".to_string(),
            })?;

        let file: StoreFile = serde_json::from_slice(&plaintext).map_err(|e| {
            StoreError::Corrupted {
                reason: e.to_string(),
            }
        })?;

        let secrets = migrate_if_needed(file);

        Ok(Self {
            path: path.to_path_buf(),
            identity,
            secrets: RwLock::new(secrets),
            allow_insecure_permissions,
        })
    }

    #[must_use]
    pub fn recipient(&self) -> &str {
        self.identity.recipient()
    }

    pub async fn secret_count(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn add(
        &self,
        reference: &SecretRef,
        value: SecretValue,
        rotate_via: Option<String>,
    ) -> Result<(), StoreError> {
        let key = reference.storage_key();
        let mut guard = self.secrets.write().await;
        if guard.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                reference: key,
            });
        }

        let snapshot = guard.clone();
        let now = Utc::now();
        guard.insert(
            key.clone(),
            Secret {
                namespace: reference.namespace.clone(),
                name: reference.name.clone(),
                value,
                created_at: now,
                updated_at: now,
                last_rotated: None,
                rotate_via,
            },
        );

        if let Err(err) = self.persist(&guard) {
            *guard = snapshot;
            return Err(err);
        }
        Ok(())
    }

    pub async fn update(
        &self,
        reference: &SecretRef,
        value: SecretValue,
        rotate_via: Option<String>,
    ) -> Result<(), StoreError> {
        let key = reference.storage_key();
        let mut guard = self.secrets.write().await;
        let Some(existing) = guard.get(&key) else {
            return Err(StoreError::NotFound { reference: key });
        };

        let snapshot = guard.clone();
        let mut updated = existing.clone();
        updated.value = value;
        updated.rotate_via = rotate_via.or(updated.rotate_via);
        updated.updated_at = Utc::now();
        guard.insert(key, updated);

        if let Err(err) = self.persist(&guard) {
            *guard = snapshot;
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete(&self, reference: &SecretRef) -> Result<(), StoreError> {
        let key = reference.storage_key();
        let mut guard = self.secrets.write().await;
        if !guard.contains_key(&key) {
            return Err(StoreError::NotFound { reference: key });
        }

        let snapshot = guard.clone();
        guard.remove(&key);

        if let Err(err) = self.persist(&guard) {
            *guard = snapshot;
            return Err(err);
        }
        Ok(())
    }

    /// Internal accessor: returns the decrypted value. Never exposed
    /// directly over the wire protocol — only through a lease.
    pub async fn get(&self, reference: &SecretRef) -> Result<Secret, StoreError> {
        let key = reference.storage_key();
        self.secrets
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound { reference: key })
    }

    pub async fn mark_rotated(&self, reference: &SecretRef) -> Result<(), StoreError> {
        let key = reference.storage_key();
        let mut guard = self.secrets.write().await;
        let Some(existing) = guard.get(&key) else {
            return Err(StoreError::NotFound { reference: key });
        };

        let snapshot = guard.clone();
        let mut updated = existing.clone();
        let now = Utc::now();
        updated.last_rotated = Some(now);
        updated.updated_at = now;
        guard.insert(key, updated);

        if let Err(err) = self.persist(&guard) {
            *guard = snapshot;
            return Err(err);
        }
        Ok(())
    }

    /// Metadata for every secret, optionally restricted to one namespace.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<SecretMetadata> {
        self.secrets
            .read()
            .await
            .values()
            .filter(|s| namespace.is_none_or(|ns| s.namespace == ns))
            .map(SecretMetadata::from)
            .collect()
    }

    /// Every secret with a configured rotation hook.
    pub async fn list_with_rotation_hook(&self) -> Vec<SecretRef> {
        self.secrets
            .read()
            .await
            .values()
            .filter(|s| s.rotate_via.is_some())
            .map(|s| SecretRef::new(s.namespace.clone(), s.name.clone()))
            .collect()
    }

    pub async fn wipe_all(&self) -> Result<(), StoreError> {
        let mut guard = self.secrets.write().await;
        let snapshot = guard.clone();
        guard.clear();
        if let Err(err) = self.persist(&guard) {
            *guard = snapshot;
            return Err(err);
        }
        Ok(())
    }

    fn persist(&self, secrets: &HashMap<String, Secret>) -> Result<(), StoreError> {
        let file = StoreFile {
            version: CURRENT_VERSION,
            secrets: secrets.clone(),
        };
        let plaintext = serde_json::to_vec(&file)?;
        let ciphertext = crypto::encrypt(self.identity.key(), &plaintext).map_err(|e| {
            StoreError::Corrupted {
                reason: e.to_string(),
            }
        })?;
        std::fs::write(&self.path, ciphertext)?;
        set_mode(&self.path, STORE_MODE)?;
        Ok(())
    }
}

fn migrate_if_needed(file: StoreFile) -> HashMap<String, Secret> {
    if file.version >= CURRENT_VERSION {
        return file.secrets;
    }

    // V1 stored flat `name -> Secret` with no namespace field; `Secret`'s
    // `#[serde(default)]` already filled namespace in as `default` during
    // deserialization, so re-key every entry under its own composite key.
    file.secrets
        .into_values()
        .map(|secret| (format!("{}::{}", secret.namespace, secret.name), secret))
        .collect()
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn check_mode(path: &Path, expected: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let actual = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if actual != expected {
        return Err(StoreError::InsecurePermissions {
            path: path.display().to_string(),
            mode: actual,
            expected,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_mode(_path: &Path, _expected: u32) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_identity() -> Identity {
        Identity::generate().unwrap()
    }

    #[tokio::test]
    async fn add_then_get_roundtrips_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        let reference = SecretRef::parse("db-password").unwrap();

        store
            .add(&reference, SecretValue::new("hunter2"), None)
            .await
            .unwrap();

        let secret = store.get(&reference).await.unwrap();
        assert_eq!(secret.value.expose(), "hunter2");
    }

    #[tokio::test]
    async fn add_duplicate_reference_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        let reference = SecretRef::parse("db-password").unwrap();

        store
            .add(&reference, SecretValue::new("first"), None)
            .await
            .unwrap();
        let result = store.add(&reference, SecretValue::new("second"), None).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn persists_across_load() {
        let dir = tempdir().unwrap();
        let blob_path = dir.path().join("secrets.blob");
        let identity_path = dir.path().join("identity");

        let identity = test_identity();
        identity.save(&identity_path).unwrap();

        let store = Store::init(&blob_path, identity, false).unwrap();
        let reference = SecretRef::parse("prod::api-key").unwrap();
        store
            .add(&reference, SecretValue::new("sk-live-abc"), None)
            .await
            .unwrap();

        // Wrong identity: decrypting with an unrelated key must fail.
        let wrong_identity = Identity::generate().unwrap();
        assert!(Store::load(&blob_path, wrong_identity, false).is_err());

        let reloaded_identity = Identity::load(&identity_path, false).unwrap();
        let reopened = Store::load(&blob_path, reloaded_identity, false).unwrap();
        let secret = reopened.get(&reference).await.unwrap();
        assert_eq!(secret.value.expose(), "sk-live-abc");
    }

    #[tokio::test]
    async fn delete_removes_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        let reference = SecretRef::parse("db-password").unwrap();
        store
            .add(&reference, SecretValue::new("hunter2"), None)
            .await
            .unwrap();

        store.delete(&reference).await.unwrap();
        assert!(matches!(
            store.get(&reference).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_missing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        let reference = SecretRef::parse("missing").unwrap();
        assert!(matches!(
            store.delete(&reference).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn mark_rotated_advances_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        let reference = SecretRef::parse("db-password").unwrap();
        store
            .add(&reference, SecretValue::new("hunter2"), Some("rotate.sh".into()))
            .await
            .unwrap();

        store.mark_rotated(&reference).await.unwrap();
        let secret = store.get(&reference).await.unwrap();
        assert!(secret.last_rotated.is_some());
    }

    #[tokio::test]
    async fn list_never_exposes_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        store
            .add(&SecretRef::parse("a").unwrap(), SecretValue::new("x"), None)
            .await
            .unwrap();

        let listed = store.list(None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a");
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        store
            .add(&SecretRef::parse("production::api").unwrap(), SecretValue::new("p"), None)
            .await
            .unwrap();
        store
            .add(&SecretRef::parse("staging::api").unwrap(), SecretValue::new("s"), None)
            .await
            .unwrap();
        store
            .add(&SecretRef::parse("api").unwrap(), SecretValue::new("d"), None)
            .await
            .unwrap();

        let staging_only = store.list(Some("staging")).await;
        assert_eq!(staging_only.len(), 1);
        assert_eq!(staging_only[0].namespace, "staging");

        assert_eq!(store.list(None).await.len(), 3);
    }

    #[tokio::test]
    async fn wipe_all_clears_every_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        let store = Store::init(&path, test_identity(), false).unwrap();
        store
            .add(&SecretRef::parse("a").unwrap(), SecretValue::new("x"), None)
            .await
            .unwrap();
        store
            .add(&SecretRef::parse("b").unwrap(), SecretValue::new("y"), None)
            .await
            .unwrap();

        store.wipe_all().await.unwrap();
        assert_eq!(store.list(None).await.len(), 0);
    }

    #[tokio::test]
    async fn init_sets_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        Store::init(&path, test_identity(), false).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn init_twice_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.blob");
        Store::init(&path, test_identity(), false).unwrap();
        assert!(matches!(
            Store::init(&path, test_identity(), false),
            Err(StoreError::AlreadyInitialized)
        ));
    }
}
