//! The broker's identity: the root encryption key and its on-disk encoding.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto::{self, EncryptionKey};
use crate::error::IdentityError;

const IDENTITY_MODE: u32 = 0o600;

/// The broker's root key plus its derived, non-secret recipient fingerprint.
pub struct Identity {
    key: EncryptionKey,
    recipient: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("recipient", &self.recipient)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generates a fresh identity. Does not write anything to disk.
    pub fn generate() -> Result<Self, IdentityError> {
        let key = EncryptionKey::generate();
        let recipient = crypto::fingerprint(&key)?;
        Ok(Self { key, recipient })
    }

    #[must_use]
    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    /// A non-secret identifier derived from the root key, safe to display
    /// or log.
    #[must_use]
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Writes the identity to `path` as base64 text, mode 0600.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let armored = BASE64.encode(self.key.as_bytes());
        std::fs::write(path, armored.as_bytes())?;
        set_mode(path, IDENTITY_MODE)?;
        Ok(())
    }

    /// Loads an identity previously written by [`Identity::save`].
    ///
    /// Rejects files whose permissions are wider than 0600 unless
    /// `allow_insecure_permissions` is set.
    pub fn load(path: &Path, allow_insecure_permissions: bool) -> Result<Self, IdentityError> {
        if !path.exists() {
            return Err(IdentityError::NotFound {
                path: path.display().to_string(),
            });
        }

        if !allow_insecure_permissions {
            check_mode(path, IDENTITY_MODE)?;
        }

        let armored = std::fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(armored.trim())
            .map_err(|e| IdentityError::Malformed {
                reason: e.to_string(),
            })?;
        let key_bytes: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::Malformed {
                    reason: format!("expected 32 key bytes, got {}", bytes.len()),
                })?;

        let key = EncryptionKey::from_bytes(key_bytes);
        let recipient = crypto::fingerprint(&key)?;
        Ok(Self { key, recipient })
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), IdentityError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), IdentityError> {
    Ok(())
}

#[cfg(unix)]
fn check_mode(path: &Path, expected: u32) -> Result<(), IdentityError> {
    use std::os::unix::fs::PermissionsExt;
    let actual = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if actual != expected {
        return Err(IdentityError::InsecurePermissions {
            path: path.display().to_string(),
            mode: actual,
            expected,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_mode(_path: &Path, _expected: u32) -> Result<(), IdentityError> {
    Ok(())
}

/// Default identity file name under the broker's data directory.
pub fn default_filename() -> PathBuf {
    PathBuf::from("identity")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_has_stable_recipient() {
        let identity = Identity::generate().unwrap();
        assert_eq!(identity.recipient().len(), 64);
    }

    #[test]
    fn save_then_load_roundtrips_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let identity = Identity::generate().unwrap();
        identity.save(&path).unwrap();

        let loaded = Identity::load(&path, false).unwrap();
        assert_eq!(loaded.recipient(), identity.recipient());
        assert_eq!(loaded.key().as_bytes(), identity.key().as_bytes());
    }

    #[test]
    fn save_sets_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        Identity::generate().unwrap().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        assert!(matches!(
            Identity::load(&path, false),
            Err(IdentityError::NotFound { .. })
        ));
    }

    #[test]
    fn load_rejects_insecure_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        Identity::generate().unwrap().save(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            Identity::load(&path, false),
            Err(IdentityError::InsecurePermissions { .. })
        ));
        assert!(Identity::load(&path, true).is_ok());
    }
}
