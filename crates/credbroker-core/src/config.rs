//! Broker configuration: `config.json` on disk, overridable by environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_directory() -> PathBuf {
    dirs_data_home().join(".credbroker")
}

fn dirs_data_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

const fn default_lease_ttl_secs() -> i64 {
    3600
}

const fn default_max_lease_ttl_secs() -> i64 {
    86_400
}

const fn default_rotation_timeout_secs() -> u64 {
    30
}

const fn default_lease_scan_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fail_action: KillswitchOptions,
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_heartbeat_timeout_secs() -> u64 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            fail_action: KillswitchOptions::default(),
        }
    }
}

/// Which killswitch sub-actions run, shared between manual activation and
/// the heartbeat monitor's automatic fail action.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KillswitchOptions {
    #[serde(default)]
    pub revoke_all: bool,
    #[serde(default)]
    pub rotate_all: bool,
    #[serde(default)]
    pub wipe_store: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_lease_ttl_secs")]
    pub default_lease_ttl_secs: i64,
    #[serde(default = "default_max_lease_ttl_secs")]
    pub max_lease_ttl_secs: i64,
    #[serde(default = "default_rotation_timeout_secs")]
    pub rotation_timeout_secs: u64,
    #[serde(default = "default_lease_scan_interval_secs")]
    pub lease_scan_interval_secs: u64,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub disable_mlock: bool,
    #[serde(default)]
    pub allow_insecure_permissions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            default_lease_ttl_secs: default_lease_ttl_secs(),
            max_lease_ttl_secs: default_max_lease_ttl_secs(),
            rotation_timeout_secs: default_rotation_timeout_secs(),
            lease_scan_interval_secs: default_lease_scan_interval_secs(),
            heartbeat: HeartbeatConfig::default(),
            disable_mlock: false,
            allow_insecure_permissions: false,
        }
    }
}

impl Config {
    /// Loads `config.json` from `path` if present, otherwise returns the
    /// built-in default; either way, environment variables win last.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CREDBROKER_DIR") {
            self.directory = PathBuf::from(dir);
        }
        if let Some(ttl) = env_i64("CREDBROKER_DEFAULT_LEASE_TTL") {
            self.default_lease_ttl_secs = ttl;
        }
        if let Some(ttl) = env_i64("CREDBROKER_MAX_LEASE_TTL") {
            self.max_lease_ttl_secs = ttl;
        }
        if let Some(secs) = env_u64("CREDBROKER_ROTATION_TIMEOUT") {
            self.rotation_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("CREDBROKER_LEASE_SCAN_INTERVAL") {
            self.lease_scan_interval_secs = secs;
        }
        if let Ok(url) = std::env::var("CREDBROKER_HEARTBEAT_URL") {
            self.heartbeat.enabled = true;
            self.heartbeat.url = Some(url);
        }
        if let Ok(val) = std::env::var("CREDBROKER_DISABLE_MLOCK") {
            self.disable_mlock = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = std::env::var("CREDBROKER_ALLOW_INSECURE_PERMISSIONS") {
            self.allow_insecure_permissions = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.directory.join("broker.sock")
    }

    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.directory.join("identity")
    }

    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.directory.join("secrets.blob")
    }

    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.directory.join("audit.log")
    }

    #[must_use]
    pub fn leases_path(&self) -> PathBuf {
        self.directory.join("leases.json")
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.directory.join("config.json")
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
