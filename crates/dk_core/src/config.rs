//! Core configuration.
//!
//! Loaded from a JSON file (path in `DK_CONFIG`, if set); every field has a
//! default so a partial file is fine. `DK_DB_PATH` overrides the database
//! location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use dk_crypto::ratchet::RatchetLimits;
use dk_proto::PaddingMode;
use dk_store::StoreOptions;

pub const APP_QUALIFIER: &str = "dev";
pub const APP_ORG: &str = "devicekeys";
pub const APP_NAME: &str = "keyd";

pub const ENV_CONFIG: &str = "DK_CONFIG";
pub const ENV_DB_PATH: &str = "DK_DB_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,

    /// Below this many unused one-time prekeys a `ReplenishmentNeeded`
    /// event is emitted.
    pub one_time_prekey_low_watermark: u32,
    /// Pool size a replenishment tops up to; also the initial batch.
    pub one_time_prekey_batch: u32,

    pub signed_prekey_rotation_secs: u64,
    /// How long a retired signed prekey can still answer handshakes.
    pub signed_prekey_grace_secs: u64,

    pub max_skip: u64,
    pub max_skipped_keys: usize,

    /// Versions of device key shares kept, counting the current one.
    pub share_retention_versions: u32,

    pub padding: PaddingMode,

    /// Attempts for a unit of work that hits store contention.
    pub transaction_retries: u32,

    /// 0 disables auto-lock.
    pub vault_auto_lock_secs: u64,

    /// Interval of the background rotation task.
    pub rotation_check_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: 8,
            one_time_prekey_low_watermark: 10,
            one_time_prekey_batch: 100,
            signed_prekey_rotation_secs: 7 * 24 * 3600,
            signed_prekey_grace_secs: 2 * 24 * 3600,
            max_skip: 1000,
            max_skipped_keys: 1000,
            share_retention_versions: 3,
            padding: PaddingMode::Buckets,
            transaction_retries: 5,
            vault_auto_lock_secs: 1800,
            rotation_check_secs: 3600,
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Defaults, then the file named by `DK_CONFIG`, then `DK_DB_PATH`.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(ENV_CONFIG) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(db) = std::env::var_os(ENV_DB_PATH) {
            config.database_path = PathBuf::from(db);
        }
        Ok(config)
    }

    /// Configuration for a database at `path`, everything else default.
    pub fn for_database(path: impl Into<PathBuf>) -> Self {
        Self { database_path: path.into(), ..Self::default() }
    }

    pub fn ratchet_limits(&self) -> RatchetLimits {
        RatchetLimits {
            max_skip: self.max_skip,
            max_skipped_keys: self.max_skipped_keys,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.max_connections.max(1),
            ..StoreOptions::default()
        }
    }

    pub fn signed_prekey_rotation(&self) -> chrono::Duration {
        seconds(self.signed_prekey_rotation_secs)
    }

    pub fn signed_prekey_grace(&self) -> chrono::Duration {
        seconds(self.signed_prekey_grace_secs)
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_check_secs.max(1))
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

pub fn default_database_path() -> PathBuf {
    match ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME) {
        Some(dirs) => dirs.data_dir().join("keys.db"),
        None => PathBuf::from("dk-keys.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_limits() {
        let c = CoreConfig::default();
        assert_eq!(c.one_time_prekey_low_watermark, 10);
        assert_eq!(c.max_skip, 1000);
        assert_eq!(c.max_skipped_keys, 1000);
        assert_eq!(c.signed_prekey_rotation(), chrono::Duration::days(7));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        std::fs::write(&path, r#"{ "max_skip": 50, "padding": "none" }"#).unwrap();
        let c = CoreConfig::load(&path).unwrap();
        assert_eq!(c.max_skip, 50);
        assert_eq!(c.padding, PaddingMode::None);
        assert_eq!(c.max_skipped_keys, 1000);
        assert_eq!(c.ratchet_limits().max_skip, 50);
    }
}
