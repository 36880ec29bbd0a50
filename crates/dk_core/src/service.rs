//! `KeyService`: the one handle every public operation hangs off.
//!
//! Each component module contributes an `impl KeyService` block. The service
//! owns the store, the configuration, the lock table and the event channel.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use dk_proto::DeviceId;
use dk_store::{Store, Vault};

use crate::config::CoreConfig;
use crate::error::Result;
use crate::locks::LockTable;

const EVENT_CAPACITY: usize = 256;

/// Vault contexts of the encrypted columns; each is bound as associated data.
pub(crate) mod columns {
    pub const IDENTITY_SECRET: &str = "identity_keys.secret_enc";
    pub const SIGNED_PREKEY_SECRET: &str = "signed_prekeys.secret_enc";
    pub const SIGNED_PREKEY_KEM_SECRET: &str = "signed_prekeys.kem_secret_enc";
    pub const ONE_TIME_PREKEY_SECRET: &str = "one_time_prekeys.secret_enc";
    pub const RATCHET_STATE: &str = "sessions.ratchet_state_enc";
    pub const CONVERSATION_KEY: &str = "conversation_keys.key_enc";
}

/// Advisory notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KeyEvent {
    /// A device's one-time prekey pool dropped below the low watermark.
    ReplenishmentNeeded { device_id: DeviceId, available: u64 },
    /// Sessions referencing a device were invalidated.
    SessionsInvalidated { device_id: DeviceId, count: u64 },
    DeviceRevoked { device_id: DeviceId },
}

#[derive(Clone)]
pub struct KeyService {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    config: CoreConfig,
    locks: LockTable,
    events: broadcast::Sender<KeyEvent>,
}

impl KeyService {
    pub fn new(store: Store, config: CoreConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                locks: LockTable::default(),
                events,
            }),
        }
    }

    /// Open the database named in `config`; the vault is left as given.
    pub async fn connect(config: CoreConfig, vault: Vault) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(dk_store::StoreError::from)?;
            }
        }
        let store = Store::open_with(&config.database_path, vault, &config.store_options()).await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    pub(crate) fn retries(&self) -> u32 {
        self.inner.config.transaction_retries
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: KeyEvent) {
        // No receivers is fine: events are advisory.
        let _ = self.inner.events.send(event);
    }
}
