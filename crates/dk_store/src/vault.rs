//! Vault: in-memory key that encrypts private key material at rest.
//!
//! The vault holds the 32-byte store encryption key in memory. Every secret
//! column (identity secrets, prekey secrets, ratchet state, conversation
//! keys) is sealed under it. When the vault is locked, or the auto-lock timer
//! fires, the key is zeroized and every secret read or write fails with
//! `StoreError::VaultLocked`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use dk_crypto::kdf::{generate_salt, vault_key_from_password};

use crate::error::StoreError;

pub const DEFAULT_AUTO_LOCK_SECS: u64 = 1800;

#[derive(ZeroizeOnDrop)]
struct VaultInner {
    key: [u8; 32],
    #[zeroize(skip)]
    last_activity: Instant,
}

/// Thread-safe vault handle. Clones share the same key slot.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultInner>>>,
    auto_lock_secs: u64,
}

impl Vault {
    pub fn new() -> Self {
        Self::with_auto_lock(DEFAULT_AUTO_LOCK_SECS)
    }

    /// Vault that locks itself after `seconds` of inactivity. 0 = never.
    pub fn with_auto_lock(seconds: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            auto_lock_secs: seconds,
        }
    }

    /// Unlock with a passphrase and the store's salt.
    pub async fn unlock(&self, passphrase: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let vault_key = vault_key_from_password(passphrase, salt)?;
        self.unlock_with_key(vault_key.0).await
    }

    /// Unlock with raw key material (keyring, HSM, tests).
    pub async fn unlock_with_key(&self, key: [u8; 32]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        *guard = Some(VaultInner {
            key,
            last_activity: Instant::now(),
        });
        Ok(())
    }

    /// Lock the vault — zeroizes the key.
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => {
                if self.expired(inner) {
                    drop(guard);
                    tracing::info!("vault auto-locked after inactivity");
                    self.lock().await;
                    return true;
                }
                false
            }
            None => true,
        }
    }

    fn expired(&self, inner: &VaultInner) -> bool {
        self.auto_lock_secs > 0
            && inner.last_activity.elapsed() > Duration::from_secs(self.auto_lock_secs)
    }

    /// Record activity (resets the auto-lock timer).
    pub async fn touch(&self) {
        let mut guard = self.inner.write().await;
        if let Some(ref mut inner) = *guard {
            inner.last_activity = Instant::now();
        }
    }

    /// Run `f` with the raw key. Fails if locked or auto-lock has expired.
    /// Touches the activity timer.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        if self.is_locked().await {
            return Err(StoreError::VaultLocked);
        }

        let mut guard = self.inner.write().await;
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(&inner.key)
            }
            None => Err(StoreError::VaultLocked),
        }
    }

    /// Seconds until auto-lock, `None` when locked.
    pub async fn time_until_lock(&self) -> Option<u64> {
        let guard = self.inner.read().await;
        guard.as_ref().map(|inner| {
            if self.auto_lock_secs == 0 {
                return u64::MAX;
            }
            let elapsed = inner.last_activity.elapsed().as_secs();
            self.auto_lock_secs.saturating_sub(elapsed)
        })
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh salt for a new store. Persisted in `store_meta`; not secret.
pub fn new_vault_salt() -> [u8; 16] {
    generate_salt()
}
