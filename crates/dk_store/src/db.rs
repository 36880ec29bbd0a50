//! Database abstraction over SQLite via sqlx.

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use zeroize::Zeroizing;

use crate::{error::StoreError, migrations, vault::{self, Vault}};

const VALUE_AD_PREFIX: &[u8] = b"dk-store-v1\x00";
const META_VAULT_SALT: &str = "vault_salt";
const META_VAULT_CHECK: &str = "vault_check";
const VAULT_CHECK_PLAINTEXT: &[u8] = b"dk-vault-check";

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Central store handle. Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path` with default options.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        Self::open_with(db_path, vault, &StoreOptions::default()).await
    }

    /// Open (or create) the database and run pending migrations.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at
    /// connection time, NOT inside a migration: SQLite forbids changing
    /// `journal_mode` inside a transaction and sqlx wraps every migration in
    /// one.
    pub async fn open_with(db_path: &Path, vault: Vault, options: &StoreOptions) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(opts)
            .await?;

        migrations::run(&pool).await?;
        tracing::info!(path = %db_path.display(), "store opened");

        Ok(Self { pool, vault })
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Vault ────────────────────────────────────────────────────────────────

    /// Unlock the vault from a passphrase.
    ///
    /// The first unlock of a fresh database creates the salt and a check
    /// value; later unlocks with a different passphrase fail with
    /// `WrongPassphrase` instead of producing undecryptable columns.
    pub async fn unlock(&self, passphrase: &[u8]) -> Result<(), StoreError> {
        let salt = self.vault_salt().await?;
        self.vault.unlock(passphrase, &salt).await?;

        match self.meta(META_VAULT_CHECK).await? {
            Some(check) => {
                let ok = self
                    .decrypt_value(META_VAULT_CHECK, &check)
                    .await
                    .map(|pt| pt.as_slice() == VAULT_CHECK_PLAINTEXT)
                    .unwrap_or(false);
                if !ok {
                    self.vault.lock().await;
                    return Err(StoreError::WrongPassphrase);
                }
            }
            None => {
                let check = self.encrypt_value(META_VAULT_CHECK, VAULT_CHECK_PLAINTEXT).await?;
                self.set_meta(META_VAULT_CHECK, &check).await?;
            }
        }
        Ok(())
    }

    async fn vault_salt(&self) -> Result<[u8; 16], StoreError> {
        if let Some(hex_salt) = self.meta(META_VAULT_SALT).await? {
            let bytes = hex::decode(hex_salt).map_err(dk_crypto::CryptoError::from)?;
            return bytes
                .try_into()
                .map_err(|_| StoreError::Corrupt("vault salt must be 16 bytes".into()));
        }
        let salt = vault::new_vault_salt();
        self.set_meta(META_VAULT_SALT, &hex::encode(salt)).await?;
        Ok(salt)
    }

    async fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO store_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Encrypt a plaintext value with the vault key.
    ///
    /// `context` names the column; it is bound as associated data so a value
    /// cannot be moved to another column and still decrypt.
    pub async fn encrypt_value(&self, context: &str, plaintext: &[u8]) -> Result<String, StoreError> {
        let ad = value_ad(context);
        self.vault
            .with_key(|key| {
                let ct = dk_crypto::aead::encrypt(key, plaintext, &ad)?;
                Ok(URL_SAFE_NO_PAD.encode(ct))
            })
            .await
    }

    /// Decrypt a vault-encrypted value.
    pub async fn decrypt_value(&self, context: &str, b64: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let ct = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(dk_crypto::CryptoError::Base64Decode)?;
        let ad = value_ad(context);
        self.vault
            .with_key(|key| Ok(dk_crypto::aead::decrypt(key, &ct, &ad)?))
            .await
    }

    pub async fn encrypt_json<T: Serialize>(&self, context: &str, value: &T) -> Result<String, StoreError> {
        let json = Zeroizing::new(serde_json::to_vec(value)?);
        self.encrypt_value(context, &json).await
    }

    pub async fn decrypt_json<T: DeserializeOwned>(&self, context: &str, b64: &str) -> Result<T, StoreError> {
        let json = self.decrypt_value(context, b64).await?;
        Ok(serde_json::from_slice(&json)?)
    }
}

fn value_ad(context: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(VALUE_AD_PREFIX.len() + context.len());
    ad.extend_from_slice(VALUE_AD_PREFIX);
    ad.extend_from_slice(context.as_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::error::StoreError;
    use crate::vault::Vault;
    use chrono::Utc;

    async fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("keys.db"), Vault::new())
            .await
            .expect("open store");
        (dir, store)
    }

    async fn insert_device(store: &Store, id: &str) {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO devices (id, user_id, display_name, trust_state, capabilities, created_at, updated_at) VALUES (?, 'alice', 'laptop', 'trusted', '{}', ?, ?)",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&store.pool)
        .await
        .expect("insert device");
    }

    #[tokio::test]
    async fn migrations_allow_one_live_session_per_pair() {
        let (_dir, store) = open_temp().await;
        insert_device(&store, "dev-a").await;
        insert_device(&store, "dev-b").await;

        let insert = |id: &'static str, state: &'static str| {
            let pool = store.pool.clone();
            async move {
                let now = Utc::now();
                sqlx::query(
                    "INSERT INTO sessions (id, local_device_id, remote_device_id, state, suite, remote_fingerprint, ratchet_state_enc, handshake_ek, created_at, updated_at) VALUES (?, 'dev-a', 'dev-b', ?, 'classical', 'fp', 'enc', 'ek', ?, ?)",
                )
                .bind(id)
                .bind(state)
                .bind(now)
                .bind(now)
                .execute(&pool)
                .await
            }
        };

        insert("sid-old", "invalidated").await.expect("invalidated session");
        insert("sid-prev", "superseded").await.expect("superseded session");
        insert("sid-1", "established").await.expect("first live session");
        let err = insert("sid-2", "active").await.expect_err("second live session");
        assert!(StoreError::from(err).is_unique_violation());
    }

    #[tokio::test]
    async fn audit_tables_are_append_only() {
        let (_dir, store) = open_temp().await;
        sqlx::query(
            "INSERT INTO revocation_records (id, device_id, reason, sessions_invalidated, shares_deleted, conversations_rotated, created_at, prev_hash, hash) VALUES ('r1', 'dev', 'lost', 0, 0, 0, ?, 'CHAIN_START', 'h')",
        )
        .bind(Utc::now())
        .execute(&store.pool)
        .await
        .expect("insert record");

        assert!(sqlx::query("UPDATE revocation_records SET reason = 'x'")
            .execute(&store.pool)
            .await
            .is_err());
        assert!(sqlx::query("DELETE FROM revocation_records")
            .execute(&store.pool)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn values_are_bound_to_their_column() {
        let (_dir, store) = open_temp().await;
        store.unlock(b"correct horse").await.expect("unlock");

        let ct = store.encrypt_value("identity_keys.secret_enc", b"secret").await.unwrap();
        let pt = store.decrypt_value("identity_keys.secret_enc", &ct).await.unwrap();
        assert_eq!(pt.as_slice(), b"secret");
        assert!(store.decrypt_value("sessions.ratchet_state_enc", &ct).await.is_err());
    }

    #[tokio::test]
    async fn wrong_passphrase_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.db");
        {
            let store = Store::open(&path, Vault::new()).await.unwrap();
            store.unlock(b"first").await.unwrap();
            store.close().await;
        }
        let store = Store::open(&path, Vault::new()).await.unwrap();
        assert!(matches!(store.unlock(b"second").await, Err(StoreError::WrongPassphrase)));
        assert!(store.vault.is_locked().await);
        store.unlock(b"first").await.expect("original passphrase");
    }
}
