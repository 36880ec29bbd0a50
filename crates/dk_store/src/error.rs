use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked — unlock with passphrase first")]
    VaultLocked,

    #[error("Vault passphrase does not match this database")]
    WrongPassphrase,

    #[error("Crypto error: {0}")]
    Crypto(#[from] dk_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// SQLite extended result codes, as reported by sqlx.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";
const SQLITE_BUSY_RECOVERY: &str = "261";
const SQLITE_LOCKED_SHAREDCACHE: &str = "262";
const SQLITE_BUSY_SNAPSHOT: &str = "517";
const SQLITE_BUSY_TIMEOUT: &str = "773";

impl StoreError {
    /// Lock contention or pool exhaustion: the whole unit of work may be
    /// retried from the start.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some(
                    SQLITE_BUSY
                        | SQLITE_LOCKED
                        | SQLITE_BUSY_RECOVERY
                        | SQLITE_LOCKED_SHAREDCACHE
                        | SQLITE_BUSY_SNAPSHOT
                        | SQLITE_BUSY_TIMEOUT
                )
            ),
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::VaultLocked.is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }
}
