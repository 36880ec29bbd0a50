use thiserror::Error;

use dk_crypto::CryptoError;
use dk_proto::{CodecError, ConversationId, DeviceId};
use dk_store::StoreError;

use crate::types::TrustState;

#[derive(Debug, Error)]
pub enum KeyError {
    /// The identity key is already registered. Carries the existing device so
    /// an idempotent re-registration can be resolved by the caller.
    #[error("Identity key already registered to device {existing}")]
    DuplicateDevice { existing: DeviceId },

    #[error("No one-time prekeys left for device {0}")]
    BundleExhausted(DeviceId),

    #[error("Identity of device {device} does not match its verified fingerprint")]
    IdentityMismatch { device: DeviceId },

    #[error("Message counter {counter} was already accepted on this chain")]
    CounterRegression { counter: u64 },

    #[error("Receiving chain desynchronised: {skip} skipped messages exceeds limit {limit}")]
    ChainDesynchronized { skip: u64, limit: u64 },

    /// One message for every cause: wrong key, corrupted data, tampered header.
    #[error("Message authentication failed")]
    AuthenticationFailed,

    #[error("Device {0} cannot receive keys")]
    RecipientUnavailable(DeviceId),

    #[error("Device {0} is already revoked")]
    RevocationConflict(DeviceId),

    #[error("Trust state cannot move from {from} to {to}")]
    InvalidTrustTransition { from: TrustState, to: TrustState },

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("No session from {local} to {remote}")]
    SessionNotFound { local: DeviceId, remote: DeviceId },

    #[error("Session from {local} to {remote} has been invalidated")]
    SessionInvalidated { local: DeviceId, remote: DeviceId },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Conversation already has keys: {0}")]
    ConversationExists(ConversationId),

    #[error("Conversation {conversation} version {version} is read-only (current is {current})")]
    StaleConversationKey { conversation: ConversationId, version: u32, current: u32 },

    #[error("Device {0} is not held by this core")]
    NotLocalDevice(DeviceId),

    #[error("Audit chain broken in {table} at seq {seq}")]
    AuditChainBroken { table: &'static str, seq: i64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl KeyError {
    /// Errors the core (or its caller) handles without surfacing a failure:
    /// a degraded bundle, or a participant dropped from one fan-out.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self, KeyError::BundleExhausted(_) | KeyError::RecipientUnavailable(_))
    }

    /// Store contention; the unit of work may be retried from the start.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeyError::Store(e) if e.is_transient())
    }

    pub fn is_security_event(&self) -> bool {
        matches!(self, KeyError::IdentityMismatch { .. })
    }

    /// The already-registered device, for idempotent registration.
    pub fn existing_device(&self) -> Option<DeviceId> {
        match self {
            KeyError::DuplicateDevice { existing } => Some(*existing),
            _ => None,
        }
    }
}

impl From<CryptoError> for KeyError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AeadDecrypt => KeyError::AuthenticationFailed,
            CryptoError::CounterRegression { counter, .. } => KeyError::CounterRegression { counter },
            CryptoError::ChainDesynchronized { skip, limit } => KeyError::ChainDesynchronized { skip, limit },
            other => KeyError::Crypto(other),
        }
    }
}

impl From<sqlx::Error> for KeyError {
    fn from(e: sqlx::Error) -> Self {
        KeyError::Store(StoreError::Database(e))
    }
}

impl From<serde_json::Error> for KeyError {
    fn from(e: serde_json::Error) -> Self {
        KeyError::Store(StoreError::Serialisation(e))
    }
}

pub type Result<T, E = KeyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_bundle_and_recipient_errors_are_recoverable() {
        let d = DeviceId::new();
        assert!(KeyError::BundleExhausted(d).is_locally_recoverable());
        assert!(KeyError::RecipientUnavailable(d).is_locally_recoverable());
        assert!(!KeyError::DuplicateDevice { existing: d }.is_locally_recoverable());
        assert!(!KeyError::AuthenticationFailed.is_locally_recoverable());
        assert!(!KeyError::RevocationConflict(d).is_locally_recoverable());
    }

    #[test]
    fn ratchet_failures_map_to_protocol_errors() {
        assert!(matches!(KeyError::from(CryptoError::AeadDecrypt), KeyError::AuthenticationFailed));
        assert!(matches!(
            KeyError::from(CryptoError::CounterRegression { chain: "c".into(), counter: 2 }),
            KeyError::CounterRegression { counter: 2 }
        ));
        assert!(matches!(
            KeyError::from(CryptoError::ChainDesynchronized { skip: 9, limit: 5 }),
            KeyError::ChainDesynchronized { skip: 9, limit: 5 }
        ));
        assert!(matches!(
            KeyError::from(CryptoError::SignatureVerification),
            KeyError::Crypto(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn authentication_failure_message_has_no_detail() {
        assert_eq!(KeyError::AuthenticationFailed.to_string(), "Message authentication failed");
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(KeyError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!KeyError::AuthenticationFailed.is_transient());
    }
}
