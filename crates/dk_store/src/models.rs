//! Database row models — these map to/from SQL rows.
//!
//! Columns ending in `_enc` hold vault ciphertext (see `Store::encrypt_value`).
//! Enumerated columns are plain text; `dk_core` maps them to typed enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    /// "untrusted" | "pending" | "trusted" | "compromised" | "revoked"
    pub trust_state: String,
    /// DeviceCapabilities JSON
    pub capabilities: String,
    pub generation: i64,
    /// True when this core holds the device's private keys.
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityKeyRow {
    pub id: String,
    pub device_id: String,
    pub generation: i64,
    /// Base64url Ed25519 public key
    pub public_key: String,
    /// Hex BLAKE3 fingerprint — unique across all devices and generations.
    pub fingerprint: String,
    /// Local devices only.
    pub secret_enc: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when a newer generation replaces this key. Kept for verifying
    /// historical signatures.
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPrekeyRow {
    pub id: String,
    pub device_id: String,
    pub identity_generation: i64,
    pub public_key: String,
    pub signature: String,
    /// ML-KEM-768 encapsulation key, when the device advertises it.
    pub kem_public: Option<String>,
    pub secret_enc: Option<String>,
    pub kem_secret_enc: Option<String>,
    pub is_active: bool,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePrekeyRow {
    pub id: String,
    pub device_id: String,
    pub public_key: String,
    pub secret_enc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub local_device_id: String,
    pub remote_device_id: String,
    /// "established" | "active" | "superseded" | "invalidated"
    pub state: String,
    /// HybridSuite tag
    pub suite: String,
    pub remote_fingerprint: String,
    /// RatchetSession JSON, vault-encrypted
    pub ratchet_state_enc: String,
    /// X3DHHeader JSON; cleared once the peer has answered.
    pub pending_handshake: Option<String>,
    /// Ephemeral key of the handshake that created this session; an
    /// incoming handshake with a different key starts a new session.
    pub handshake_ek: String,
    pub kem_public: Option<String>,
    pub kem_ciphertext: Option<String>,
    pub send_counter: i64,
    pub recv_counter: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub invalidation_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationKeyRow {
    pub id: String,
    pub conversation_id: String,
    pub version: i64,
    pub key_enc: String,
    /// "active" | "read_only"
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ParticipantRow {
    pub conversation_id: String,
    pub device_id: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceKeyShareRow {
    pub id: String,
    pub conversation_key_id: String,
    pub conversation_id: String,
    pub version: i64,
    pub target_device_id: String,
    pub sender_device_id: String,
    /// SealedMessage JSON
    pub sealed: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KeyRotationRecordRow {
    pub seq: i64,
    pub id: String,
    /// "signed_prekey" | "identity_key" | "one_time_prekeys" | "conversation_key"
    pub kind: String,
    pub device_id: Option<String>,
    pub conversation_id: Option<String>,
    pub old_ref: Option<String>,
    pub new_ref: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevocationRecordRow {
    pub seq: i64,
    pub id: String,
    pub device_id: String,
    pub reason: String,
    pub sessions_invalidated: i64,
    pub shares_deleted: i64,
    pub conversations_rotated: i64,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}
