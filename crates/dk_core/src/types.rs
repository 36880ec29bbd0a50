//! Closed state enums and the value types returned by `KeyService`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use dk_crypto::identity::{DeviceCapabilities, PublicKeyBytes};
use dk_crypto::kem::HybridSuite;
use dk_proto::{ConversationId, DeviceId, UserId};
use dk_store::StoreError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        concat!("unknown ", stringify!($name), " {:?}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ── Trust ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Untrusted,
    Pending,
    Trusted,
    Compromised,
    Revoked,
}

text_enum!(TrustState {
    Untrusted => "untrusted",
    Pending => "pending",
    Trusted => "trusted",
    Compromised => "compromised",
    Revoked => "revoked",
});

impl TrustState {
    /// Allowed moves, excluding same-state no-ops:
    /// untrusted → pending → trusted; any non-revoked → compromised | revoked.
    pub fn can_transition_to(self, next: TrustState) -> bool {
        use TrustState::*;
        match (self, next) {
            (Revoked, _) => false,
            (_, Compromised) | (_, Revoked) => true,
            (Untrusted, Pending) | (Pending, Trusted) => true,
            _ => false,
        }
    }

    /// Devices in these states get no new keys and no new sessions.
    pub fn is_cut_off(self) -> bool {
        matches!(self, TrustState::Compromised | TrustState::Revoked)
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

/// Lifecycle of a (local, remote) session.
///
/// `Uninitiated` means no row exists and `Pending` only ever exists in memory
/// (`PendingSession`); the other states are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitiated,
    Pending,
    Established,
    Active,
    Invalidated,
}

text_enum!(SessionState {
    Uninitiated => "uninitiated",
    Pending => "pending",
    Established => "established",
    Active => "active",
    Invalidated => "invalidated",
});

/// Read-only view of a persisted session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub local_device: DeviceId,
    pub remote_device: DeviceId,
    pub state: SessionState,
    pub suite: HybridSuite,
    pub remote_fingerprint: String,
    pub send_counter: u64,
    pub recv_counter: u64,
    /// True while outgoing messages still carry the handshake header.
    pub awaiting_reply: bool,
    /// Hybrid suite only.
    pub has_kem_material: bool,
    pub created_at: DateTime<Utc>,
}

// ── Conversation keys ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    ReadOnly,
}

text_enum!(KeyStatus {
    Active => "active",
    ReadOnly => "read_only",
});

/// One version of a conversation's symmetric key.
pub struct ConversationKey {
    pub conversation_id: ConversationId,
    pub version: u32,
    pub status: KeyStatus,
    key: Zeroizing<[u8; 32]>,
}

impl ConversationKey {
    pub(crate) fn new(conversation_id: ConversationId, version: u32, status: KeyStatus, key: [u8; 32]) -> Self {
        Self { conversation_id, version, status, key: Zeroizing::new(key) }
    }

    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationKey")
            .field("conversation_id", &self.conversation_id)
            .field("version", &self.version)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

// ── Audit ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    SignedPrekey,
    IdentityKey,
    OneTimePrekeys,
    ConversationKey,
}

text_enum!(RotationKind {
    SignedPrekey => "signed_prekey",
    IdentityKey => "identity_key",
    OneTimePrekeys => "one_time_prekeys",
    ConversationKey => "conversation_key",
});

// ── Registry views ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIdentity {
    pub device_id: DeviceId,
    pub public_key: PublicKeyBytes,
    pub fingerprint: String,
    pub trust_state: TrustState,
    pub generation: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub user_id: UserId,
    pub display_name: String,
    pub trust_state: TrustState,
    pub capabilities: DeviceCapabilities,
    pub generation: u32,
    pub is_local: bool,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

// ── Lifecycle results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RevocationOutcome {
    pub device_id: DeviceId,
    /// The device was already revoked; nothing was written.
    pub already_revoked: bool,
    pub sessions_invalidated: u64,
    pub shares_deleted: u64,
    /// (conversation, new version) for every conversation re-keyed.
    pub conversations_rotated: Vec<(ConversationId, u32)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub signed_prekeys: u64,
    pub one_time_prekeys: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationPassReport {
    pub signed_prekeys_rotated: Vec<DeviceId>,
    pub one_time_prekeys_added: u64,
    pub purged: PurgeReport,
}
