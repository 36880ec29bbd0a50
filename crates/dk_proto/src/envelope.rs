//! Sealed pairwise message — what the relay sees.
//!
//! The relay only needs:
//!   - sender / recipient device ids (routing)
//!   - the algorithm tag (so the recipient knows which suite to expect)
//!   - the ratchet header (DH public key + counters)
//!   - nonce, ciphertext and tag (opaque)
//!   - the handshake header, on messages sent before the peer has answered
//!
//! The AEAD associated data covers the envelope version, both device ids,
//! the algorithm tag, the ratchet header and the sender fingerprint, plus
//! whatever the caller supplies. The handshake header is not in it; it is
//! bound through the key it derives, so an altered header fails to open.
//! `sent_at` is the sender's clock, unauthenticated and informational only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dk_crypto::ratchet::RatchetHeader;
use dk_crypto::x3dh::X3DHHeader;

use crate::ids::DeviceId;

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Wire format version.
    pub version: u8,

    pub sender_device: DeviceId,
    pub recipient_device: DeviceId,

    /// Suite tag, e.g. `dk1/x25519/xchacha20poly1305`.
    pub algorithm: String,

    /// Ratchet public key, message counter and previous chain length.
    pub header: RatchetHeader,

    /// XChaCha20-Poly1305 nonce (24 bytes, base64url).
    pub nonce: String,
    /// Ciphertext without tag (base64url). Inner content is padded plaintext.
    pub ciphertext: String,
    /// Poly1305 tag (16 bytes, base64url).
    pub tag: String,

    /// Hex BLAKE3 fingerprint of the sender's identity key.
    pub sender_fingerprint: String,

    /// Present until the responder has answered on this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<X3DHHeader>,

    /// Not authenticated.
    pub sent_at: DateTime<Utc>,
}

impl SealedMessage {
    pub fn counter(&self) -> u64 {
        self.header.n
    }

    pub fn previous_chain_length(&self) -> u64 {
        self.header.pn
    }

    pub fn is_handshake(&self) -> bool {
        self.handshake.is_some()
    }

    /// Associated data authenticated together with the ciphertext.
    ///
    /// Layout: length-prefixed fields, each as `u32 LE len || bytes`:
    /// version, sender, recipient, algorithm, ratchet key, n, pn,
    /// sender fingerprint, caller AD.
    pub fn associated_data(&self, caller_ad: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + caller_ad.len());
        push_field(&mut out, b"dk-envelope-v1");
        push_field(&mut out, &[self.version]);
        push_field(&mut out, self.sender_device.as_text().as_bytes());
        push_field(&mut out, self.recipient_device.as_text().as_bytes());
        push_field(&mut out, self.algorithm.as_bytes());
        push_field(&mut out, self.header.dh_pub.as_bytes());
        push_field(&mut out, &self.header.n.to_le_bytes());
        push_field(&mut out, &self.header.pn.to_le_bytes());
        push_field(&mut out, self.sender_fingerprint.as_bytes());
        push_field(&mut out, caller_ad);
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

fn push_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_le_bytes());
    out.extend_from_slice(field);
}
