//! Conversation key distribution.
//!
//! A `DeviceKeyShare` is one conversation key version sealed for one target
//! device over the pairwise session with the sending device. The server only
//! ever stores and relays shares; it never sees the raw key.

use serde::{Deserialize, Serialize};

use crate::envelope::SealedMessage;
use crate::ids::{ConversationId, DeviceId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeyShare {
    pub conversation_id: ConversationId,
    pub version: u32,
    pub sender_device: DeviceId,
    pub target_device: DeviceId,
    pub sealed: SealedMessage,
}

impl DeviceKeyShare {
    /// Caller associated data used when sealing the share; binds the share to
    /// its conversation and version.
    pub fn associated_data(conversation_id: &ConversationId, version: u32) -> Vec<u8> {
        let mut ad = Vec::with_capacity(conversation_id.as_str().len() + 16);
        ad.extend_from_slice(b"dk-share-v1\x00");
        ad.extend_from_slice(conversation_id.as_str().as_bytes());
        ad.push(0);
        ad.extend_from_slice(&version.to_le_bytes());
        ad
    }
}

/// Payload encrypted directly under a conversation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCiphertext {
    pub conversation_id: ConversationId,
    pub version: u32,
    /// base64url(nonce || ciphertext+tag)
    pub payload: String,
}

impl ConversationCiphertext {
    pub fn associated_data(&self, caller_ad: &[u8]) -> Vec<u8> {
        let mut ad = DeviceKeyShare::associated_data(&self.conversation_id, self.version);
        ad.extend_from_slice(b"\x00msg\x00");
        ad.extend_from_slice(caller_ad);
        ad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_ad_depends_on_version() {
        let conv = ConversationId::from("c1");
        assert_ne!(
            DeviceKeyShare::associated_data(&conv, 1),
            DeviceKeyShare::associated_data(&conv, 2)
        );
    }
}
