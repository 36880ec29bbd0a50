//! Prekey bundles as handed to an initiating device.

use serde::{Deserialize, Serialize};

use dk_crypto::x3dh::PrekeyBundle;

/// Whether the first message of a session gets one-time-prekey secrecy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstMessageSecrecy {
    /// A one-time prekey was claimed for this bundle.
    OneTimePrekey,
    /// The pool was empty; the handshake relies on the signed prekey alone.
    SignedPrekeyOnly,
}

/// A bundle plus the secrecy level the initiator should expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedBundle {
    pub bundle: PrekeyBundle,
    pub first_message_secrecy: FirstMessageSecrecy,
}

impl IssuedBundle {
    pub fn new(bundle: PrekeyBundle) -> Self {
        let first_message_secrecy = if bundle.has_one_time_prekey() {
            FirstMessageSecrecy::OneTimePrekey
        } else {
            FirstMessageSecrecy::SignedPrekeyOnly
        };
        Self { bundle, first_message_secrecy }
    }

    pub fn is_degraded(&self) -> bool {
        self.first_message_secrecy == FirstMessageSecrecy::SignedPrekeyOnly
    }
}
