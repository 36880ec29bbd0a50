//! dk_proto — wire types and serialisation for the device key core
//!
//! Everything a peer or an external collaborator sees is defined here and
//! serialised to JSON. Binary fields are base64url without padding.
//!
//! # Modules
//! - `ids`      — device, user and conversation identifiers
//! - `bundle`   — issued prekey bundles
//! - `envelope` — sealed pairwise message (what the relay stores)
//! - `share`    — conversation key shares and conversation ciphertexts
//! - `codec`    — plaintext padding

pub mod bundle;
pub mod codec;
pub mod envelope;
pub mod ids;
pub mod share;

pub use bundle::{FirstMessageSecrecy, IssuedBundle};
pub use codec::{CodecError, PaddingMode};
pub use envelope::SealedMessage;
pub use ids::{ConversationId, DeviceId, UserId};
pub use share::{ConversationCiphertext, DeviceKeyShare};

pub use dk_crypto::x3dh::PrekeyBundle;
