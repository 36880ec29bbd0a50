//! dk_core — multi-device end-to-end key management and session core
//!
//! Every operation hangs off [`KeyService`]. Components, leaf first:
//!
//! - `registry`  — device identities and trust state
//! - `prekeys`   — signed and one-time prekeys, bundle issuance
//! - `session`   — X3DH handshakes and persisted ratchet sessions
//! - `cipher`    — sealing and opening pairwise messages
//! - `fanout`    — versioned conversation keys wrapped per device
//! - `lifecycle` — scheduled rotation, replenishment, purge and revocation
//! - `audit`     — hash-chained rotation and revocation records
//!
//! Concurrency: ratchet advancement and conversation membership changes are
//! serialised through an in-process lock table (`locks`); every unit of work
//! is a single SQLite transaction, retried as a whole on contention.

pub mod audit;
pub mod cipher;
pub mod config;
pub mod error;
pub mod fanout;
pub mod lifecycle;
mod locks;
pub mod prekeys;
pub mod registry;
mod retry;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod types;

pub use audit::{AuditReport, RevocationRecord, RotationRecord};
pub use config::CoreConfig;
pub use error::{KeyError, Result};
pub use fanout::FanoutResult;
pub use prekeys::SignedPrekeyUpload;
pub use service::{KeyEvent, KeyService};
pub use session::PendingSession;
pub use types::*;

pub use dk_crypto::identity::{Algorithm, DeviceCapabilities, PublicKeyBytes};
pub use dk_crypto::kem::{negotiate as negotiate_suite, HybridSuite};
pub use dk_proto::{
    ConversationCiphertext, ConversationId, DeviceId, DeviceKeyShare, FirstMessageSecrecy, IssuedBundle,
    PrekeyBundle, SealedMessage, UserId,
};
