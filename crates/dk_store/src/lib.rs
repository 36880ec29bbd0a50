//! dk_store — encrypted SQLite persistence for the device key core
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. We use application-level encryption:
//! - Secret columns (identity secrets, prekey secrets, ratchet state,
//!   conversation keys) are stored as XChaCha20-Poly1305 ciphertext,
//!   base64url-encoded, with the column name bound as associated data.
//! - The vault key is derived from a passphrase via Argon2id (or supplied
//!   raw) and held in memory only while the vault is unlocked.
//! - Public keys, fingerprints, states and timestamps are plaintext so they
//!   can be queried.
//!
//! # Migration
//! SQLx migrations in `migrations/` are embedded and run on open.

pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod vault;

pub use db::{Store, StoreOptions};
pub use error::StoreError;
pub use vault::Vault;
