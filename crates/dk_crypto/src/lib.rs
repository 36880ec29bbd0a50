//! dk_crypto — device key core cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - AEAD failures carry no detail about why a ciphertext was rejected.
//!
//! # Module layout
//! - `identity`  — long-term Ed25519 identity keys + advertised capabilities
//! - `x3dh`      — X3DH key agreement (signed prekeys, one-time prekeys, bundles)
//! - `kem`       — ML-KEM-768 hybrid encapsulation + suite negotiation
//! - `ratchet`   — Double Ratchet with DH ratchet steps + bounded skipped keys
//! - `aead`      — XChaCha20-Poly1305 (combined and detached-tag forms)
//! - `kdf`       — HKDF / Argon2id key derivation
//! - `hash`      — BLAKE3 utilities (fingerprints, audit chain links)
//! - `error`     — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod kem;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
