//! Key derivation functions
//!
//! `vault_key_from_password` — Argon2id, derives the 32-byte key used to
//!   encrypt private key material in the local store.
//!
//! `hkdf_expand` — HKDF-SHA256, used for handshake and conversation keys.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

// ── Vault key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte vault key derived from an operator passphrase. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

/// Argon2id parameters, tuned for a service unlocking once at start-up.
fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a vault key from a passphrase + 16-byte salt.
/// The salt is stored next to the database (not secret).
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

/// Generate a fresh random 16-byte salt.
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a fresh random 32-byte symmetric key.
pub fn generate_key() -> [u8; 32] {
    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Combine the classical X3DH secret with a KEM shared secret.
///
/// Both inputs are mandatory; a hybrid session never derives from one alone.
pub fn hybrid_root_secret(classical: &[u8; 32], kem_shared: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(classical);
    ikm.extend_from_slice(kem_shared);
    let mut out = [0u8; 32];
    let res = hkdf_expand(&ikm, Some(&[0u8; 32]), b"dk-hybrid-v1", &mut out);
    ikm.zeroize();
    res.map(|()| out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_secret_depends_on_both_inputs() {
        let a = hybrid_root_secret(&[1u8; 32], &[2u8; 32]).unwrap();
        let b = hybrid_root_secret(&[1u8; 32], &[3u8; 32]).unwrap();
        let c = hybrid_root_secret(&[4u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, hybrid_root_secret(&[1u8; 32], &[2u8; 32]).unwrap());
    }
}
