//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Two shapes are offered:
//!   - combined wire format `[ nonce (24) | ciphertext + tag ]` for columns
//!     encrypted at rest and conversation-key payloads;
//!   - detached `SealedBox` for ratchet messages, whose envelope carries the
//!     tag as its own field.

use chacha20poly1305::{
    aead::{Aead, AeadCore, AeadInPlace, KeyInit, OsRng as AeadOsRng},
    Tag, XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Ciphertext with its nonce and tag kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypt with a detached tag.
pub fn seal_detached(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut nonce_out = [0u8; NONCE_LEN];
    nonce_out.copy_from_slice(&nonce);
    let mut tag_out = [0u8; TAG_LEN];
    tag_out.copy_from_slice(&tag);
    Ok(SealedBox { nonce: nonce_out, ciphertext: buffer, tag: tag_out })
}

/// Decrypt a detached-tag box. Every failure maps to `AeadDecrypt`.
pub fn open_detached(
    key: &[u8; 32],
    sealed: &SealedBox,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadDecrypt)?;
    let nonce = XNonce::from_slice(&sealed.nonce);
    let tag = Tag::from_slice(&sealed.tag);

    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(nonce, aad, buffer.as_mut_slice(), tag)
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(buffer)
}
