//! Identity key management
//!
//! Each *device* has one active long-term `IdentityKeyPair` (Ed25519).
//! Identity keys sign the device's signed prekeys; the signature also covers
//! the advertised `DeviceCapabilities`, so the algorithm set a peer
//! negotiates against cannot be altered in transit.
//!
//! Key-change policy
//! -----------------
//! If the stored identity of a device changes without an explicit rotation,
//! sessions with that device fail with an identity mismatch and are never
//! silently re-established. Enforcement lives in `dk_core`.
//!
//! Prekeys
//! -------
//! - Signed Prekey (SPK): X25519, rotated periodically (weekly default),
//!   public half signed by the identity Ed25519 key.
//! - One-Time Prekeys (OPK): X25519, consumed once per session init.

use std::collections::BTreeSet;
use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::{error::CryptoError, hash};

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        VerifyingKey::from_bytes(&to_array(bytes)?)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes.to_vec()))
    }

    /// Stored fingerprint (hex BLAKE3 of the key).
    pub fn fingerprint(&self) -> String {
        hash::fingerprint(&self.0)
    }

    /// Human-readable fingerprint: first 20 bytes, hex in groups of 4.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn display_fingerprint(&self) -> String {
        let fp = self.fingerprint();
        fp[..40]
            .chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn as_array(&self) -> Result<[u8; 32], CryptoError> {
        to_array(&self.0)
    }
}

fn to_array(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        let secret_bytes = signing_key.to_bytes();
        Self { public, secret_bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Identity key must be 32 bytes, got {}", bytes.len()
            )));
        }
        let arr = to_array(bytes)?;
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Sign arbitrary bytes; returns 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// Algorithms a device can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "x25519")]
    X25519,
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "xchacha20poly1305")]
    XChaCha20Poly1305,
    #[serde(rename = "ml-kem-768")]
    MlKem768,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::X25519 => "x25519",
            Algorithm::Ed25519 => "ed25519",
            Algorithm::XChaCha20Poly1305 => "xchacha20poly1305",
            Algorithm::MlKem768 => "ml-kem-768",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability set a device advertises at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub algorithms: BTreeSet<Algorithm>,
}

impl DeviceCapabilities {
    /// Classical-only device.
    pub fn classical() -> Self {
        Self {
            algorithms: [Algorithm::X25519, Algorithm::Ed25519, Algorithm::XChaCha20Poly1305]
                .into_iter()
                .collect(),
        }
    }

    /// Device that also supports ML-KEM-768 hybrid handshakes.
    pub fn hybrid() -> Self {
        let mut caps = Self::classical();
        caps.algorithms.insert(Algorithm::MlKem768);
        caps
    }

    pub fn supports(&self, alg: Algorithm) -> bool {
        self.algorithms.contains(&alg)
    }

    /// Deterministic bytes for signing: algorithm names in sorted order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.algorithms
            .iter()
            .map(Algorithm::as_str)
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes()
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self::classical()
    }
}
