//! Hybrid encapsulation: ML-KEM-768 alongside the classical X3DH exchange.
//!
//! The suite is negotiated once per session from both devices' advertised
//! capabilities. When hybrid, the initiator encapsulates to the responder's
//! KEM public key (published in the prekey bundle, covered by the signed
//! prekey signature) and both secrets feed `kdf::hybrid_root_secret`.

use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::identity::{Algorithm, DeviceCapabilities};

type EK = <MlKem768 as KemCore>::EncapsulationKey;
type DK = <MlKem768 as KemCore>::DecapsulationKey;

pub const KEM_PUBLIC_KEY_LEN: usize = 1184;
pub const KEM_SECRET_KEY_LEN: usize = 2400;
pub const KEM_CIPHERTEXT_LEN: usize = 1088;
pub const KEM_SHARED_SECRET_LEN: usize = 32;

// ── Suite negotiation ────────────────────────────────────────────────────────

/// Algorithm suite recorded immutably on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridSuite {
    /// X25519 X3DH + Double Ratchet + XChaCha20-Poly1305.
    Classical,
    /// As `Classical`, with an ML-KEM-768 secret mixed into the root key.
    HybridMlKem768,
}

impl HybridSuite {
    /// Wire tag carried in every sealed message.
    pub fn tag(&self) -> &'static str {
        match self {
            HybridSuite::Classical => "dk1/x25519/xchacha20poly1305",
            HybridSuite::HybridMlKem768 => "dk1/x25519+mlkem768/xchacha20poly1305",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dk1/x25519/xchacha20poly1305" => Some(HybridSuite::Classical),
            "dk1/x25519+mlkem768/xchacha20poly1305" => Some(HybridSuite::HybridMlKem768),
            _ => None,
        }
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, HybridSuite::HybridMlKem768)
    }
}

/// Pick the strongest suite both sides support.
pub fn negotiate(local: &DeviceCapabilities, remote: &DeviceCapabilities) -> HybridSuite {
    if local.supports(Algorithm::MlKem768) && remote.supports(Algorithm::MlKem768) {
        HybridSuite::HybridMlKem768
    } else {
        HybridSuite::Classical
    }
}

// ── ML-KEM-768 ───────────────────────────────────────────────────────────────

/// A decapsulation key and its public encapsulation key.
pub struct KemKeyPair {
    pub public: Vec<u8>,
    secret: Zeroizing<Vec<u8>>,
}

impl KemKeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let (dk, ek) = MlKem768::generate(&mut rng);
        Self {
            public: ek.as_bytes().as_slice().to_vec(),
            secret: Zeroizing::new(dk.as_bytes().as_slice().to_vec()),
        }
    }

    pub fn from_parts(public: Vec<u8>, secret: Vec<u8>) -> Result<Self, CryptoError> {
        if public.len() != KEM_PUBLIC_KEY_LEN || secret.len() != KEM_SECRET_KEY_LEN {
            return Err(CryptoError::Kem("invalid ML-KEM key length".into()));
        }
        Ok(Self { public, secret: Zeroizing::new(secret) })
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

/// Encapsulate to `public_key`. Returns (ciphertext, shared secret).
pub fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    use ml_kem::kem::Encapsulate;

    if public_key.len() != KEM_PUBLIC_KEY_LEN {
        return Err(CryptoError::Kem("invalid encapsulation key length".into()));
    }
    let ek_array: ml_kem::Encoded<EK> = public_key
        .try_into()
        .map_err(|_| CryptoError::Kem("invalid encapsulation key".into()))?;
    let ek = EK::from_bytes(&ek_array);

    let mut rng = rand::rngs::OsRng;
    let (ct, ss) = ek
        .encapsulate(&mut rng)
        .map_err(|_| CryptoError::Kem("encapsulation failed".into()))?;

    let mut shared = [0u8; KEM_SHARED_SECRET_LEN];
    shared.copy_from_slice(ss.as_slice());
    Ok((ct.as_slice().to_vec(), shared))
}

/// Recover the shared secret from a ciphertext.
pub fn decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> Result<[u8; 32], CryptoError> {
    use ml_kem::kem::Decapsulate;

    if secret_key.len() != KEM_SECRET_KEY_LEN || ciphertext.len() != KEM_CIPHERTEXT_LEN {
        return Err(CryptoError::Kem("invalid decapsulation input length".into()));
    }
    let mut dk_array: ml_kem::Encoded<DK> = secret_key
        .try_into()
        .map_err(|_| CryptoError::Kem("invalid decapsulation key".into()))?;
    let dk = DK::from_bytes(&dk_array);
    dk_array.as_mut_slice().zeroize();

    let ct: ml_kem::Ciphertext<MlKem768> = ciphertext
        .try_into()
        .map_err(|_| CryptoError::Kem("invalid ciphertext".into()))?;

    let ss = dk
        .decapsulate(&ct)
        .map_err(|_| CryptoError::Kem("decapsulation failed".into()))?;
    let mut shared = [0u8; KEM_SHARED_SECRET_LEN];
    shared.copy_from_slice(ss.as_slice());
    Ok(shared)
}
