//! X3DH-like asynchronous key agreement, optionally hybrid with ML-KEM-768.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator fetches the responder device's bundle:
//!     IK_B  (identity, Ed25519 public → converted to X25519)
//!     SPK_B (signed prekey, X25519) + IK_B signature over
//!           SPK_B || KEM_B? || capabilities
//!     OPK_B (optional one-time prekey, X25519)
//!     KEM_B (optional ML-KEM-768 encapsulation key)
//!
//!   DH calculations (single ephemeral EK_A):
//!     DH1 = DH(IK_A_x25519, SPK_B)
//!     DH2 = DH(EK_A,         IK_B_x25519)
//!     DH3 = DH(EK_A,         SPK_B)
//!     DH4 = DH(EK_A,         OPK_B)     [optional]
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], info="dk-x3dh-v1")
//!   Hybrid: SK' = HKDF(SK || ML-KEM shared secret, info="dk-hybrid-v1")
//!
//! The bundle signature MUST be verified before any DH is computed.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{Algorithm, DeviceCapabilities, IdentityKeyPair},
    kdf,
    kem::{self, HybridSuite},
};

// ── Helpers ──────────────────────────────────────────────────────────────────

pub fn b64e(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(CryptoError::Base64Decode)
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion that ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key.
/// Uses the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    let montgomery = point.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

// ── Signed prekeys ───────────────────────────────────────────────────────────

/// Bytes covered by a signed-prekey signature.
pub fn signed_prekey_payload(
    spk_pub: &[u8],
    kem_pub: Option<&[u8]>,
    capabilities: &DeviceCapabilities,
) -> Vec<u8> {
    let kem = kem_pub.unwrap_or(&[]);
    let mut out = Vec::with_capacity(16 + spk_pub.len() + kem.len() + 64);
    out.extend_from_slice(b"dk-spk-v1\x00");
    out.extend_from_slice(spk_pub);
    out.extend_from_slice(&(kem.len() as u32).to_le_bytes());
    out.extend_from_slice(kem);
    out.extend_from_slice(&capabilities.canonical_bytes());
    out
}

/// Freshly generated signed prekey material.
pub struct SignedPrekeyMaterial {
    pub secret: StaticSecret,
    pub public: X25519Public,
    pub kem: Option<kem::KemKeyPair>,
    pub signature: Vec<u8>,
}

/// Generate a signed prekey: an X25519 keypair (plus an ML-KEM key when the
/// device advertises it) with the public halves signed by the identity key.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
    capabilities: &DeviceCapabilities,
) -> SignedPrekeyMaterial {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let kem = capabilities
        .supports(Algorithm::MlKem768)
        .then(kem::KemKeyPair::generate);
    let payload = signed_prekey_payload(
        public.as_bytes(),
        kem.as_ref().map(|k| k.public.as_slice()),
        capabilities,
    );
    let signature = identity.sign(&payload);
    SignedPrekeyMaterial { secret, public, kem, signature }
}

/// Generate a batch of one-time prekeys (X25519).
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// Published material for one device, consumed by session initiators.
/// Binary fields are base64url without padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub device_id: String,
    pub user_id: String,
    /// Ed25519 identity public key
    pub ik_pub: String,
    pub spk_id: String,
    /// X25519 signed prekey
    pub spk_pub: String,
    /// Ed25519 signature over `signed_prekey_payload`
    pub spk_sig: String,
    /// X25519 one-time prekey (consumed once)
    pub opk_pub: Option<String>,
    pub opk_id: Option<String>,
    /// ML-KEM-768 encapsulation key
    pub kem_pub: Option<String>,
    pub capabilities: DeviceCapabilities,
}

impl PrekeyBundle {
    /// Verify the signed prekey signature against the bundle's identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let ik = to_32(&b64d(&self.ik_pub)?)?;
        let spk = to_32(&b64d(&self.spk_pub)?)?;
        let sig = b64d(&self.spk_sig)?;
        let kem_pub = self.kem_pub.as_deref().map(b64d).transpose()?;

        if self.capabilities.supports(Algorithm::MlKem768) && kem_pub.is_none() {
            return Err(CryptoError::InvalidKey(
                "bundle advertises ML-KEM-768 without a KEM key".into(),
            ));
        }
        let payload = signed_prekey_payload(&spk, kem_pub.as_deref(), &self.capabilities);
        IdentityKeyPair::verify(&ik, &payload, &sig)
    }

    pub fn has_one_time_prekey(&self) -> bool {
        self.opk_pub.is_some()
    }
}

// ── Init message header ──────────────────────────────────────────────────────

/// Sent alongside the first ciphertexts so the responder can derive SK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3DHHeader {
    /// Initiator's Ed25519 identity public key
    pub ik_pub: String,
    /// Initiator's ephemeral X25519 public key
    pub ek_pub: String,
    /// Which signed prekey the initiator used
    pub spk_id: String,
    /// Which OPK was consumed (`None` if bundle had none)
    pub opk_id: Option<String>,
    /// ML-KEM ciphertext (hybrid suite only)
    pub kem_ciphertext: Option<String>,
    pub suite: HybridSuite,
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Result of the handshake: a shared secret plus the init header.
pub struct X3DHResult {
    /// 32-byte shared key → initial root key of the Double Ratchet
    pub shared_key: [u8; 32],
    pub header: X3DHHeader,
}

impl Drop for X3DHResult {
    fn drop(&mut self) {
        self.shared_key.zeroize();
    }
}

fn derive_sk(ikm: &mut Vec<u8>) -> Result<[u8; 32], CryptoError> {
    let mut sk = [0u8; 32];
    let res = kdf::hkdf_expand(ikm, Some(&[0u8; 32]), b"dk-x3dh-v1", &mut sk);
    ikm.zeroize();
    res.map(|()| sk)
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Initiate a session against `bundle` under the negotiated `suite`.
///
/// Steps:
///   1. Verify the bundle signature (covers SPK, KEM key, capabilities).
///   2. Convert IK_A secret → X25519; convert IK_B pub → X25519.
///   3. Generate ONE ephemeral X25519 keypair EK_A.
///   4. Compute DH1..DH4 and derive SK.
///   5. Hybrid: encapsulate to KEM_B and mix the KEM secret into SK.
pub fn initiate(
    my_ik: &IdentityKeyPair,
    bundle: &PrekeyBundle,
    suite: HybridSuite,
) -> Result<X3DHResult, CryptoError> {
    // ── 1. Verify ────────────────────────────────────────────────────────
    bundle.verify()?;
    let ik_b_ed = to_32(&b64d(&bundle.ik_pub)?)?;
    let spk_b = X25519Public::from(to_32(&b64d(&bundle.spk_pub)?)?);

    // ── 2. Convert identity keys to X25519 ───────────────────────────────
    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;

    // ── 3. Ephemeral key ─────────────────────────────────────────────────
    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    // ── 4. DH calculations ───────────────────────────────────────────────
    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id_out = None;
    if let Some(ref opk_b64) = bundle.opk_pub {
        let opk_b = X25519Public::from(to_32(&b64d(opk_b64)?)?);
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id_out = bundle.opk_id.clone();
    }

    let mut sk = derive_sk(&mut ikm)?;

    // ── 5. Hybrid ────────────────────────────────────────────────────────
    let mut kem_ciphertext = None;
    if suite.is_hybrid() {
        let kem_pub = bundle
            .kem_pub
            .as_deref()
            .ok_or_else(|| CryptoError::Kem("hybrid suite without bundle KEM key".into()))?;
        let (ct, mut kem_ss) = kem::encapsulate(&b64d(kem_pub)?)?;
        let mixed = kdf::hybrid_root_secret(&sk, &kem_ss);
        kem_ss.zeroize();
        sk.zeroize();
        sk = mixed?;
        kem_ciphertext = Some(b64e(&ct));
    }

    Ok(X3DHResult {
        shared_key: sk,
        header: X3DHHeader {
            ik_pub: b64e(&my_ik.public.0),
            ek_pub: b64e(ek_a_pub.as_bytes()),
            spk_id: bundle.spk_id.clone(),
            opk_id: opk_id_out,
            kem_ciphertext,
            suite,
        },
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Secrets the responder looks up for an incoming header.
pub struct ResponderKeys<'a> {
    pub identity: &'a IdentityKeyPair,
    pub spk_secret: &'a StaticSecret,
    pub opk_secret: Option<&'a StaticSecret>,
    pub kem_secret: Option<&'a [u8]>,
}

/// Reconstruct SK from an init header.
pub fn respond(keys: &ResponderKeys<'_>, header: &X3DHHeader) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(to_32(&b64d(&header.ek_pub)?)?);
    let sender_ik_ed = to_32(&b64d(&header.ik_pub)?)?;

    let sender_ik_x = ed25519_pub_to_x25519(&sender_ik_ed)?;
    let ik_b_x = ed25519_secret_to_x25519(keys.identity.secret_bytes());

    // Mirror the initiator's DH order exactly (DH is commutative).
    let dh1 = keys.spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = keys.spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    match (header.opk_id.is_some(), keys.opk_secret) {
        (true, Some(opk_sec)) => {
            let dh4 = opk_sec.diffie_hellman(&ek_a);
            ikm.extend_from_slice(dh4.as_bytes());
        }
        (false, None) => {}
        _ => {
            ikm.zeroize();
            return Err(CryptoError::InvalidKey("one-time prekey mismatch".into()));
        }
    }

    let mut sk = derive_sk(&mut ikm)?;

    if header.suite.is_hybrid() {
        let (Some(kem_secret), Some(ct_b64)) = (keys.kem_secret, header.kem_ciphertext.as_deref())
        else {
            sk.zeroize();
            return Err(CryptoError::Kem("hybrid header without KEM material".into()));
        };
        let mut kem_ss = kem::decapsulate(kem_secret, &b64d(ct_b64)?)?;
        let mixed = kdf::hybrid_root_secret(&sk, &kem_ss);
        kem_ss.zeroize();
        sk.zeroize();
        sk = mixed?;
    }

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(
        ik: &IdentityKeyPair,
        spk: &SignedPrekeyMaterial,
        caps: &DeviceCapabilities,
        opk: Option<&X25519Public>,
    ) -> PrekeyBundle {
        PrekeyBundle {
            device_id: "dev-b".into(),
            user_id: "bob".into(),
            ik_pub: b64e(&ik.public.0),
            spk_id: "spk-1".into(),
            spk_pub: b64e(spk.public.as_bytes()),
            spk_sig: b64e(&spk.signature),
            opk_pub: opk.map(|p| b64e(p.as_bytes())),
            opk_id: opk.map(|_| "opk-0".to_string()),
            kem_pub: spk.kem.as_ref().map(|k| b64e(&k.public)),
            capabilities: caps.clone(),
        }
    }

    #[test]
    fn x3dh_roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let caps = DeviceCapabilities::classical();
        let spk = generate_signed_prekey(&bob_ik, &caps);
        let bundle = bundle_for(&bob_ik, &spk, &caps, None);

        let result = initiate(&alice_ik, &bundle, HybridSuite::Classical).unwrap();
        let keys = ResponderKeys {
            identity: &bob_ik,
            spk_secret: &spk.secret,
            opk_secret: None,
            kem_secret: None,
        };
        let bob_sk = respond(&keys, &result.header).unwrap();
        assert_eq!(result.shared_key, bob_sk, "both sides must derive the same SK");
    }

    #[test]
    fn x3dh_roundtrip_with_opk_and_kem() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let caps = DeviceCapabilities::hybrid();
        let spk = generate_signed_prekey(&bob_ik, &caps);
        let opks = generate_one_time_prekeys(1);
        let (ref opk_secret, ref opk_pub) = opks[0];
        let bundle = bundle_for(&bob_ik, &spk, &caps, Some(opk_pub));

        let result = initiate(&alice_ik, &bundle, HybridSuite::HybridMlKem768).unwrap();
        assert!(result.header.kem_ciphertext.is_some());
        assert_eq!(result.header.opk_id.as_deref(), Some("opk-0"));

        let kem_secret = spk.kem.as_ref().map(|k| k.secret_bytes());
        let keys = ResponderKeys {
            identity: &bob_ik,
            spk_secret: &spk.secret,
            opk_secret: Some(opk_secret),
            kem_secret,
        };
        assert_eq!(result.shared_key, respond(&keys, &result.header).unwrap());
    }

    #[test]
    fn hybrid_header_requires_kem_secret() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let caps = DeviceCapabilities::hybrid();
        let spk = generate_signed_prekey(&bob_ik, &caps);
        let bundle = bundle_for(&bob_ik, &spk, &caps, None);

        let hybrid = initiate(&alice_ik, &bundle, HybridSuite::HybridMlKem768).unwrap();
        // Responder without the KEM secret cannot complete a hybrid header.
        let keys = ResponderKeys {
            identity: &bob_ik,
            spk_secret: &spk.secret,
            opk_secret: None,
            kem_secret: None,
        };
        assert!(respond(&keys, &hybrid.header).is_err());
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let evil_ik = IdentityKeyPair::generate();
        let caps = DeviceCapabilities::classical();

        let spk = generate_signed_prekey(&evil_ik, &caps);
        let bundle = bundle_for(&bob_ik, &spk, &caps, None);
        assert!(initiate(&alice_ik, &bundle, HybridSuite::Classical).is_err());
    }

    #[test]
    fn rejects_capability_downgrade() {
        let bob_ik = IdentityKeyPair::generate();
        let caps = DeviceCapabilities::hybrid();
        let spk = generate_signed_prekey(&bob_ik, &caps);
        let mut bundle = bundle_for(&bob_ik, &spk, &caps, None);

        // Strip ML-KEM from the advertised set in transit.
        bundle.capabilities = DeviceCapabilities::classical();
        bundle.kem_pub = None;
        assert!(matches!(bundle.verify(), Err(CryptoError::SignatureVerification)));
    }
}
