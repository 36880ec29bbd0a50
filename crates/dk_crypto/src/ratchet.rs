//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation:
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then dropped)
//!
//! Counters:
//!   `send_n` never repeats within a sending chain. On the receiving side a
//!   message whose counter is at or below the last accepted counter of its
//!   chain is a replay unless its key is still in the skipped-key cache.
//!
//! `advance_receiving_chain` mutates state before the caller has checked the
//! AEAD tag. Callers work on a clone and keep it only once the message
//! authenticates.

use std::collections::VecDeque;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::x3dh::{b64d, b64e};

/// Default bound on fast-forwarding a receiving chain in one step.
pub const DEFAULT_MAX_SKIP: u64 = 1000;

/// Default bound on cached skipped message keys per session.
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 1000;

/// Retired receiving chains remembered for replay detection.
const RETIRED_CHAINS: usize = 32;

pub type MessageKey = Zeroizing<[u8; 32]>;

// ── Ratchet header (included in every message, unencrypted) ──────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64)
    pub dh_pub: String,
    /// Message number in the current sending chain
    pub n: u64,
    /// Number of messages in the previous sending chain
    pub pn: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetLimits {
    pub max_skip: u64,
    pub max_skipped_keys: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: String,
    n: u64,
    mk: [u8; 32],
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet state for one side of a session.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    root_key: [u8; 32],

    // ── Sending chain ────────────────────────────────────────────────────
    dh_send_secret: [u8; 32],
    dh_send_pub: [u8; 32],
    send_ck: Option<[u8; 32]>,
    send_n: u64,
    prev_send_n: u64,

    // ── Receiving chain ──────────────────────────────────────────────────
    dh_recv_pub: Option<[u8; 32]>,
    recv_ck: Option<[u8; 32]>,
    recv_n: u64,

    // ── Out-of-order support ─────────────────────────────────────────────
    skipped: VecDeque<SkippedKey>,
    retired_recv_chains: VecDeque<String>,

    limits: RatchetLimits,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for sk in self.skipped.iter_mut() {
            sk.mk.zeroize();
        }
    }
}

// ── Construction ─────────────────────────────────────────────────────────────

impl RatchetSession {
    /// Create a session as the INITIATOR.
    ///
    /// The responder's signed prekey is the first "received" ratchet key; the
    /// initiator performs a DH ratchet immediately so it can send at once.
    pub fn init_initiator(
        shared_key: &[u8; 32],
        remote_spk_pub: &X25519Public,
        limits: RatchetLimits,
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret);

        let dh_output = dh_send_secret.diffie_hellman(remote_spk_pub);
        let (new_rk, new_ck) = kdf_rk(shared_key, dh_output.as_bytes())?;

        Ok(Self {
            root_key: new_rk,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub: dh_send_pub.to_bytes(),
            send_ck: Some(new_ck),
            send_n: 0,
            prev_send_n: 0,
            dh_recv_pub: Some(remote_spk_pub.to_bytes()),
            recv_ck: None,
            recv_n: 0,
            skipped: VecDeque::new(),
            retired_recv_chains: VecDeque::new(),
            limits,
        })
    }

    /// Create a session as the RESPONDER.
    ///
    /// The signed prekey secret is the initial ratchet key. No chain exists
    /// until the initiator's first message triggers the DH ratchet.
    pub fn init_responder(
        shared_key: &[u8; 32],
        my_spk_secret: &StaticSecret,
        limits: RatchetLimits,
    ) -> Self {
        let my_spk_pub = X25519Public::from(my_spk_secret);
        Self {
            root_key: *shared_key,
            dh_send_secret: my_spk_secret.to_bytes(),
            dh_send_pub: my_spk_pub.to_bytes(),
            send_ck: None,
            send_n: 0,
            prev_send_n: 0,
            dh_recv_pub: None,
            recv_ck: None,
            recv_n: 0,
            skipped: VecDeque::new(),
            retired_recv_chains: VecDeque::new(),
            limits,
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// One symmetric step of the sending chain.
    ///
    /// Returns the header to transmit and the one-time message key. The
    /// previous chain key is overwritten.
    pub fn advance_sending_chain(&mut self) -> Result<(RatchetHeader, MessageKey), CryptoError> {
        let ck = self
            .send_ck
            .as_ref()
            .ok_or_else(|| CryptoError::RatchetNotReady("no sending chain yet".into()))?;
        let (new_ck, mk) = kdf_ck(ck)?;
        self.send_ck = Some(new_ck);
        let header = RatchetHeader {
            dh_pub: b64e(&self.dh_send_pub),
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;
        Ok((header, mk))
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Derive the message key for a received header.
    ///
    /// Handles:
    ///   1. Cached skipped key (late, out-of-order message)
    ///   2. Replay on the current or a retired chain → `CounterRegression`
    ///   3. New DH ratchet when the peer's ratchet key changed
    ///   4. Fast-forward up to `max_skip` → else `ChainDesynchronized`
    pub fn advance_receiving_chain(&mut self, header: &RatchetHeader) -> Result<MessageKey, CryptoError> {
        let peer_dh_bytes: [u8; 32] = b64d(&header.dh_pub)?
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad ratchet DH pub".into()))?;

        // 1. Skipped keys
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.dh_pub == header.dh_pub && k.n == header.n)
        {
            if let Some(mut entry) = self.skipped.remove(pos) {
                let mk = Zeroizing::new(entry.mk);
                entry.mk.zeroize();
                return Ok(mk);
            }
        }

        let on_current_chain = self.dh_recv_pub == Some(peer_dh_bytes) && self.recv_ck.is_some();

        // 2. Replays
        if on_current_chain && header.n < self.recv_n {
            return Err(CryptoError::CounterRegression {
                chain: header.dh_pub.clone(),
                counter: header.n,
            });
        }
        if self.retired_recv_chains.iter().any(|c| *c == header.dh_pub) {
            return Err(CryptoError::CounterRegression {
                chain: header.dh_pub.clone(),
                counter: header.n,
            });
        }

        // 3. DH ratchet
        if !on_current_chain {
            if self.recv_ck.is_some() {
                self.skip_message_keys(header.pn)?;
            }
            if let Some(old) = self.dh_recv_pub {
                self.retired_recv_chains.push_back(b64e(&old));
                while self.retired_recv_chains.len() > RETIRED_CHAINS {
                    self.retired_recv_chains.pop_front();
                }
            }
            self.dh_ratchet(&X25519Public::from(peer_dh_bytes))?;
        }

        // 4. Fast-forward within the chain
        self.skip_message_keys(header.n)?;

        let ck = self
            .recv_ck
            .as_ref()
            .ok_or_else(|| CryptoError::RatchetNotReady("no receiving chain".into()))?;
        let (new_ck, mk) = kdf_ck(ck)?;
        self.recv_ck = Some(new_ck);
        self.recv_n += 1;
        Ok(mk)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn dh_ratchet(&mut self, peer_dh: &X25519Public) -> Result<(), CryptoError> {
        self.dh_recv_pub = Some(peer_dh.to_bytes());

        let dh_recv_output = StaticSecret::from(self.dh_send_secret).diffie_hellman(peer_dh);
        let (new_rk, new_recv_ck) = kdf_rk(&self.root_key, dh_recv_output.as_bytes())?;
        self.root_key = new_rk;
        self.recv_ck = Some(new_recv_ck);
        self.recv_n = 0;

        self.prev_send_n = self.send_n;
        self.send_n = 0;
        let new_dh = StaticSecret::random_from_rng(OsRng);
        self.dh_send_pub = X25519Public::from(&new_dh).to_bytes();
        let dh_send_output = new_dh.diffie_hellman(peer_dh);
        let (new_rk2, new_send_ck) = kdf_rk(&self.root_key, dh_send_output.as_bytes())?;
        self.root_key = new_rk2;
        self.send_ck = Some(new_send_ck);
        self.dh_send_secret = new_dh.to_bytes();
        Ok(())
    }

    /// Cache message keys from `recv_n` up to (not including) `until`.
    fn skip_message_keys(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let skip = until - self.recv_n;
        if skip > self.limits.max_skip {
            return Err(CryptoError::ChainDesynchronized {
                skip,
                limit: self.limits.max_skip,
            });
        }
        let Some(mut ck) = self.recv_ck else {
            return Ok(());
        };
        let dh_pub = self.dh_recv_pub.map(|k| b64e(&k)).unwrap_or_default();

        while self.recv_n < until {
            let (new_ck, mk) = kdf_ck(&ck)?;
            ck = new_ck;
            self.skipped.push_back(SkippedKey {
                dh_pub: dh_pub.clone(),
                n: self.recv_n,
                mk: *mk,
            });
            self.recv_n += 1;
        }
        self.recv_ck = Some(ck);
        ck.zeroize();

        while self.skipped.len() > self.limits.max_skipped_keys {
            if let Some(mut evicted) = self.skipped.pop_front() {
                evicted.mk.zeroize();
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn our_ratchet_pub(&self) -> String {
        b64e(&self.dh_send_pub)
    }

    pub fn send_counter(&self) -> u64 {
        self.send_n
    }

    pub fn recv_counter(&self) -> u64 {
        self.recv_n
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    pub fn can_send(&self) -> bool {
        self.send_ck.is_some()
    }
}

// ── KDF helpers (per Signal spec) ────────────────────────────────────────────

/// KDF_RK: root key derivation from DH output.
/// Returns (new_root_key, new_chain_key).
fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"dk-ratchet-rk", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"dk-ratchet-ck", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// KDF_CK: chain key → (next_chain_key, message_key), HMAC-SHA256.
fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], MessageKey), CryptoError> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]);
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, Zeroizing::new(mk)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(limits: RatchetLimits) -> (RatchetSession, RatchetSession) {
        let shared_key = [42u8; 32];
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);
        let alice = RatchetSession::init_initiator(&shared_key, &bob_spk_pub, limits).unwrap();
        let bob = RatchetSession::init_responder(&shared_key, &bob_spk, limits);
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = pair(RatchetLimits::default());

        for i in 0..3 {
            let (header, mk_alice) = alice.advance_sending_chain().unwrap();
            let mk_bob = bob.advance_receiving_chain(&header).unwrap();
            assert_eq!(*mk_alice, *mk_bob, "message {i}: keys must match");
        }

        // Bob replies (DH ratchet on Alice's side)
        for i in 0..2 {
            let (header, mk_bob) = bob.advance_sending_chain().unwrap();
            let mk_alice = alice.advance_receiving_chain(&header).unwrap();
            assert_eq!(*mk_bob, *mk_alice, "reply {i}: keys must match");
        }

        let (header, mk_a) = alice.advance_sending_chain().unwrap();
        let mk_b = bob.advance_receiving_chain(&header).unwrap();
        assert_eq!(*mk_a, *mk_b);
    }

    #[test]
    fn responder_cannot_send_first() {
        let (_alice, mut bob) = pair(RatchetLimits::default());
        assert!(!bob.can_send());
        assert!(matches!(
            bob.advance_sending_chain(),
            Err(CryptoError::RatchetNotReady(_))
        ));
    }

    #[test]
    fn out_of_order_messages_open_once() {
        let (mut alice, mut bob) = pair(RatchetLimits::default());

        let (h0, mk0) = alice.advance_sending_chain().unwrap();
        let (h1, mk1) = alice.advance_sending_chain().unwrap();
        let (h2, mk2) = alice.advance_sending_chain().unwrap();

        assert_eq!(*mk2, *bob.advance_receiving_chain(&h2).unwrap());
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(*mk0, *bob.advance_receiving_chain(&h0).unwrap());
        assert_eq!(*mk1, *bob.advance_receiving_chain(&h1).unwrap());
        assert_eq!(bob.skipped_len(), 0);

        assert!(matches!(
            bob.advance_receiving_chain(&h1),
            Err(CryptoError::CounterRegression { counter: 1, .. })
        ));
    }

    #[test]
    fn replay_on_retired_chain_is_regression() {
        let (mut alice, mut bob) = pair(RatchetLimits::default());
        let (h0, _) = alice.advance_sending_chain().unwrap();
        bob.advance_receiving_chain(&h0).unwrap();

        let (reply, _) = bob.advance_sending_chain().unwrap();
        alice.advance_receiving_chain(&reply).unwrap();
        let (h_new, _) = alice.advance_sending_chain().unwrap();
        bob.advance_receiving_chain(&h_new).unwrap();

        assert!(matches!(
            bob.advance_receiving_chain(&h0),
            Err(CryptoError::CounterRegression { .. })
        ));
    }

    #[test]
    fn skip_beyond_limit_desynchronises() {
        let limits = RatchetLimits { max_skip: 5, max_skipped_keys: 10 };
        let (mut alice, mut bob) = pair(limits);
        let mut last = None;
        for _ in 0..7 {
            last = Some(alice.advance_sending_chain().unwrap().0);
        }
        let header = last.unwrap();
        assert!(matches!(
            bob.advance_receiving_chain(&header),
            Err(CryptoError::ChainDesynchronized { skip: 6, limit: 5 })
        ));
    }

    #[test]
    fn skipped_cache_is_bounded() {
        let limits = RatchetLimits { max_skip: 50, max_skipped_keys: 4 };
        let (mut alice, mut bob) = pair(limits);
        let headers: Vec<_> = (0..10).map(|_| alice.advance_sending_chain().unwrap().0).collect();

        bob.advance_receiving_chain(&headers[9]).unwrap();
        assert_eq!(bob.skipped_len(), 4);
        // Oldest keys were evicted; the newest cached ones still open.
        assert!(bob.advance_receiving_chain(&headers[8]).is_ok());
        assert!(bob.advance_receiving_chain(&headers[0]).is_err());
    }

    #[test]
    fn state_survives_serialisation() {
        let (mut alice, mut bob) = pair(RatchetLimits::default());
        let (h0, mk0) = alice.advance_sending_chain().unwrap();
        let json = serde_json::to_vec(&bob).unwrap();
        let mut restored: RatchetSession = serde_json::from_slice(&json).unwrap();
        assert_eq!(*mk0, *restored.advance_receiving_chain(&h0).unwrap());
    }
}
