//! Message Cipher: seal and open pairwise messages over a ratchet session.
//!
//! Every message key is used once. The ratchet state is loaded, advanced on
//! a working copy and written back in the same transaction, and on `open`
//! only after the AEAD tag has verified. Any failure leaves the stored
//! session untouched.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use dk_crypto::aead::{self, SealedBox, NONCE_LEN, TAG_LEN};
use dk_crypto::hash;
use dk_crypto::kem::{self, HybridSuite};
use dk_crypto::ratchet::RatchetSession;
use dk_crypto::x3dh::{self, b64d, b64e, ResponderKeys, X3DHHeader};
use dk_proto::codec;
use dk_proto::envelope::ENVELOPE_VERSION;
use dk_proto::{DeviceId, SealedMessage};
use dk_store::models::{DeviceRow, IdentityKeyRow, SessionRow};

use crate::error::{KeyError, Result};
use crate::locks::session_key;
use crate::prekeys;
use crate::registry::{active_identity, capabilities_of, fetch_device, fetch_local_device, trust_of};
use crate::retry::retry_transient;
use crate::service::{columns, KeyService};
use crate::session::{
    counter, insert_session, live_session, missing_session, prune_superseded, session_by_handshake, suite_of,
    supersede_session, superseded_sessions, SUPERSEDED,
};
use crate::types::SessionState;

impl KeyService {
    /// Encrypt `plaintext` for `remote` on the live session from `local`.
    ///
    /// `associated_data` is authenticated but not encrypted; the receiver
    /// must pass the same bytes to [`KeyService::open`].
    pub async fn seal(
        &self,
        local: DeviceId,
        remote: DeviceId,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<SealedMessage> {
        let _locks = self.locks().acquire([session_key(local, remote)]).await;
        let svc = self;
        retry_transient(self.retries(), "seal", move || async move {
            let mut tx = svc.store().begin().await?;
            let sealed = svc.seal_in_tx(&mut *tx, local, remote, plaintext, associated_data).await?;
            tx.commit().await?;
            Ok(sealed)
        })
        .await
    }

    /// Decrypt a message addressed to `local`.
    ///
    /// A message carrying a handshake header for which no matching session
    /// exists sets up the responder session; it is kept only if the message
    /// authenticates.
    pub async fn open(&self, local: DeviceId, sealed: &SealedMessage, associated_data: &[u8]) -> Result<Vec<u8>> {
        if sealed.recipient_device != local {
            return Err(KeyError::AuthenticationFailed);
        }
        let _locks = self.locks().acquire([session_key(local, sealed.sender_device)]).await;
        let svc = self;
        let plaintext = retry_transient(self.retries(), "open", move || async move {
            let mut tx = svc.store().begin().await?;
            let plaintext = svc.open_in_tx(&mut *tx, local, sealed, associated_data).await?;
            tx.commit().await?;
            Ok(plaintext)
        })
        .await?;
        Ok(plaintext.to_vec())
    }

    /// Seal inside the caller's transaction. Caller holds the pair lock.
    pub(crate) async fn seal_in_tx(
        &self,
        conn: &mut SqliteConnection,
        local: DeviceId,
        remote: DeviceId,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<SealedMessage> {
        let Some(row) = live_session(conn, local, remote).await? else {
            return Err(missing_session(conn, local, remote).await?);
        };
        let suite = suite_of(&row)?;
        let mut ratchet: RatchetSession = self
            .store()
            .decrypt_json(columns::RATCHET_STATE, &row.ratchet_state_enc)
            .await?;
        let (header, message_key) = ratchet.advance_sending_chain()?;

        let handshake = row
            .pending_handshake
            .as_deref()
            .map(serde_json::from_str::<X3DHHeader>)
            .transpose()?;
        let sender_fingerprint = active_identity(conn, local).await?.fingerprint;

        let mut sealed = SealedMessage {
            version: ENVELOPE_VERSION,
            sender_device: local,
            recipient_device: remote,
            algorithm: suite.tag().to_string(),
            header,
            nonce: String::new(),
            ciphertext: String::new(),
            tag: String::new(),
            sender_fingerprint,
            handshake,
            sent_at: Utc::now(),
        };
        let padded = Zeroizing::new(codec::pad(plaintext, self.config().padding)?);
        let sealed_box = aead::seal_detached(&message_key, &padded, &sealed.associated_data(associated_data))?;
        sealed.nonce = b64e(&sealed_box.nonce);
        sealed.ciphertext = b64e(&sealed_box.ciphertext);
        sealed.tag = b64e(&sealed_box.tag);

        let state_enc = self.store().encrypt_json(columns::RATCHET_STATE, &ratchet).await?;
        let done = sqlx::query(
            "UPDATE sessions SET ratchet_state_enc = ?, send_counter = ?, state = 'active', updated_at = ? \
             WHERE id = ? AND state != 'invalidated'",
        )
        .bind(&state_enc)
        .bind(counter(ratchet.send_counter()))
        .bind(Utc::now())
        .bind(&row.id)
        .execute(&mut *conn)
        .await?;
        if done.rows_affected() == 0 {
            return Err(KeyError::SessionInvalidated { local, remote });
        }

        tracing::debug!(local = %local, remote = %remote, n = sealed.counter(), handshake = sealed.is_handshake(), "sealed");
        Ok(sealed)
    }

    /// Open inside the caller's transaction. Caller holds the pair lock.
    pub(crate) async fn open_in_tx(
        &self,
        conn: &mut SqliteConnection,
        local: DeviceId,
        sealed: &SealedMessage,
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let remote = sealed.sender_device;
        if sealed.recipient_device != local || sealed.version != ENVELOPE_VERSION {
            return Err(KeyError::AuthenticationFailed);
        }
        let suite = HybridSuite::from_tag(&sealed.algorithm).ok_or(KeyError::AuthenticationFailed)?;

        let local_row = fetch_local_device(conn, local).await?;
        let remote_row = fetch_device(conn, remote).await?;
        if trust_of(&remote_row)?.is_cut_off() {
            return Err(KeyError::SessionInvalidated { local, remote });
        }
        let remote_identity = active_identity(conn, remote).await?;
        if !hash::fingerprints_equal(&sealed.sender_fingerprint, &remote_identity.fingerprint) {
            tracing::error!(
                security_event = true,
                event = "identity_mismatch",
                local = %local,
                remote = %remote,
                expected = %remote_identity.fingerprint,
                presented = %sealed.sender_fingerprint,
                "sender fingerprint does not match the registry",
            );
            return Err(KeyError::IdentityMismatch { device: remote });
        }

        if let Some(handshake) = sealed.handshake.as_ref() {
            if let Some(row) = session_by_handshake(conn, local, remote, &handshake.ek_pub).await? {
                return self.open_existing(conn, row, suite, sealed, associated_data).await;
            }
            let peers = Peers { local: &local_row, remote: &remote_row, remote_identity: &remote_identity };
            return self.open_handshake(conn, peers, suite, handshake, sealed, associated_data).await;
        }

        let mut candidates = superseded_sessions(conn, local, remote).await?;
        if let Some(live) = live_session(conn, local, remote).await? {
            candidates.insert(0, live);
        }
        if candidates.is_empty() {
            return Err(missing_session(conn, local, remote).await?);
        }

        // Live session first. A rejection by one session says nothing about
        // the others; report a replay over a plain mismatch.
        let mut rejection: Option<KeyError> = None;
        for row in candidates {
            match self.open_existing(conn, row, suite, sealed, associated_data).await {
                Ok(plaintext) => return Ok(plaintext),
                Err(err) if is_session_rejection(&err) => {
                    let replay = matches!(err, KeyError::CounterRegression { .. });
                    if rejection.is_none() || replay {
                        rejection = Some(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(rejection.unwrap_or(KeyError::AuthenticationFailed))
    }

    async fn open_existing(
        &self,
        conn: &mut SqliteConnection,
        row: SessionRow,
        suite: HybridSuite,
        sealed: &SealedMessage,
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        if suite_of(&row)? != suite {
            return Err(KeyError::AuthenticationFailed);
        }
        let mut ratchet: RatchetSession = self
            .store()
            .decrypt_json(columns::RATCHET_STATE, &row.ratchet_state_enc)
            .await?;
        let message_key = ratchet.advance_receiving_chain(&sealed.header)?;
        let plaintext = open_payload(&message_key, sealed, associated_data)?;

        // Authenticated: commit. Any message from the peer means it has the
        // session, so the handshake header is no longer sent. A superseded
        // session the peer is still sending on becomes live again.
        let (local, remote) = (sealed.recipient_device, sealed.sender_device);
        let promoted = row.state == SUPERSEDED;
        if promoted {
            supersede_session(conn, local, remote).await?;
        }
        let state_enc = self.store().encrypt_json(columns::RATCHET_STATE, &ratchet).await?;
        let done = sqlx::query(
            "UPDATE sessions SET ratchet_state_enc = ?, send_counter = ?, recv_counter = ?, pending_handshake = NULL, \
             state = 'active', updated_at = ? WHERE id = ? AND state != 'invalidated'",
        )
        .bind(&state_enc)
        .bind(counter(ratchet.send_counter()))
        .bind(counter(ratchet.recv_counter()))
        .bind(Utc::now())
        .bind(&row.id)
        .execute(&mut *conn)
        .await?;
        if done.rows_affected() == 0 {
            return Err(KeyError::SessionInvalidated { local, remote });
        }
        if promoted {
            prune_superseded(conn, local, remote).await?;
            tracing::debug!(local = %local, remote = %remote, session = %row.id, "superseded session resumed");
        }
        Ok(plaintext)
    }

    async fn open_handshake(
        &self,
        conn: &mut SqliteConnection,
        peers: Peers<'_>,
        suite: HybridSuite,
        handshake: &X3DHHeader,
        sealed: &SealedMessage,
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (local, remote) = (sealed.recipient_device, sealed.sender_device);

        // The suite is fixed by both devices' signed capabilities; a header
        // or tag naming anything else is a downgrade attempt.
        let expected = kem::negotiate(&capabilities_of(peers.local)?, &capabilities_of(peers.remote)?);
        if handshake.suite != suite || suite != expected {
            tracing::warn!(security_event = true, local = %local, remote = %remote, offered = suite.tag(), expected = expected.tag(), "handshake suite rejected");
            return Err(KeyError::AuthenticationFailed);
        }
        if handshake.ik_pub != peers.remote_identity.public_key {
            tracing::error!(security_event = true, event = "identity_mismatch", local = %local, remote = %remote, "handshake identity does not match the registry");
            return Err(KeyError::IdentityMismatch { device: remote });
        }

        // A handshake that already produced a session (live or superseded)
        // is a replay.
        let seen: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE local_device_id = ? AND remote_device_id = ? AND handshake_ek = ?",
        )
        .bind(local.as_text())
        .bind(remote.as_text())
        .bind(&handshake.ek_pub)
        .fetch_one(&mut *conn)
        .await?;
        if seen > 0 {
            return Err(KeyError::CounterRegression { counter: sealed.counter() });
        }

        let spk = prekeys::signed_prekey_by_id(conn, local, &handshake.spk_id)
            .await?
            .ok_or(KeyError::AuthenticationFailed)?;
        if let Some(retired_at) = spk.retired_at {
            if retired_at + self.config().signed_prekey_grace() < Utc::now() {
                return Err(KeyError::AuthenticationFailed);
            }
        }
        let spk_secret = self
            .static_secret(columns::SIGNED_PREKEY_SECRET, spk.secret_enc.as_deref())
            .await?;

        let opk = match handshake.opk_id.as_deref() {
            Some(id) => {
                let row = prekeys::one_time_prekey_by_id(conn, local, id)
                    .await?
                    .ok_or(KeyError::AuthenticationFailed)?;
                Some((row.id, self.static_secret(columns::ONE_TIME_PREKEY_SECRET, row.secret_enc.as_deref()).await?))
            }
            None => None,
        };

        let kem_secret = if suite.is_hybrid() {
            let enc = spk.kem_secret_enc.as_deref().ok_or(KeyError::AuthenticationFailed)?;
            Some(self.store().decrypt_value(columns::SIGNED_PREKEY_KEM_SECRET, enc).await?)
        } else {
            None
        };

        let (_, identity) = self.local_identity(conn, local).await?;
        let keys = ResponderKeys {
            identity: &identity,
            spk_secret: &spk_secret,
            opk_secret: opk.as_ref().map(|(_, secret)| secret),
            kem_secret: kem_secret.as_ref().map(|k| k.as_slice()),
        };
        let shared = Zeroizing::new(x3dh::respond(&keys, handshake).map_err(|_| KeyError::AuthenticationFailed)?);

        let mut ratchet = RatchetSession::init_responder(&shared, &spk_secret, self.config().ratchet_limits());
        let message_key = ratchet.advance_receiving_chain(&sealed.header)?;
        let plaintext = open_payload(&message_key, sealed, associated_data)?;

        // Authenticated: this session becomes live, the previous one is kept
        // for messages already in flight.
        supersede_session(conn, local, remote).await?;
        let now = Utc::now();
        let row = SessionRow {
            id: Uuid::new_v4().to_string(),
            local_device_id: local.as_text(),
            remote_device_id: remote.as_text(),
            state: SessionState::Active.as_str().to_string(),
            suite: suite.tag().to_string(),
            remote_fingerprint: peers.remote_identity.fingerprint.clone(),
            ratchet_state_enc: self.store().encrypt_json(columns::RATCHET_STATE, &ratchet).await?,
            pending_handshake: None,
            handshake_ek: handshake.ek_pub.clone(),
            kem_public: if suite.is_hybrid() { spk.kem_public.clone() } else { None },
            kem_ciphertext: handshake.kem_ciphertext.clone(),
            send_counter: counter(ratchet.send_counter()),
            recv_counter: counter(ratchet.recv_counter()),
            created_at: now,
            updated_at: now,
            invalidated_at: None,
            invalidation_reason: None,
        };
        insert_session(conn, &row).await?;
        prune_superseded(conn, local, remote).await?;
        if let Some((id, _)) = &opk {
            prekeys::destroy_one_time_prekey_secret(conn, id).await?;
        }

        tracing::info!(
            event = "session_established",
            role = "responder",
            local = %local,
            remote = %remote,
            suite = suite.tag(),
            one_time_prekey = opk.is_some(),
        );
        Ok(plaintext)
    }

    async fn static_secret(&self, column: &str, enc: Option<&str>) -> Result<StaticSecret> {
        let enc = enc.ok_or(KeyError::AuthenticationFailed)?;
        let bytes = self.store().decrypt_value(column, enc).await?;
        let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyError::AuthenticationFailed)?;
        Ok(StaticSecret::from(array))
    }
}

struct Peers<'a> {
    local: &'a DeviceRow,
    remote: &'a DeviceRow,
    remote_identity: &'a IdentityKeyRow,
}

/// Errors meaning "not this session's message".
fn is_session_rejection(err: &KeyError) -> bool {
    matches!(
        err,
        KeyError::AuthenticationFailed | KeyError::CounterRegression { .. } | KeyError::ChainDesynchronized { .. }
    )
}

/// Decode and decrypt the payload. Every failure is `AuthenticationFailed`.
fn open_payload(key: &[u8; 32], sealed: &SealedMessage, associated_data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let nonce: [u8; NONCE_LEN] = decode_fixed(&sealed.nonce)?;
    let tag: [u8; TAG_LEN] = decode_fixed(&sealed.tag)?;
    let ciphertext = b64d(&sealed.ciphertext).map_err(|_| KeyError::AuthenticationFailed)?;
    let sealed_box = SealedBox { nonce, ciphertext, tag };
    let padded = aead::open_detached(key, &sealed_box, &sealed.associated_data(associated_data))?;
    let plaintext = codec::unpad(&padded).map_err(|_| KeyError::AuthenticationFailed)?;
    Ok(Zeroizing::new(plaintext))
}

fn decode_fixed<const N: usize>(b64: &str) -> Result<[u8; N]> {
    b64d(b64)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(KeyError::AuthenticationFailed)
}
