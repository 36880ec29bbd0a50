//! Session Manager: one forward-secure ratchet session per (local, remote)
//! device pair.
//!
//! `Uninitiated -> Pending -> Established -> Active -> Invalidated`.
//! A pending handshake exists only in memory ([`PendingSession`]); the
//! session row is written when the handshake completes. The initiator's
//! handshake header is stored with the row and attached to every outgoing
//! message until the peer has answered.
//!
//! A pair has at most one live session, the one `seal` uses. A newer
//! handshake from either side moves the live session to `superseded`
//! instead of wiping it: when both devices initiate at once, each ends up
//! live on the session the other one abandoned. Superseded sessions stay
//! usable for receiving, and a message that authenticates on one makes it
//! live again, so the pair settles on whichever session the peer is sending
//! on. At most [`MAX_SUPERSEDED_SESSIONS`] are kept per pair.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;
use x25519_dalek::PublicKey as X25519Public;

use dk_crypto::hash;
use dk_crypto::identity::PublicKeyBytes;
use dk_crypto::kem::{self, HybridSuite};
use dk_crypto::ratchet::RatchetSession;
use dk_crypto::x3dh::{self, b64d, PrekeyBundle};
use dk_crypto::CryptoError;
use dk_proto::{DeviceId, FirstMessageSecrecy, IssuedBundle};
use dk_store::models::SessionRow;
use dk_store::StoreError;

use crate::error::{KeyError, Result};
use crate::locks::session_key;
use crate::registry::{active_identity, capabilities_of, fetch_device, fetch_local_device, parse_device_id, trust_of};
use crate::retry::retry_transient;
use crate::service::{columns, KeyEvent, KeyService};
use crate::types::{SessionInfo, SessionState};

/// A bundle fetched for a handshake that has not been performed yet.
/// Dropping it persists nothing; the claimed one-time prekey stays consumed.
pub struct PendingSession<'a> {
    service: &'a KeyService,
    local: DeviceId,
    remote: DeviceId,
    issued: IssuedBundle,
}

impl<'a> PendingSession<'a> {
    pub fn local(&self) -> DeviceId {
        self.local
    }

    pub fn remote(&self) -> DeviceId {
        self.remote
    }

    pub fn bundle(&self) -> &PrekeyBundle {
        &self.issued.bundle
    }

    pub fn first_message_secrecy(&self) -> FirstMessageSecrecy {
        self.issued.first_message_secrecy
    }

    pub fn state(&self) -> SessionState {
        SessionState::Pending
    }

    /// Run the handshake and persist the session as `Established`.
    pub async fn complete(self) -> Result<SessionInfo> {
        self.service.initiate_session(self.local, &self.issued.bundle).await
    }
}

// ── Row helpers ──────────────────────────────────────────────────────────────

pub const MAX_SUPERSEDED_SESSIONS: i64 = 5;

pub(crate) const SUPERSEDED: &str = "superseded";

pub(crate) async fn live_session(
    conn: &mut SqliteConnection,
    local: DeviceId,
    remote: DeviceId,
) -> Result<Option<SessionRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM sessions WHERE local_device_id = ? AND remote_device_id = ? AND state IN ('established', 'active')",
    )
    .bind(local.as_text())
    .bind(remote.as_text())
    .fetch_optional(&mut *conn)
    .await?)
}

/// Retained sessions of the pair, most recently used first.
pub(crate) async fn superseded_sessions(
    conn: &mut SqliteConnection,
    local: DeviceId,
    remote: DeviceId,
) -> Result<Vec<SessionRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM sessions WHERE local_device_id = ? AND remote_device_id = ? AND state = 'superseded' \
         ORDER BY updated_at DESC",
    )
    .bind(local.as_text())
    .bind(remote.as_text())
    .fetch_all(&mut *conn)
    .await?)
}

/// The live or superseded session created by the handshake with ephemeral
/// key `ek`.
pub(crate) async fn session_by_handshake(
    conn: &mut SqliteConnection,
    local: DeviceId,
    remote: DeviceId,
    ek: &str,
) -> Result<Option<SessionRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM sessions WHERE local_device_id = ? AND remote_device_id = ? AND handshake_ek = ? \
         AND state != 'invalidated'",
    )
    .bind(local.as_text())
    .bind(remote.as_text())
    .bind(ek)
    .fetch_optional(&mut *conn)
    .await?)
}

/// The error for a pair without a live session.
pub(crate) async fn missing_session(conn: &mut SqliteConnection, local: DeviceId, remote: DeviceId) -> Result<KeyError> {
    let invalidated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sessions WHERE local_device_id = ? AND remote_device_id = ? AND state = 'invalidated'",
    )
    .bind(local.as_text())
    .bind(remote.as_text())
    .fetch_one(&mut *conn)
    .await?;
    Ok(if invalidated > 0 {
        KeyError::SessionInvalidated { local, remote }
    } else {
        KeyError::SessionNotFound { local, remote }
    })
}

pub(crate) async fn insert_session(conn: &mut SqliteConnection, row: &SessionRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (id, local_device_id, remote_device_id, state, suite, remote_fingerprint, ratchet_state_enc, \
         pending_handshake, handshake_ek, kem_public, kem_ciphertext, send_counter, recv_counter, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&row.local_device_id)
    .bind(&row.remote_device_id)
    .bind(&row.state)
    .bind(&row.suite)
    .bind(&row.remote_fingerprint)
    .bind(&row.ratchet_state_enc)
    .bind(&row.pending_handshake)
    .bind(&row.handshake_ek)
    .bind(&row.kem_public)
    .bind(&row.kem_ciphertext)
    .bind(row.send_counter)
    .bind(row.recv_counter)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move the live session of one pair, if any, to `superseded`. Its ratchet
/// state is kept so messages already sent on it still open.
pub(crate) async fn supersede_session(conn: &mut SqliteConnection, local: DeviceId, remote: DeviceId) -> Result<u64> {
    let done = sqlx::query(
        "UPDATE sessions SET state = 'superseded', pending_handshake = NULL, updated_at = ? \
         WHERE local_device_id = ? AND remote_device_id = ? AND state IN ('established', 'active')",
    )
    .bind(Utc::now())
    .bind(local.as_text())
    .bind(remote.as_text())
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

/// Invalidate superseded sessions of the pair beyond the newest
/// [`MAX_SUPERSEDED_SESSIONS`]. Key material is wiped.
pub(crate) async fn prune_superseded(conn: &mut SqliteConnection, local: DeviceId, remote: DeviceId) -> Result<u64> {
    let now = Utc::now();
    let done = sqlx::query(
        "UPDATE sessions SET state = 'invalidated', ratchet_state_enc = '', pending_handshake = NULL, \
         invalidated_at = ?, invalidation_reason = 'superseded session limit', updated_at = ? \
         WHERE id IN (SELECT id FROM sessions WHERE local_device_id = ? AND remote_device_id = ? \
         AND state = 'superseded' ORDER BY updated_at DESC LIMIT -1 OFFSET ?)",
    )
    .bind(now)
    .bind(now)
    .bind(local.as_text())
    .bind(remote.as_text())
    .bind(MAX_SUPERSEDED_SESSIONS)
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

/// Invalidate every session in which `device` is either side and wipe its
/// key material. Returns how many live sessions were invalidated.
pub(crate) async fn invalidate_sessions_in_tx(conn: &mut SqliteConnection, device: DeviceId, reason: &str) -> Result<u64> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE sessions SET state = 'invalidated', ratchet_state_enc = '', pending_handshake = NULL, \
         invalidated_at = ?, invalidation_reason = ?, updated_at = ? \
         WHERE (local_device_id = ? OR remote_device_id = ?) AND state = 'superseded'",
    )
    .bind(now)
    .bind(reason)
    .bind(now)
    .bind(device.as_text())
    .bind(device.as_text())
    .execute(&mut *conn)
    .await?;
    let done = sqlx::query(
        "UPDATE sessions SET state = 'invalidated', ratchet_state_enc = '', pending_handshake = NULL, \
         invalidated_at = ?, invalidation_reason = ?, updated_at = ? \
         WHERE (local_device_id = ? OR remote_device_id = ?) AND state IN ('established', 'active')",
    )
    .bind(now)
    .bind(reason)
    .bind(now)
    .bind(device.as_text())
    .bind(device.as_text())
    .execute(&mut *conn)
    .await?;
    Ok(done.rows_affected())
}

pub(crate) fn suite_of(row: &SessionRow) -> Result<HybridSuite> {
    HybridSuite::from_tag(&row.suite)
        .ok_or_else(|| KeyError::Store(StoreError::Corrupt(format!("unknown suite {:?}", row.suite))))
}

pub(crate) fn session_info(row: &SessionRow) -> Result<SessionInfo> {
    Ok(SessionInfo {
        id: row.id.clone(),
        local_device: parse_device_id(&row.local_device_id)?,
        remote_device: parse_device_id(&row.remote_device_id)?,
        state: row.state.parse()?,
        suite: suite_of(row)?,
        remote_fingerprint: row.remote_fingerprint.clone(),
        send_counter: row.send_counter.max(0) as u64,
        recv_counter: row.recv_counter.max(0) as u64,
        awaiting_reply: row.pending_handshake.is_some(),
        has_kem_material: row.kem_ciphertext.is_some(),
        created_at: row.created_at,
    })
}

pub(crate) fn counter(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ── Operations ───────────────────────────────────────────────────────────────

impl KeyService {
    /// Fetch a bundle for `remote` (claiming a one-time prekey) without
    /// running the handshake yet.
    pub async fn begin_session(&self, local: DeviceId, remote: DeviceId) -> Result<PendingSession<'_>> {
        {
            let mut conn = self.store().pool.acquire().await?;
            fetch_local_device(&mut *conn, local).await?;
        }
        let issued = self.issue_bundle(remote).await?;
        Ok(PendingSession { service: self, local, remote, issued })
    }

    /// Run the initiator side of the handshake against `bundle` and persist
    /// the session. A previous live session for the pair is superseded.
    pub async fn initiate_session(&self, local: DeviceId, bundle: &PrekeyBundle) -> Result<SessionInfo> {
        let remote = bundle_device(bundle)?;
        let _locks = self.locks().acquire([session_key(local, remote)]).await;
        self.establish_session(local, bundle).await
    }

    /// `initiate_session` for a caller already holding the pair's lock.
    pub(crate) async fn establish_session(&self, local: DeviceId, bundle: &PrekeyBundle) -> Result<SessionInfo> {
        let remote = bundle_device(bundle)?;
        bundle.verify()?;

        let svc = self;
        let info = retry_transient(self.retries(), "initiate_session", move || async move {
            let mut tx = svc.store().begin().await?;
            let info = svc.initiate_in_tx(&mut *tx, local, remote, bundle).await?;
            tx.commit().await?;
            Ok(info)
        })
        .await?;

        tracing::info!(
            event = "session_established",
            role = "initiator",
            local = %local,
            remote = %remote,
            suite = info.suite.tag(),
            one_time_prekey = bundle.has_one_time_prekey(),
        );
        Ok(info)
    }

    async fn initiate_in_tx(
        &self,
        conn: &mut SqliteConnection,
        local: DeviceId,
        remote: DeviceId,
        bundle: &PrekeyBundle,
    ) -> Result<SessionInfo> {
        let local_row = fetch_local_device(conn, local).await?;
        if trust_of(&local_row)?.is_cut_off() {
            return Err(KeyError::RecipientUnavailable(local));
        }
        let remote_row = fetch_device(conn, remote).await?;
        if trust_of(&remote_row)?.is_cut_off() {
            return Err(KeyError::RecipientUnavailable(remote));
        }

        let remote_identity = active_identity(conn, remote).await?;
        let bundle_fingerprint = PublicKeyBytes::from_b64(&bundle.ik_pub)?.fingerprint();
        if !hash::fingerprints_equal(&bundle_fingerprint, &remote_identity.fingerprint) {
            tracing::error!(
                security_event = true,
                event = "identity_mismatch",
                local = %local,
                remote = %remote,
                expected = %remote_identity.fingerprint,
                presented = %bundle_fingerprint,
                "bundle identity does not match the registry",
            );
            return Err(KeyError::IdentityMismatch { device: remote });
        }

        let (_, identity) = self.local_identity(conn, local).await?;
        let suite = kem::negotiate(&capabilities_of(&local_row)?, &bundle.capabilities);
        let handshake = x3dh::initiate(&identity, bundle, suite)?;

        let spk_bytes: [u8; 32] = b64d(&bundle.spk_pub)?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signed prekey must be 32 bytes".into()))?;
        let ratchet =
            RatchetSession::init_initiator(&handshake.shared_key, &X25519Public::from(spk_bytes), self.config().ratchet_limits())?;

        supersede_session(conn, local, remote).await?;

        let now = Utc::now();
        let row = SessionRow {
            id: Uuid::new_v4().to_string(),
            local_device_id: local.as_text(),
            remote_device_id: remote.as_text(),
            state: SessionState::Established.as_str().to_string(),
            suite: suite.tag().to_string(),
            remote_fingerprint: remote_identity.fingerprint,
            ratchet_state_enc: self.store().encrypt_json(columns::RATCHET_STATE, &ratchet).await?,
            pending_handshake: Some(serde_json::to_string(&handshake.header)?),
            handshake_ek: handshake.header.ek_pub.clone(),
            kem_public: if suite.is_hybrid() { bundle.kem_pub.clone() } else { None },
            kem_ciphertext: handshake.header.kem_ciphertext.clone(),
            send_counter: 0,
            recv_counter: 0,
            created_at: now,
            updated_at: now,
            invalidated_at: None,
            invalidation_reason: None,
        };
        insert_session(conn, &row).await?;
        prune_superseded(conn, local, remote).await?;
        session_info(&row)
    }

    /// Lifecycle state of the newest session for the pair.
    pub async fn session_state(&self, local: DeviceId, remote: DeviceId) -> Result<SessionState> {
        Ok(self
            .session_details(local, remote)
            .await?
            .map(|s| s.state)
            .unwrap_or(SessionState::Uninitiated))
    }

    /// The newest session for the pair, live or not.
    pub async fn session_details(&self, local: DeviceId, remote: DeviceId) -> Result<Option<SessionInfo>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT * FROM sessions WHERE local_device_id = ? AND remote_device_id = ? AND state != 'superseded' \
             ORDER BY (state != 'invalidated') DESC, created_at DESC LIMIT 1",
        )
        .bind(local.as_text())
        .bind(remote.as_text())
        .fetch_optional(&self.store().pool)
        .await?;
        row.as_ref().map(session_info).transpose()
    }

    /// Invalidate every live session referencing `device`, on either side.
    pub async fn invalidate_sessions_for(&self, device: DeviceId, reason: &str) -> Result<u64> {
        let svc = self;
        let count = retry_transient(self.retries(), "invalidate_sessions_for", move || async move {
            let mut tx = svc.store().begin().await?;
            let count = invalidate_sessions_in_tx(&mut *tx, device, reason).await?;
            tx.commit().await?;
            Ok(count)
        })
        .await?;

        if count > 0 {
            tracing::info!(event = "sessions_invalidated", device = %device, count, reason);
            self.emit(KeyEvent::SessionsInvalidated { device_id: device, count });
        }
        Ok(count)
    }

    /// Make sure a live session exists from `local` to `remote`, establishing
    /// one from a freshly issued bundle if needed. Caller holds the pair lock.
    pub(crate) async fn ensure_session(&self, local: DeviceId, remote: DeviceId) -> Result<()> {
        let live = {
            let mut conn = self.store().pool.acquire().await?;
            live_session(&mut *conn, local, remote).await?
        };
        if live.is_none() {
            let issued = self.issue_bundle(remote).await?;
            self.establish_session(local, &issued.bundle).await?;
        }
        Ok(())
    }
}

fn bundle_device(bundle: &PrekeyBundle) -> Result<DeviceId> {
    bundle
        .device_id
        .parse()
        .map_err(|_| KeyError::Crypto(CryptoError::InvalidKey(format!("invalid bundle device id {:?}", bundle.device_id))))
}
