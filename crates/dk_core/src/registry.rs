//! Identity Registry: one long-term Ed25519 identity per device, plus the
//! device's trust state.
//!
//! Remote devices are registered from their public key only. Local devices
//! (`provision_local_device`) also keep the private half, vault-encrypted,
//! and start out with a signed prekey and a batch of one-time prekeys.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use dk_crypto::identity::{DeviceCapabilities, IdentityKeyPair, PublicKeyBytes};
use dk_proto::{DeviceId, UserId};
use dk_store::models::{DeviceRow, IdentityKeyRow};
use dk_store::StoreError;

use crate::error::{KeyError, Result};
use crate::fanout;
use crate::prekeys;
use crate::retry::retry_transient;
use crate::service::{columns, KeyEvent, KeyService};
use crate::session;
use crate::types::{DeviceInfo, TrustState, VerifiedIdentity};

// ── Row helpers ──────────────────────────────────────────────────────────────

pub(crate) fn parse_device_id(s: &str) -> Result<DeviceId> {
    s.parse()
        .map_err(|_| KeyError::Store(StoreError::Corrupt(format!("invalid device id {s:?}"))))
}

pub(crate) async fn fetch_device(conn: &mut SqliteConnection, device: DeviceId) -> Result<DeviceRow> {
    sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE id = ?")
        .bind(device.as_text())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(KeyError::DeviceNotFound(device))
}

/// The device row, which must be held by this core.
pub(crate) async fn fetch_local_device(conn: &mut SqliteConnection, device: DeviceId) -> Result<DeviceRow> {
    let row = fetch_device(conn, device).await?;
    if !row.is_local {
        return Err(KeyError::NotLocalDevice(device));
    }
    Ok(row)
}

pub(crate) async fn active_identity(conn: &mut SqliteConnection, device: DeviceId) -> Result<IdentityKeyRow> {
    sqlx::query_as::<_, IdentityKeyRow>("SELECT * FROM identity_keys WHERE device_id = ? AND retired_at IS NULL")
        .bind(device.as_text())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| KeyError::Store(StoreError::Corrupt(format!("device {device} has no active identity key"))))
}

pub(crate) fn trust_of(row: &DeviceRow) -> Result<TrustState> {
    Ok(row.trust_state.parse()?)
}

pub(crate) fn capabilities_of(row: &DeviceRow) -> Result<DeviceCapabilities> {
    Ok(serde_json::from_str(&row.capabilities)?)
}

async fn device_for_fingerprint(conn: &mut SqliteConnection, fingerprint: &str) -> Result<Option<DeviceId>> {
    let found: Option<String> = sqlx::query_scalar("SELECT device_id FROM identity_keys WHERE fingerprint = ?")
        .bind(fingerprint)
        .fetch_optional(&mut *conn)
        .await?;
    found.as_deref().map(parse_device_id).transpose()
}

struct NewDevice<'a> {
    id: DeviceId,
    user_id: &'a UserId,
    display_name: &'a str,
    trust_state: TrustState,
    capabilities_json: &'a str,
    is_local: bool,
    public_key: &'a PublicKeyBytes,
    secret_enc: Option<&'a str>,
}

async fn insert_device(conn: &mut SqliteConnection, device: &NewDevice<'_>) -> Result<()> {
    let fingerprint = device.public_key.fingerprint();
    if let Some(existing) = device_for_fingerprint(conn, &fingerprint).await? {
        return Err(KeyError::DuplicateDevice { existing });
    }

    let now = Utc::now();
    sqlx::query(
        "INSERT INTO devices (id, user_id, display_name, trust_state, capabilities, generation, is_local, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
    )
    .bind(device.id.as_text())
    .bind(device.user_id.as_str())
    .bind(device.display_name)
    .bind(device.trust_state.as_str())
    .bind(device.capabilities_json)
    .bind(device.is_local)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO identity_keys (id, device_id, generation, public_key, fingerprint, secret_enc, created_at) \
         VALUES (?, ?, 1, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(device.id.as_text())
    .bind(device.public_key.to_b64())
    .bind(&fingerprint)
    .bind(device.secret_enc)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn device_info(row: &DeviceRow, identity: &IdentityKeyRow) -> Result<DeviceInfo> {
    Ok(DeviceInfo {
        id: parse_device_id(&row.id)?,
        user_id: UserId::from(row.user_id.as_str()),
        display_name: row.display_name.clone(),
        trust_state: trust_of(row)?,
        capabilities: capabilities_of(row)?,
        generation: u32::try_from(row.generation).unwrap_or(0),
        is_local: row.is_local,
        fingerprint: identity.fingerprint.clone(),
        created_at: row.created_at,
        last_seen_at: row.last_seen_at,
    })
}

// ── Operations ───────────────────────────────────────────────────────────────

impl KeyService {
    /// Register a remote device from its public identity key.
    ///
    /// The device starts `untrusted`. A key whose fingerprint is already
    /// registered fails with `DuplicateDevice`, carrying the existing id.
    pub async fn register_device(
        &self,
        user_id: &UserId,
        public_key: &PublicKeyBytes,
        capabilities: &DeviceCapabilities,
        display_name: &str,
    ) -> Result<DeviceId> {
        let public_key = PublicKeyBytes::from_slice(&public_key.0)?;
        let capabilities_json = serde_json::to_string(capabilities)?;
        let device_id = DeviceId::new();

        let svc = self;
        let (public_key, capabilities_json) = (&public_key, capabilities_json.as_str());
        let outcome = retry_transient(self.retries(), "register_device", move || async move {
            let mut tx = svc.store().begin().await?;
            insert_device(
                &mut *tx,
                &NewDevice {
                    id: device_id,
                    user_id,
                    display_name,
                    trust_state: TrustState::Untrusted,
                    capabilities_json,
                    is_local: false,
                    public_key,
                    secret_enc: None,
                },
            )
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await;

        match outcome {
            Ok(()) => {
                tracing::info!(event = "device_registered", device = %device_id, user = %user_id, fingerprint = %public_key.fingerprint());
                Ok(device_id)
            }
            Err(e) => Err(self.resolve_duplicate(e, &public_key.fingerprint()).await),
        }
    }

    /// `register_device`, but a re-registration of the same key by the same
    /// user returns the existing device instead of failing.
    pub async fn register_or_get_device(
        &self,
        user_id: &UserId,
        public_key: &PublicKeyBytes,
        capabilities: &DeviceCapabilities,
        display_name: &str,
    ) -> Result<DeviceId> {
        match self.register_device(user_id, public_key, capabilities, display_name).await {
            Err(KeyError::DuplicateDevice { existing }) => {
                let mut conn = self.store().pool.acquire().await?;
                let row = fetch_device(&mut *conn, existing).await?;
                if row.user_id == user_id.as_str() {
                    Ok(existing)
                } else {
                    Err(KeyError::DuplicateDevice { existing })
                }
            }
            other => other,
        }
    }

    /// A concurrent registration of the same key loses on the fingerprint
    /// unique index; report it the same way as the pre-insert check.
    async fn resolve_duplicate(&self, err: KeyError, fingerprint: &str) -> KeyError {
        let KeyError::Store(ref store_err) = err else {
            return err;
        };
        if !store_err.is_unique_violation() {
            return err;
        }
        let Ok(mut conn) = self.store().pool.acquire().await else {
            return err;
        };
        match device_for_fingerprint(&mut *conn, fingerprint).await {
            Ok(Some(existing)) => KeyError::DuplicateDevice { existing },
            _ => err,
        }
    }

    /// Create a device held by this core: identity key pair, initial signed
    /// prekey (with an ML-KEM key when `capabilities` advertises one) and a
    /// batch of one-time prekeys. Local devices start `trusted`.
    pub async fn provision_local_device(
        &self,
        user_id: &UserId,
        display_name: &str,
        capabilities: &DeviceCapabilities,
    ) -> Result<DeviceId> {
        let identity = IdentityKeyPair::generate();
        let secret_enc = self
            .store()
            .encrypt_value(columns::IDENTITY_SECRET, identity.secret_bytes())
            .await?;
        let signed_prekey = self.prepare_signed_prekey(&identity, capabilities).await?;
        let batch = self.config().one_time_prekey_batch as usize;
        let one_time_prekeys = self.prepare_one_time_prekeys(batch).await?;
        let capabilities_json = serde_json::to_string(capabilities)?;
        let device_id = DeviceId::new();

        let svc = self;
        let public_key = &identity.public;
        let (secret_enc, signed_prekey, one_time_prekeys, capabilities_json) =
            (secret_enc.as_str(), &signed_prekey, one_time_prekeys.as_slice(), capabilities_json.as_str());
        retry_transient(self.retries(), "provision_local_device", move || async move {
            let mut tx = svc.store().begin().await?;
            let now = Utc::now();
            insert_device(
                &mut *tx,
                &NewDevice {
                    id: device_id,
                    user_id,
                    display_name,
                    trust_state: TrustState::Trusted,
                    capabilities_json,
                    is_local: true,
                    public_key,
                    secret_enc: Some(secret_enc),
                },
            )
            .await?;
            prekeys::store_signed_prekey(&mut *tx, device_id, 1, signed_prekey, now, svc.config().signed_prekey_rotation())
                .await?;
            prekeys::store_one_time_prekeys(&mut *tx, device_id, one_time_prekeys, now).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!(
            event = "device_provisioned",
            device = %device_id,
            user = %user_id,
            fingerprint = %identity.fingerprint(),
            one_time_prekeys = batch,
        );
        Ok(device_id)
    }

    pub async fn get_verified_identity(&self, device: DeviceId) -> Result<VerifiedIdentity> {
        let mut conn = self.store().pool.acquire().await?;
        let row = fetch_device(&mut *conn, device).await?;
        let identity = active_identity(&mut *conn, device).await?;
        Ok(VerifiedIdentity {
            device_id: device,
            public_key: PublicKeyBytes::from_b64(&identity.public_key)?,
            fingerprint: identity.fingerprint,
            trust_state: trust_of(&row)?,
            generation: u32::try_from(identity.generation).unwrap_or(0),
        })
    }

    pub async fn list_devices(&self, user_id: &UserId) -> Result<Vec<DeviceInfo>> {
        let mut conn = self.store().pool.acquire().await?;
        let rows: Vec<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE user_id = ? ORDER BY created_at, id")
            .bind(user_id.as_str())
            .fetch_all(&mut *conn)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let identity = active_identity(&mut *conn, parse_device_id(&row.id)?).await?;
            out.push(device_info(row, &identity)?);
        }
        Ok(out)
    }

    pub async fn touch_device(&self, device: DeviceId) -> Result<()> {
        let done = sqlx::query("UPDATE devices SET last_seen_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(device.as_text())
            .execute(&self.store().pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(KeyError::DeviceNotFound(device));
        }
        Ok(())
    }

    /// Move a device through the trust state machine.
    ///
    /// `compromised` invalidates every session referencing the device and
    /// deletes its key shares in the same transaction. `revoked` runs the full
    /// `revoke_device` unit.
    pub async fn set_trust_state(&self, device: DeviceId, new_state: TrustState, reason: &str) -> Result<()> {
        let current = {
            let mut conn = self.store().pool.acquire().await?;
            trust_of(&fetch_device(&mut *conn, device).await?)?
        };
        check_transition(device, current, new_state)?;
        if current == new_state {
            return Ok(());
        }
        if new_state == TrustState::Revoked {
            return self.revoke_device(device, reason).await.map(|_| ());
        }

        let svc = self;
        let invalidated = retry_transient(self.retries(), "set_trust_state", move || async move {
            let mut tx = svc.store().begin().await?;
            let from = trust_of(&fetch_device(&mut *tx, device).await?)?;
            check_transition(device, from, new_state)?;
            if from == new_state {
                return Ok(0);
            }
            sqlx::query("UPDATE devices SET trust_state = ?, updated_at = ? WHERE id = ?")
                .bind(new_state.as_str())
                .bind(Utc::now())
                .bind(device.as_text())
                .execute(&mut *tx)
                .await?;
            let mut invalidated = 0;
            if new_state.is_cut_off() {
                invalidated = session::invalidate_sessions_in_tx(&mut *tx, device, reason).await?;
                fanout::delete_shares_for_device(&mut *tx, device).await?;
            }
            tx.commit().await?;
            Ok(invalidated)
        })
        .await?;

        if new_state == TrustState::Compromised {
            tracing::warn!(event = "trust_changed", device = %device, from = %current, to = %new_state, reason, sessions_invalidated = invalidated);
        } else {
            tracing::info!(event = "trust_changed", device = %device, from = %current, to = %new_state, reason);
        }
        if invalidated > 0 {
            self.emit(KeyEvent::SessionsInvalidated { device_id: device, count: invalidated });
        }
        Ok(())
    }

    /// Decrypt the active identity key pair of a local device.
    pub(crate) async fn local_identity(
        &self,
        conn: &mut SqliteConnection,
        device: DeviceId,
    ) -> Result<(IdentityKeyRow, IdentityKeyPair)> {
        let row = active_identity(conn, device).await?;
        let secret = row.secret_enc.as_deref().ok_or(KeyError::NotLocalDevice(device))?;
        let bytes = self.store().decrypt_value(columns::IDENTITY_SECRET, secret).await?;
        let pair = IdentityKeyPair::from_bytes(&bytes)?;
        Ok((row, pair))
    }
}

fn check_transition(device: DeviceId, from: TrustState, to: TrustState) -> Result<()> {
    if from == TrustState::Revoked && to == TrustState::Revoked {
        return Err(KeyError::RevocationConflict(device));
    }
    if from != to && !from.can_transition_to(to) {
        return Err(KeyError::InvalidTrustTransition { from, to });
    }
    Ok(())
}
