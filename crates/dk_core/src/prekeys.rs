//! Prekey Store: signed medium-term prekeys and single-use one-time prekeys.
//!
//! A one-time prekey is claimed by one conditional `UPDATE ... RETURNING`
//! statement, so two concurrent bundle requests can never receive the same
//! key. Signed prekeys are swapped (old retired, new active) inside one
//! transaction; a partial unique index keeps one active row per device.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

use dk_crypto::identity::{Algorithm, DeviceCapabilities, IdentityKeyPair};
use dk_crypto::x3dh::{self, b64d, b64e, PrekeyBundle};
use dk_crypto::CryptoError;
use dk_proto::{DeviceId, IssuedBundle};
use dk_store::models::{OneTimePrekeyRow, SignedPrekeyRow};

use crate::audit::{self, RotationEntry};
use crate::error::{KeyError, Result};
use crate::registry::{active_identity, capabilities_of, fetch_device, trust_of};
use crate::retry::retry_transient;
use crate::service::{columns, KeyEvent, KeyService};
use crate::types::RotationKind;

/// A signed prekey published for a device whose secrets live elsewhere.
/// Binary fields are base64url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyUpload {
    pub public_key: String,
    /// Identity signature over the prekey, the KEM key and the capabilities.
    pub signature: String,
    pub kem_public: Option<String>,
}

/// A claimed one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePrekey {
    pub id: String,
    pub public_key: String,
}

/// A signed prekey ready to insert; secrets already vault-encrypted.
pub(crate) struct PreparedSignedPrekey {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub kem_public: Option<String>,
    pub secret_enc: Option<String>,
    pub kem_secret_enc: Option<String>,
}

pub(crate) struct PreparedOneTimePrekey {
    pub id: String,
    pub public_key: String,
    pub secret_enc: Option<String>,
}

// ── Storage helpers (inside the caller's transaction) ────────────────────────

/// Retire the active signed prekey, if any, and activate `spk`.
/// Returns the id of the retired prekey.
pub(crate) async fn store_signed_prekey(
    conn: &mut SqliteConnection,
    device: DeviceId,
    identity_generation: i64,
    spk: &PreparedSignedPrekey,
    now: DateTime<Utc>,
    lifetime: Duration,
) -> Result<Option<String>> {
    let retired: Option<String> = sqlx::query_scalar(
        "UPDATE signed_prekeys SET is_active = 0, retired_at = ? WHERE device_id = ? AND is_active = 1 RETURNING id",
    )
    .bind(now)
    .bind(device.as_text())
    .fetch_optional(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO signed_prekeys (id, device_id, identity_generation, public_key, signature, kem_public, secret_enc, kem_secret_enc, is_active, activated_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&spk.id)
    .bind(device.as_text())
    .bind(identity_generation)
    .bind(&spk.public_key)
    .bind(&spk.signature)
    .bind(&spk.kem_public)
    .bind(&spk.secret_enc)
    .bind(&spk.kem_secret_enc)
    .bind(now)
    .bind(now + lifetime)
    .execute(&mut *conn)
    .await?;

    Ok(retired)
}

pub(crate) async fn store_one_time_prekeys(
    conn: &mut SqliteConnection,
    device: DeviceId,
    batch: &[PreparedOneTimePrekey],
    now: DateTime<Utc>,
) -> Result<u64> {
    for opk in batch {
        sqlx::query("INSERT INTO one_time_prekeys (id, device_id, public_key, secret_enc, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&opk.id)
            .bind(device.as_text())
            .bind(&opk.public_key)
            .bind(&opk.secret_enc)
            .bind(now)
            .execute(&mut *conn)
            .await?;
    }
    Ok(batch.len() as u64)
}

/// Claim the oldest unused one-time prekey. `BundleExhausted` when none is left.
pub(crate) async fn claim_one_time_prekey(conn: &mut SqliteConnection, device: DeviceId) -> Result<OneTimePrekey> {
    sqlx::query_as::<_, OneTimePrekey>(
        "UPDATE one_time_prekeys SET used_at = ? \
         WHERE id = (SELECT id FROM one_time_prekeys WHERE device_id = ? AND used_at IS NULL ORDER BY created_at, id LIMIT 1) \
           AND used_at IS NULL \
         RETURNING id, public_key",
    )
    .bind(Utc::now())
    .bind(device.as_text())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(KeyError::BundleExhausted(device))
}

pub(crate) async fn count_available(conn: &mut SqliteConnection, device: DeviceId) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys WHERE device_id = ? AND used_at IS NULL")
        .bind(device.as_text())
        .fetch_one(&mut *conn)
        .await?;
    Ok(n.max(0) as u64)
}

pub(crate) async fn active_signed_prekey(conn: &mut SqliteConnection, device: DeviceId) -> Result<Option<SignedPrekeyRow>> {
    Ok(sqlx::query_as("SELECT * FROM signed_prekeys WHERE device_id = ? AND is_active = 1")
        .bind(device.as_text())
        .fetch_optional(&mut *conn)
        .await?)
}

/// Active or retired signed prekey by id; retired ones answer in-flight handshakes.
pub(crate) async fn signed_prekey_by_id(
    conn: &mut SqliteConnection,
    device: DeviceId,
    id: &str,
) -> Result<Option<SignedPrekeyRow>> {
    Ok(sqlx::query_as("SELECT * FROM signed_prekeys WHERE device_id = ? AND id = ?")
        .bind(device.as_text())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub(crate) async fn one_time_prekey_by_id(
    conn: &mut SqliteConnection,
    device: DeviceId,
    id: &str,
) -> Result<Option<OneTimePrekeyRow>> {
    Ok(sqlx::query_as("SELECT * FROM one_time_prekeys WHERE device_id = ? AND id = ?")
        .bind(device.as_text())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Forget a one-time prekey secret once its handshake has been answered.
pub(crate) async fn destroy_one_time_prekey_secret(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("UPDATE one_time_prekeys SET secret_enc = NULL, used_at = COALESCE(used_at, ?) WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn decode_key_32(b64: &str, what: &str) -> Result<Vec<u8>> {
    let bytes = b64d(b64)?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(format!("{what} must be 32 bytes, got {}", bytes.len())).into());
    }
    Ok(bytes)
}

// ── Operations ───────────────────────────────────────────────────────────────

impl KeyService {
    pub(crate) async fn prepare_signed_prekey(
        &self,
        identity: &IdentityKeyPair,
        capabilities: &DeviceCapabilities,
    ) -> Result<PreparedSignedPrekey> {
        let material = x3dh::generate_signed_prekey(identity, capabilities);
        let secret_enc = self
            .store()
            .encrypt_value(columns::SIGNED_PREKEY_SECRET, material.secret.as_bytes())
            .await?;
        let kem_secret_enc = match &material.kem {
            Some(kem) => Some(
                self.store()
                    .encrypt_value(columns::SIGNED_PREKEY_KEM_SECRET, kem.secret_bytes())
                    .await?,
            ),
            None => None,
        };
        Ok(PreparedSignedPrekey {
            id: Uuid::new_v4().to_string(),
            public_key: b64e(material.public.as_bytes()),
            signature: b64e(&material.signature),
            kem_public: material.kem.as_ref().map(|k| b64e(&k.public)),
            secret_enc: Some(secret_enc),
            kem_secret_enc,
        })
    }

    pub(crate) async fn prepare_one_time_prekeys(&self, count: usize) -> Result<Vec<PreparedOneTimePrekey>> {
        let mut out = Vec::with_capacity(count);
        for (secret, public) in x3dh::generate_one_time_prekeys(count) {
            let secret_enc = self
                .store()
                .encrypt_value(columns::ONE_TIME_PREKEY_SECRET, secret.as_bytes())
                .await?;
            out.push(PreparedOneTimePrekey {
                id: Uuid::new_v4().to_string(),
                public_key: b64e(public.as_bytes()),
                secret_enc: Some(secret_enc),
            });
        }
        Ok(out)
    }

    /// Publish a signed prekey for a device. The signature must verify
    /// against the device's active identity key and its registered
    /// capabilities; the previous active prekey is retired.
    pub async fn publish_signed_prekey(&self, device: DeviceId, upload: &SignedPrekeyUpload) -> Result<String> {
        decode_key_32(&upload.public_key, "signed prekey")?;
        let spk = PreparedSignedPrekey {
            id: Uuid::new_v4().to_string(),
            public_key: upload.public_key.clone(),
            signature: upload.signature.clone(),
            kem_public: upload.kem_public.clone(),
            secret_enc: None,
            kem_secret_enc: None,
        };

        let svc = self;
        let spk_ref = &spk;
        let retired = retry_transient(self.retries(), "publish_signed_prekey", move || async move {
            let mut tx = svc.store().begin().await?;
            let row = fetch_device(&mut *tx, device).await?;
            if trust_of(&row)?.is_cut_off() {
                return Err(KeyError::RecipientUnavailable(device));
            }
            let capabilities = capabilities_of(&row)?;
            let identity = active_identity(&mut *tx, device).await?;
            verify_upload(&identity.public_key, spk_ref, &capabilities)?;

            let now = Utc::now();
            let retired = store_signed_prekey(
                &mut *tx,
                device,
                identity.generation,
                spk_ref,
                now,
                svc.config().signed_prekey_rotation(),
            )
            .await?;
            audit::append_rotation(
                &mut *tx,
                RotationEntry {
                    kind: RotationKind::SignedPrekey,
                    device_id: Some(device),
                    conversation_id: None,
                    old_ref: retired.clone(),
                    new_ref: Some(spk_ref.id.clone()),
                    reason: "published",
                },
            )
            .await?;
            tx.commit().await?;
            Ok(retired)
        })
        .await?;

        tracing::info!(event = "signed_prekey_published", device = %device, prekey = %spk.id, retired = ?retired);
        Ok(spk.id)
    }

    /// Publish public one-time prekeys for a device. Returns how many were added.
    pub async fn publish_one_time_prekeys(&self, device: DeviceId, public_keys: &[String]) -> Result<u64> {
        let batch = public_keys
            .iter()
            .map(|pk| {
                decode_key_32(pk, "one-time prekey")?;
                Ok(PreparedOneTimePrekey {
                    id: Uuid::new_v4().to_string(),
                    public_key: pk.clone(),
                    secret_enc: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let svc = self;
        let batch_ref = batch.as_slice();
        let added = retry_transient(self.retries(), "publish_one_time_prekeys", move || async move {
            let mut tx = svc.store().begin().await?;
            if trust_of(&fetch_device(&mut *tx, device).await?)?.is_cut_off() {
                return Err(KeyError::RecipientUnavailable(device));
            }
            let added = store_one_time_prekeys(&mut *tx, device, batch_ref, Utc::now()).await?;
            tx.commit().await?;
            Ok(added)
        })
        .await?;

        tracing::debug!(device = %device, added, "one-time prekeys published");
        Ok(added)
    }

    /// Atomically claim one unused one-time prekey; `None` when the pool is empty.
    pub async fn consume_one_time_prekey(&self, device: DeviceId) -> Result<Option<OneTimePrekey>> {
        let mut conn = self.store().pool.acquire().await?;
        match claim_one_time_prekey(&mut *conn, device).await {
            Ok(opk) => Ok(Some(opk)),
            Err(KeyError::BundleExhausted(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn available_one_time_prekeys(&self, device: DeviceId) -> Result<u64> {
        let mut conn = self.store().pool.acquire().await?;
        count_available(&mut *conn, device).await
    }

    /// Hand out a prekey bundle for `device`, claiming one one-time prekey.
    ///
    /// An empty pool degrades to a signed-prekey-only bundle. Cut-off devices
    /// and devices without an active signed prekey are `RecipientUnavailable`.
    pub async fn issue_bundle(&self, device: DeviceId) -> Result<IssuedBundle> {
        let svc = self;
        let (bundle, available) = retry_transient(self.retries(), "issue_bundle", move || async move {
            let mut tx = svc.store().begin().await?;
            // Claim first: the write lock is taken up front and an error
            // below rolls the claim back.
            let one_time = match claim_one_time_prekey(&mut *tx, device).await {
                Ok(opk) => Some(opk),
                Err(e) if e.is_locally_recoverable() => None,
                Err(e) => return Err(e),
            };

            let row = fetch_device(&mut *tx, device).await?;
            if trust_of(&row)?.is_cut_off() {
                return Err(KeyError::RecipientUnavailable(device));
            }
            let Some(spk) = active_signed_prekey(&mut *tx, device).await? else {
                return Err(KeyError::RecipientUnavailable(device));
            };
            let identity = active_identity(&mut *tx, device).await?;
            let available = count_available(&mut *tx, device).await?;
            tx.commit().await?;

            let bundle = PrekeyBundle {
                device_id: device.as_text(),
                user_id: row.user_id.clone(),
                ik_pub: identity.public_key,
                spk_id: spk.id,
                spk_pub: spk.public_key,
                spk_sig: spk.signature,
                opk_pub: one_time.as_ref().map(|o| o.public_key.clone()),
                opk_id: one_time.map(|o| o.id),
                kem_pub: spk.kem_public,
                capabilities: capabilities_of(&row)?,
            };
            Ok((bundle, available))
        })
        .await?;

        let issued = IssuedBundle::new(bundle);
        if issued.is_degraded() {
            tracing::warn!(event = "bundle_exhausted", device = %device, "no one-time prekeys left; issuing signed-prekey-only bundle");
        }
        let watermark = u64::from(self.config().one_time_prekey_low_watermark);
        if available < watermark {
            tracing::warn!(event = "replenishment_needed", device = %device, available, watermark);
            self.emit(KeyEvent::ReplenishmentNeeded { device_id: device, available });
        }
        Ok(issued)
    }
}

fn verify_upload(identity_b64: &str, spk: &PreparedSignedPrekey, capabilities: &DeviceCapabilities) -> Result<()> {
    let identity = b64d(identity_b64)?;
    let public = b64d(&spk.public_key)?;
    let kem_public = spk.kem_public.as_deref().map(b64d).transpose()?;
    if capabilities.supports(Algorithm::MlKem768) && kem_public.is_none() {
        return Err(CryptoError::InvalidKey("device advertises ML-KEM-768 but the prekey has no KEM key".into()).into());
    }
    let signature = b64d(&spk.signature)?;
    let payload = x3dh::signed_prekey_payload(&public, kem_public.as_deref(), capabilities);
    IdentityKeyPair::verify(&identity, &payload, &signature)?;
    Ok(())
}
