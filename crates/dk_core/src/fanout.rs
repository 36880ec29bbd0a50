//! Conversation Key Fan-out.
//!
//! Each conversation has one symmetric key per version; exactly one version
//! is active, older ones are read-only and still decrypt history. A version
//! reaches a device as a [`DeviceKeyShare`]: the raw key sealed over the
//! pairwise session from the sending device, so the relay never sees it.
//!
//! Lock order: the conversation lock first, then the (sender, target)
//! session locks. Sessions are established before the fan-out transaction
//! opens, because establishing one runs its own transaction.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use uuid::Uuid;
use zeroize::Zeroizing;

use dk_crypto::aead;
use dk_crypto::kdf;
use dk_crypto::x3dh::{b64d, b64e};
use dk_proto::codec;
use dk_proto::{ConversationCiphertext, ConversationId, DeviceId, DeviceKeyShare, SealedMessage};
use dk_store::models::{ConversationKeyRow, DeviceKeyShareRow};

use crate::audit::{self, RotationEntry};
use crate::error::{KeyError, Result};
use crate::locks::{conversation_key, session_key};
use crate::registry::{fetch_device, fetch_local_device, parse_device_id, trust_of};
use crate::retry::retry_transient;
use crate::service::{columns, KeyService};
use crate::types::{ConversationKey, KeyStatus, RotationKind, TrustState};

/// Shares produced by one fan-out of a conversation key version.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutResult {
    pub conversation_id: ConversationId,
    pub version: u32,
    pub shares: Vec<DeviceKeyShare>,
    /// Participants left out of this fan-out (cut off, not trusted, or
    /// without a usable bundle).
    pub skipped: Vec<DeviceId>,
}

/// A key version prepared outside the transaction.
pub(crate) struct PreparedKey {
    key: Zeroizing<[u8; 32]>,
    key_enc: String,
}

// ── Row helpers ──────────────────────────────────────────────────────────────

async fn active_key_row(conn: &mut SqliteConnection, conversation: &ConversationId) -> Result<ConversationKeyRow> {
    sqlx::query_as::<_, ConversationKeyRow>(
        "SELECT * FROM conversation_keys WHERE conversation_id = ? AND status = 'active'",
    )
    .bind(conversation.as_str())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| KeyError::ConversationNotFound(conversation.clone()))
}

async fn key_row(conn: &mut SqliteConnection, conversation: &ConversationId, version: u32) -> Result<Option<ConversationKeyRow>> {
    Ok(sqlx::query_as("SELECT * FROM conversation_keys WHERE conversation_id = ? AND version = ?")
        .bind(conversation.as_str())
        .bind(i64::from(version))
        .fetch_optional(&mut *conn)
        .await?)
}

pub(crate) async fn participants_in_tx(conn: &mut SqliteConnection, conversation: &ConversationId) -> Result<Vec<DeviceId>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT device_id FROM conversation_participants WHERE conversation_id = ? ORDER BY device_id",
    )
    .bind(conversation.as_str())
    .fetch_all(&mut *conn)
    .await?;
    ids.iter().map(|id| parse_device_id(id)).collect()
}

pub(crate) async fn conversations_of(conn: &mut SqliteConnection, device: DeviceId) -> Result<Vec<ConversationId>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT conversation_id FROM conversation_participants WHERE device_id = ? ORDER BY conversation_id",
    )
    .bind(device.as_text())
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(ConversationId::from).collect())
}

async fn add_participant(conn: &mut SqliteConnection, conversation: &ConversationId, device: DeviceId) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO conversation_participants (conversation_id, device_id, joined_at) VALUES (?, ?, ?)")
        .bind(conversation.as_str())
        .bind(device.as_text())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn delete_shares_for_device(conn: &mut SqliteConnection, device: DeviceId) -> Result<u64> {
    let done = sqlx::query("DELETE FROM device_key_shares WHERE target_device_id = ?")
        .bind(device.as_text())
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected())
}

fn version_of(row: &ConversationKeyRow) -> u32 {
    u32::try_from(row.version).unwrap_or(0)
}

// ── Internals ────────────────────────────────────────────────────────────────

impl KeyService {
    pub(crate) async fn prepare_key(&self) -> Result<PreparedKey> {
        let key = Zeroizing::new(kdf::generate_key());
        let key_enc = self.store().encrypt_value(columns::CONVERSATION_KEY, key.as_slice()).await?;
        Ok(PreparedKey { key, key_enc })
    }

    async fn load_key(&self, conversation: &ConversationId, row: &ConversationKeyRow) -> Result<ConversationKey> {
        let bytes = self.store().decrypt_value(columns::CONVERSATION_KEY, &row.key_enc).await?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Store(dk_store::StoreError::Corrupt("conversation key must be 32 bytes".into())))?;
        Ok(ConversationKey::new(conversation.clone(), version_of(row), row.status.parse()?, key))
    }

    /// Split `targets` into devices that can receive a share now and devices
    /// that are skipped. Establishes missing sessions; the caller holds the
    /// (sender, target) locks.
    pub(crate) async fn prepare_fanout(&self, sender: DeviceId, targets: &[DeviceId]) -> Result<(Vec<DeviceId>, Vec<DeviceId>)> {
        let mut ready = Vec::new();
        let mut skipped = Vec::new();
        for &target in targets {
            if target == sender {
                continue;
            }
            let trust = {
                let mut conn = self.store().pool.acquire().await?;
                trust_of(&fetch_device(&mut *conn, target).await?)?
            };
            if trust != TrustState::Trusted {
                tracing::info!(sender = %sender, target = %target, trust = %trust, "participant skipped in fan-out");
                skipped.push(target);
                continue;
            }
            match self.ensure_session(sender, target).await {
                Ok(()) => ready.push(target),
                Err(e) if e.is_locally_recoverable() => {
                    tracing::warn!(sender = %sender, target = %target, error = %e, "participant dropped from fan-out");
                    skipped.push(target);
                }
                Err(e) => return Err(e),
            }
        }
        Ok((ready, skipped))
    }

    /// Seal `key` for `target` and upsert the share row.
    async fn wrap_in_tx(
        &self,
        conn: &mut SqliteConnection,
        key: &ConversationKey,
        key_row_id: &str,
        sender: DeviceId,
        target: DeviceId,
    ) -> Result<DeviceKeyShare> {
        let ad = DeviceKeyShare::associated_data(&key.conversation_id, key.version);
        let sealed = self.seal_in_tx(conn, sender, target, key.key_bytes(), &ad).await?;
        let share = DeviceKeyShare {
            conversation_id: key.conversation_id.clone(),
            version: key.version,
            sender_device: sender,
            target_device: target,
            sealed,
        };

        sqlx::query(
            "INSERT INTO device_key_shares (id, conversation_key_id, conversation_id, version, target_device_id, sender_device_id, sealed, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (conversation_key_id, target_device_id) DO UPDATE SET \
             sender_device_id = excluded.sender_device_id, sealed = excluded.sealed, created_at = excluded.created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(key_row_id)
        .bind(key.conversation_id.as_str())
        .bind(i64::from(key.version))
        .bind(target.as_text())
        .bind(sender.as_text())
        .bind(share.sealed.to_json()?)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(share)
    }

    /// Wrap for every ready target. A session that vanished since it was
    /// prepared drops that target instead of failing the fan-out.
    async fn wrap_all_in_tx(
        &self,
        conn: &mut SqliteConnection,
        key: &ConversationKey,
        key_row_id: &str,
        sender: DeviceId,
        targets: &[DeviceId],
        skipped: &mut Vec<DeviceId>,
    ) -> Result<Vec<DeviceKeyShare>> {
        let mut shares = Vec::with_capacity(targets.len());
        for &target in targets {
            match self.wrap_in_tx(conn, key, key_row_id, sender, target).await {
                Ok(share) => shares.push(share),
                Err(KeyError::SessionInvalidated { .. } | KeyError::SessionNotFound { .. }) => {
                    tracing::warn!(sender = %sender, target = %target, "session lost during fan-out; participant dropped");
                    skipped.push(target);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(shares)
    }

    /// Create the next version, mark the previous one read-only, wrap it for
    /// `targets`, prune shares outside the retention window and record the
    /// rotation. Runs inside the caller's transaction.
    pub(crate) async fn rotate_in_tx(
        &self,
        conn: &mut SqliteConnection,
        conversation: &ConversationId,
        sender: DeviceId,
        targets: &[DeviceId],
        prepared: &PreparedKey,
        reason: &str,
    ) -> Result<FanoutResult> {
        let current = active_key_row(conn, conversation).await?;
        let old_version = version_of(&current);
        let version = old_version + 1;
        let now = Utc::now();

        sqlx::query("UPDATE conversation_keys SET status = 'read_only' WHERE id = ?")
            .bind(&current.id)
            .execute(&mut *conn)
            .await?;
        let key_row_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO conversation_keys (id, conversation_id, version, key_enc, status, created_at) VALUES (?, ?, ?, ?, 'active', ?)",
        )
        .bind(&key_row_id)
        .bind(conversation.as_str())
        .bind(i64::from(version))
        .bind(&prepared.key_enc)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let key = ConversationKey::new(conversation.clone(), version, KeyStatus::Active, *prepared.key);
        let mut skipped = Vec::new();
        let shares = self
            .wrap_all_in_tx(conn, &key, &key_row_id, sender, targets, &mut skipped)
            .await?;

        let retention = self.config().share_retention_versions.max(1);
        if let Some(cutoff) = version.checked_sub(retention) {
            sqlx::query("DELETE FROM device_key_shares WHERE conversation_id = ? AND version <= ?")
                .bind(conversation.as_str())
                .bind(i64::from(cutoff))
                .execute(&mut *conn)
                .await?;
        }

        audit::append_rotation(
            conn,
            RotationEntry {
                kind: RotationKind::ConversationKey,
                device_id: Some(sender),
                conversation_id: Some(conversation),
                old_ref: Some(format!("v{old_version}")),
                new_ref: Some(format!("v{version}")),
                reason,
            },
        )
        .await?;

        Ok(FanoutResult { conversation_id: conversation.clone(), version, shares, skipped })
    }

    /// Store a key version learned from a share, if this core does not
    /// hold it yet.
    async fn remember_key_in_tx(&self, conn: &mut SqliteConnection, key: &ConversationKey) -> Result<KeyStatus> {
        if let Some(row) = key_row(conn, &key.conversation_id, key.version).await? {
            return Ok(row.status.parse()?);
        }
        let newest: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM conversation_keys WHERE conversation_id = ?")
            .bind(key.conversation_id.as_str())
            .fetch_one(&mut *conn)
            .await?;
        let status = match newest {
            Some(v) if v > i64::from(key.version) => KeyStatus::ReadOnly,
            _ => KeyStatus::Active,
        };
        if status == KeyStatus::Active {
            sqlx::query("UPDATE conversation_keys SET status = 'read_only' WHERE conversation_id = ? AND status = 'active'")
                .bind(key.conversation_id.as_str())
                .execute(&mut *conn)
                .await?;
        }
        let key_enc = self.store().encrypt_value(columns::CONVERSATION_KEY, key.key_bytes()).await?;
        sqlx::query(
            "INSERT INTO conversation_keys (id, conversation_id, version, key_enc, status, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(key.conversation_id.as_str())
        .bind(i64::from(key.version))
        .bind(&key_enc)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(status)
    }

    async fn ensure_recipient(&self, target: DeviceId) -> Result<()> {
        let mut conn = self.store().pool.acquire().await?;
        if trust_of(&fetch_device(&mut *conn, target).await?)?.is_cut_off() {
            return Err(KeyError::RecipientUnavailable(target));
        }
        Ok(())
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

impl KeyService {
    /// Create version 1 of a conversation key and register its participants.
    pub async fn create_conversation_key(
        &self,
        conversation: &ConversationId,
        participants: &[DeviceId],
    ) -> Result<ConversationKey> {
        let _locks = self.locks().acquire([conversation_key(conversation)]).await;
        let prepared = self.prepare_key().await?;

        let svc = self;
        let prepared_ref = &prepared;
        retry_transient(self.retries(), "create_conversation_key", move || async move {
            let mut tx = svc.store().begin().await?;
            let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_keys WHERE conversation_id = ?")
                .bind(conversation.as_str())
                .fetch_one(&mut *tx)
                .await?;
            if existing > 0 {
                return Err(KeyError::ConversationExists(conversation.clone()));
            }
            for &device in participants {
                fetch_device(&mut *tx, device).await?;
                add_participant(&mut *tx, conversation, device).await?;
            }
            sqlx::query(
                "INSERT INTO conversation_keys (id, conversation_id, version, key_enc, status, created_at) VALUES (?, ?, 1, ?, 'active', ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(conversation.as_str())
            .bind(&prepared_ref.key_enc)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!(event = "conversation_created", conversation = %conversation, participants = participants.len());
        Ok(ConversationKey::new(conversation.clone(), 1, KeyStatus::Active, *prepared.key))
    }

    /// Wrap the current version for every participant except `sender`.
    pub async fn distribute_conversation_key(&self, conversation: &ConversationId, sender: DeviceId) -> Result<FanoutResult> {
        let mut locks = self.locks().acquire([conversation_key(conversation)]).await;
        let participants = {
            let mut conn = self.store().pool.acquire().await?;
            fetch_local_device(&mut *conn, sender).await?;
            participants_in_tx(&mut *conn, conversation).await?
        };
        self.locks()
            .extend(&mut locks, participants.iter().map(|&p| session_key(sender, p)))
            .await;
        let (ready, skipped) = self.prepare_fanout(sender, &participants).await?;

        let svc = self;
        let (ready, skipped) = (ready.as_slice(), skipped.as_slice());
        let result = retry_transient(self.retries(), "distribute_conversation_key", move || async move {
            let mut tx = svc.store().begin().await?;
            let row = active_key_row(&mut *tx, conversation).await?;
            let key = svc.load_key(conversation, &row).await?;
            let mut skipped = skipped.to_vec();
            let shares = svc
                .wrap_all_in_tx(&mut *tx, &key, &row.id, sender, ready, &mut skipped)
                .await?;
            tx.commit().await?;
            Ok(FanoutResult { conversation_id: conversation.clone(), version: key.version, shares, skipped })
        })
        .await?;

        tracing::info!(
            event = "conversation_key_distributed",
            conversation = %conversation,
            version = result.version,
            shares = result.shares.len(),
            skipped = result.skipped.len(),
        );
        Ok(result)
    }

    /// Seal `key` for one device, establishing a session if none exists.
    pub async fn wrap_for_device(&self, key: &ConversationKey, sender: DeviceId, target: DeviceId) -> Result<DeviceKeyShare> {
        if sender == target {
            return Err(KeyError::RecipientUnavailable(target));
        }
        let _locks = self.locks().acquire([session_key(sender, target)]).await;
        self.ensure_recipient(target).await?;
        self.ensure_session(sender, target).await?;

        let svc = self;
        retry_transient(self.retries(), "wrap_for_device", move || async move {
            let mut tx = svc.store().begin().await?;
            let row = key_row(&mut *tx, &key.conversation_id, key.version)
                .await?
                .ok_or_else(|| KeyError::ConversationNotFound(key.conversation_id.clone()))?;
            let share = svc.wrap_in_tx(&mut *tx, key, &row.id, sender, target).await?;
            tx.commit().await?;
            Ok(share)
        })
        .await
    }

    /// Start a new key version and wrap it for every trusted participant.
    /// Participants that cannot receive it are dropped from this fan-out.
    pub async fn rotate_conversation_key(&self, conversation: &ConversationId, sender: DeviceId) -> Result<FanoutResult> {
        let mut locks = self.locks().acquire([conversation_key(conversation)]).await;
        let participants = {
            let mut conn = self.store().pool.acquire().await?;
            fetch_local_device(&mut *conn, sender).await?;
            active_key_row(&mut *conn, conversation).await?;
            participants_in_tx(&mut *conn, conversation).await?
        };
        self.locks()
            .extend(&mut locks, participants.iter().map(|&p| session_key(sender, p)))
            .await;
        let (ready, skipped) = self.prepare_fanout(sender, &participants).await?;
        let prepared = self.prepare_key().await?;

        let svc = self;
        let (ready, skipped, prepared) = (ready.as_slice(), skipped.as_slice(), &prepared);
        let result = retry_transient(self.retries(), "rotate_conversation_key", move || async move {
            let mut tx = svc.store().begin().await?;
            let mut result = svc
                .rotate_in_tx(&mut *tx, conversation, sender, ready, prepared, "rotation")
                .await?;
            tx.commit().await?;
            result.skipped.extend_from_slice(skipped);
            Ok(result)
        })
        .await?;

        tracing::info!(
            event = "conversation_key_rotated",
            conversation = %conversation,
            version = result.version,
            shares = result.shares.len(),
            skipped = result.skipped.len(),
        );
        Ok(result)
    }

    /// Add `new_device` to the conversation and wrap the current version
    /// only. Earlier versions are never shared with a late joiner.
    pub async fn share_with_new_device(
        &self,
        conversation: &ConversationId,
        new_device: DeviceId,
        sender: DeviceId,
    ) -> Result<DeviceKeyShare> {
        if sender == new_device {
            return Err(KeyError::RecipientUnavailable(new_device));
        }
        let _locks = self
            .locks()
            .acquire([conversation_key(conversation), session_key(sender, new_device)])
            .await;
        self.ensure_recipient(new_device).await?;
        self.ensure_session(sender, new_device).await?;

        let svc = self;
        let share = retry_transient(self.retries(), "share_with_new_device", move || async move {
            let mut tx = svc.store().begin().await?;
            let row = active_key_row(&mut *tx, conversation).await?;
            let key = svc.load_key(conversation, &row).await?;
            add_participant(&mut *tx, conversation, new_device).await?;
            let share = svc.wrap_in_tx(&mut *tx, &key, &row.id, sender, new_device).await?;
            tx.commit().await?;
            Ok(share)
        })
        .await?;

        tracing::info!(event = "device_joined_conversation", conversation = %conversation, device = %new_device, version = share.version);
        Ok(share)
    }

    /// Open a share addressed to `local` and return the conversation key.
    pub async fn unwrap_share(&self, local: DeviceId, share: &DeviceKeyShare) -> Result<ConversationKey> {
        if share.target_device != local || share.sealed.sender_device != share.sender_device {
            return Err(KeyError::AuthenticationFailed);
        }
        let _locks = self.locks().acquire([session_key(local, share.sender_device)]).await;

        let svc = self;
        retry_transient(self.retries(), "unwrap_share", move || async move {
            let mut tx = svc.store().begin().await?;
            let ad = DeviceKeyShare::associated_data(&share.conversation_id, share.version);
            let raw = svc.open_in_tx(&mut *tx, local, &share.sealed, &ad).await?;
            let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| KeyError::AuthenticationFailed)?;
            let mut key = ConversationKey::new(share.conversation_id.clone(), share.version, KeyStatus::Active, bytes);
            key.status = svc.remember_key_in_tx(&mut *tx, &key).await?;
            tx.commit().await?;
            Ok(key)
        })
        .await
    }

    /// Encrypt under the active version. A read-only version is rejected.
    pub async fn encrypt_with_conversation_key(
        &self,
        conversation: &ConversationId,
        version: u32,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<ConversationCiphertext> {
        let mut conn = self.store().pool.acquire().await?;
        let row = key_row(&mut *conn, conversation, version)
            .await?
            .ok_or_else(|| KeyError::ConversationNotFound(conversation.clone()))?;
        let key = self.load_key(conversation, &row).await?;
        if key.status != KeyStatus::Active {
            let current = version_of(&active_key_row(&mut *conn, conversation).await?);
            return Err(KeyError::StaleConversationKey { conversation: conversation.clone(), version, current });
        }

        let mut out = ConversationCiphertext { conversation_id: conversation.clone(), version, payload: String::new() };
        let padded = Zeroizing::new(codec::pad(plaintext, self.config().padding)?);
        let ciphertext = aead::encrypt(key.key_bytes(), &padded, &out.associated_data(associated_data))?;
        out.payload = b64e(&ciphertext);
        Ok(out)
    }

    /// Decrypt under whichever retained version the ciphertext names.
    pub async fn decrypt_with_conversation_key(
        &self,
        ciphertext: &ConversationCiphertext,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut conn = self.store().pool.acquire().await?;
        let row = key_row(&mut *conn, &ciphertext.conversation_id, ciphertext.version)
            .await?
            .ok_or_else(|| KeyError::ConversationNotFound(ciphertext.conversation_id.clone()))?;
        let key = self.load_key(&ciphertext.conversation_id, &row).await?;

        let data = b64d(&ciphertext.payload).map_err(|_| KeyError::AuthenticationFailed)?;
        let padded = aead::decrypt(key.key_bytes(), &data, &ciphertext.associated_data(associated_data))?;
        codec::unpad(&padded).map_err(|_| KeyError::AuthenticationFailed)
    }

    pub async fn conversation_participants(&self, conversation: &ConversationId) -> Result<Vec<DeviceId>> {
        let mut conn = self.store().pool.acquire().await?;
        participants_in_tx(&mut *conn, conversation).await
    }

    pub async fn current_conversation_version(&self, conversation: &ConversationId) -> Result<u32> {
        let mut conn = self.store().pool.acquire().await?;
        Ok(version_of(&active_key_row(&mut *conn, conversation).await?))
    }

    /// Every share currently held for `device`, oldest version first.
    pub async fn shares_for_device(&self, device: DeviceId) -> Result<Vec<DeviceKeyShare>> {
        let rows: Vec<DeviceKeyShareRow> = sqlx::query_as(
            "SELECT * FROM device_key_shares WHERE target_device_id = ? ORDER BY conversation_id, version",
        )
        .bind(device.as_text())
        .fetch_all(&self.store().pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(DeviceKeyShare {
                    conversation_id: ConversationId::from(row.conversation_id),
                    version: u32::try_from(row.version).unwrap_or(0),
                    sender_device: parse_device_id(&row.sender_device_id)?,
                    target_device: device,
                    sealed: SealedMessage::from_json(&row.sealed)?,
                })
            })
            .collect()
    }
}
