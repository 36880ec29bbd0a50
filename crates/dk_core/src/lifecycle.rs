//! Key Lifecycle Manager: scheduled signed-prekey rotation, identity key
//! rotation, one-time prekey replenishment, purging, and device revocation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use dk_crypto::identity::IdentityKeyPair;
use dk_proto::{ConversationId, DeviceId};

use crate::audit::{self, RevocationEntry, RotationEntry};
use crate::error::{KeyError, Result};
use crate::fanout::{self, PreparedKey};
use crate::locks::{conversation_key, session_key};
use crate::prekeys::{active_signed_prekey, count_available, store_one_time_prekeys, store_signed_prekey};
use crate::registry::{capabilities_of, fetch_device, fetch_local_device, parse_device_id, trust_of};
use crate::retry::retry_transient;
use crate::service::{columns, KeyEvent, KeyService};
use crate::session::invalidate_sessions_in_tx;
use crate::types::{PurgeReport, RevocationOutcome, RotationKind, RotationPassReport, TrustState};

async fn local_live_devices(conn: &mut SqliteConnection) -> Result<Vec<DeviceId>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM devices WHERE is_local = 1 AND trust_state NOT IN ('compromised', 'revoked') ORDER BY created_at, id",
    )
    .fetch_all(&mut *conn)
    .await?;
    ids.iter().map(|id| parse_device_id(id)).collect()
}

async fn has_active_key(conn: &mut SqliteConnection, conversation: &ConversationId) -> Result<bool> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_keys WHERE conversation_id = ? AND status = 'active'")
        .bind(conversation.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(n > 0)
}

/// How one conversation is re-keyed when a member is revoked.
struct RekeyPlan {
    conversation: ConversationId,
    /// Membership observed while planning, revoked device included.
    members: Vec<DeviceId>,
    /// `None` when no local trusted member remains to send the new key.
    sender: Option<DeviceId>,
    ready: Vec<DeviceId>,
    skipped: Vec<DeviceId>,
    key: Option<PreparedKey>,
}

enum RevokeAttempt {
    Done(RevocationOutcome),
    AlreadyRevoked,
    MembershipChanged,
}

impl KeyService {
    /// Give every local device whose active signed prekey has reached the
    /// rotation interval a fresh one. The retired prekey keeps answering
    /// handshakes for the grace period.
    pub async fn rotate_signed_prekeys(&self, now: DateTime<Utc>) -> Result<Vec<DeviceId>> {
        let interval = self.config().signed_prekey_rotation();
        let due = {
            let mut conn = self.store().pool.acquire().await?;
            let mut due = Vec::new();
            for device in local_live_devices(&mut *conn).await? {
                match active_signed_prekey(&mut *conn, device).await? {
                    Some(spk) if spk.activated_at + interval > now => {}
                    current => due.push((device, current.map(|s| s.id))),
                }
            }
            due
        };

        let mut rotated = Vec::new();
        for (device, old_id) in due {
            let (generation, spk) = {
                let mut conn = self.store().pool.acquire().await?;
                let row = fetch_local_device(&mut *conn, device).await?;
                let (identity_row, identity) = self.local_identity(&mut *conn, device).await?;
                let spk = self.prepare_signed_prekey(&identity, &capabilities_of(&row)?).await?;
                (identity_row.generation, spk)
            };

            let svc = self;
            let (spk_ref, old_ref) = (&spk, old_id.as_deref());
            let swapped = retry_transient(self.retries(), "rotate_signed_prekeys", move || async move {
                let mut tx = svc.store().begin().await?;
                let current = active_signed_prekey(&mut *tx, device).await?;
                if current.as_ref().map(|s| s.id.as_str()) != old_ref {
                    // Rotated concurrently.
                    return Ok(false);
                }
                let retired = store_signed_prekey(&mut *tx, device, generation, spk_ref, now, interval).await?;
                audit::append_rotation(
                    &mut *tx,
                    RotationEntry {
                        kind: RotationKind::SignedPrekey,
                        device_id: Some(device),
                        conversation_id: None,
                        old_ref: retired,
                        new_ref: Some(spk_ref.id.clone()),
                        reason: "scheduled",
                    },
                )
                .await?;
                tx.commit().await?;
                Ok(true)
            })
            .await?;

            if swapped {
                tracing::info!(event = "signed_prekey_rotated", device = %device, prekey = %spk.id);
                rotated.push(device);
            }
        }
        Ok(rotated)
    }

    /// Replace a local device's identity key. The old key stays on record
    /// (public half only), a signed prekey is issued under the new key and
    /// every session referencing the device is invalidated. Returns the new
    /// generation.
    pub async fn rotate_identity_key(&self, device: DeviceId, reason: &str) -> Result<u32> {
        let capabilities = {
            let mut conn = self.store().pool.acquire().await?;
            let row = fetch_local_device(&mut *conn, device).await?;
            if trust_of(&row)?.is_cut_off() {
                return Err(KeyError::RecipientUnavailable(device));
            }
            capabilities_of(&row)?
        };
        let identity = IdentityKeyPair::generate();
        let secret_enc = self
            .store()
            .encrypt_value(columns::IDENTITY_SECRET, identity.secret_bytes())
            .await?;
        let spk = self.prepare_signed_prekey(&identity, &capabilities).await?;

        let svc = self;
        let (identity_ref, secret_enc, spk_ref) = (&identity, secret_enc.as_str(), &spk);
        let (generation, invalidated) = retry_transient(self.retries(), "rotate_identity_key", move || async move {
            let mut tx = svc.store().begin().await?;
            let row = fetch_local_device(&mut *tx, device).await?;
            if trust_of(&row)?.is_cut_off() {
                return Err(KeyError::RecipientUnavailable(device));
            }
            let old_generation = row.generation;
            let generation = old_generation + 1;
            let now = Utc::now();

            sqlx::query("UPDATE identity_keys SET retired_at = ?, secret_enc = NULL WHERE device_id = ? AND retired_at IS NULL")
                .bind(now)
                .bind(device.as_text())
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO identity_keys (id, device_id, generation, public_key, fingerprint, secret_enc, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(device.as_text())
            .bind(generation)
            .bind(identity_ref.public.to_b64())
            .bind(identity_ref.fingerprint())
            .bind(secret_enc)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE devices SET generation = ?, updated_at = ? WHERE id = ?")
                .bind(generation)
                .bind(now)
                .bind(device.as_text())
                .execute(&mut *tx)
                .await?;

            store_signed_prekey(&mut *tx, device, generation, spk_ref, now, svc.config().signed_prekey_rotation()).await?;
            let invalidated = invalidate_sessions_in_tx(&mut *tx, device, reason).await?;
            audit::append_rotation(
                &mut *tx,
                RotationEntry {
                    kind: RotationKind::IdentityKey,
                    device_id: Some(device),
                    conversation_id: None,
                    old_ref: Some(format!("g{old_generation}")),
                    new_ref: Some(format!("g{generation}")),
                    reason,
                },
            )
            .await?;
            tx.commit().await?;
            Ok((generation, invalidated))
        })
        .await?;

        tracing::warn!(
            event = "identity_key_rotated",
            device = %device,
            generation,
            fingerprint = %identity.fingerprint(),
            sessions_invalidated = invalidated,
            reason,
        );
        if invalidated > 0 {
            self.emit(KeyEvent::SessionsInvalidated { device_id: device, count: invalidated });
        }
        Ok(u32::try_from(generation).unwrap_or(u32::MAX))
    }

    /// Top a local device's one-time prekey pool up to the batch size when it
    /// is below the low watermark. Returns how many keys were added.
    pub async fn replenish_one_time_prekeys(&self, device: DeviceId) -> Result<u64> {
        let batch = u64::from(self.config().one_time_prekey_batch);
        let watermark = u64::from(self.config().one_time_prekey_low_watermark);
        let available = {
            let mut conn = self.store().pool.acquire().await?;
            let row = fetch_local_device(&mut *conn, device).await?;
            if trust_of(&row)?.is_cut_off() {
                return Err(KeyError::RecipientUnavailable(device));
            }
            count_available(&mut *conn, device).await?
        };
        if available >= watermark || available >= batch {
            return Ok(0);
        }
        let prepared = self.prepare_one_time_prekeys((batch - available) as usize).await?;

        let svc = self;
        let prepared_ref = prepared.as_slice();
        let added = retry_transient(self.retries(), "replenish_one_time_prekeys", move || async move {
            let mut tx = svc.store().begin().await?;
            let available = count_available(&mut *tx, device).await?;
            if available >= watermark || available >= batch {
                return Ok(0);
            }
            let take = ((batch - available) as usize).min(prepared_ref.len());
            let added = store_one_time_prekeys(&mut *tx, device, &prepared_ref[..take], Utc::now()).await?;
            audit::append_rotation(
                &mut *tx,
                RotationEntry {
                    kind: RotationKind::OneTimePrekeys,
                    device_id: Some(device),
                    conversation_id: None,
                    old_ref: Some(available.to_string()),
                    new_ref: Some((available + added).to_string()),
                    reason: "replenished",
                },
            )
            .await?;
            tx.commit().await?;
            Ok(added)
        })
        .await?;

        if added > 0 {
            tracing::info!(event = "one_time_prekeys_replenished", device = %device, added, available_before = available);
        }
        Ok(added)
    }

    /// Delete retired signed prekeys and used one-time prekeys once the grace
    /// period has passed.
    pub async fn purge_expired_prekeys(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let cutoff = now - self.config().signed_prekey_grace();

        let svc = self;
        let report = retry_transient(self.retries(), "purge_expired_prekeys", move || async move {
            let mut tx = svc.store().begin().await?;
            let mut report = PurgeReport::default();

            let retired: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
                "SELECT id, retired_at FROM signed_prekeys WHERE is_active = 0 AND retired_at IS NOT NULL",
            )
            .fetch_all(&mut *tx)
            .await?;
            for (id, retired_at) in retired {
                if retired_at <= cutoff {
                    sqlx::query("DELETE FROM signed_prekeys WHERE id = ?").bind(&id).execute(&mut *tx).await?;
                    report.signed_prekeys += 1;
                }
            }

            let used: Vec<(String, DateTime<Utc>)> =
                sqlx::query_as("SELECT id, used_at FROM one_time_prekeys WHERE used_at IS NOT NULL")
                    .fetch_all(&mut *tx)
                    .await?;
            for (id, used_at) in used {
                if used_at <= cutoff {
                    sqlx::query("DELETE FROM one_time_prekeys WHERE id = ?").bind(&id).execute(&mut *tx).await?;
                    report.one_time_prekeys += 1;
                }
            }

            tx.commit().await?;
            Ok(report)
        })
        .await?;

        if report.signed_prekeys + report.one_time_prekeys > 0 {
            tracing::info!(
                event = "prekeys_purged",
                signed_prekeys = report.signed_prekeys,
                one_time_prekeys = report.one_time_prekeys,
            );
        }
        Ok(report)
    }

    /// Revoke a device in one unit of work: trust state `revoked`, every
    /// session referencing it invalidated, every share addressed to it
    /// deleted, removal from every conversation and a key rotation for each,
    /// and one revocation record.
    ///
    /// Revoking an already revoked device succeeds with `already_revoked`
    /// set and writes nothing.
    pub async fn revoke_device(&self, device: DeviceId, reason: &str) -> Result<RevocationOutcome> {
        loop {
            let (trust, conversations) = {
                let mut conn = self.store().pool.acquire().await?;
                let trust = trust_of(&fetch_device(&mut *conn, device).await?)?;
                (trust, fanout::conversations_of(&mut *conn, device).await?)
            };
            if trust == TrustState::Revoked {
                return Ok(already_revoked(device));
            }

            let mut locks = self.locks().acquire(conversations.iter().map(conversation_key)).await;
            let mut plans = self.plan_rekeys(device, &conversations).await?;
            let pairs: Vec<_> = plans
                .iter()
                .filter_map(|p| p.sender.map(|s| (s, &p.members)))
                .flat_map(|(s, members)| members.iter().map(move |&m| session_key(s, m)))
                .collect();
            self.locks().extend(&mut locks, pairs).await;
            for plan in plans.iter_mut() {
                let Some(sender) = plan.sender else { continue };
                let targets: Vec<DeviceId> = plan.members.iter().copied().filter(|&m| m != device).collect();
                let (ready, skipped) = self.prepare_fanout(sender, &targets).await?;
                plan.ready = ready;
                plan.skipped = skipped;
                plan.key = Some(self.prepare_key().await?);
            }

            let svc = self;
            let (plans_ref, conversations_ref) = (plans.as_slice(), conversations.as_slice());
            let attempt = retry_transient(self.retries(), "revoke_device", move || async move {
                let mut tx = svc.store().begin().await?;
                let attempt = svc.revoke_in_tx(&mut *tx, device, reason, conversations_ref, plans_ref).await?;
                if matches!(attempt, RevokeAttempt::Done(_)) {
                    tx.commit().await?;
                }
                Ok(attempt)
            })
            .await?;
            drop(locks);

            match attempt {
                RevokeAttempt::Done(outcome) => {
                    tracing::warn!(
                        event = "device_revoked",
                        device = %device,
                        reason,
                        sessions_invalidated = outcome.sessions_invalidated,
                        shares_deleted = outcome.shares_deleted,
                        conversations_rotated = outcome.conversations_rotated.len(),
                    );
                    self.emit(KeyEvent::DeviceRevoked { device_id: device });
                    if outcome.sessions_invalidated > 0 {
                        self.emit(KeyEvent::SessionsInvalidated {
                            device_id: device,
                            count: outcome.sessions_invalidated,
                        });
                    }
                    return Ok(outcome);
                }
                RevokeAttempt::AlreadyRevoked => return Ok(already_revoked(device)),
                RevokeAttempt::MembershipChanged => {
                    tracing::debug!(device = %device, "conversation membership changed during revocation; replanning");
                }
            }
        }
    }

    async fn plan_rekeys(&self, device: DeviceId, conversations: &[ConversationId]) -> Result<Vec<RekeyPlan>> {
        let mut conn = self.store().pool.acquire().await?;
        let mut plans = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let members = fanout::participants_in_tx(&mut *conn, conversation).await?;
            let mut sender = None;
            if has_active_key(&mut *conn, conversation).await? {
                for &member in &members {
                    if member == device {
                        continue;
                    }
                    let row = fetch_device(&mut *conn, member).await?;
                    if row.is_local && trust_of(&row)? == TrustState::Trusted {
                        sender = Some(member);
                        break;
                    }
                }
            }
            if sender.is_none() {
                tracing::warn!(conversation = %conversation, device = %device, "no local member can re-key conversation; membership removal only");
            }
            plans.push(RekeyPlan {
                conversation: conversation.clone(),
                members,
                sender,
                ready: Vec::new(),
                skipped: Vec::new(),
                key: None,
            });
        }
        Ok(plans)
    }

    async fn revoke_in_tx(
        &self,
        conn: &mut SqliteConnection,
        device: DeviceId,
        reason: &str,
        conversations: &[ConversationId],
        plans: &[RekeyPlan],
    ) -> Result<RevokeAttempt> {
        if trust_of(&fetch_device(conn, device).await?)? == TrustState::Revoked {
            return Ok(RevokeAttempt::AlreadyRevoked);
        }
        let planned: BTreeSet<ConversationId> = conversations.iter().cloned().collect();
        let current: BTreeSet<ConversationId> = fanout::conversations_of(conn, device).await?.into_iter().collect();
        if current != planned {
            return Ok(RevokeAttempt::MembershipChanged);
        }
        for plan in plans {
            if fanout::participants_in_tx(conn, &plan.conversation).await? != plan.members {
                return Ok(RevokeAttempt::MembershipChanged);
            }
        }

        sqlx::query("UPDATE devices SET trust_state = 'revoked', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(device.as_text())
            .execute(&mut *conn)
            .await?;
        let sessions_invalidated = invalidate_sessions_in_tx(conn, device, reason).await?;
        let shares_deleted = fanout::delete_shares_for_device(conn, device).await?;
        sqlx::query("DELETE FROM conversation_participants WHERE device_id = ?")
            .bind(device.as_text())
            .execute(&mut *conn)
            .await?;

        let mut conversations_rotated = Vec::new();
        for plan in plans {
            let (Some(sender), Some(key)) = (plan.sender, plan.key.as_ref()) else { continue };
            let result = self
                .rotate_in_tx(conn, &plan.conversation, sender, &plan.ready, key, "member revoked")
                .await?;
            tracing::info!(
                event = "conversation_key_rotated",
                conversation = %plan.conversation,
                version = result.version,
                shares = result.shares.len(),
                skipped = result.skipped.len() + plan.skipped.len(),
            );
            conversations_rotated.push((plan.conversation.clone(), result.version));
        }

        audit::append_revocation(
            conn,
            RevocationEntry {
                device_id: device,
                reason,
                sessions_invalidated,
                shares_deleted,
                conversations_rotated: conversations_rotated.len() as u64,
            },
        )
        .await?;

        Ok(RevokeAttempt::Done(RevocationOutcome {
            device_id: device,
            already_revoked: false,
            sessions_invalidated,
            shares_deleted,
            conversations_rotated,
        }))
    }

    /// One pass of the periodic maintenance: signed prekey rotation,
    /// one-time prekey replenishment for every local device, then purge.
    pub async fn run_rotation_pass(&self, now: DateTime<Utc>) -> Result<RotationPassReport> {
        let signed_prekeys_rotated = self.rotate_signed_prekeys(now).await?;

        let devices = {
            let mut conn = self.store().pool.acquire().await?;
            local_live_devices(&mut *conn).await?
        };
        let mut one_time_prekeys_added = 0;
        for device in devices {
            match self.replenish_one_time_prekeys(device).await {
                Ok(added) => one_time_prekeys_added += added,
                // Revoked between the listing and the replenish.
                Err(KeyError::RecipientUnavailable(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let purged = self.purge_expired_prekeys(now).await?;
        let report = RotationPassReport { signed_prekeys_rotated, one_time_prekeys_added, purged };
        tracing::info!(
            event = "rotation_pass",
            signed_prekeys_rotated = report.signed_prekeys_rotated.len(),
            one_time_prekeys_added = report.one_time_prekeys_added,
            signed_prekeys_purged = report.purged.signed_prekeys,
            one_time_prekeys_purged = report.purged.one_time_prekeys,
        );
        Ok(report)
    }
}

fn already_revoked(device: DeviceId) -> RevocationOutcome {
    tracing::debug!(device = %device, "device already revoked");
    RevocationOutcome {
        device_id: device,
        already_revoked: true,
        sessions_invalidated: 0,
        shares_deleted: 0,
        conversations_rotated: Vec::new(),
    }
}
