//! Append-only audit of key rotations and revocations.
//!
//! Each table is its own hash chain: `hash = chain_link(prev_hash, kind,
//! canonical JSON of the record)`, starting from `CHAIN_START`. SQL triggers
//! reject UPDATE and DELETE; `verify_audit_chain` recomputes every link.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use uuid::Uuid;

use dk_crypto::hash::{self, CHAIN_START};
use dk_proto::{ConversationId, DeviceId};
use dk_store::models::{KeyRotationRecordRow, RevocationRecordRow};

use crate::error::{KeyError, Result};
use crate::service::KeyService;
use crate::types::RotationKind;

const ROTATION_TABLE: &str = "key_rotation_records";
const REVOCATION_TABLE: &str = "revocation_records";

#[derive(Debug, Clone, Serialize)]
pub struct RotationRecord {
    pub seq: i64,
    pub id: String,
    pub kind: RotationKind,
    pub device_id: Option<String>,
    pub conversation_id: Option<String>,
    pub old_ref: Option<String>,
    pub new_ref: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevocationRecord {
    pub seq: i64,
    pub id: String,
    pub device_id: String,
    pub reason: String,
    pub sessions_invalidated: u64,
    pub shares_deleted: u64,
    pub conversations_rotated: u64,
    pub created_at: DateTime<Utc>,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub rotation_records: usize,
    pub revocation_records: usize,
}

// ── Canonical payloads ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct RotationPayload<'a> {
    id: &'a str,
    kind: &'a str,
    device_id: Option<&'a str>,
    conversation_id: Option<&'a str>,
    old_ref: Option<&'a str>,
    new_ref: Option<&'a str>,
    reason: &'a str,
    created_at_ms: i64,
}

impl<'a> RotationPayload<'a> {
    fn of(row: &'a KeyRotationRecordRow) -> Self {
        Self {
            id: &row.id,
            kind: &row.kind,
            device_id: row.device_id.as_deref(),
            conversation_id: row.conversation_id.as_deref(),
            old_ref: row.old_ref.as_deref(),
            new_ref: row.new_ref.as_deref(),
            reason: &row.reason,
            created_at_ms: row.created_at.timestamp_millis(),
        }
    }
}

#[derive(Serialize)]
struct RevocationPayload<'a> {
    id: &'a str,
    device_id: &'a str,
    reason: &'a str,
    sessions_invalidated: i64,
    shares_deleted: i64,
    conversations_rotated: i64,
    created_at_ms: i64,
}

impl<'a> RevocationPayload<'a> {
    fn of(row: &'a RevocationRecordRow) -> Self {
        Self {
            id: &row.id,
            device_id: &row.device_id,
            reason: &row.reason,
            sessions_invalidated: row.sessions_invalidated,
            shares_deleted: row.shares_deleted,
            conversations_rotated: row.conversations_rotated,
            created_at_ms: row.created_at.timestamp_millis(),
        }
    }
}

fn rotation_hash(prev: &str, row: &KeyRotationRecordRow) -> Result<String> {
    let payload = serde_json::to_vec(&RotationPayload::of(row))?;
    Ok(hash::chain_link(prev, ROTATION_TABLE, &payload))
}

fn revocation_hash(prev: &str, row: &RevocationRecordRow) -> Result<String> {
    let payload = serde_json::to_vec(&RevocationPayload::of(row))?;
    Ok(hash::chain_link(prev, REVOCATION_TABLE, &payload))
}

async fn chain_head(conn: &mut SqliteConnection, table: &str) -> Result<String> {
    let sql = format!("SELECT hash FROM {table} ORDER BY seq DESC LIMIT 1");
    let head: Option<String> = sqlx::query_scalar(&sql).fetch_optional(&mut *conn).await?;
    Ok(head.unwrap_or_else(|| CHAIN_START.to_string()))
}

// ── Writers (inside the caller's transaction) ────────────────────────────────

pub(crate) struct RotationEntry<'a> {
    pub kind: RotationKind,
    pub device_id: Option<DeviceId>,
    pub conversation_id: Option<&'a ConversationId>,
    pub old_ref: Option<String>,
    pub new_ref: Option<String>,
    pub reason: &'a str,
}

pub(crate) async fn append_rotation(conn: &mut SqliteConnection, entry: RotationEntry<'_>) -> Result<String> {
    let prev_hash = chain_head(conn, ROTATION_TABLE).await?;
    let mut row = KeyRotationRecordRow {
        seq: 0,
        id: Uuid::new_v4().to_string(),
        kind: entry.kind.as_str().to_string(),
        device_id: entry.device_id.map(|d| d.as_text()),
        conversation_id: entry.conversation_id.map(|c| c.0.clone()),
        old_ref: entry.old_ref,
        new_ref: entry.new_ref,
        reason: entry.reason.to_string(),
        created_at: Utc::now(),
        prev_hash,
        hash: String::new(),
    };
    row.hash = rotation_hash(&row.prev_hash, &row)?;

    sqlx::query(
        "INSERT INTO key_rotation_records (id, kind, device_id, conversation_id, old_ref, new_ref, reason, created_at, prev_hash, hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&row.kind)
    .bind(&row.device_id)
    .bind(&row.conversation_id)
    .bind(&row.old_ref)
    .bind(&row.new_ref)
    .bind(&row.reason)
    .bind(row.created_at)
    .bind(&row.prev_hash)
    .bind(&row.hash)
    .execute(&mut *conn)
    .await?;

    tracing::info!(event = "key_rotated", kind = %entry.kind, record = %row.id, reason = %row.reason);
    Ok(row.id)
}

pub(crate) struct RevocationEntry<'a> {
    pub device_id: DeviceId,
    pub reason: &'a str,
    pub sessions_invalidated: u64,
    pub shares_deleted: u64,
    pub conversations_rotated: u64,
}

pub(crate) async fn append_revocation(conn: &mut SqliteConnection, entry: RevocationEntry<'_>) -> Result<String> {
    let prev_hash = chain_head(conn, REVOCATION_TABLE).await?;
    let mut row = RevocationRecordRow {
        seq: 0,
        id: Uuid::new_v4().to_string(),
        device_id: entry.device_id.as_text(),
        reason: entry.reason.to_string(),
        sessions_invalidated: to_i64(entry.sessions_invalidated),
        shares_deleted: to_i64(entry.shares_deleted),
        conversations_rotated: to_i64(entry.conversations_rotated),
        created_at: Utc::now(),
        prev_hash,
        hash: String::new(),
    };
    row.hash = revocation_hash(&row.prev_hash, &row)?;

    sqlx::query(
        "INSERT INTO revocation_records (id, device_id, reason, sessions_invalidated, shares_deleted, conversations_rotated, created_at, prev_hash, hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&row.device_id)
    .bind(&row.reason)
    .bind(row.sessions_invalidated)
    .bind(row.shares_deleted)
    .bind(row.conversations_rotated)
    .bind(row.created_at)
    .bind(&row.prev_hash)
    .bind(&row.hash)
    .execute(&mut *conn)
    .await?;
    Ok(row.id)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ── Queries ──────────────────────────────────────────────────────────────────

impl KeyService {
    /// Rotation records, oldest first; optionally only those for one device.
    pub async fn rotation_records(&self, device: Option<DeviceId>) -> Result<Vec<RotationRecord>> {
        let rows: Vec<KeyRotationRecordRow> = match device {
            Some(d) => {
                sqlx::query_as("SELECT * FROM key_rotation_records WHERE device_id = ? ORDER BY seq")
                    .bind(d.as_text())
                    .fetch_all(&self.store().pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM key_rotation_records ORDER BY seq")
                    .fetch_all(&self.store().pool)
                    .await?
            }
        };
        rows.into_iter()
            .map(|r| {
                Ok(RotationRecord {
                    seq: r.seq,
                    kind: r.kind.parse()?,
                    id: r.id,
                    device_id: r.device_id,
                    conversation_id: r.conversation_id,
                    old_ref: r.old_ref,
                    new_ref: r.new_ref,
                    reason: r.reason,
                    created_at: r.created_at,
                    hash: r.hash,
                })
            })
            .collect()
    }

    pub async fn revocation_records(&self) -> Result<Vec<RevocationRecord>> {
        let rows: Vec<RevocationRecordRow> = sqlx::query_as("SELECT * FROM revocation_records ORDER BY seq")
            .fetch_all(&self.store().pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RevocationRecord {
                seq: r.seq,
                id: r.id,
                device_id: r.device_id,
                reason: r.reason,
                sessions_invalidated: r.sessions_invalidated.max(0) as u64,
                shares_deleted: r.shares_deleted.max(0) as u64,
                conversations_rotated: r.conversations_rotated.max(0) as u64,
                created_at: r.created_at,
                hash: r.hash,
            })
            .collect())
    }

    /// Recompute both hash chains. Fails at the first broken link.
    pub async fn verify_audit_chain(&self) -> Result<AuditReport> {
        let rotations: Vec<KeyRotationRecordRow> = sqlx::query_as("SELECT * FROM key_rotation_records ORDER BY seq")
            .fetch_all(&self.store().pool)
            .await?;
        let mut prev = CHAIN_START.to_string();
        for row in &rotations {
            if row.prev_hash != prev || rotation_hash(&prev, row)? != row.hash {
                tracing::error!(security_event = true, table = ROTATION_TABLE, seq = row.seq, "audit chain broken");
                return Err(KeyError::AuditChainBroken { table: ROTATION_TABLE, seq: row.seq });
            }
            prev = row.hash.clone();
        }

        let revocations: Vec<RevocationRecordRow> = sqlx::query_as("SELECT * FROM revocation_records ORDER BY seq")
            .fetch_all(&self.store().pool)
            .await?;
        let mut prev = CHAIN_START.to_string();
        for row in &revocations {
            if row.prev_hash != prev || revocation_hash(&prev, row)? != row.hash {
                tracing::error!(security_event = true, table = REVOCATION_TABLE, seq = row.seq, "audit chain broken");
                return Err(KeyError::AuditChainBroken { table: REVOCATION_TABLE, seq: row.seq });
            }
            prev = row.hash.clone();
        }

        Ok(AuditReport {
            rotation_records: rotations.len(),
            revocation_records: revocations.len(),
        })
    }
}
