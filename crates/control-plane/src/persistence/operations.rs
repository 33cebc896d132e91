use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct OperationRecord {
    pub id: Uuid,
    pub node_id: Uuid,
    pub kind: String,
    pub phase: String,
    pub percent: i64,
    pub message: String,
    pub error: String,
    pub plan_hash: String,
    pub generation: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOperation {
    pub id: Uuid,
    pub node_id: Uuid,
    pub kind: String,
    pub message: String,
    pub plan_hash: String,
    pub generation: i64,
}

const OP_COLUMNS: &str =
    "id, node_id, kind, phase, percent, message, error, plan_hash, generation, \
     created_at, updated_at";

pub async fn insert_operation(
    pool: &Db,
    op: NewOperation,
    now: DateTime<Utc>,
) -> Result<OperationRecord> {
    sqlx::query(
        "INSERT INTO operations \
         (id, node_id, kind, phase, percent, message, error, plan_hash, generation, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'queued', 0, ?4, '', ?5, ?6, ?7, ?7)",
    )
    .bind(op.id)
    .bind(op.node_id)
    .bind(&op.kind)
    .bind(&op.message)
    .bind(&op.plan_hash)
    .bind(op.generation)
    .bind(now)
    .execute(pool)
    .await?;

    get_operation(pool, op.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("operation {} vanished after insert", op.id))
}

pub async fn get_operation(pool: &Db, id: Uuid) -> Result<Option<OperationRecord>> {
    let record = sqlx::query_as::<_, OperationRecord>(&format!(
        "SELECT {OP_COLUMNS} FROM operations WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_operations(
    pool: &Db,
    node_id: Option<Uuid>,
    limit: i64,
) -> Result<Vec<OperationRecord>> {
    let records = match node_id {
        Some(node_id) => {
            sqlx::query_as::<_, OperationRecord>(&format!(
                "SELECT {OP_COLUMNS} FROM operations WHERE node_id = ?1 \
                 ORDER BY created_at DESC LIMIT ?2"
            ))
            .bind(node_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, OperationRecord>(&format!(
                "SELECT {OP_COLUMNS} FROM operations ORDER BY created_at DESC LIMIT ?1"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(records)
}

/// Operations that have not reached a terminal phase.
pub async fn live_operations(pool: &Db) -> Result<Vec<OperationRecord>> {
    let records = sqlx::query_as::<_, OperationRecord>(&format!(
        "SELECT {OP_COLUMNS} FROM operations WHERE phase IN ('queued', 'running') \
         ORDER BY created_at ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn live_operation_for_node(
    pool: &Db,
    node_id: Uuid,
) -> Result<Option<OperationRecord>> {
    let record = sqlx::query_as::<_, OperationRecord>(&format!(
        "SELECT {OP_COLUMNS} FROM operations \
         WHERE node_id = ?1 AND phase IN ('queued', 'running') \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(node_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn latest_operation_for_node(
    pool: &Db,
    node_id: Uuid,
) -> Result<Option<OperationRecord>> {
    let record = sqlx::query_as::<_, OperationRecord>(&format!(
        "SELECT {OP_COLUMNS} FROM operations WHERE node_id = ?1 \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(node_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Advance an operation's phase.
///
/// The CAS on non-terminal phases makes terminal states sticky, and
/// `MAX(percent, ...)` keeps reported progress monotonic even when a
/// late out-of-order update lands. Returns the updated record, or
/// `None` when the operation was already terminal (or unknown).
pub async fn transition(
    pool: &Db,
    id: Uuid,
    phase: &str,
    percent: i64,
    message: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<Option<OperationRecord>> {
    let result = sqlx::query(
        "UPDATE operations \
         SET phase = ?1, percent = MAX(percent, ?2), message = ?3, error = ?4, updated_at = ?5 \
         WHERE id = ?6 AND phase IN ('queued', 'running')",
    )
    .bind(phase)
    .bind(percent)
    .bind(message)
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() != 1 {
        return Ok(None);
    }
    get_operation(pool, id).await
}

/// Non-terminal operations whose last update is older than `cutoff`.
pub async fn overdue_operations(pool: &Db, cutoff: DateTime<Utc>) -> Result<Vec<OperationRecord>> {
    let records = sqlx::query_as::<_, OperationRecord>(&format!(
        "SELECT {OP_COLUMNS} FROM operations \
         WHERE phase IN ('queued', 'running') AND updated_at < ?1"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Drop terminal operations older than `cutoff`.
pub async fn delete_old_operations(pool: &Db, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM operations \
         WHERE phase IN ('succeeded', 'failed') AND updated_at < ?1",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
