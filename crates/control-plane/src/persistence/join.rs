use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use common::api::NodeIdentity;

use super::nodes::{self, NewNode};
use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct JoinTokenRecord {
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub max_uses: i64,
    pub uses: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct JoinRequestRecord {
    pub id: Uuid,
    pub token_hash: String,
    #[sqlx(rename = "identity_json")]
    pub identity: Json<NodeIdentity>,
    #[sqlx(rename = "metadata_json")]
    pub metadata: Json<BTreeMap<String, String>>,
    #[sqlx(rename = "profiles_json")]
    pub profiles: Json<Vec<String>>,
    pub status: String,
    pub message: String,
    pub node_id: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJoinRequest {
    pub id: Uuid,
    pub token_hash: String,
    pub identity: NodeIdentity,
    pub metadata: BTreeMap<String, String>,
    pub profiles: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

pub async fn insert_token(
    pool: &Db,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    max_uses: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO join_tokens (token_hash, expires_at, max_uses, uses, created_at) \
         VALUES (?1, ?2, ?3, 0, ?4)",
    )
    .bind(token_hash)
    .bind(expires_at)
    .bind(max_uses)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically consume one use of a token. Returns false when the token
/// is unknown, expired, or exhausted; the caller cannot tell which, and
/// deliberately reports all three the same way.
pub async fn consume_token(pool: &Db, token_hash: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE join_tokens SET uses = uses + 1 \
         WHERE token_hash = ?1 AND expires_at > ?2 AND uses < max_uses",
    )
    .bind(token_hash)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_token(pool: &Db, token_hash: &str) -> Result<Option<JoinTokenRecord>> {
    let record = sqlx::query_as::<_, JoinTokenRecord>(
        "SELECT token_hash, expires_at, max_uses, uses, created_at \
         FROM join_tokens WHERE token_hash = ?1",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

const REQUEST_COLUMNS: &str = "id, token_hash, identity_json, metadata_json, profiles_json, \
     status, message, node_id, requested_at, resolved_at";

pub async fn insert_request(pool: &Db, request: NewJoinRequest) -> Result<JoinRequestRecord> {
    sqlx::query(
        "INSERT INTO join_requests \
         (id, token_hash, identity_json, metadata_json, profiles_json, status, message, requested_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', '', ?6)",
    )
    .bind(request.id)
    .bind(&request.token_hash)
    .bind(Json(&request.identity))
    .bind(Json(&request.metadata))
    .bind(Json(&request.profiles))
    .bind(request.requested_at)
    .execute(pool)
    .await?;

    get_request(pool, request.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("join request {} vanished after insert", request.id))
}

pub async fn get_request(pool: &Db, id: Uuid) -> Result<Option<JoinRequestRecord>> {
    let record = sqlx::query_as::<_, JoinRequestRecord>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM join_requests WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_requests(pool: &Db, status: Option<&str>) -> Result<Vec<JoinRequestRecord>> {
    let records = match status {
        Some(status) => {
            sqlx::query_as::<_, JoinRequestRecord>(&format!(
                "SELECT {REQUEST_COLUMNS} FROM join_requests \
                 WHERE status = ?1 ORDER BY requested_at ASC"
            ))
            .bind(status)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, JoinRequestRecord>(&format!(
                "SELECT {REQUEST_COLUMNS} FROM join_requests ORDER BY requested_at ASC"
            ))
            .fetch_all(pool)
            .await?
        }
    };
    Ok(records)
}

/// Approve a pending request and create its node record in one
/// transaction. Returns `None` when the request does not exist or was
/// already resolved (the CAS on `status = 'pending'` lost).
pub async fn approve_request(
    pool: &Db,
    request_id: Uuid,
    node: NewNode,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Option<JoinRequestRecord>> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "UPDATE join_requests \
         SET status = 'approved', node_id = ?1, message = ?2, profiles_json = ?3, resolved_at = ?4 \
         WHERE id = ?5 AND status = 'pending'",
    )
    .bind(node.id)
    .bind(message)
    .bind(Json(&node.profiles))
    .bind(now)
    .bind(request_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(None);
    }

    nodes::insert_node(&mut *tx, &node, now).await?;
    tx.commit().await?;

    get_request(pool, request_id).await
}

/// Reject a pending request. Same CAS semantics as approval.
pub async fn reject_request(
    pool: &Db,
    request_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Option<JoinRequestRecord>> {
    let result = sqlx::query(
        "UPDATE join_requests \
         SET status = 'rejected', message = ?1, resolved_at = ?2 \
         WHERE id = ?3 AND status = 'pending'",
    )
    .bind(reason)
    .bind(now)
    .bind(request_id)
    .execute(pool)
    .await?;

    if result.rows_affected() != 1 {
        return Ok(None);
    }
    get_request(pool, request_id).await
}

/// Drop resolved requests older than `resolved_cutoff` and pending ones
/// older than `pending_cutoff`. Returns how many rows went away.
pub async fn delete_old_requests(
    pool: &Db,
    resolved_cutoff: DateTime<Utc>,
    pending_cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM join_requests \
         WHERE (status != 'pending' AND resolved_at < ?1) \
            OR (status = 'pending' AND requested_at < ?2)",
    )
    .bind(resolved_cutoff)
    .bind(pending_cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_expired_tokens(pool: &Db, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM join_tokens WHERE expires_at < ?1 OR uses >= max_uses")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
