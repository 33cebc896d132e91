use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use common::api::{NodeIdentity, NodeUnitStatus};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct NodeRecord {
    pub id: Uuid,
    #[sqlx(rename = "identity_json")]
    pub identity: Json<NodeIdentity>,
    pub status: String,
    #[sqlx(rename = "profiles_json")]
    pub profiles: Json<Vec<String>>,
    #[sqlx(rename = "metadata_json")]
    pub metadata: Json<BTreeMap<String, String>>,
    #[sqlx(rename = "units_json")]
    pub units: Option<Json<Vec<NodeUnitStatus>>>,
    pub agent_endpoint: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: String,
    pub last_plan_hash: String,
    pub applied_plan_hash: String,
    pub applied_generation: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub id: Uuid,
    pub identity: NodeIdentity,
    pub profiles: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

const NODE_COLUMNS: &str = "id, identity_json, status, profiles_json, metadata_json, units_json, \
     agent_endpoint, last_seen, last_error, last_plan_hash, applied_plan_hash, \
     applied_generation, created_at, updated_at";

pub async fn insert_node(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    node: &NewNode,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO nodes \
         (id, identity_json, status, profiles_json, metadata_json, agent_endpoint, \
          last_error, last_plan_hash, applied_plan_hash, applied_generation, created_at, updated_at) \
         VALUES (?1, ?2, 'unknown', ?3, ?4, '', '', '', '', 0, ?5, ?5)",
    )
    .bind(node.id)
    .bind(Json(&node.identity))
    .bind(Json(&node.profiles))
    .bind(Json(&node.metadata))
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_node(pool: &Db, id: Uuid) -> Result<Option<NodeRecord>> {
    let record =
        sqlx::query_as::<_, NodeRecord>(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(record)
}

pub async fn list_nodes(pool: &Db, include_removed: bool) -> Result<Vec<NodeRecord>> {
    let records = if include_removed {
        sqlx::query_as::<_, NodeRecord>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, NodeRecord>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE status != 'removed' ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await?
    };
    Ok(records)
}

/// Replace a node's profile assignment. Fails the CAS when the node is
/// gone or already removed.
pub async fn update_profiles(
    pool: &Db,
    id: Uuid,
    profiles: &[String],
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE nodes SET profiles_json = ?1, updated_at = ?2 \
         WHERE id = ?3 AND status != 'removed'",
    )
    .bind(Json(profiles))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_status(pool: &Db, id: Uuid, status: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status != 'removed'",
    )
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Fold an accepted status report into the registry record.
///
/// The `last_seen` guard in the WHERE clause makes replays and
/// out-of-order reports no-ops even when two reports race.
#[allow(clippy::too_many_arguments)]
pub async fn record_report(
    pool: &Db,
    id: Uuid,
    identity: &NodeIdentity,
    units: &[NodeUnitStatus],
    status: &str,
    last_error: &str,
    agent_endpoint: &str,
    reported_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE nodes SET identity_json = ?1, units_json = ?2, status = ?3, last_error = ?4, \
         agent_endpoint = ?5, last_seen = ?6, updated_at = ?7 \
         WHERE id = ?8 AND status != 'removed' \
           AND (last_seen IS NULL OR last_seen < ?6)",
    )
    .bind(Json(identity))
    .bind(Json(units))
    .bind(status)
    .bind(last_error)
    .bind(agent_endpoint)
    .bind(reported_at)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record the plan hash most recently dispatched to a node.
pub async fn set_desired_plan_hash(
    pool: &Db,
    id: Uuid,
    plan_hash: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE nodes SET last_plan_hash = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(plan_hash)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a successful apply: the node is now at this plan/generation.
pub async fn record_applied(
    pool: &Db,
    id: Uuid,
    plan_hash: &str,
    generation: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE nodes SET applied_plan_hash = ?1, applied_generation = ?2, updated_at = ?3 \
         WHERE id = ?4",
    )
    .bind(plan_hash)
    .bind(generation)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal removal. The row stays so the id is never reused.
pub async fn mark_removed(pool: &Db, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE nodes SET status = 'removed', updated_at = ?1 \
         WHERE id = ?2 AND status != 'removed'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Demote nodes that stopped reporting to `unknown`. Draining and
/// removed nodes keep their status.
pub async fn mark_stale_unknown(pool: &Db, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes SET status = 'unknown', updated_at = ?1 \
         WHERE status IN ('healthy', 'unhealthy') \
           AND (last_seen IS NULL OR last_seen < ?2)",
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
