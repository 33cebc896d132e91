use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use common::api::ClusterNetworkSpec;

use super::Db;
use crate::Result;

/// The single cluster-wide network document plus its generation.
#[derive(Debug, Clone, FromRow)]
pub struct NetworkRecord {
    #[sqlx(rename = "spec_json")]
    pub spec: Json<ClusterNetworkSpec>,
    pub generation: i64,
    pub updated_at: DateTime<Utc>,
}

pub async fn get_network(pool: &Db) -> Result<Option<NetworkRecord>> {
    let record = sqlx::query_as::<_, NetworkRecord>(
        "SELECT spec_json, generation, updated_at FROM cluster_network WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Store the network document and bump the generation counter in one
/// statement, so concurrent writers serialize through SQLite and every
/// accepted write gets a distinct generation. `RETURNING` hands back
/// the row this statement produced, not whatever a later writer left.
pub async fn set_network(
    pool: &Db,
    spec: &ClusterNetworkSpec,
    now: DateTime<Utc>,
) -> Result<NetworkRecord> {
    let record = sqlx::query_as::<_, NetworkRecord>(
        "INSERT INTO cluster_network (id, spec_json, generation, updated_at) \
         VALUES (1, ?1, 1, ?2) \
         ON CONFLICT(id) DO UPDATE SET \
           spec_json = excluded.spec_json, \
           generation = cluster_network.generation + 1, \
           updated_at = excluded.updated_at \
         RETURNING spec_json, generation, updated_at",
    )
    .bind(Json(spec))
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(record)
}
