//! Cluster network document: one spec per cluster, generation-counted.

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::info;

use common::api::ClusterNetworkSpec;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::network;
use crate::validation;

#[derive(Clone, Debug, serde::Serialize)]
pub struct ClusterNetworkView {
    pub spec: ClusterNetworkSpec,
    /// Monotonic counter, bumped on every accepted write.
    pub generation: i64,
    pub updated_at: DateTime<Utc>,
}

pub async fn get_cluster_network(state: &AppState) -> ApiResult<ClusterNetworkView> {
    let record = network::get_network(&state.db)
        .await?
        .ok_or_else(|| AppError::not_found("cluster network is not configured yet"))?;
    Ok(ClusterNetworkView {
        spec: record.spec.0,
        generation: record.generation,
        updated_at: record.updated_at,
    })
}

/// Replace the network document. Every accepted write bumps the
/// generation, which invalidates all compiled plans.
pub async fn set_cluster_network(
    state: &AppState,
    spec: ClusterNetworkSpec,
) -> ApiResult<ClusterNetworkView> {
    validation::validate_network_spec(&spec)?;

    let record = network::set_network(&state.db, &spec, Utc::now()).await?;
    state.plan_cache.clear();
    state.kick_reconcile();

    counter!("control_plane_network_updates_total").increment(1);
    info!(generation = record.generation, domain = %record.spec.0.cluster_domain, "cluster network updated");

    Ok(ClusterNetworkView {
        spec: record.spec.0,
        generation: record.generation,
        updated_at: record.updated_at,
    })
}
