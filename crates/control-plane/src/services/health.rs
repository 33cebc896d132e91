//! Cluster health rollup, computed at read time from the registry, the
//! operation log, and the current desired plans. Nothing here is stored.

use std::collections::BTreeMap;

use chrono::Utc;

use common::api::{
    ArtifactKind, ClusterHealth, ClusterStatus, HealthBucket, NodeHealth, NodeHealthStatus,
    OperationKind, OperationPhase, ServiceSummary,
};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{network, nodes, operations, NodeRecord};
use crate::services::plans;

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct ClusterHealthRequest {
    /// Also compute per-service rollout summaries.
    #[serde(default)]
    pub include_services: bool,
}

pub async fn get_cluster_health(
    state: &AppState,
    req: ClusterHealthRequest,
) -> ApiResult<ClusterHealth> {
    let now = Utc::now();
    let staleness = state.health.staleness_threshold();
    let records = nodes::list_nodes(&state.db, false).await?;
    let desired_generation = network::get_network(&state.db)
        .await?
        .map(|n| n.generation)
        .unwrap_or(0);

    let mut node_lines = Vec::with_capacity(records.len());
    let mut healthy = 0_u32;
    let mut unhealthy = 0_u32;
    let mut unknown = 0_u32;
    let mut service_rollup: BTreeMap<String, ServiceSummary> = BTreeMap::new();

    for record in &records {
        let desired = plans::desired_plan(state, record).await?;
        let latest_op = operations::latest_operation_for_node(&state.db, record.id).await?;

        let stale = match record.last_seen {
            Some(last_seen) => now - last_seen > staleness,
            None => true,
        };
        let bucket = if stale {
            HealthBucket::Unknown
        } else {
            match record.status.as_str() {
                "healthy" => HealthBucket::Healthy,
                "unhealthy" => HealthBucket::Unhealthy,
                _ => HealthBucket::Unknown,
            }
        };
        match bucket {
            HealthBucket::Healthy => healthy += 1,
            HealthBucket::Unhealthy => unhealthy += 1,
            HealthBucket::Unknown => unknown += 1,
        }

        let converged = record.applied_plan_hash == desired.plan_id
            && record.applied_generation == desired.generation;
        let current_phase = latest_op
            .as_ref()
            .map(|op| op.phase.parse::<OperationPhase>())
            .transpose()
            .map_err(|err| AppError::internal(format!("corrupt operation record: {err}")))?;
        let upgrading = latest_op
            .as_ref()
            .map(|op| {
                op.kind == OperationKind::ApplyPlan.as_str()
                    && matches!(
                        op.phase.as_str(),
                        "queued" | "running"
                    )
            })
            .unwrap_or(false);

        if req.include_services {
            for artifact in &desired.artifacts {
                if artifact.kind != ArtifactKind::Service {
                    continue;
                }
                let entry = service_rollup
                    .entry(artifact.name.clone())
                    .or_insert_with(|| ServiceSummary {
                        service_name: artifact.name.clone(),
                        desired_version: artifact.version.clone(),
                        nodes_at_desired: 0,
                        nodes_total: 0,
                        upgrading: 0,
                    });
                entry.nodes_total += 1;
                entry.desired_version = artifact.version.clone();
                if converged {
                    entry.nodes_at_desired += 1;
                }
                if upgrading {
                    entry.upgrading += 1;
                }
            }
        }

        node_lines.push(NodeHealthStatus {
            node_id: record.id,
            hostname: record.identity.0.hostname.clone(),
            bucket,
            last_seen: record.last_seen,
            last_error: record.last_error.clone(),
            health: node_health(record, &desired, desired_generation, converged, current_phase),
        });
    }

    let status = overall_status(records.len(), healthy, unhealthy, unknown);

    Ok(ClusterHealth {
        status,
        total_nodes: records.len() as u32,
        healthy_nodes: healthy,
        unhealthy_nodes: unhealthy,
        unknown_nodes: unknown,
        nodes: node_lines,
        services: service_rollup.into_values().collect(),
    })
}

fn node_health(
    record: &NodeRecord,
    desired: &common::api::NodePlan,
    desired_generation: i64,
    converged: bool,
    current_phase: Option<OperationPhase>,
) -> NodeHealth {
    NodeHealth {
        node_id: record.id,
        desired_generation,
        applied_generation: record.applied_generation,
        desired_plan_hash: desired.plan_id.clone(),
        applied_plan_hash: record.applied_plan_hash.clone(),
        converged,
        current_plan_id: if record.last_plan_hash.is_empty() {
            desired.plan_id.clone()
        } else {
            record.last_plan_hash.clone()
        },
        current_phase,
        last_error: record.last_error.clone(),
    }
}

/// An empty cluster is unhealthy; a cluster with any failing or silent
/// node is degraded while healthy nodes remain, unhealthy otherwise.
fn overall_status(total: usize, healthy: u32, unhealthy: u32, unknown: u32) -> ClusterStatus {
    if total == 0 {
        return ClusterStatus::Unhealthy;
    }
    if unhealthy == 0 && unknown == 0 {
        return ClusterStatus::Healthy;
    }
    if healthy > 0 {
        ClusterStatus::Degraded
    } else {
        ClusterStatus::Unhealthy
    }
}
