//! Node registry: listing, profile assignment, status ingestion,
//! removal, and agent upgrades.

use std::str::FromStr;

use chrono::Utc;
use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use common::api::{
    NodeStatus, NodeStatusReport, NodeView, OperationKind, OperationPhase, UnitState,
};

use crate::app_state::AppState;
use crate::dispatch::{DispatchCommand, UpgradeSpec};
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, nodes, operations};
use crate::services::operations::{
    operation_view, publish_created, record_transition, OperationView,
};
use crate::services::plans;
use crate::validation;

pub async fn list_nodes(state: &AppState, include_removed: bool) -> ApiResult<Vec<NodeView>> {
    let records = nodes::list_nodes(&state.db, include_removed).await?;
    records.into_iter().map(node_view).collect()
}

pub async fn get_node(state: &AppState, node_id: Uuid) -> ApiResult<NodeView> {
    let record = nodes::get_node(&state.db, node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {node_id} not found")))?;
    node_view(record)
}

/// Replace a node's profile assignment.
pub async fn set_node_profiles(
    state: &AppState,
    node_id: Uuid,
    profiles: Vec<String>,
) -> ApiResult<NodeView> {
    validation::validate_profiles(&profiles, &state.limits)?;

    let record = nodes::get_node(&state.db, node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {node_id} not found")))?;
    if record.status == "removed" {
        return Err(AppError::failed_precondition(format!(
            "node {node_id} was removed"
        )));
    }

    if !nodes::update_profiles(&state.db, node_id, &profiles, Utc::now()).await? {
        return Err(AppError::failed_precondition(format!(
            "node {node_id} was removed concurrently"
        )));
    }

    state.plan_cache.invalidate_node(node_id);
    state.kick_reconcile();
    info!(node_id = %node_id, ?profiles, "node profiles updated");

    let updated = nodes::get_node(&state.db, node_id)
        .await?
        .ok_or_else(|| AppError::internal("node vanished after profile update"))?;
    node_view(updated)
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ReportOutcome {
    /// False when the report was older than what the registry already
    /// holds and was discarded.
    pub accepted: bool,
    /// Hash of the plan the control plane currently wants on the node.
    /// Agents compare against what they last applied.
    pub desired_plan_hash: String,
}

/// Ingest a periodic agent status report.
///
/// Kept deliberately cheap: the report is folded into the registry row
/// and drift only *kicks* the reconciler, which does the plan work on
/// its own schedule.
pub async fn report_node_status(
    state: &AppState,
    report: NodeStatusReport,
) -> ApiResult<ReportOutcome> {
    validation::validate_identity(&report.identity, &state.limits)?;
    if report.units.len() > state.limits.max_units_per_report {
        return Err(AppError::invalid_argument(format!(
            "at most {} units per report",
            state.limits.max_units_per_report
        )));
    }
    validation::validate_field_len("last_error", &report.last_error, &state.limits)?;
    validation::validate_field_len("agent_endpoint", &report.agent_endpoint, &state.limits)?;

    let record = nodes::get_node(&state.db, report.node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {} not found", report.node_id)))?;
    if record.status == "removed" {
        // Removal is terminal; a removed node's reports read as unknown.
        return Err(AppError::not_found(format!(
            "node {} not found",
            report.node_id
        )));
    }

    let status = derive_status(&record, &report);
    let accepted = nodes::record_report(
        &state.db,
        report.node_id,
        &report.identity,
        &report.units,
        status.as_str(),
        &report.last_error,
        &report.agent_endpoint,
        report.reported_at,
        Utc::now(),
    )
    .await?;

    if !accepted {
        counter!("control_plane_reports_discarded_total").increment(1);
        warn!(node_id = %report.node_id, reported_at = %report.reported_at, "stale status report discarded");
    } else if record.applied_plan_hash != record.last_plan_hash {
        state.kick_reconcile();
    }

    Ok(ReportOutcome {
        accepted,
        desired_plan_hash: record.last_plan_hash,
    })
}

fn derive_status(record: &db::NodeRecord, report: &NodeStatusReport) -> NodeStatus {
    // A draining node stays draining regardless of what it reports.
    if record.status == "draining" {
        return NodeStatus::Draining;
    }
    let failed = report
        .units
        .iter()
        .any(|unit| unit.state == UnitState::Failed);
    if failed || !report.last_error.is_empty() {
        NodeStatus::Unhealthy
    } else {
        NodeStatus::Healthy
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct RemoveNodeRequest {
    pub node_id: Uuid,
    /// Skip the drain step and remove immediately.
    #[serde(default)]
    pub force: bool,
}

/// Remove a node: drain its plan-managed units, then mark it removed.
/// With `force` the drain is skipped and the node is removed before
/// this returns. Returns the tracking operation.
pub async fn remove_node(state: &AppState, req: RemoveNodeRequest) -> ApiResult<OperationView> {
    let record = nodes::get_node(&state.db, req.node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {} not found", req.node_id)))?;
    if record.status == "removed" {
        return Err(AppError::failed_precondition(format!(
            "node {} was already removed",
            req.node_id
        )));
    }
    if operations::live_operation_for_node(&state.db, req.node_id)
        .await?
        .is_some()
    {
        return Err(AppError::failed_precondition(format!(
            "node {} has an operation in flight",
            req.node_id
        )));
    }

    let now = Utc::now();

    if req.force {
        // No agent round-trip: the node must read as removed the moment
        // this call returns, reachable agent or not.
        let op = operations::insert_operation(
            &state.db,
            db::NewOperation {
                id: Uuid::new_v4(),
                node_id: req.node_id,
                kind: OperationKind::RemoveNode.as_str().to_string(),
                message: "forced node removal".to_string(),
                plan_hash: String::new(),
                generation: 0,
            },
            now,
        )
        .await?;
        publish_created(&state.watch, &op);

        nodes::mark_removed(&state.db, req.node_id, now).await?;
        record_transition(
            &state.db,
            &state.watch,
            op.id,
            OperationPhase::Succeeded,
            100,
            "node removed",
            None,
        )
        .await?;

        state.plan_cache.invalidate_node(req.node_id);
        counter!("control_plane_node_removals_total").increment(1);
        info!(node_id = %req.node_id, operation_id = %op.id, force = true, "node removed");

        let updated = operations::get_operation(&state.db, op.id)
            .await?
            .ok_or_else(|| AppError::internal("operation vanished after transition"))?;
        return operation_view(updated);
    }

    let current = plans::desired_plan(state, &record).await?;
    let stop = crate::plan::stop_plan(&current);

    let op = operations::insert_operation(
        &state.db,
        db::NewOperation {
            id: Uuid::new_v4(),
            node_id: req.node_id,
            kind: OperationKind::RemoveNode.as_str().to_string(),
            message: "node removal requested".to_string(),
            plan_hash: stop.plan_id.clone(),
            generation: stop.generation,
        },
        now,
    )
    .await?;

    nodes::set_status(&state.db, req.node_id, NodeStatus::Draining.as_str(), now).await?;
    publish_created(&state.watch, &op);

    state
        .dispatch_tx
        .send(DispatchCommand::Drain {
            operation_id: op.id,
            node_id: req.node_id,
            endpoint: record.agent_endpoint.clone(),
            stop,
        })
        .await
        .map_err(|_| AppError::internal("dispatch queue closed"))?;

    state.plan_cache.invalidate_node(req.node_id);
    counter!("control_plane_node_removals_total").increment(1);
    info!(node_id = %req.node_id, operation_id = %op.id, "node removal queued");

    operation_view(op)
}

#[derive(Clone, Debug)]
pub struct UpgradeNodeRequest {
    pub node_id: Uuid,
    pub version: String,
    /// Raw artifact bytes to stage for the agent.
    pub artifact: Vec<u8>,
    /// Hex SHA-256 the caller computed over `artifact`.
    pub sha256: String,
}

/// Stage a new agent binary and queue its rollout to one node.
pub async fn upgrade_node_agent(
    state: &AppState,
    req: UpgradeNodeRequest,
) -> ApiResult<OperationView> {
    validation::validate_field_len("version", &req.version, &state.limits)?;
    if req.version.trim().is_empty() {
        return Err(AppError::invalid_argument("version must not be empty"));
    }
    if req.artifact.is_empty() {
        return Err(AppError::invalid_argument("artifact must not be empty"));
    }
    if req.artifact.len() > state.limits.max_artifact_bytes {
        return Err(AppError::invalid_argument(format!(
            "artifact exceeds {} bytes",
            state.limits.max_artifact_bytes
        )));
    }

    let digest = hex::encode(Sha256::digest(&req.artifact));
    if !digest.eq_ignore_ascii_case(&req.sha256) {
        counter!("control_plane_upgrade_checksum_mismatch_total").increment(1);
        return Err(AppError::invalid_argument(
            "artifact checksum does not match sha256",
        ));
    }

    let record = nodes::get_node(&state.db, req.node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {} not found", req.node_id)))?;
    if record.status == "removed" {
        return Err(AppError::failed_precondition(format!(
            "node {} was removed",
            req.node_id
        )));
    }
    if record.agent_endpoint.is_empty() {
        return Err(AppError::failed_precondition(format!(
            "node {} has no agent endpoint yet",
            req.node_id
        )));
    }
    if operations::live_operation_for_node(&state.db, req.node_id)
        .await?
        .is_some()
    {
        return Err(AppError::failed_precondition(format!(
            "node {} has an operation in flight",
            req.node_id
        )));
    }

    let artifact_name = format!("clusterd-agent-{}-{}", req.version, &digest[..12]);
    let artifact_url = state
        .artifacts
        .stage(&artifact_name, &req.artifact)
        .await
        .map_err(AppError::from)?;

    let now = Utc::now();
    let op = operations::insert_operation(
        &state.db,
        db::NewOperation {
            id: Uuid::new_v4(),
            node_id: req.node_id,
            kind: OperationKind::Upgrade.as_str().to_string(),
            message: format!("upgrade agent to {}", req.version),
            plan_hash: String::new(),
            generation: 0,
        },
        now,
    )
    .await?;
    publish_created(&state.watch, &op);

    state
        .dispatch_tx
        .send(DispatchCommand::UpgradeAgent {
            operation_id: op.id,
            node_id: req.node_id,
            endpoint: record.agent_endpoint.clone(),
            upgrade: UpgradeSpec {
                version: req.version.clone(),
                sha256: digest,
                artifact_url,
            },
        })
        .await
        .map_err(|_| AppError::internal("dispatch queue closed"))?;

    counter!("control_plane_upgrades_queued_total").increment(1);
    info!(node_id = %req.node_id, operation_id = %op.id, version = %req.version, "agent upgrade queued");

    operation_view(op)
}

pub(crate) fn node_view(record: db::NodeRecord) -> ApiResult<NodeView> {
    let status = NodeStatus::from_str(&record.status)
        .map_err(|err| AppError::internal(format!("corrupt node record: {err}")))?;
    Ok(NodeView {
        node_id: record.id,
        identity: record.identity.0,
        status,
        profiles: record.profiles.0,
        metadata: record.metadata.0,
        agent_endpoint: record.agent_endpoint,
        last_seen: record.last_seen,
        last_error: record.last_error,
    })
}
