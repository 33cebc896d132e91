//! Plan retrieval and explicit application: agents pull their desired
//! state from here, operators can force an apply ahead of the next
//! reconcile sweep.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use common::api::{ClusterNetworkSpec, NodePlan, OperationKind};

use crate::app_state::AppState;
use crate::dispatch::DispatchCommand;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, network, nodes, operations, NodeRecord};
use crate::services::operations::{operation_view, publish_created, OperationView};

/// The plan a node should currently be running.
pub async fn get_node_plan(state: &AppState, node_id: Uuid) -> ApiResult<NodePlan> {
    let node = nodes::get_node(&state.db, node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {node_id} not found")))?;
    if node.status == "removed" {
        return Err(AppError::not_found(format!("node {node_id} not found")));
    }
    desired_plan(state, &node).await
}

/// Queue an apply of the node's current desired plan and return the
/// tracking operation. Delivery failures surface only through the
/// operation, never to this caller.
pub async fn apply_node_plan(state: &AppState, node_id: Uuid) -> ApiResult<OperationView> {
    let node = nodes::get_node(&state.db, node_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("node {node_id} not found")))?;
    if node.status == "removed" {
        return Err(AppError::not_found(format!("node {node_id} not found")));
    }
    if operations::live_operation_for_node(&state.db, node_id)
        .await?
        .is_some()
    {
        return Err(AppError::failed_precondition(format!(
            "node {node_id} has an operation in flight"
        )));
    }
    if node.agent_endpoint.is_empty() {
        return Err(AppError::failed_precondition(format!(
            "node {node_id} has no agent endpoint yet"
        )));
    }

    let desired = desired_plan(state, &node).await?;
    let now = Utc::now();
    if node.last_plan_hash != desired.plan_id {
        nodes::set_desired_plan_hash(&state.db, node_id, &desired.plan_id, now).await?;
    }

    let op = operations::insert_operation(
        &state.db,
        db::NewOperation {
            id: Uuid::new_v4(),
            node_id,
            kind: OperationKind::ApplyPlan.as_str().to_string(),
            message: "applying desired plan".to_string(),
            plan_hash: desired.plan_id.clone(),
            generation: desired.generation,
        },
        now,
    )
    .await?;
    publish_created(&state.watch, &op);

    state
        .dispatch_tx
        .send(DispatchCommand::ApplyPlan {
            operation_id: op.id,
            endpoint: node.agent_endpoint.clone(),
            plan: desired,
        })
        .await
        .map_err(|_| AppError::internal("dispatch queue closed"))?;

    info!(node_id = %node_id, operation_id = %op.id, "plan apply queued");
    operation_view(op)
}

/// Compile (or fetch from cache) the desired plan for a registry record.
///
/// Before any network document exists the plan is compiled against the
/// default spec at generation zero, so fresh clusters still converge on
/// profiles.
pub(crate) async fn desired_plan(state: &AppState, node: &NodeRecord) -> ApiResult<NodePlan> {
    let (spec, generation) = match network::get_network(&state.db).await? {
        Some(record) => (record.spec.0, record.generation),
        None => (ClusterNetworkSpec::default(), 0),
    };

    if let Some(plan) = state.plan_cache.get(node.id, &node.profiles.0, generation) {
        return Ok(plan);
    }

    let plan = crate::plan::compile_plan(
        node.id,
        &node.profiles.0,
        &spec,
        generation,
        state.profiles.as_ref(),
    )
    .map_err(AppError::from)?;
    state.plan_cache.insert(&plan);
    Ok(plan)
}
