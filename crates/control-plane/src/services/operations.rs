//! Operation tracking: phase transitions, agent callbacks, and the
//! streaming watch surface.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::info;
use uuid::Uuid;

use common::api::{OperationEvent, OperationKind, OperationPhase};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, operations, Db};
use crate::watch::{WatchRegistry, WatchScope, WatchStream};

/// Operation record as exposed to operators and agents.
#[derive(Clone, Debug, serde::Serialize)]
pub struct OperationView {
    pub operation_id: Uuid,
    pub node_id: Uuid,
    pub kind: OperationKind,
    pub phase: OperationPhase,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_hash: String,
    pub generation: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn get_operation(state: &AppState, operation_id: Uuid) -> ApiResult<OperationView> {
    let record = operations::get_operation(&state.db, operation_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("operation {operation_id} not found")))?;
    operation_view(record)
}

pub async fn list_operations(
    state: &AppState,
    node_id: Option<Uuid>,
    limit: u32,
) -> ApiResult<Vec<OperationView>> {
    let limit = i64::from(limit.clamp(1, 500));
    let records = operations::list_operations(&state.db, node_id, limit).await?;
    records.into_iter().map(operation_view).collect()
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct CompleteOperationRequest {
    pub operation_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Defaults to 100 on completion.
    pub percent: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Agent callback reporting the outcome of a dispatched operation.
///
/// Re-reporting the same terminal outcome is idempotent; reporting the
/// opposite outcome on a terminal operation is a precondition failure.
pub async fn complete_operation(
    state: &AppState,
    req: CompleteOperationRequest,
) -> ApiResult<OperationView> {
    let target = if req.success {
        OperationPhase::Succeeded
    } else {
        OperationPhase::Failed
    };
    let percent = i64::from(req.percent.unwrap_or(100).min(100));
    let error = req.error.as_deref().unwrap_or("");
    if target == OperationPhase::Succeeded && !error.is_empty() {
        return Err(AppError::invalid_argument(
            "a successful completion cannot carry an error",
        ));
    }

    let updated = record_transition(
        &state.db,
        &state.watch,
        req.operation_id,
        target,
        percent,
        &req.message,
        req.error.as_deref(),
    )
    .await?;

    let record = match updated {
        Some(_) => {
            let record = operations::get_operation(&state.db, req.operation_id)
                .await?
                .ok_or_else(|| AppError::internal("operation vanished after transition"))?;

            // A confirmed apply means the node is now at that plan.
            if target == OperationPhase::Succeeded
                && record.kind == OperationKind::ApplyPlan.as_str()
                && !record.plan_hash.is_empty()
            {
                db::nodes::record_applied(
                    &state.db,
                    record.node_id,
                    &record.plan_hash,
                    record.generation,
                    Utc::now(),
                )
                .await?;
            }
            state.kick_reconcile();
            record
        }
        None => {
            let record = operations::get_operation(&state.db, req.operation_id)
                .await?
                .ok_or_else(|| {
                    AppError::not_found(format!("operation {} not found", req.operation_id))
                })?;
            if record.phase != target.as_str() {
                return Err(AppError::failed_precondition(format!(
                    "operation {} is already {}",
                    req.operation_id, record.phase
                )));
            }
            record
        }
    };

    counter!("control_plane_operations_completed_total", "outcome" => target.as_str())
        .increment(1);
    info!(operation_id = %req.operation_id, outcome = target.as_str(), "operation completed");
    operation_view(record)
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct OperationProgressRequest {
    pub operation_id: Uuid,
    pub percent: u8,
    #[serde(default)]
    pub message: String,
}

/// Agent callback reporting intermediate progress.
pub async fn report_operation_progress(
    state: &AppState,
    req: OperationProgressRequest,
) -> ApiResult<OperationView> {
    if req.percent > 100 {
        return Err(AppError::invalid_argument("percent must be <= 100"));
    }

    let updated = record_transition(
        &state.db,
        &state.watch,
        req.operation_id,
        OperationPhase::Running,
        i64::from(req.percent),
        &req.message,
        None,
    )
    .await?;

    match updated {
        Some(_) => {
            let record = operations::get_operation(&state.db, req.operation_id)
                .await?
                .ok_or_else(|| AppError::internal("operation vanished after transition"))?;
            operation_view(record)
        }
        None => {
            let exists = operations::get_operation(&state.db, req.operation_id).await?;
            match exists {
                Some(record) => Err(AppError::failed_precondition(format!(
                    "operation {} is already {}",
                    req.operation_id, record.phase
                ))),
                None => Err(AppError::not_found(format!(
                    "operation {} not found",
                    req.operation_id
                ))),
            }
        }
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct WatchOperationsRequest {
    /// Watch a single operation.
    pub operation_id: Option<Uuid>,
    /// Watch everything targeting one node.
    pub node_id: Option<Uuid>,
}

/// Subscribe to operation events.
///
/// New watchers first receive a snapshot event for every matching
/// operation that is not yet terminal (and for the named operation even
/// when it is), then live transitions. A watcher that stops reading is
/// disconnected rather than allowed to stall publishers.
pub async fn watch_operations(
    state: &AppState,
    req: WatchOperationsRequest,
) -> ApiResult<WatchStream> {
    let scope = match (req.operation_id, req.node_id) {
        (Some(operation_id), _) => WatchScope::Operation(operation_id),
        (None, Some(node_id)) => WatchScope::Node(node_id),
        (None, None) => WatchScope::All,
    };

    // Register before reading the snapshot: a transition committed
    // while the snapshot query runs lands in the live queue, and the
    // stream drops whatever the snapshot already covers.
    let mut stream = state.watch.subscribe(scope);

    let mut backlog = Vec::new();
    match scope {
        WatchScope::Operation(operation_id) => {
            let record = operations::get_operation(&state.db, operation_id)
                .await?
                .ok_or_else(|| {
                    AppError::not_found(format!("operation {operation_id} not found"))
                })?;
            backlog.push(event_from_record(&record)?);
        }
        _ => {
            for record in operations::live_operations(&state.db).await? {
                backlog.push(event_from_record(&record)?);
            }
        }
    }
    stream.replay(backlog);

    Ok(stream)
}

/// Advance an operation and publish the transition to watchers.
///
/// Returns `None` when the operation was already terminal; the caller
/// decides whether that is idempotent success or a conflict.
pub(crate) async fn record_transition(
    pool: &Db,
    watch: &WatchRegistry,
    operation_id: Uuid,
    phase: OperationPhase,
    percent: i64,
    message: &str,
    error: Option<&str>,
) -> crate::Result<Option<OperationEvent>> {
    let updated = operations::transition(
        pool,
        operation_id,
        phase.as_str(),
        percent,
        message,
        error.unwrap_or(""),
        Utc::now(),
    )
    .await?;

    let Some(record) = updated else {
        return Ok(None);
    };
    let event = event_from_record(&record).map_err(|err| anyhow::anyhow!("{err}"))?;
    watch.publish(&event);
    Ok(Some(event))
}

/// Publish the initial `queued` snapshot for a freshly created
/// operation.
pub(crate) fn publish_created(watch: &WatchRegistry, record: &db::OperationRecord) {
    if let Ok(event) = event_from_record(record) {
        watch.publish(&event);
    }
}

pub(crate) fn event_from_record(record: &db::OperationRecord) -> ApiResult<OperationEvent> {
    let phase = parse_phase(&record.phase)?;
    Ok(OperationEvent {
        operation_id: record.id,
        node_id: record.node_id,
        phase,
        message: record.message.clone(),
        percent: record.percent.clamp(0, 100) as u8,
        done: phase.is_terminal(),
        error: if record.error.is_empty() {
            None
        } else {
            Some(record.error.clone())
        },
        timestamp: record.updated_at,
    })
}

fn parse_phase(raw: &str) -> ApiResult<OperationPhase> {
    OperationPhase::from_str(raw)
        .map_err(|err| AppError::internal(format!("corrupt operation record: {err}")))
}

pub(crate) fn operation_view(record: db::OperationRecord) -> ApiResult<OperationView> {
    let phase = parse_phase(&record.phase)?;
    let kind = OperationKind::from_str(&record.kind)
        .map_err(|err| AppError::internal(format!("corrupt operation record: {err}")))?;
    Ok(OperationView {
        operation_id: record.id,
        node_id: record.node_id,
        kind,
        phase,
        percent: record.percent.clamp(0, 100) as u8,
        message: record.message,
        error: if record.error.is_empty() {
            None
        } else {
            Some(record.error)
        },
        plan_hash: record.plan_hash,
        generation: record.generation,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}
