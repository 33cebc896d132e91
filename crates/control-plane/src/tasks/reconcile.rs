//! Reconcile sweep: the only place plans are compiled in bulk and
//! dispatched. Status ingestion and operator edits just kick this loop.

use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::api::OperationKind;

use crate::app_state::AppState;
use crate::dispatch::DispatchCommand;
use crate::error::ApiResult;
use crate::persistence::{self as db, nodes, operations};
use crate::services::operations::publish_created;
use crate::services::plans;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Nodes demoted to `unknown` for going silent.
    pub stale_marked: u64,
    /// Apply operations queued this sweep.
    pub dispatched: usize,
    /// Nodes that drifted but cannot be reached (no agent endpoint yet).
    pub unreachable: usize,
}

pub async fn reconcile_loop(state: AppState) {
    let sweep_interval = Duration::from_secs(state.reconcile.sweep_interval_secs.max(1));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(sweep_interval) => {}
            _ = state.reconcile_kick.notified() => {}
        }

        match run_reconcile_sweep(&state).await {
            Ok(report) if report == ReconcileReport::default() => {}
            Ok(report) => {
                info!(
                    stale = report.stale_marked,
                    dispatched = report.dispatched,
                    unreachable = report.unreachable,
                    "reconcile sweep"
                );
            }
            Err(err) => warn!(error = %err, "reconcile sweep failed"),
        }
    }
}

/// One pass: demote silent nodes, then queue an apply for every node
/// whose desired plan differs from what it last applied.
pub async fn run_reconcile_sweep(state: &AppState) -> ApiResult<ReconcileReport> {
    let now = Utc::now();
    let mut report = ReconcileReport::default();

    let cutoff = now - state.health.staleness_threshold();
    report.stale_marked = nodes::mark_stale_unknown(&state.db, cutoff, now).await?;

    for record in nodes::list_nodes(&state.db, false).await? {
        if record.status == "draining" {
            continue;
        }

        let desired = plans::desired_plan(state, &record).await?;
        if desired.plan_id == record.applied_plan_hash {
            continue;
        }

        // Track drift even when we cannot dispatch yet.
        if record.last_plan_hash != desired.plan_id {
            nodes::set_desired_plan_hash(&state.db, record.id, &desired.plan_id, now).await?;
        }

        if operations::live_operation_for_node(&state.db, record.id)
            .await?
            .is_some()
        {
            continue;
        }
        if record.agent_endpoint.is_empty() {
            debug!(node_id = %record.id, "node drifted but has no agent endpoint yet");
            report.unreachable += 1;
            continue;
        }

        let op = operations::insert_operation(
            &state.db,
            db::NewOperation {
                id: Uuid::new_v4(),
                node_id: record.id,
                kind: OperationKind::ApplyPlan.as_str().to_string(),
                message: "applying desired plan".to_string(),
                plan_hash: desired.plan_id.clone(),
                generation: desired.generation,
            },
            now,
        )
        .await?;
        publish_created(&state.watch, &op);

        if state
            .dispatch_tx
            .send(DispatchCommand::ApplyPlan {
                operation_id: op.id,
                endpoint: record.agent_endpoint.clone(),
                plan: desired,
            })
            .await
            .is_err()
        {
            warn!("dispatch queue closed, stopping sweep");
            break;
        }

        counter!("control_plane_plans_dispatched_total").increment(1);
        report.dispatched += 1;
    }

    Ok(report)
}
