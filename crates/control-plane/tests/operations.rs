#[path = "support/common.rs"]
mod support;

use common::api::{OperationKind, OperationPhase};
use chrono::{Duration, Utc};
use support::{admit_node, make_harness, report_healthy};
use control_plane::dispatch::DispatchCommand;
use control_plane::error::ErrorKind;
use control_plane::services::{nodes, operations, plans};
use control_plane::tasks::{reconcile, watchdog};

#[tokio::test]
async fn reconcile_dispatches_apply_for_drifted_nodes() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    let outcome = reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    assert_eq!(outcome.dispatched, 1);

    let desired = plans::get_node_plan(&state, node_id).await.expect("plan");
    match harness.next_command().await {
        DispatchCommand::ApplyPlan { plan, .. } => assert_eq!(plan.plan_id, desired.plan_id),
        other => panic!("unexpected command {other:?}"),
    }

    let ops = operations::list_operations(&state, Some(node_id), 10)
        .await
        .expect("ops");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::ApplyPlan);
    assert_eq!(ops[0].phase, OperationPhase::Queued);

    // A node with an operation already in flight is not dispatched again.
    let outcome = reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    assert_eq!(outcome.dispatched, 0);
}

#[tokio::test]
async fn nodes_without_an_endpoint_are_not_dispatched() {
    let harness = make_harness().await;
    let state = &harness.state;
    admit_node(state, "node-a", &["core"]).await;

    let outcome = reconcile::run_reconcile_sweep(state).await.expect("sweep");
    assert_eq!(outcome.dispatched, 0);
    assert_eq!(outcome.unreachable, 1);
}

#[tokio::test]
async fn successful_completion_converges_the_node() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let op_id = match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, .. } => operation_id,
        other => panic!("unexpected command {other:?}"),
    };

    let view = operations::complete_operation(
        &state,
        operations::CompleteOperationRequest {
            operation_id: op_id,
            success: true,
            message: "applied".to_string(),
            percent: None,
            error: None,
        },
    )
    .await
    .expect("complete");
    assert_eq!(view.phase, OperationPhase::Succeeded);
    assert_eq!(view.percent, 100);

    // The node now matches its desired plan, so the next sweep is idle.
    let outcome = reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    assert_eq!(outcome.dispatched, 0);
}

#[tokio::test]
async fn completion_is_idempotent_but_conflicts_fail() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let op_id = match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, .. } => operation_id,
        other => panic!("unexpected command {other:?}"),
    };

    let complete = operations::CompleteOperationRequest {
        operation_id: op_id,
        success: true,
        message: String::new(),
        percent: None,
        error: None,
    };
    operations::complete_operation(&state, complete.clone())
        .await
        .expect("first completion");
    operations::complete_operation(&state, complete.clone())
        .await
        .expect("same outcome again is idempotent");

    let err = operations::complete_operation(
        &state,
        operations::CompleteOperationRequest {
            success: false,
            error: Some("it broke".to_string()),
            ..complete
        },
    )
    .await
    .expect_err("conflicting outcome");
    assert_eq!(err.kind, ErrorKind::FailedPrecondition);
}

#[tokio::test]
async fn progress_is_monotonic() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let op_id = match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, .. } => operation_id,
        other => panic!("unexpected command {other:?}"),
    };

    let view = operations::report_operation_progress(
        &state,
        operations::OperationProgressRequest {
            operation_id: op_id,
            percent: 50,
            message: "halfway".to_string(),
        },
    )
    .await
    .expect("progress");
    assert_eq!(view.phase, OperationPhase::Running);
    assert_eq!(view.percent, 50);

    // A late, lower progress report cannot move the needle backwards.
    let view = operations::report_operation_progress(
        &state,
        operations::OperationProgressRequest {
            operation_id: op_id,
            percent: 30,
            message: "late".to_string(),
        },
    )
    .await
    .expect("late progress");
    assert_eq!(view.percent, 50);
}

#[tokio::test]
async fn watchers_see_the_full_lifecycle() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    let mut stream = operations::watch_operations(
        &state,
        operations::WatchOperationsRequest {
            operation_id: None,
            node_id: Some(node_id),
        },
    )
    .await
    .expect("watch");

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let op_id = match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, .. } => operation_id,
        other => panic!("unexpected command {other:?}"),
    };

    let event = stream.recv().await.expect("queued event");
    assert_eq!(event.phase, OperationPhase::Queued);
    assert!(!event.done);

    operations::complete_operation(
        &state,
        operations::CompleteOperationRequest {
            operation_id: op_id,
            success: true,
            message: "applied".to_string(),
            percent: None,
            error: None,
        },
    )
    .await
    .expect("complete");

    let event = stream.recv().await.expect("terminal event");
    assert_eq!(event.phase, OperationPhase::Succeeded);
    assert!(event.done);
}

#[tokio::test]
async fn watching_a_finished_operation_yields_its_terminal_state() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let op_id = match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, .. } => operation_id,
        other => panic!("unexpected command {other:?}"),
    };
    operations::complete_operation(
        &state,
        operations::CompleteOperationRequest {
            operation_id: op_id,
            success: true,
            message: String::new(),
            percent: None,
            error: None,
        },
    )
    .await
    .expect("complete");

    // Even with no future transitions, the watcher must still learn
    // the operation is done.
    let mut stream = operations::watch_operations(
        &state,
        operations::WatchOperationsRequest {
            operation_id: Some(op_id),
            node_id: None,
        },
    )
    .await
    .expect("watch");

    let event = stream.recv().await.expect("terminal snapshot");
    assert_eq!(event.phase, OperationPhase::Succeeded);
    assert!(event.done);
}

#[tokio::test]
async fn late_watchers_get_a_snapshot_of_live_operations() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let _ = harness.next_command().await;

    // Subscribing after the operation was created still yields its
    // current state first.
    let mut stream = operations::watch_operations(
        &state,
        operations::WatchOperationsRequest::default(),
    )
    .await
    .expect("watch");

    let event = stream.try_recv().expect("snapshot event");
    assert_eq!(event.node_id, node_id);
    assert_eq!(event.phase, OperationPhase::Queued);
}

#[tokio::test]
async fn watchdog_fails_operations_past_the_ceiling() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    reconcile::run_reconcile_sweep(&state).await.expect("sweep");
    let op_id = match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, .. } => operation_id,
        other => panic!("unexpected command {other:?}"),
    };

    // Nothing is overdue yet.
    let failed = watchdog::run_watchdog_sweep(&state.db, &state.watch, &state.operations, Utc::now())
        .await
        .expect("sweep");
    assert_eq!(failed, 0);

    let future = Utc::now()
        + Duration::seconds(state.operations.running_ceiling_secs as i64)
        + Duration::seconds(60);
    let failed = watchdog::run_watchdog_sweep(&state.db, &state.watch, &state.operations, future)
        .await
        .expect("sweep");
    assert_eq!(failed, 1);

    let op = operations::get_operation(&state, op_id).await.expect("op");
    assert_eq!(op.phase, OperationPhase::Failed);
    assert!(op.error.is_some());

    // The failure is sticky: the agent reporting success afterwards is
    // a conflict, not a resurrection.
    let err = operations::complete_operation(
        &state,
        operations::CompleteOperationRequest {
            operation_id: op_id,
            success: true,
            message: String::new(),
            percent: None,
            error: None,
        },
    )
    .await
    .expect_err("late success");
    assert_eq!(err.kind, ErrorKind::FailedPrecondition);
}

#[tokio::test]
async fn explicit_apply_queues_an_operation() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    let op = plans::apply_node_plan(&state, node_id).await.expect("apply");
    assert_eq!(op.kind, OperationKind::ApplyPlan);
    assert_eq!(op.phase, OperationPhase::Queued);

    let desired = plans::get_node_plan(&state, node_id).await.expect("plan");
    match harness.next_command().await {
        DispatchCommand::ApplyPlan { operation_id, plan, .. } => {
            assert_eq!(operation_id, op.operation_id);
            assert_eq!(plan.plan_id, desired.plan_id);
        }
        other => panic!("unexpected command {other:?}"),
    }

    // A second apply while the first is in flight is a conflict.
    let err = plans::apply_node_plan(&state, node_id)
        .await
        .expect_err("in flight");
    assert_eq!(err.kind, ErrorKind::FailedPrecondition);

    let err = plans::apply_node_plan(&state, uuid::Uuid::new_v4())
        .await
        .expect_err("unknown node");
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let harness = make_harness().await;
    let err = operations::get_operation(&harness.state, uuid::Uuid::new_v4())
        .await
        .expect_err("unknown");
    assert_eq!(err.kind, ErrorKind::NotFound);

    let err = operations::watch_operations(
        &harness.state,
        operations::WatchOperationsRequest {
            operation_id: Some(uuid::Uuid::new_v4()),
            node_id: None,
        },
    )
    .await
    .expect_err("watch unknown");
    assert_eq!(err.kind, ErrorKind::NotFound);
}

// `remove_node` goes through the same queue; its drain command carries
// a stop plan even though the apply path is exercised elsewhere.
#[tokio::test]
async fn removal_queues_a_drain_command() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    nodes::remove_node(
        &state,
        nodes::RemoveNodeRequest {
            node_id,
            force: false,
        },
    )
    .await
    .expect("remove");

    match harness.next_command().await {
        DispatchCommand::Drain { stop, .. } => {
            assert!(!stop.unit_actions.is_empty());
            assert!(stop.artifacts.is_empty());
        }
        other => panic!("unexpected command {other:?}"),
    }
}
