#[path = "support/common.rs"]
mod support;

use common::api::{ClusterStatus, HealthBucket, UnitState};
use chrono::{Duration, Utc};
use support::{admit_node, make_harness, report, report_healthy, unit};
use control_plane::dispatch::DispatchCommand;
use control_plane::services::{health, nodes, operations, plans};
use control_plane::tasks::reconcile;

#[tokio::test]
async fn empty_cluster_is_unhealthy() {
    let harness = make_harness().await;
    let rollup = health::get_cluster_health(&harness.state, health::ClusterHealthRequest::default())
        .await
        .expect("health");
    assert_eq!(rollup.status, ClusterStatus::Unhealthy);
    assert_eq!(rollup.total_nodes, 0);
    assert!(rollup.nodes.is_empty());
}

#[tokio::test]
async fn all_reporting_nodes_mean_a_healthy_cluster() {
    let harness = make_harness().await;
    let state = &harness.state;

    for hostname in ["node-a", "node-b"] {
        let node_id = admit_node(state, hostname, &["core"]).await;
        report_healthy(state, node_id, hostname).await;
    }

    let rollup = health::get_cluster_health(state, health::ClusterHealthRequest::default())
        .await
        .expect("health");
    assert_eq!(rollup.status, ClusterStatus::Healthy);
    assert_eq!(rollup.total_nodes, 2);
    assert_eq!(rollup.healthy_nodes, 2);
}

#[tokio::test]
async fn failing_and_silent_nodes_degrade_the_cluster() {
    let harness = make_harness().await;
    let state = &harness.state;

    let good = admit_node(state, "node-a", &["core"]).await;
    report_healthy(state, good, "node-a").await;

    // Reported long enough ago to be past the staleness threshold.
    let silent = admit_node(state, "node-b", &["core"]).await;
    let stale_threshold = state.health.staleness_threshold();
    nodes::report_node_status(
        state,
        report(
            silent,
            "node-b",
            vec![unit("discovery.service", UnitState::Active)],
            Utc::now() - stale_threshold - Duration::seconds(30),
        ),
    )
    .await
    .expect("old report");

    let failing = admit_node(state, "node-c", &["core"]).await;
    nodes::report_node_status(
        state,
        report(
            failing,
            "node-c",
            vec![unit("discovery.service", UnitState::Failed)],
            Utc::now(),
        ),
    )
    .await
    .expect("failing report");

    let rollup = health::get_cluster_health(state, health::ClusterHealthRequest::default())
        .await
        .expect("health");
    assert_eq!(rollup.status, ClusterStatus::Degraded);
    assert_eq!(rollup.healthy_nodes, 1);
    assert_eq!(rollup.unhealthy_nodes, 1);
    assert_eq!(rollup.unknown_nodes, 1);

    let bucket_of = |id| {
        rollup
            .nodes
            .iter()
            .find(|n| n.node_id == id)
            .expect("node line")
            .bucket
    };
    assert_eq!(bucket_of(good), HealthBucket::Healthy);
    assert_eq!(bucket_of(silent), HealthBucket::Unknown);
    assert_eq!(bucket_of(failing), HealthBucket::Unhealthy);
}

#[tokio::test]
async fn convergence_tracks_applied_plan_hash() {
    let mut harness = make_harness().await;
    let state = harness.state.clone();
    let node_id = admit_node(&state, "node-a", &["core"]).await;
    report_healthy(&state, node_id, "node-a").await;

    let rollup = health::get_cluster_health(&state, health::ClusterHealthRequest::default())
        .await
        .expect("health");
    assert!(!rollup.nodes[0].health.converged);

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

    let rollup = health::get_cluster_health(&state, health::ClusterHealthRequest::default())
        .await
        .expect("health");
    let line = &rollup.nodes[0];
    assert!(line.health.converged);
    let desired = plans::get_node_plan(&state, node_id).await.expect("plan");
    assert_eq!(line.health.applied_plan_hash, desired.plan_id);
    assert_eq!(line.health.desired_plan_hash, desired.plan_id);
}

#[tokio::test]
async fn service_summaries_group_by_artifact() {
    let harness = make_harness().await;
    let state = &harness.state;

    for hostname in ["node-a", "node-b"] {
        let node_id = admit_node(state, hostname, &["core", "dns"]).await;
        report_healthy(state, node_id, hostname).await;
    }
    let gateway_only = admit_node(state, "node-c", &["gateway"]).await;
    report_healthy(state, gateway_only, "node-c").await;

    let rollup = health::get_cluster_health(
        state,
        health::ClusterHealthRequest {
            include_services: true,
        },
    )
    .await
    .expect("health");

    let dns = rollup
        .services
        .iter()
        .find(|s| s.service_name == "dns")
        .expect("dns summary");
    assert_eq!(dns.nodes_total, 2);
    assert_eq!(dns.nodes_at_desired, 0);

    let gateway = rollup
        .services
        .iter()
        .find(|s| s.service_name == "gateway")
        .expect("gateway summary");
    assert_eq!(gateway.nodes_total, 1);

    // The plain rollup leaves summaries out.
    let rollup = health::get_cluster_health(state, health::ClusterHealthRequest::default())
        .await
        .expect("health");
    assert!(rollup.services.is_empty());
}
