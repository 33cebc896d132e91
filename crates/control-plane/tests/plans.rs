#[path = "support/common.rs"]
mod support;

use common::api::{ClusterNetworkSpec, NetworkProtocol};
use support::{admit_node, make_harness};
use control_plane::error::ErrorKind;
use control_plane::plan::NETWORK_CONFIG_PATH;
use control_plane::services::{network, nodes, plans};

fn network_spec(domain: &str) -> ClusterNetworkSpec {
    ClusterNetworkSpec {
        cluster_domain: domain.to_string(),
        protocol: NetworkProtocol::Https,
        acme_enabled: true,
        admin_email: "ops@example.org".to_string(),
        ..ClusterNetworkSpec::default()
    }
}

#[tokio::test]
async fn plan_is_deterministic_for_fixed_inputs() {
    let harness = make_harness().await;
    let state = &harness.state;
    let node_id = admit_node(state, "node-a", &["core", "dns"]).await;

    let first = plans::get_node_plan(state, node_id).await.expect("plan");
    let second = plans::get_node_plan(state, node_id).await.expect("plan");

    assert_eq!(first, second);
    assert!(!first.plan_id.is_empty());
    assert!(first.rendered_config.contains_key(NETWORK_CONFIG_PATH));
    assert!(first
        .unit_actions
        .iter()
        .any(|a| a.unit_name == "dns.service"));
}

#[tokio::test]
async fn network_update_bumps_generation_and_changes_plan() {
    let harness = make_harness().await;
    let state = &harness.state;
    let node_id = admit_node(state, "node-a", &["core"]).await;

    let before = plans::get_node_plan(state, node_id).await.expect("plan");
    assert_eq!(before.generation, 0);

    let view = network::set_cluster_network(state, network_spec("cluster.example.org"))
        .await
        .expect("set network");
    assert_eq!(view.generation, 1);

    let after = plans::get_node_plan(state, node_id).await.expect("plan");
    assert_eq!(after.generation, 1);
    assert_ne!(before.plan_id, after.plan_id);
    assert!(after
        .rendered_config
        .get(NETWORK_CONFIG_PATH)
        .expect("network document")
        .contains("cluster.example.org"));

    let view = network::set_cluster_network(state, network_spec("other.example.org"))
        .await
        .expect("set network again");
    assert_eq!(view.generation, 2);
}

#[tokio::test]
async fn concurrent_network_writers_observe_distinct_generations() {
    let harness = make_harness().await;
    let state = harness.state.clone();

    // Each writer must get back the generation its own write produced,
    // not whatever a racing writer left behind.
    let first = {
        let state = state.clone();
        tokio::spawn(async move {
            network::set_cluster_network(&state, network_spec("cluster.example.org")).await
        })
    };
    let second = {
        let state = state.clone();
        tokio::spawn(async move {
            network::set_cluster_network(&state, network_spec("other.example.org")).await
        })
    };

    let a = first.await.expect("task").expect("set network").generation;
    let b = second.await.expect("task").expect("set network").generation;
    assert_ne!(a, b);
    assert_eq!(a.min(b), 1);
    assert_eq!(a.max(b), 2);
}

#[tokio::test]
async fn invalid_network_specs_are_rejected() {
    let harness = make_harness().await;
    let state = &harness.state;

    let mut spec = network_spec("cluster.example.org");
    spec.admin_email = String::new();
    let err = network::set_cluster_network(state, spec)
        .await
        .expect_err("acme without admin email");
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let err = network::set_cluster_network(state, network_spec("not a domain"))
        .await
        .expect_err("bad domain");
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    // A rejected write must not bump the generation.
    let err = network::get_cluster_network(state)
        .await
        .expect_err("still unconfigured");
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn profile_change_changes_the_plan() {
    let harness = make_harness().await;
    let state = &harness.state;
    let node_id = admit_node(state, "node-a", &["core"]).await;

    let before = plans::get_node_plan(state, node_id).await.expect("plan");

    nodes::set_node_profiles(state, node_id, vec!["core".to_string(), "gateway".to_string()])
        .await
        .expect("set profiles");

    let after = plans::get_node_plan(state, node_id).await.expect("plan");
    assert_ne!(before.plan_id, after.plan_id);
    assert!(after
        .unit_actions
        .iter()
        .any(|a| a.unit_name == "gateway.service"));
}

#[tokio::test]
async fn unknown_profiles_do_not_block_the_plan() {
    let harness = make_harness().await;
    let state = &harness.state;
    let node_id = admit_node(state, "node-a", &["no-such-profile", "dns"]).await;

    let plan = plans::get_node_plan(state, node_id).await.expect("plan");
    assert!(plan
        .unit_actions
        .iter()
        .any(|a| a.unit_name == "dns.service"));
}

#[tokio::test]
async fn plans_are_per_node() {
    let harness = make_harness().await;
    let state = &harness.state;
    let node_a = admit_node(state, "node-a", &["core"]).await;
    let node_b = admit_node(state, "node-b", &["core"]).await;

    let plan_a = plans::get_node_plan(state, node_a).await.expect("plan a");
    let plan_b = plans::get_node_plan(state, node_b).await.expect("plan b");

    // Same content, but the plan identity is bound to the node.
    assert_ne!(plan_a.plan_id, plan_b.plan_id);
    assert_eq!(plan_a.unit_actions, plan_b.unit_actions);
}

#[tokio::test]
async fn unknown_node_has_no_plan() {
    let harness = make_harness().await;
    let err = plans::get_node_plan(&harness.state, uuid::Uuid::new_v4())
        .await
        .expect_err("unknown node");
    assert_eq!(err.kind, ErrorKind::NotFound);
}
