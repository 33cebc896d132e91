#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use common::api::{NodeIdentity, NodePlan, NodeStatusReport, NodeUnitStatus, UnitState};
use control_plane::app_state::AppState;
use control_plane::dispatch::{
    AgentDispatcher, ArtifactStore, DispatchCommand, DispatchContext, UpgradeSpec,
};
use control_plane::persistence::migrations;
use control_plane::services::{join, nodes};
use control_plane::{build_state, config, EngineHooks};

/// What a [`RecordingDispatcher`] saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    ApplyPlan { endpoint: String, plan_id: String },
    Upgrade { endpoint: String, version: String },
}

/// Dispatcher double that records calls and answers from a canned
/// result.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    pub calls: Arc<Mutex<Vec<AgentCall>>>,
    pub fail_with: Arc<Mutex<Option<String>>>,
}

impl RecordingDispatcher {
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_with.lock().expect("fail_with") = Some(message.to_string());
    }

    fn outcome(&self) -> anyhow::Result<()> {
        match self.fail_with.lock().expect("fail_with").take() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

impl AgentDispatcher for RecordingDispatcher {
    fn apply_plan<'a>(
        &'a self,
        endpoint: &'a str,
        plan: &'a NodePlan,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().expect("calls").push(AgentCall::ApplyPlan {
                endpoint: endpoint.to_string(),
                plan_id: plan.plan_id.clone(),
            });
            self.outcome()
        })
    }

    fn upgrade_agent<'a>(
        &'a self,
        endpoint: &'a str,
        upgrade: &'a UpgradeSpec,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().expect("calls").push(AgentCall::Upgrade {
                endpoint: endpoint.to_string(),
                version: upgrade.version.clone(),
            });
            self.outcome()
        })
    }
}

/// Artifact store double that keeps staged payloads in memory.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    pub staged: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl ArtifactStore for MemoryArtifactStore {
    fn stage<'a>(&'a self, name: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            self.staged
                .lock()
                .expect("staged")
                .push((name.to_string(), bytes.to_vec()));
            Ok(format!("mem://{name}"))
        })
    }
}

pub struct TestHarness {
    pub state: AppState,
    /// Taken by [`TestHarness::spawn_dispatch_loop`]; inspect it
    /// directly instead to assert on queued commands.
    pub dispatch_rx: Option<mpsc::Receiver<DispatchCommand>>,
    pub dispatcher: RecordingDispatcher,
    pub artifacts: MemoryArtifactStore,
}

impl TestHarness {
    /// Spawn the real dispatch loop over the recording transport.
    pub fn spawn_dispatch_loop(&mut self) -> tokio::task::JoinHandle<()> {
        let ctx = DispatchContext {
            db: self.state.db.clone(),
            watch: self.state.watch.clone(),
            dispatcher: Arc::new(self.dispatcher.clone()),
            operations: self.state.operations.clone(),
        };
        let rx = self.dispatch_rx.take().expect("dispatch loop already spawned");
        tokio::spawn(control_plane::dispatch::dispatch_loop(ctx, rx))
    }

    /// Next queued command, when the dispatch loop is not running.
    pub async fn next_command(&mut self) -> DispatchCommand {
        self.dispatch_rx
            .as_mut()
            .expect("dispatch loop already spawned")
            .recv()
            .await
            .expect("dispatch queue closed")
    }
}

pub async fn make_harness() -> TestHarness {
    let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
    migrations::run_migrations(&pool).await.expect("migrations");

    let cfg = config::load().expect("config");
    let dispatcher = RecordingDispatcher::default();
    let artifacts = MemoryArtifactStore::default();
    let hooks = EngineHooks {
        dispatcher: Arc::new(dispatcher.clone()),
        artifacts: Arc::new(artifacts.clone()),
        ..EngineHooks::default()
    };
    let (state, dispatch_rx) = build_state(pool, cfg, hooks);

    TestHarness {
        state,
        dispatch_rx: Some(dispatch_rx),
        dispatcher,
        artifacts,
    }
}

pub fn identity(hostname: &str) -> NodeIdentity {
    NodeIdentity {
        hostname: hostname.to_string(),
        domain: "cluster.test".to_string(),
        ips: vec!["10.0.0.10".to_string()],
        os: "linux".to_string(),
        arch: "amd64".to_string(),
        agent_version: "1.0.0".to_string(),
    }
}

/// Issue a token, request a join, and approve it. Returns the node id.
pub async fn admit_node(state: &AppState, hostname: &str, profiles: &[&str]) -> Uuid {
    let token = join::create_join_token(state, join::CreateJoinTokenRequest::default())
        .await
        .expect("token");
    let request = join::request_join(
        state,
        join::RequestJoinRequest {
            token: token.token,
            identity: identity(hostname),
            profiles: profiles.iter().map(|p| p.to_string()).collect(),
            metadata: BTreeMap::new(),
        },
    )
    .await
    .expect("request join");
    let approved = join::approve_join(
        state,
        join::ApproveJoinRequest {
            request_id: request.request_id,
            node_id: None,
            profiles: Vec::new(),
            message: String::new(),
        },
    )
    .await
    .expect("approve");
    approved.node_id.expect("node id")
}

pub fn unit(name: &str, state: UnitState) -> NodeUnitStatus {
    NodeUnitStatus {
        name: name.to_string(),
        state,
        details: String::new(),
    }
}

pub fn report(
    node_id: Uuid,
    hostname: &str,
    units: Vec<NodeUnitStatus>,
    reported_at: DateTime<Utc>,
) -> NodeStatusReport {
    NodeStatusReport {
        node_id,
        identity: identity(hostname),
        units,
        last_error: String::new(),
        reported_at,
        agent_endpoint: format!("http://{hostname}.cluster.test:9901"),
    }
}

/// Report healthy status for a node so it has an endpoint and a fresh
/// `last_seen`.
pub async fn report_healthy(state: &AppState, node_id: Uuid, hostname: &str) {
    nodes::report_node_status(
        state,
        report(node_id, hostname, vec![unit("discovery.service", UnitState::Active)], Utc::now()),
    )
    .await
    .expect("report");
}
