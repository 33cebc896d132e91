//! Agent dispatch boundary.
//!
//! The control plane never talks to node agents inline with a service
//! call. Work is queued as [`DispatchCommand`]s and drained by
//! [`dispatch_loop`], which drives the operation record through its
//! phases and enforces the per-send timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use common::api::{NodePlan, OperationPhase};

use crate::config::OperationsConfig;
use crate::persistence::{self, Db};
use crate::services::operations::record_transition;
use crate::watch::WatchRegistry;

/// Agent-binary upgrade payload descriptor handed to the agent.
#[derive(Debug, Clone)]
pub struct UpgradeSpec {
    pub version: String,
    /// Hex SHA-256 of the staged artifact; the agent re-verifies it.
    pub sha256: String,
    /// Where the agent fetches the staged artifact from.
    pub artifact_url: String,
}

/// Transport used to reach a node agent.
///
/// Implementations live outside this crate (gRPC, HTTP, test doubles)
/// and are injected at engine build time.
pub trait AgentDispatcher: Send + Sync + 'static {
    fn apply_plan<'a>(
        &'a self,
        endpoint: &'a str,
        plan: &'a NodePlan,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn upgrade_agent<'a>(
        &'a self,
        endpoint: &'a str,
        upgrade: &'a UpgradeSpec,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Dispatcher that accepts everything without talking to anyone.
/// Default for builds without a transport wired in.
pub struct NoopDispatcher;

impl AgentDispatcher for NoopDispatcher {
    fn apply_plan<'a>(
        &'a self,
        _endpoint: &'a str,
        _plan: &'a NodePlan,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn upgrade_agent<'a>(
        &'a self,
        _endpoint: &'a str,
        _upgrade: &'a UpgradeSpec,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Staging area for upgrade artifacts.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Persist the artifact bytes and return the URL agents fetch it
    /// from.
    fn stage<'a>(&'a self, name: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Stores artifacts under a local directory, served to agents by an
/// external file server rooted at `base_url`.
pub struct FsArtifactStore {
    dir: PathBuf,
    base_url: String,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn stage<'a>(&'a self, name: &'a str, bytes: &'a [u8]) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.dir.join(name);
            tokio::fs::write(&path, bytes).await?;
            Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), name))
        })
    }
}

/// One unit of agent-facing work, keyed to the operation that tracks it.
#[derive(Debug)]
pub enum DispatchCommand {
    ApplyPlan {
        operation_id: Uuid,
        endpoint: String,
        plan: NodePlan,
    },
    UpgradeAgent {
        operation_id: Uuid,
        node_id: Uuid,
        endpoint: String,
        upgrade: UpgradeSpec,
    },
    /// Stop everything the node's plan manages, then mark it removed.
    /// The removal proceeds even when the stop plan cannot be
    /// delivered.
    Drain {
        operation_id: Uuid,
        node_id: Uuid,
        endpoint: String,
        stop: NodePlan,
    },
}

#[derive(Clone)]
pub struct DispatchContext {
    pub db: Db,
    pub watch: WatchRegistry,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub operations: OperationsConfig,
}

/// Drain the command queue until every sender is gone.
pub async fn dispatch_loop(ctx: DispatchContext, mut rx: mpsc::Receiver<DispatchCommand>) {
    while let Some(command) = rx.recv().await {
        if let Err(err) = handle_command(&ctx, command).await {
            warn!(error = %err, "dispatch command failed");
        }
    }
    info!("dispatch queue closed, loop exiting");
}

async fn handle_command(ctx: &DispatchContext, command: DispatchCommand) -> anyhow::Result<()> {
    match command {
        DispatchCommand::ApplyPlan {
            operation_id,
            endpoint,
            plan,
        } => {
            let started = record_transition(
                &ctx.db,
                &ctx.watch,
                operation_id,
                OperationPhase::Running,
                10,
                "dispatching plan to agent",
                None,
            )
            .await?;
            if started.is_none() {
                // Already terminal (watchdog beat us to it).
                return Ok(());
            }

            let outcome = send_with_timeout(
                ctx,
                ctx.dispatcher.apply_plan(&endpoint, &plan),
            )
            .await;

            match outcome {
                Ok(()) => {
                    persistence::nodes::record_applied(
                        &ctx.db,
                        plan.node_id,
                        &plan.plan_id,
                        plan.generation,
                        Utc::now(),
                    )
                    .await?;
                    record_transition(
                        &ctx.db,
                        &ctx.watch,
                        operation_id,
                        OperationPhase::Succeeded,
                        100,
                        "plan applied",
                        None,
                    )
                    .await?;
                }
                Err(err) => {
                    record_transition(
                        &ctx.db,
                        &ctx.watch,
                        operation_id,
                        OperationPhase::Failed,
                        100,
                        "plan dispatch failed",
                        Some(&err.to_string()),
                    )
                    .await?;
                }
            }
        }
        DispatchCommand::UpgradeAgent {
            operation_id,
            node_id: _,
            endpoint,
            upgrade,
        } => {
            let started = record_transition(
                &ctx.db,
                &ctx.watch,
                operation_id,
                OperationPhase::Running,
                10,
                "dispatching upgrade to agent",
                None,
            )
            .await?;
            if started.is_none() {
                return Ok(());
            }

            let outcome = send_with_timeout(
                ctx,
                ctx.dispatcher.upgrade_agent(&endpoint, &upgrade),
            )
            .await;

            match outcome {
                Ok(()) => {
                    record_transition(
                        &ctx.db,
                        &ctx.watch,
                        operation_id,
                        OperationPhase::Succeeded,
                        100,
                        "upgrade dispatched",
                        None,
                    )
                    .await?;
                }
                Err(err) => {
                    record_transition(
                        &ctx.db,
                        &ctx.watch,
                        operation_id,
                        OperationPhase::Failed,
                        100,
                        "upgrade dispatch failed",
                        Some(&err.to_string()),
                    )
                    .await?;
                }
            }
        }
        DispatchCommand::Drain {
            operation_id,
            node_id,
            endpoint,
            stop,
        } => {
            let started = record_transition(
                &ctx.db,
                &ctx.watch,
                operation_id,
                OperationPhase::Running,
                10,
                "draining node",
                None,
            )
            .await?;
            if started.is_none() {
                return Ok(());
            }

            let drain_timeout = Duration::from_secs(ctx.operations.drain_timeout_secs);
            let drained =
                tokio::time::timeout(drain_timeout, ctx.dispatcher.apply_plan(&endpoint, &stop))
                    .await;
            match &drained {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(node_id = %node_id, error = %err, "drain delivery failed, removing anyway")
                }
                Err(_) => warn!(node_id = %node_id, "drain timed out, removing anyway"),
            }

            persistence::nodes::mark_removed(&ctx.db, node_id, Utc::now()).await?;
            record_transition(
                &ctx.db,
                &ctx.watch,
                operation_id,
                OperationPhase::Succeeded,
                100,
                "node removed",
                None,
            )
            .await?;
        }
    }
    Ok(())
}

async fn send_with_timeout(
    ctx: &DispatchContext,
    fut: BoxFuture<'_, anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(ctx.operations.dispatch_timeout_secs);
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "agent did not respond within {}s",
            ctx.operations.dispatch_timeout_secs
        )),
    }
}
