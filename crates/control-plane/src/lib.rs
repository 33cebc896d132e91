//! Cluster control plane core.
//!
//! Admits nodes through operator-approved join requests, compiles
//! per-node desired-state plans from profiles and the cluster network
//! document, tracks agent-facing operations with a streaming watch
//! surface, and rolls registry state up into cluster health.

pub mod app_state;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod persistence;
pub mod plan;
pub mod profiles;
pub mod services;
pub mod tasks;
pub mod telemetry;
pub mod tokens;
pub mod validation;
pub mod watch;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::app_state::AppState;
use crate::dispatch::{
    dispatch_loop, AgentDispatcher, ArtifactStore, DispatchCommand, DispatchContext,
    FsArtifactStore, NoopDispatcher,
};
use crate::plan::PlanCache;
use crate::profiles::{ProfileCatalog, StaticProfileCatalog};
use crate::watch::WatchRegistry;

/// Depth of the agent dispatch queue. Enqueueing applies backpressure
/// to service calls rather than growing without bound.
const DISPATCH_QUEUE_DEPTH: usize = 256;

/// Injection points for the pieces that live outside this crate.
pub struct EngineHooks {
    /// Transport to node agents.
    pub dispatcher: Arc<dyn AgentDispatcher>,
    /// Staging area for upgrade artifacts.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Profile definitions.
    pub catalog: Arc<dyn ProfileCatalog>,
}

impl Default for EngineHooks {
    fn default() -> Self {
        Self {
            dispatcher: Arc::new(NoopDispatcher),
            artifacts: Arc::new(FsArtifactStore::new(
                "data/artifacts",
                "file:///data/artifacts",
            )),
            catalog: StaticProfileCatalog::builtin(),
        }
    }
}

/// A running control plane: shared state plus its background tasks.
pub struct Engine {
    pub state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Open the database, run migrations, and start the dispatch,
    /// reconcile, watchdog, and retention loops.
    pub async fn start(cfg: config::AppConfig, hooks: EngineHooks) -> Result<Self> {
        let db = persistence::migrations::init_pool(&cfg.database.url).await?;
        persistence::migrations::run_migrations(&db).await?;

        let dispatcher = Arc::clone(&hooks.dispatcher);
        let (state, dispatch_rx) = build_state(db, cfg, hooks);

        let ctx = DispatchContext {
            db: state.db.clone(),
            watch: state.watch.clone(),
            dispatcher,
            operations: state.operations.clone(),
        };

        let tasks = vec![
            tokio::spawn(dispatch_loop(ctx, dispatch_rx)),
            tokio::spawn(tasks::reconcile::reconcile_loop(state.clone())),
            tokio::spawn(tasks::watchdog::watchdog_loop(
                state.db.clone(),
                state.watch.clone(),
                state.operations.clone(),
            )),
            tokio::spawn(tasks::retention::retention_loop(
                state.db.clone(),
                state.retention.clone(),
            )),
        ];

        info!("control plane engine started");
        Ok(Self { state, tasks })
    }

    /// Stop background tasks. In-flight dispatches are abandoned.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("control plane engine stopped");
    }
}

/// Assemble shared state around an already-migrated pool. Exposed for
/// tests, which drive the dispatch queue themselves.
pub fn build_state(
    db: persistence::Db,
    cfg: config::AppConfig,
    hooks: EngineHooks,
) -> (AppState, mpsc::Receiver<DispatchCommand>) {
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
    let watch = WatchRegistry::new(cfg.operations.watch_queue_depth);

    let state = AppState {
        db,
        cluster: cfg.cluster,
        tokens: cfg.tokens,
        health: cfg.health,
        operations: cfg.operations,
        reconcile: cfg.reconcile,
        retention: cfg.retention,
        limits: cfg.limits,
        profiles: hooks.catalog,
        plan_cache: Arc::new(PlanCache::new()),
        watch,
        dispatch_tx,
        artifacts: hooks.artifacts,
        reconcile_kick: Arc::new(Notify::new()),
    };

    (state, dispatch_rx)
}
