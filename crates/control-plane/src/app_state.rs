use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::config::{
    ClusterConfig, HealthConfig, LimitsConfig, OperationsConfig, ReconcileConfig, RetentionConfig,
    TokenConfig,
};
use crate::dispatch::{ArtifactStore, DispatchCommand};
use crate::persistence;
use crate::plan::PlanCache;
use crate::profiles::ProfileCatalog;
use crate::watch::WatchRegistry;

/// Shared application state passed into every service call.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub cluster: ClusterConfig,
    pub tokens: TokenConfig,
    pub health: HealthConfig,
    pub operations: OperationsConfig,
    pub reconcile: ReconcileConfig,
    pub retention: RetentionConfig,
    pub limits: LimitsConfig,
    /// Profile definitions the plan compiler resolves against.
    pub profiles: Arc<dyn ProfileCatalog>,
    /// Cache of compiled plans; invalidated on profile or network edits.
    pub plan_cache: Arc<PlanCache>,
    /// Operation event fan-out to watchers.
    pub watch: WatchRegistry,
    /// Queue feeding the dispatch loop. Services enqueue, never send.
    pub dispatch_tx: mpsc::Sender<DispatchCommand>,
    /// Staging area for agent upgrade artifacts.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Pinged whenever recorded state drifts from desired state, so the
    /// reconcile loop wakes up early instead of waiting out its tick.
    pub reconcile_kick: Arc<Notify>,
}

impl AppState {
    /// Signal the reconcile loop that desired or observed state moved.
    pub fn kick_reconcile(&self) {
        self.reconcile_kick.notify_one();
    }
}
