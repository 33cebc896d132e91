use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::api::OperationPhase;
use tracing::{info, warn};

use crate::config::OperationsConfig;
use crate::persistence::{self as db, operations};
use crate::services::operations::record_transition;
use crate::watch::WatchRegistry;
use crate::Result;

/// Fail operations that never reported a terminal outcome, so watchers
/// and convergence checks are not wedged forever by a dead agent.
pub async fn watchdog_loop(db: db::Db, watch: WatchRegistry, operations_cfg: OperationsConfig) {
    // Sweep well inside the ceiling so an overdue operation is caught
    // within roughly half a ceiling of going quiet.
    let sweep_interval = (operations_cfg.running_ceiling_secs / 2).max(5);
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));

    loop {
        interval.tick().await;

        match run_watchdog_sweep(&db, &watch, &operations_cfg, Utc::now()).await {
            Ok(0) => {}
            Ok(failed) => info!(failed, "watchdog failed overdue operations"),
            Err(err) => warn!(?err, "watchdog sweep failed"),
        }
    }
}

pub async fn run_watchdog_sweep(
    db: &db::Db,
    watch: &WatchRegistry,
    operations_cfg: &OperationsConfig,
    now: DateTime<Utc>,
) -> Result<u64> {
    let ceiling = operations_cfg.running_ceiling_secs.min(i64::MAX as u64) as i64;
    let cutoff = now - ChronoDuration::seconds(ceiling);

    let overdue = operations::overdue_operations(db, cutoff).await?;
    let mut failed = 0_u64;
    for record in overdue {
        let updated = record_transition(
            db,
            watch,
            record.id,
            OperationPhase::Failed,
            100,
            "operation timed out",
            Some("no progress within the operation ceiling"),
        )
        .await?;
        if updated.is_some() {
            warn!(operation_id = %record.id, node_id = %record.node_id, "operation timed out");
            failed += 1;
        }
    }
    Ok(failed)
}
