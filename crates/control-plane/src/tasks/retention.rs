use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::persistence::{self as db, join, operations};
use crate::Result;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub join_requests_pruned: u64,
    pub tokens_pruned: u64,
    pub operations_pruned: u64,
}

pub async fn retention_loop(db: db::Db, retention: RetentionConfig) {
    let sweep_interval = retention.sweep_interval_secs.max(60);
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));

    loop {
        interval.tick().await;

        match run_retention_sweep(&db, &retention, Utc::now()).await {
            Ok(report) if report == RetentionReport::default() => {}
            Ok(report) => {
                info!(
                    join_requests = report.join_requests_pruned,
                    tokens = report.tokens_pruned,
                    operations = report.operations_pruned,
                    "retention sweep pruned records"
                );
            }
            Err(err) => warn!(?err, "retention sweep failed"),
        }
    }
}

pub async fn run_retention_sweep(
    db: &db::Db,
    retention: &RetentionConfig,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let resolved_cutoff = now - secs(retention.resolved_join_secs);
    let pending_cutoff = now - secs(retention.pending_join_secs);
    let operation_cutoff = now - secs(retention.operation_secs);

    let join_requests_pruned =
        join::delete_old_requests(db, resolved_cutoff, pending_cutoff).await?;
    let tokens_pruned = join::delete_expired_tokens(db, now).await?;
    let operations_pruned = operations::delete_old_operations(db, operation_cutoff).await?;

    Ok(RetentionReport {
        join_requests_pruned,
        tokens_pruned,
        operations_pruned,
    })
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(value.min(i64::MAX as u64) as i64)
}
