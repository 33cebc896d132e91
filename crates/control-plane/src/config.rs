use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "CLUSTERD";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cluster: ClusterConfig,
    pub tokens: TokenConfig,
    pub health: HealthConfig,
    pub operations: OperationsConfig,
    pub reconcile: ReconcileConfig,
    pub retention: RetentionConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Profiles assigned when an approval carries none.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub default_profiles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub pepper: String,
    /// Default join-token lifetime when CreateJoinToken omits expiry.
    #[serde(default = "default_join_token_ttl_secs")]
    pub join_token_ttl_secs: u64,
    /// Uses permitted per join token.
    #[serde(default = "default_join_token_max_uses")]
    pub join_token_max_uses: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval agents are expected to report status on.
    pub heartbeat_interval_secs: u64,
    /// A node is `unknown` once last_seen is older than
    /// `heartbeat_interval_secs * staleness_multiplier`.
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: u32,
}

impl HealthConfig {
    pub fn staleness_threshold(&self) -> chrono::Duration {
        let secs = self
            .heartbeat_interval_secs
            .saturating_mul(u64::from(self.staleness_multiplier.max(1)));
        chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationsConfig {
    /// Per-send timeout when handing a plan to a node agent.
    pub dispatch_timeout_secs: u64,
    /// Ceiling after which a non-terminal operation is failed by the
    /// watchdog.
    pub running_ceiling_secs: u64,
    /// Bounded queue depth per operation watcher; a full queue drops
    /// the watcher rather than stalling the operation.
    #[serde(default = "default_watch_queue_depth")]
    pub watch_queue_depth: usize,
    /// Time budget for draining a node before removal proceeds anyway.
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// How long resolved join requests are kept.
    pub resolved_join_secs: u64,
    /// How long unresolved join requests are kept.
    pub pending_join_secs: u64,
    /// How long terminal operations are kept.
    pub operation_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_field_len: usize,
    pub max_profiles: usize,
    pub max_units_per_report: usize,
    /// Cap on inline upgrade artifact size.
    pub max_artifact_bytes: usize,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

fn default_join_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_join_token_max_uses() -> u32 {
    1
}

fn default_staleness_multiplier() -> u32 {
    3
}

fn default_watch_queue_depth() -> usize {
    32
}

impl OperationsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_timeout_secs == 0 {
            anyhow::bail!("operations.dispatch_timeout_secs must be > 0");
        }
        if self.running_ceiling_secs < self.dispatch_timeout_secs {
            anyhow::bail!(
                "operations.running_ceiling_secs must be >= operations.dispatch_timeout_secs"
            );
        }
        if self.watch_queue_depth == 0 {
            anyhow::bail!("operations.watch_queue_depth must be > 0");
        }
        Ok(())
    }
}

impl HealthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("health.heartbeat_interval_secs must be > 0");
        }
        if self.staleness_multiplier == 0 {
            anyhow::bail!("health.staleness_multiplier must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric token strings are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("database.url", "sqlite://data/control-plane.db")?
        .set_default("cluster.default_profiles", vec!["core"])?
        .set_default("tokens.pepper", "dev-token-pepper")?
        .set_default("tokens.join_token_ttl_secs", default_join_token_ttl_secs())?
        .set_default("tokens.join_token_max_uses", default_join_token_max_uses())?
        .set_default("health.heartbeat_interval_secs", 30u64)?
        .set_default("health.staleness_multiplier", default_staleness_multiplier())?
        .set_default("operations.dispatch_timeout_secs", 30u64)?
        .set_default("operations.running_ceiling_secs", 600u64)?
        .set_default("operations.watch_queue_depth", 32u64)?
        .set_default("operations.drain_timeout_secs", 60u64)?
        .set_default("reconcile.sweep_interval_secs", 15u64)?
        .set_default("retention.resolved_join_secs", 72 * 60 * 60u64)?
        .set_default("retention.pending_join_secs", 7 * 24 * 60 * 60u64)?
        .set_default("retention.operation_secs", 24 * 60 * 60u64)?
        .set_default("retention.sweep_interval_secs", 60u64)?
        .set_default("limits.max_field_len", 255u64)?
        .set_default("limits.max_profiles", 16u64)?
        .set_default("limits.max_units_per_report", 256u64)?
        .set_default("limits.max_artifact_bytes", 256 * 1024 * 1024u64)?;

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.health.validate()?;
    cfg.operations.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_and_validate() {
        let cfg = load().expect("default config");
        assert_eq!(cfg.tokens.join_token_max_uses, 1);
        assert_eq!(cfg.health.staleness_multiplier, 3);
        assert!(!cfg.cluster.default_profiles.is_empty());
    }

    #[test]
    fn staleness_threshold_multiplies_heartbeat() {
        let health = HealthConfig {
            heartbeat_interval_secs: 30,
            staleness_multiplier: 3,
        };
        assert_eq!(health.staleness_threshold(), chrono::Duration::seconds(90));
    }

    #[test]
    fn running_ceiling_below_dispatch_timeout_rejected() {
        let ops = OperationsConfig {
            dispatch_timeout_secs: 60,
            running_ceiling_secs: 30,
            watch_queue_depth: 8,
            drain_timeout_secs: 60,
        };
        assert!(ops.validate().is_err());
    }
}
