//! runplane.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the built-in
//! defaults. Pools and workspaces listed here are written to the store on
//! startup, replacing any stored record with the same ID.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use runplane_autoscale::{AutoscaleConfig, RestartPolicy};
use runplane_capacity::CapacityConfig;
use runplane_scheduler::{BackoffPolicy, DispatchConfig};
use runplane_state::{AgentPool, Workspace};

use crate::engine::LocalExecution;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunplaneConfig {
    pub store: StoreConfig,
    pub dispatch: DispatchSection,
    pub capacity: CapacitySection,
    pub autoscale: AutoscaleSection,
    pub local: LocalExecution,
    pub log: LogConfig,
    pub pools: Vec<AgentPool>,
    pub workspaces: Vec<Workspace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/runplane/runplane.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub workers: usize,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub no_agents_delay_secs: u64,
    pub no_pool_delay_secs: u64,
    pub local_timeout_secs: u64,
    /// Storage lease held on a task row while it is handed over.
    pub claim_lease_secs: u64,
    /// How often every workspace with Pending work is re-queued.
    pub sweep_interval_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base_secs: 5,
            backoff_max_secs: 60,
            no_agents_delay_secs: 15,
            no_pool_delay_secs: 10,
            local_timeout_secs: 60 * 60,
            claim_lease_secs: 60,
            sweep_interval_secs: 10,
        }
    }
}

impl DispatchSection {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            backoff: BackoffPolicy::new(
                Duration::from_secs(self.backoff_base_secs),
                Duration::from_secs(self.backoff_max_secs),
            ),
            no_agents_delay: Duration::from_secs(self.no_agents_delay_secs),
            no_pool_delay: Duration::from_secs(self.no_pool_delay_secs),
            local_timeout: Duration::from_secs(self.local_timeout_secs),
            claim_lease: Duration::from_secs(self.claim_lease_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacitySection {
    pub heartbeat_timeout_secs: u64,
    pub reservation_ttl_secs: u64,
    pub backend_timeout_secs: u64,
}

impl Default for CapacitySection {
    fn default() -> Self {
        let defaults = CapacityConfig::default();
        Self {
            heartbeat_timeout_secs: defaults.heartbeat_timeout_secs,
            reservation_ttl_secs: defaults.reservation_ttl_secs,
            backend_timeout_secs: defaults.backend_timeout.as_secs(),
        }
    }
}

impl CapacitySection {
    pub fn capacity_config(&self) -> CapacityConfig {
        CapacityConfig {
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            reservation_ttl_secs: self.reservation_ttl_secs,
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSection {
    pub interval_secs: u64,
    pub scale_up_utilization: f64,
    pub scale_down_utilization: f64,
    /// Time a new pod gets to register its agent.
    pub grace_period_secs: u64,
    pub restart_base_backoff_secs: u64,
    pub restart_max_backoff_secs: u64,
    pub max_restarts: u32,
}

impl Default for AutoscaleSection {
    fn default() -> Self {
        let defaults = AutoscaleConfig::default();
        Self {
            interval_secs: 5,
            scale_up_utilization: defaults.scale_up_utilization,
            scale_down_utilization: defaults.scale_down_utilization,
            grace_period_secs: defaults.restart.grace_period.as_secs(),
            restart_base_backoff_secs: defaults.restart.base_backoff.as_secs(),
            restart_max_backoff_secs: defaults.restart.max_backoff.as_secs(),
            max_restarts: defaults.restart.max_restarts,
        }
    }
}

impl AutoscaleSection {
    pub fn autoscale_config(&self) -> AutoscaleConfig {
        AutoscaleConfig {
            scale_up_utilization: self.scale_up_utilization,
            scale_down_utilization: self.scale_down_utilization,
            restart: RestartPolicy {
                grace_period: Duration::from_secs(self.grace_period_secs),
                base_backoff: Duration::from_secs(self.restart_base_backoff_secs),
                max_backoff: Duration::from_secs(self.restart_max_backoff_secs),
                max_restarts: self.max_restarts,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl RunplaneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: RunplaneConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for pool in &self.pools {
            if pool.slots_per_pod == 0 {
                anyhow::bail!("pool {}: slots_per_pod must be at least 1", pool.pool_id);
            }
            if pool.max_replicas < pool.min_replicas {
                anyhow::bail!(
                    "pool {}: max_replicas {} is below min_replicas {}",
                    pool.pool_id,
                    pool.max_replicas,
                    pool.min_replicas
                );
            }
        }
        for ws in &self.workspaces {
            if let Some(pool_id) = &ws.current_pool_id
                && !self.pools.iter().any(|p| &p.pool_id == pool_id)
            {
                tracing::warn!(
                    workspace_id = %ws.workspace_id,
                    %pool_id,
                    "workspace references a pool not defined in the config"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runplane_state::{ExecutionMode, PoolKind};

    #[test]
    fn empty_file_uses_defaults() {
        let config = RunplaneConfig::from_toml("").unwrap();
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.autoscale.interval_secs, 5);
        assert_eq!(config.capacity.reservation_ttl_secs, 24 * 60 * 60);
        assert!(config.pools.is_empty());

        let dispatch = config.dispatch.dispatch_config();
        assert_eq!(dispatch.backoff.delay(4), Duration::from_secs(60));
        assert_eq!(dispatch.no_agents_delay, Duration::from_secs(15));
        assert_eq!(dispatch.claim_lease, Duration::from_secs(60));
    }

    #[test]
    fn parses_pools_and_workspaces() {
        let config = RunplaneConfig::from_toml(
            r#"
[store]
path = "/tmp/rp.redb"

[dispatch]
workers = 8

[autoscale]
grace_period_secs = 300
max_restarts = 3

[local.plan]
program = "terraform"
args = ["plan", "-input=false"]
working_dir = "/srv/workspaces"
per_workspace_dir = true

[[pools]]
pool_id = "pool-a"
kind = "k8s"
min_replicas = 1
max_replicas = 4
slots_per_pod = 2

[[pools.freeze_schedules]]
weekdays = [5]
from_time = "18:00"
to_time = "06:00"

[[workspaces]]
workspace_id = "ws-1"
execution_mode = "k8s"
current_pool_id = "pool-a"
"#,
        )
        .unwrap();

        assert_eq!(config.store.path, PathBuf::from("/tmp/rp.redb"));
        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.dispatch.backoff_base_secs, 5);

        let pool = &config.pools[0];
        assert_eq!(pool.kind, PoolKind::Kubernetes);
        assert_eq!(pool.slots_per_pod, 2);
        assert_eq!(pool.freeze_schedules[0].weekdays, vec![5]);

        let ws = &config.workspaces[0];
        assert_eq!(ws.execution_mode, ExecutionMode::Kubernetes);
        assert_eq!(ws.current_pool_id.as_deref(), Some("pool-a"));

        let plan = config.local.plan.as_ref().unwrap();
        assert_eq!(plan.args, vec!["plan", "-input=false"]);
        assert!(plan.per_workspace_dir);
        assert!(config.local.apply.is_none());

        let restart = config.autoscale.autoscale_config().restart;
        assert_eq!(restart.grace_period, Duration::from_secs(300));
        assert_eq!(restart.max_restarts, 3);
    }

    #[test]
    fn rejects_inverted_replica_bounds() {
        let err = RunplaneConfig::from_toml(
            r#"
[[pools]]
pool_id = "bad"
kind = "k8s"
min_replicas = 3
max_replicas = 1
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("below min_replicas"));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = RunplaneConfig::default();
        config.pools.push(AgentPool::kubernetes("pool-a", 0, 3));
        let text = config.to_toml_string().unwrap();
        let parsed = RunplaneConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.pools, config.pools);
    }
}
