//! solvergrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub data_dir: Option<PathBuf>,
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub sectioning: SectioningConfig,
    pub coordinator: CoordinatorConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Prefix for in-process node names (`{prefix}-{index}`).
    pub name_prefix: String,
    /// Memory made available to solver instances on one node.
    pub capacity_memory_bytes: u64,
    /// Estimated footprint of one live solver instance.
    pub solver_memory_bytes: u64,
    /// A node with less free memory than this is not available for placement.
    pub memory_floor_bytes: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name_prefix: "solver".to_string(),
            capacity_memory_bytes: 8 * 1024 * 1024 * 1024,
            solver_memory_bytes: 512 * 1024 * 1024,
            memory_floor_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub group: String,
    /// Number of nodes the daemon starts in its in-process fabric.
    pub nodes: u32,
    pub rpc_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub suspect_timeout_ms: u64,
    pub lock_retry_delay_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            group: "solvergrid".to_string(),
            nodes: 1,
            rpc_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            suspect_timeout_ms: 10_000,
            lock_retry_delay_ms: 1_000,
        }
    }
}

impl ClusterConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SectioningConfig {
    /// Concurrent workers used to process one batch of requests.
    pub workers: usize,
    /// Base seed for the tie-breaking random source.
    pub seed: u64,
    /// Rooms further apart than this cannot be reached within the break.
    pub distance_limit_meters: f64,
    /// Back-to-back break (in 5-minute slots) considered for distance conflicts.
    pub distance_break_slots: u16,
    pub last_week_to_enroll: i32,
    pub last_week_to_change: i32,
    pub last_week_to_drop: i32,
}

impl Default for SectioningConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            seed: 0x5eed,
            distance_limit_meters: 670.0,
            distance_break_slots: 2,
            last_week_to_enroll: 1,
            last_week_to_change: 1,
            last_week_to_drop: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub scan_interval_secs: u64,
    /// Solvers unused for longer than this are unloaded. 0 disables eviction.
    pub idle_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            idle_timeout_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8443 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,solverd=debug,solvergrid=debug".to_string(),
            json: false,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GridConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Data directory, falling back to the working directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./solvergrid-data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = GridConfig::from_toml_str("").unwrap();
        assert_eq!(config.cluster.group, "solvergrid");
        assert_eq!(config.sectioning.workers, 4);
        assert_eq!(config.api.port, 8443);
        assert!(!config.logging.json);
    }

    #[test]
    fn partial_sections_override_defaults() {
        let config = GridConfig::from_toml_str(
            r#"
data_dir = "/var/lib/solvergrid"

[cluster]
nodes = 3
rpc_timeout_ms = 250

[sectioning]
seed = 42
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.nodes, 3);
        assert_eq!(config.cluster.rpc_timeout(), Duration::from_millis(250));
        assert_eq!(config.cluster.group, "solvergrid");
        assert_eq!(config.sectioning.seed, 42);
        assert_eq!(config.sectioning.workers, 4);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/solvergrid"));
    }

    #[test]
    fn config_survives_toml_rendering() {
        let mut config = GridConfig::default();
        config.node.memory_floor_bytes = 42;
        let rendered = config.to_toml_string().unwrap();
        let back = GridConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(back.node.memory_floor_bytes, 42);
    }
}
