//! Configuration management for synclimit.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SynclimitError};
use crate::mesh::{ClusterConfig, ClusterError};

/// Prefix of environment variables overriding file settings
/// (`SYNCLIMIT__LIMITER__THRESHOLD=50`).
const ENV_PREFIX: &str = "SYNCLIMIT";

/// Main configuration for a synclimit deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynclimitConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Reconciliation configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Sliding-window limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Logical key shared by all instances enforcing the same threshold
    #[serde(default = "default_key")]
    pub key: String,

    /// Bucket width in milliseconds
    #[serde(default = "default_stat_interval_ms")]
    pub stat_interval_ms: u64,

    /// Maximum admissions per bucket
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    /// Enforce a minimum spacing of `stat_interval / threshold` between admissions
    #[serde(default)]
    pub limit_evenly: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key: default_key(),
            stat_interval_ms: default_stat_interval_ms(),
            threshold: default_threshold(),
            limit_evenly: false,
        }
    }
}

impl LimiterConfig {
    /// Bucket width as a duration.
    pub fn stat_interval(&self) -> Duration {
        Duration::from_millis(self.stat_interval_ms)
    }
}

fn default_key() -> String {
    "default".to_string()
}

fn default_stat_interval_ms() -> u64 {
    1000
}

fn default_threshold() -> u64 {
    100
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether limiters reconcile with the shared store at all
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,

    /// Minimum time between two reconciliation rounds, in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            interval_ms: default_sync_interval_ms(),
        }
    }
}

impl SyncConfig {
    /// Reconciliation period as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_interval_ms() -> u64 {
    100
}

/// Which shared counter store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store
    #[default]
    Memory,
    /// Redis server
    Redis,
    /// Chitchat gossip mesh
    Mesh,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Selected backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Counter expiry in milliseconds; must cover at least one bucket
    #[serde(default = "default_expire_ttl_ms")]
    pub expire_ttl_ms: u64,

    /// Redis settings, used by the `redis` backend
    #[serde(default)]
    pub redis: RedisConfig,

    /// Mesh settings, used by the `mesh` backend
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            expire_ttl_ms: default_expire_ttl_ms(),
            redis: RedisConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Counter expiry as a duration.
    pub fn expire_ttl(&self) -> Duration {
        Duration::from_millis(self.expire_ttl_ms)
    }
}

fn default_expire_ttl_ms() -> u64 {
    2000
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Per-call deadline as a duration.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_op_timeout_ms() -> u64 {
    1000
}

/// Gossip mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier; a random one is generated when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers, defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to join
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Cluster identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip period in milliseconds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
        }
    }
}

impl MeshConfig {
    /// Build the cluster configuration for this node.
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        if self.gossip_interval_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "mesh.gossip_interval_ms must be greater than zero".to_string(),
            )
            .into());
        }

        let defaults = ClusterConfig::default();
        Ok(ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        })
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "synclimit".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

impl SynclimitConfig {
    /// Load configuration from a file, layered with `SYNCLIMIT__*` environment variables.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: SynclimitConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SynclimitError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SynclimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SynclimitError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.stat_interval_ms == 0 {
            return Err(SynclimitError::Config(
                "limiter.stat_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.limiter.threshold == 0 {
            return Err(SynclimitError::Config(
                "limiter.threshold must be greater than zero".to_string(),
            ));
        }
        if self.store.expire_ttl_ms < self.limiter.stat_interval_ms {
            return Err(SynclimitError::Config(format!(
                "store.expire_ttl_ms ({}) must be at least limiter.stat_interval_ms ({})",
                self.store.expire_ttl_ms, self.limiter.stat_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SynclimitConfig::default();

        assert_eq!(config.limiter.stat_interval(), Duration::from_secs(1));
        assert_eq!(config.limiter.threshold, 100);
        assert!(!config.limiter.limit_evenly);
        assert!(config.sync.enabled);
        assert_eq!(config.sync.interval(), Duration::from_millis(100));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.redis.op_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
limiter:
  key: checkout
  stat_interval_ms: 500
  threshold: 20
  limit_evenly: true
sync:
  interval_ms: 25
store:
  backend: redis
  expire_ttl_ms: 1500
  redis:
    url: redis://cache:6379/
"#;
        let config = SynclimitConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiter.key, "checkout");
        assert_eq!(config.limiter.stat_interval(), Duration::from_millis(500));
        assert_eq!(config.limiter.threshold, 20);
        assert!(config.limiter.limit_evenly);
        assert_eq!(config.sync.interval_ms, 25);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis.url, "redis://cache:6379/");
        assert_eq!(config.store.redis.op_timeout_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let yaml = "limiter:\n  threshold: 0\n";
        let err = SynclimitConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_validate_rejects_short_ttl() {
        let yaml = "limiter:\n  stat_interval_ms: 5000\nstore:\n  expire_ttl_ms: 1000\n";
        let err = SynclimitConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("expire_ttl_ms"));
    }

    #[test]
    fn test_mesh_cluster_config() {
        let yaml = r#"
store:
  backend: mesh
  mesh:
    node_id: node-a
    listen_addr: 127.0.0.1:7000
    seed_nodes: ["127.0.0.1:7001"]
"#;
        let config = SynclimitConfig::from_yaml(yaml).unwrap();
        let cluster = config.store.mesh.cluster_config().unwrap();

        assert_eq!(cluster.node_id, "node-a");
        assert_eq!(cluster.advertise_addr, cluster.listen_addr);
        assert_eq!(cluster.seed_nodes, vec!["127.0.0.1:7001".to_string()]);
        assert_eq!(cluster.gossip_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_mesh_rejects_zero_gossip_interval() {
        let mesh = MeshConfig {
            gossip_interval_ms: 0,
            ..Default::default()
        };

        let err = mesh.cluster_config().unwrap_err();
        assert!(matches!(
            err,
            SynclimitError::Cluster(ClusterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("synclimit-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "limiter:\n  key: files\n  threshold: 7\n").unwrap();

        let config = SynclimitConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter.key, "files");
        assert_eq!(config.limiter.threshold, 7);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
