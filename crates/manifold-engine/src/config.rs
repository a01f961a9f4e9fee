// Engine configuration: defaults as consts, YAML override struct and
// env-var overrides applied on top.
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Size of the per-shard buffered channel used to synchronise
/// subscribe/unsubscribe requests.
pub(crate) const SUBSCRIBE_CHANNEL_SIZE: usize = 4096;
/// Buffer size of each pub/sub worker lane.
pub(crate) const PUBSUB_WORKER_CHANNEL_SIZE: usize = 4096;
/// Maximum number of channels included in a single subscribe call.
pub(crate) const SUBSCRIBE_BATCH_LIMIT: usize = 2048;
/// Size of the per-shard buffered channel collecting publish requests.
pub(crate) const PUBLISH_CHANNEL_SIZE: usize = 1024;
/// Maximum number of publish requests sent in one batched flush.
pub(crate) const PUBLISH_BATCH_LIMIT: usize = 2048;
/// Buffer size of the data operation channel; also the data batch bound.
pub(crate) const DATA_CHANNEL_SIZE: usize = 256;

pub(crate) const POOL_MAX_IDLE: usize = 10;
pub(crate) const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(240);
/// Pause between supervised loop restarts, so a dead store is not hammered
/// in a tight reconnect loop.
pub(crate) const RESTART_BACKOFF: Duration = Duration::from_millis(300);
pub(crate) const SENTINEL_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const SENTINEL_DIAL_TIMEOUT: Duration = Duration::from_millis(300);

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_POOL_SIZE: usize = 256;
const DEFAULT_PREFIX: &str = "manifold";
const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Options for one store shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub host: String,
    pub port: u16,
    /// Password sent via `AUTH` on connect when set.
    pub password: Option<String>,
    /// Database selected via `SELECT` on connect when non-zero.
    pub db: u32,
    /// Leader name monitored by sentinels; enables leader discovery
    /// together with `sentinel_addrs`.
    pub master_name: Option<String>,
    pub sentinel_addrs: Vec<String>,
    pub pool_size: usize,
    /// Prefix for every channel name and key the shard uses in the store.
    pub prefix: String,
    /// Pub/sub worker lanes; 0 means one per available core.
    pub pubsub_workers: usize,
    /// Must stay above the ping publish interval, or the subscription
    /// connection's blocking read will time out and force a resubscribe.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: 0,
            master_name: None,
            sentinel_addrs: Vec::new(),
            pool_size: DEFAULT_POOL_SIZE,
            prefix: DEFAULT_PREFIX.to_string(),
            pubsub_workers: 0,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl ShardConfig {
    /// Defaults overlaid with `MANIFOLD_STORE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("MANIFOLD_STORE_HOST") {
            config.host = value;
        }
        if let Some(value) = read_env::<u16>("MANIFOLD_STORE_PORT") {
            config.port = value;
        }
        if let Ok(value) = std::env::var("MANIFOLD_STORE_PASSWORD") {
            config.password = Some(value);
        }
        if let Some(value) = read_env::<u32>("MANIFOLD_STORE_DB") {
            config.db = value;
        }
        if let Some(value) = read_env::<usize>("MANIFOLD_STORE_POOL_SIZE") {
            config.pool_size = value;
        }
        if let Ok(value) = std::env::var("MANIFOLD_STORE_PREFIX") {
            config.prefix = value;
        }
        if let Some(value) = read_env::<usize>("MANIFOLD_STORE_WORKERS") {
            config.pubsub_workers = value;
        }
        if let Some(value) = read_env::<u64>("MANIFOLD_STORE_READ_TIMEOUT_MS") {
            config.read_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_env::<u64>("MANIFOLD_STORE_WRITE_TIMEOUT_MS") {
            config.write_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_env::<u64>("MANIFOLD_STORE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(value);
        }
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn use_sentinel(&self) -> bool {
        self.master_name.is_some() && !self.sentinel_addrs.is_empty()
    }

    pub(crate) fn worker_count(&self) -> usize {
        if self.pubsub_workers > 0 {
            return self.pubsub_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool_size must be positive".into()));
        }
        if self.read_timeout.is_zero() {
            // A zero read timeout would also zero the ping pacing interval.
            return Err(EngineError::Config("read_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Engine configuration: one entry per store shard. More than one shard
/// enables sharding; channel assignment depends only on the channel name
/// and the shard count.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub shards: Vec<ShardConfig>,
}

impl EngineConfig {
    pub fn single(shard: ShardConfig) -> Self {
        Self {
            shards: vec![shard],
        }
    }

    /// Defaults overridden by a YAML document of the shape
    /// `shards: [{host: ..., port: ...}, ...]`.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let override_cfg: EngineConfigOverride = serde_yaml::from_str(contents)
            .map_err(|err| EngineError::Config(format!("parse engine config yaml: {err}")))?;
        let shards = override_cfg
            .shards
            .into_iter()
            .map(|shard_override| {
                let mut shard = ShardConfig::default();
                shard_override.apply(&mut shard);
                shard
            })
            .collect();
        Ok(Self { shards })
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(EngineError::Config("at least one shard required".into()));
        }
        for shard in &self.shards {
            shard.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigOverride {
    #[serde(default)]
    shards: Vec<ShardConfigOverride>,
}

#[derive(Debug, Deserialize, Default)]
struct ShardConfigOverride {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    db: Option<u32>,
    master_name: Option<String>,
    sentinel_addrs: Option<Vec<String>>,
    pool_size: Option<usize>,
    prefix: Option<String>,
    pubsub_workers: Option<usize>,
    read_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

impl ShardConfigOverride {
    fn apply(self, config: &mut ShardConfig) {
        if let Some(value) = self.host {
            config.host = value;
        }
        if let Some(value) = self.port {
            config.port = value;
        }
        if let Some(value) = self.password {
            config.password = Some(value);
        }
        if let Some(value) = self.db {
            config.db = value;
        }
        if let Some(value) = self.master_name {
            config.master_name = Some(value);
        }
        if let Some(value) = self.sentinel_addrs {
            config.sentinel_addrs = value;
        }
        if let Some(value) = self.pool_size
            && value > 0
        {
            config.pool_size = value;
        }
        if let Some(value) = self.prefix {
            config.prefix = value;
        }
        if let Some(value) = self.pubsub_workers {
            config.pubsub_workers = value;
        }
        if let Some(value) = self.read_timeout_ms
            && value > 0
        {
            config.read_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.write_timeout_ms
            && value > 0
        {
            config.write_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            config.connect_timeout = Duration::from_millis(value);
        }
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_pass_validation() {
        EngineConfig::single(ShardConfig::default())
            .validate()
            .expect("default config");
    }

    #[test]
    fn rejects_empty_shard_list() {
        let err = EngineConfig::default().validate().expect_err("no shards");
        assert!(err.to_string().contains("at least one shard"));
    }

    #[test]
    fn rejects_zero_read_timeout() {
        let shard = ShardConfig {
            read_timeout: Duration::ZERO,
            ..ShardConfig::default()
        };
        let err = EngineConfig::single(shard).validate().expect_err("timeout");
        assert!(err.to_string().contains("read_timeout"));
    }

    #[test]
    fn yaml_overrides_apply_over_defaults() {
        let config = EngineConfig::from_yaml_str(
            r"
shards:
  - host: store-a
    port: 7000
    prefix: cluster
    read_timeout_ms: 5000
  - host: store-b
",
        )
        .expect("parse yaml");
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.shards[0].host, "store-a");
        assert_eq!(config.shards[0].port, 7000);
        assert_eq!(config.shards[0].prefix, "cluster");
        assert_eq!(config.shards[0].read_timeout, Duration::from_secs(5));
        assert_eq!(config.shards[1].host, "store-b");
        assert_eq!(config.shards[1].port, 6379);
    }

    #[test]
    #[serial]
    fn env_overrides_apply_over_defaults() {
        unsafe {
            std::env::set_var("MANIFOLD_STORE_HOST", "store-env");
            std::env::set_var("MANIFOLD_STORE_POOL_SIZE", "7");
        }
        let config = ShardConfig::from_env();
        assert_eq!(config.host, "store-env");
        assert_eq!(config.pool_size, 7);
        unsafe {
            std::env::remove_var("MANIFOLD_STORE_HOST");
            std::env::remove_var("MANIFOLD_STORE_POOL_SIZE");
        }
    }

    #[test]
    fn sentinel_requires_name_and_addrs() {
        let mut shard = ShardConfig {
            master_name: Some("leader".into()),
            ..ShardConfig::default()
        };
        assert!(!shard.use_sentinel());
        shard.sentinel_addrs = vec!["127.0.0.1:26379".into()];
        assert!(shard.use_sentinel());
    }
}
