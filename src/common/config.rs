//! Configuration for zkswitch components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::{Error, Result};

/// Environment prefix, e.g. `ZKSWITCH_ZK__HOSTS=zk1:2181,zk2:2181`
pub const ENV_PREFIX: &str = "ZKSWITCH";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay listener
    pub server: ServerConfig,

    /// Coordination service connection
    pub zk: ZkConfig,

    /// Coordination paths (relative to `paths.root`)
    pub paths: PathsConfig,

    /// Health-check and election tunables
    pub watcher: WatcherConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            zk: ZkConfig::default(),
            paths: PathsConfig::default(),
            watcher: WatcherConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address clients connect to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3456))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// ZooKeeper ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZkConfig {
    /// `host:port` entries
    #[serde(default = "default_zk_hosts")]
    pub hosts: Vec<String>,

    /// Session timeout
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
}

fn default_zk_hosts() -> Vec<String> {
    vec!["127.0.0.1:2181".to_string()]
}
fn default_session_timeout() -> u64 {
    10_000
}

impl ZkConfig {
    pub fn connect_string(&self) -> String {
        self.hosts.join(",")
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

impl Default for ZkConfig {
    fn default() -> Self {
        Self {
            hosts: default_zk_hosts(),
            session_timeout_ms: default_session_timeout(),
        }
    }
}

/// Node layout under the root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_master")]
    pub master: String,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_judge")]
    pub judge: String,
    #[serde(default = "default_fail")]
    pub fail: String,
    #[serde(default = "default_min_fail")]
    pub min_fail: String,
}

fn default_root() -> String {
    "/zkswitch".to_string()
}
fn default_master() -> String {
    "/master".to_string()
}
fn default_server() -> String {
    "/servers".to_string()
}
fn default_judge() -> String {
    "/judge".to_string()
}
fn default_fail() -> String {
    "/fail".to_string()
}
fn default_min_fail() -> String {
    "/min_fail".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            master: default_master(),
            server: default_server(),
            judge: default_judge(),
            fail: default_fail(),
            min_fail: default_min_fail(),
        }
    }
}

/// Watcher tunables. Defaults are the production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Pause between health checks
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Bound on a single TCP reachability probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive failed probes before a fail marker is raised
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    /// Wait after raising a marker so other watchers' markers can land
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Wait between vacating the master and publishing the new one
    #[serde(default = "default_settle")]
    pub vacate_settle_ms: u64,

    /// Master publish attempts per round
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Backoff between publish attempts
    #[serde(default = "default_settle")]
    pub publish_backoff_ms: u64,

    /// Mirror resubscribe interval after an error
    #[serde(default = "default_mirror_retry")]
    pub mirror_retry_ms: u64,

    /// Threshold substituted when the mirrored min fail value is malformed
    #[serde(default = "default_min_fail_sentinel")]
    pub min_fail_sentinel: usize,
}

fn default_check_interval() -> u64 {
    2_000
}
fn default_probe_timeout() -> u64 {
    1_000
}
fn default_fail_threshold() -> u32 {
    3
}
fn default_settle() -> u64 {
    2_000
}
fn default_publish_attempts() -> u32 {
    5
}
fn default_mirror_retry() -> u64 {
    3_000
}
fn default_min_fail_sentinel() -> usize {
    100
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            probe_timeout_ms: default_probe_timeout(),
            fail_threshold: default_fail_threshold(),
            settle_ms: default_settle(),
            vacate_settle_ms: default_settle(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_settle(),
            mirror_retry_ms: default_mirror_retry(),
            min_fail_sentinel: default_min_fail_sentinel(),
        }
    }
}

impl WatcherConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn vacate_settle(&self) -> Duration {
        Duration::from_millis(self.vacate_settle_ms)
    }

    pub fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms)
    }

    pub fn mirror_retry(&self) -> Duration {
        Duration::from_millis(self.mirror_retry_ms)
    }
}

impl Config {
    /// Load configuration: optional TOML file, then `ZKSWITCH_*` environment.
    ///
    /// Without an explicit path, `./zkswitch.toml` is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf())
                .format(config::FileFormat::Toml)
                .required(true),
            None => config::File::with_name("zkswitch")
                .format(config::FileFormat::Toml)
                .required(false),
        };

        let conf: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("zk.hosts")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.zk.hosts.is_empty() {
            return Err(Error::InvalidConfig("zk.hosts cannot be empty".into()));
        }
        if !self.paths.root.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "paths.root must be absolute: {}",
                self.paths.root
            )));
        }
        for (name, rel) in [
            ("master", &self.paths.master),
            ("server", &self.paths.server),
            ("judge", &self.paths.judge),
            ("fail", &self.paths.fail),
            ("min_fail", &self.paths.min_fail),
        ] {
            if !rel.starts_with('/') || rel.len() < 2 {
                return Err(Error::InvalidConfig(format!(
                    "paths.{} must start with '/': {:?}",
                    name, rel
                )));
            }
        }
        if self.watcher.fail_threshold == 0 {
            return Err(Error::InvalidConfig(
                "watcher.fail_threshold must be at least 1".into(),
            ));
        }
        if self.watcher.publish_attempts == 0 {
            return Err(Error::InvalidConfig(
                "watcher.publish_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
