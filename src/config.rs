//! Runtime configuration: [`Config`] built via [`ConfigBuilder`].
//!
//! Mirrors the Configuration table in the external interfaces: one field per
//! recognized key, serde-derived so it can be loaded from TOML/JSON or
//! constructed programmatically, with validation at `build()` time.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::NodeId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum StorageModule {
    Memory,
    SimpleFile,
    SegmentedBinary,
    SegmentedText,
}

/// How a leader decides to snapshot: size-based thresholds from §4.10.1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub snapshot_min_log_size: u64,
    pub snapshot_ratio: f64,
    pub snapshot_watchdog_interval: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_min_log_size: 1 << 20,
            snapshot_ratio: 4.0,
            snapshot_watchdog_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub cluster_name: String,
    pub server_id: NodeId,

    pub storage_path: PathBuf,
    pub storage_module: StorageModule,
    pub storage_segment_bytes: u64,
    pub storage_open_segments: usize,
    pub storage_checksum: bool,

    #[serde(with = "duration_millis")]
    pub election_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_period: Duration,
    #[serde(with = "duration_millis")]
    pub rpc_failure_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub state_machine_updater_backoff: Duration,

    pub snapshot_policy: SnapshotPolicy,
    /// Fraction of `last_snapshot_index` worth of trailing segments kept
    /// after a snapshot advances `log_start_index` (§4.9.8, Open Question b).
    pub snapshot_retention_entries: u64,

    #[serde(with = "duration_millis")]
    pub session_timeout: Duration,

    pub soft_rpc_size_limit: u64,
    pub max_log_entries_per_request: u64,

    pub raft_debug: bool,
}

impl Config {
    pub fn builder(cluster_name: impl Into<String>, server_id: NodeId) -> ConfigBuilder {
        ConfigBuilder::new(cluster_name, server_id)
    }

    /// `withhold_votes_until` / election-timer jitter upper bound, per §4.9.2:
    /// `now + T + uniform_random(0, T)`.
    pub fn election_timeout_jittered(&self) -> Duration {
        use rand::Rng;
        let jitter_ms = rand::thread_rng().gen_range(0..=self.election_timeout.as_millis() as u64);
        self.election_timeout + Duration::from_millis(jitter_ms)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Builder for [`Config`], matching the pack's config-builder idiom: owned
/// setters that return `Self`, with validation deferred to `build()`.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    server_id: NodeId,
    storage_path: PathBuf,
    storage_module: StorageModule,
    storage_segment_bytes: u64,
    storage_open_segments: usize,
    storage_checksum: bool,
    election_timeout: Duration,
    heartbeat_period: Duration,
    rpc_failure_backoff: Duration,
    state_machine_updater_backoff: Duration,
    snapshot_policy: SnapshotPolicy,
    snapshot_retention_entries: u64,
    session_timeout: Duration,
    soft_rpc_size_limit: u64,
    max_log_entries_per_request: u64,
    raft_debug: bool,
}

impl ConfigBuilder {
    pub fn new(cluster_name: impl Into<String>, server_id: NodeId) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            server_id,
            storage_path: PathBuf::from("."),
            storage_module: StorageModule::SegmentedBinary,
            storage_segment_bytes: 8 << 20,
            storage_open_segments: 2,
            storage_checksum: true,
            election_timeout: Duration::from_millis(500),
            heartbeat_period: Duration::from_millis(100),
            rpc_failure_backoff: Duration::from_millis(200),
            state_machine_updater_backoff: Duration::from_millis(200),
            snapshot_policy: SnapshotPolicy::default(),
            snapshot_retention_entries: 1000,
            session_timeout: Duration::from_secs(60),
            soft_rpc_size_limit: 1 << 20,
            max_log_entries_per_request: 64,
            raft_debug: false,
        }
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn storage_module(mut self, module: StorageModule) -> Self {
        self.storage_module = module;
        self
    }

    pub fn storage_segment_bytes(mut self, bytes: u64) -> Self {
        self.storage_segment_bytes = bytes;
        self
    }

    pub fn storage_open_segments(mut self, n: usize) -> Self {
        self.storage_open_segments = n;
        self
    }

    pub fn election_timeout(mut self, d: Duration) -> Self {
        self.election_timeout = d;
        self
    }

    pub fn heartbeat_period(mut self, d: Duration) -> Self {
        self.heartbeat_period = d;
        self
    }

    pub fn session_timeout(mut self, d: Duration) -> Self {
        self.session_timeout = d;
        self
    }

    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.heartbeat_period > self.election_timeout / 2 {
            return Err(ConfigError::Invalid(
                "heartbeat_period must be <= election_timeout / 2".into(),
            ));
        }
        if self.storage_segment_bytes == 0 {
            return Err(ConfigError::Invalid("storage_segment_bytes must be > 0".into()));
        }
        if self.storage_open_segments == 0 {
            return Err(ConfigError::Invalid("storage_open_segments must be > 0".into()));
        }
        if matches!(self.storage_module, StorageModule::SegmentedText) {
            return Err(ConfigError::Invalid(
                "Segmented-Text storage is a recognized configuration value but is not implemented"
                    .into(),
            ));
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            server_id: self.server_id,
            storage_path: self.storage_path,
            storage_module: self.storage_module,
            storage_segment_bytes: self.storage_segment_bytes,
            storage_open_segments: self.storage_open_segments,
            storage_checksum: self.storage_checksum,
            election_timeout: self.election_timeout,
            heartbeat_period: self.heartbeat_period,
            rpc_failure_backoff: self.rpc_failure_backoff,
            state_machine_updater_backoff: self.state_machine_updater_backoff,
            snapshot_policy: self.snapshot_policy,
            snapshot_retention_entries: self.snapshot_retention_entries,
            session_timeout: self.session_timeout,
            soft_rpc_size_limit: self.soft_rpc_size_limit,
            max_log_entries_per_request: self.max_log_entries_per_request,
            raft_debug: self.raft_debug,
        })
    }
}
