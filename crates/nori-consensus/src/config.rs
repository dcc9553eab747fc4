//! Consensus configuration (timeouts, limits, tuning parameters).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Per-node consensus configuration.
///
/// Every duration is expressed in milliseconds when loaded from YAML:
///
/// ```yaml
/// heartbeat_interval: 100
/// election_timeout_min: 1000
/// election_timeout_max: 2000
/// enable_leader_lease: true
/// throttle:
///   throughput_bytes_per_sec: 52428800
///   max_install_snapshot_tasks: 4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Heartbeat interval (leader → followers).
    ///
    /// Must be < election_timeout_min to prevent spurious elections.
    ///
    /// Default: 100ms
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// Default: 1000ms
    #[serde(with = "duration_ms")]
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 2000ms
    #[serde(with = "duration_ms")]
    pub election_timeout_max: Duration,

    /// Serve reads from the leader lease and refuse votes while the
    /// follower lease holds.
    ///
    /// Default: true
    pub enable_leader_lease: bool,

    /// Leader lease window as a fraction of `election_timeout_min`.
    ///
    /// Default: 0.9
    pub leader_lease_ratio: f32,

    /// Clock drift tolerated between peers when honouring a follower lease.
    ///
    /// Default: 1000ms
    #[serde(with = "duration_ms")]
    pub max_clock_drift: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 1024
    pub max_entries_per_append: usize,

    /// Maximum payload bytes per AppendEntries RPC.
    ///
    /// Default: 512 KiB
    pub max_bytes_per_append: usize,

    /// Maximum AppendEntries RPCs in flight per follower.
    ///
    /// Default: 1 (no pipelining)
    pub max_pipeline_depth: usize,

    /// Out-of-order AppendEntries requests a follower buffers per leader
    /// while waiting for the gap to fill. 0 disables the cache.
    ///
    /// Default: 8
    pub max_out_of_order_cache: usize,

    /// How long `propose` waits for the entry to commit.
    ///
    /// Default: 5000ms
    #[serde(with = "duration_ms")]
    pub propose_timeout: Duration,

    /// Deadline for vote, append and timeout-now RPCs.
    ///
    /// Default: 500ms
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,

    /// Deadline for the whole InstallSnapshot RPC on the leader side.
    ///
    /// Default: 60000ms
    #[serde(with = "duration_ms")]
    pub install_snapshot_timeout: Duration,

    /// Bytes requested per GetFile RPC.
    ///
    /// Default: 128 KiB
    pub snapshot_chunk_size: usize,

    /// Skip all-zero blocks when serving snapshot files.
    ///
    /// Default: true
    pub file_check_hole: bool,

    /// Block size inspected by hole detection.
    ///
    /// Default: 8 KiB
    pub hole_check_block_size: usize,

    /// Let the file service return fewer bytes than requested and report
    /// `read_size`.
    ///
    /// Default: true
    pub read_partly: bool,

    /// Retries per chunk before a snapshot copy fails.
    ///
    /// Default: 3
    pub copy_max_retry: u32,

    /// Wait between chunk retries.
    ///
    /// Default: 1000ms
    #[serde(with = "duration_ms")]
    pub copy_retry_interval: Duration,

    /// Snapshot throttle for this node's disk.
    pub throttle: ThrottleConfig,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            enable_leader_lease: true,
            leader_lease_ratio: 0.9,
            max_clock_drift: Duration::from_millis(1000),

            // Replication tuning
            max_entries_per_append: 1024,
            max_bytes_per_append: 512 * 1024,
            max_pipeline_depth: 1,
            max_out_of_order_cache: 8,

            propose_timeout: Duration::from_millis(5000),
            rpc_timeout: Duration::from_millis(500),
            install_snapshot_timeout: Duration::from_millis(60_000),

            // Snapshot streaming
            snapshot_chunk_size: 128 * 1024,
            file_check_hole: true,
            hole_check_block_size: 8 * 1024,
            read_partly: true,
            copy_max_retry: 3,
            copy_retry_interval: Duration::from_millis(1000),

            throttle: ThrottleConfig::default(),
        }
    }
}

/// Snapshot install throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Turn byte throttling on the follower's copy path on or off.
    ///
    /// Default: true
    pub enabled: bool,

    /// Configured disk/network budget for snapshot installs.
    ///
    /// Default: 200 MiB/s
    pub throughput_bytes_per_sec: u64,

    /// Floor applied to the budget so a near-zero setting cannot wedge
    /// transfers.
    ///
    /// Default: 0
    pub min_throughput_bytes_per_sec: u64,

    /// Budget slices per second.
    ///
    /// Default: 10
    pub check_cycle: u32,

    /// Concurrent follower-side installs per disk.
    ///
    /// Default: 1000
    pub max_install_snapshot_tasks: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            throughput_bytes_per_sec: 200 * 1024 * 1024,
            min_throughput_bytes_per_sec: 0,
            check_cycle: 10,
            max_install_snapshot_tasks: 1000,
        }
    }
}

impl RaftConfig {
    /// Validate configuration (ensure invariants hold).
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if !(self.leader_lease_ratio > 0.0 && self.leader_lease_ratio <= 1.0) {
            return Err(format!(
                "leader_lease_ratio ({}) must be in (0, 1]",
                self.leader_lease_ratio
            ));
        }

        if self.max_entries_per_append == 0 || self.max_bytes_per_append == 0 {
            return Err("append batch limits must be > 0".to_string());
        }

        if self.max_pipeline_depth == 0 {
            return Err("max_pipeline_depth must be > 0".to_string());
        }

        if self.snapshot_chunk_size == 0 {
            return Err("snapshot_chunk_size must be > 0".to_string());
        }

        if self.hole_check_block_size == 0 {
            return Err("hole_check_block_size must be > 0".to_string());
        }

        if self.throttle.check_cycle == 0 {
            return Err("throttle.check_cycle must be > 0".to_string());
        }

        Ok(())
    }

    /// Get randomized election timeout in [min, max].
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }

    /// Window during which a quorum acknowledgement keeps the leader lease
    /// valid.
    pub fn leader_lease_timeout(&self) -> Duration {
        self.election_timeout_min.mul_f32(self.leader_lease_ratio)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: RaftConfig =
            serde_yaml::from_str(content).map_err(|e| RaftError::ConfigError {
                reason: format!("failed to parse config: {}", e),
            })?;
        config
            .validate()
            .map_err(|reason| RaftError::ConfigError { reason })?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
