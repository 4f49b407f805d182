//! Node and network configuration.
//!
//! Plain serde structs with defaults tuned for local single-host networks.
//! Durations are stored as integer milliseconds/seconds and exposed as
//! `std::time::Duration` accessors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Outbound delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Maximum delivery attempts per target.
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds.
    pub base_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,

    /// Per-attempt timeout in milliseconds.
    pub attempt_timeout_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 2_000,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl ReliabilityConfig {
    /// Backoff before retry number `attempt` (1-based), exponentially grown
    /// from the base and capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Protocol window timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Window for both init acks to arrive at the primary, in milliseconds.
    pub init_window_ms: u64,

    /// How long a message for an unknown computation is parked before it is
    /// dropped, in milliseconds.
    pub pending_window_ms: u64,

    /// Window for every spawned node to become reachable, in milliseconds.
    pub startup_window_ms: u64,

    /// In-flight handler drain window during shutdown, in milliseconds.
    pub drain_window_ms: u64,

    /// Registry poll interval for `await_result`, in milliseconds.
    pub result_poll_interval_ms: u64,

    /// Timeout for a single health probe, in milliseconds.
    pub health_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            init_window_ms: 5_000,
            pending_window_ms: 2_000,
            startup_window_ms: 10_000,
            drain_window_ms: 3_000,
            result_poll_interval_ms: 100,
            health_timeout_ms: 2_000,
        }
    }
}

impl TimingConfig {
    pub fn init_window(&self) -> Duration {
        Duration::from_millis(self.init_window_ms)
    }

    pub fn pending_window(&self) -> Duration {
        Duration::from_millis(self.pending_window_ms)
    }

    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

/// Endpoint and serving limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address for node endpoints. Port 0 lets the OS pick.
    pub bind_address: String,

    /// Maximum concurrently handled inbound requests per node.
    pub max_inflight_requests: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            max_inflight_requests: 64,
        }
    }
}

/// Persistence tuning shared by the registry and per-node stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bounded connection pool size for the registry store.
    pub pool_size: u32,

    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,

    /// Attempts for operations hitting transient lock contention.
    pub retry_attempts: u32,

    /// Base backoff for store retries in milliseconds (jittered).
    pub retry_base_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_base_backoff_ms: 50,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Aggregate configuration handed to every spawned node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding this node's private store.
    pub data_dir: PathBuf,

    pub network: NetworkConfig,
    pub reliability: ReliabilityConfig,
    pub timing: TimingConfig,
    pub store: StoreConfig,
}

impl NodeConfig {
    /// Config rooted at `data_dir` with all defaults.
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}
