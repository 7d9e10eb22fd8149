use serde::{Deserialize, Serialize};
use std::time::Duration;

// Device calls (slews, exposures) can legitimately take minutes
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOOP_TICK_MS: u64 = 1_000;       // server loop poll tick
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;  // wait for in-flight handlers
pub const DEFAULT_MAX_WORKERS: usize = 64;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_BLOCKING_POP_MS: u64 = 60_000; // longer waits are split

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub request_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub loop_tick_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_workers: usize,
    /// Unclaimed responses are dropped by the broker after this long.
    pub response_ttl_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest single blocking pop sent to a broker. Waits past it re-issue
    /// the pop until their own deadline.
    pub max_blocking_pop_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            loop_tick_ms: DEFAULT_LOOP_TICK_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_workers: DEFAULT_MAX_WORKERS,
            response_ttl_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_blocking_pop_ms: DEFAULT_MAX_BLOCKING_POP_MS,
        }
    }
}

impl BusConfig {
    /// Overrides on top of the defaults; absent fields keep their default.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn loop_tick(&self) -> Duration {
        Duration::from_millis(self.loop_tick_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_millis(self.response_ttl_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_blocking_pop(&self) -> Duration {
        Duration::from_millis(self.max_blocking_pop_ms.max(1))
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.max(1)
    }
}
