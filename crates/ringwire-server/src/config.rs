//! Server configuration.
//!
//! Compile-time defaults with runtime environment overrides, highest
//! priority last:
//!
//! 1. Builder methods (programmatic)
//! 2. Environment variables (`WIRE_*`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ServerConfig::from_env()
//!     .port(9999)
//!     .num_buffers(2048);
//! ```

use std::net::SocketAddr;
use std::str::FromStr;

use ringwire_core::error::{WireError, WireResult};
use ringwire_io::{BackendKind, UringConfig};

/// Compile-time defaults.
pub mod defaults {
    pub const HOST: &str = "0.0.0.0";
    pub const PORT: u16 = 8080;
    pub const NUM_BUFFERS: usize = 1024;
    pub const BUFFER_SIZE: usize = 4096;
    pub const BACKEND: &str = "io_uring";
    /// Negative = unpinned.
    pub const CPU_AFFINITY: i64 = -1;
    pub const SQPOLL: bool = false;
    /// Negative = unpinned.
    pub const SQPOLL_CPU: i64 = -1;
    pub const SQPOLL_IDLE_US: u64 = 2000;
    pub const QUEUE_DEPTH: u64 = 256;
    /// Per-connection pending-write slots; power of two.
    pub const PENDING_WRITES: usize = 4096;
    pub const DRAIN_TIMEOUT_MS: u64 = 100;
}

/// Read an env var, falling back on parse failure or absence.
fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub num_buffers: usize,
    pub buffer_size: usize,
    pub backend: BackendKind,
    /// Loop-thread CPU pin; negative = unpinned.
    pub cpu_affinity: i64,
    pub sqpoll: bool,
    /// SQPOLL kernel-thread CPU pin; negative = unpinned.
    pub sqpoll_cpu: i64,
    /// SQPOLL idle before the kernel thread parks, microseconds.
    pub sqpoll_idle_us: u64,
    pub queue_depth: u32,
    /// Per-connection pending-write table size; must be a power of two.
    pub pending_writes: usize,
    /// How long shutdown waits for in-flight writes to drain.
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Defaults with `WIRE_*` environment overrides:
    /// `WIRE_HOST`, `WIRE_PORT`, `WIRE_NUM_BUFFERS`, `WIRE_BUFFER_SIZE`,
    /// `WIRE_BACKEND`, `WIRE_CPU_AFFINITY`, `WIRE_SQPOLL`,
    /// `WIRE_SQPOLL_CPU`, `WIRE_SQPOLL_IDLE_US`, `WIRE_QUEUE_DEPTH`,
    /// `WIRE_PENDING_WRITES`, `WIRE_DRAIN_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let backend_name = std::env::var("WIRE_BACKEND")
            .unwrap_or_else(|_| defaults::BACKEND.to_string());
        Self {
            host: std::env::var("WIRE_HOST").unwrap_or_else(|_| defaults::HOST.to_string()),
            port: env_get("WIRE_PORT", defaults::PORT),
            num_buffers: env_get("WIRE_NUM_BUFFERS", defaults::NUM_BUFFERS),
            buffer_size: env_get("WIRE_BUFFER_SIZE", defaults::BUFFER_SIZE),
            backend: backend_name.parse().unwrap_or(BackendKind::IoUring),
            cpu_affinity: env_get("WIRE_CPU_AFFINITY", defaults::CPU_AFFINITY),
            sqpoll: env_get::<u8>("WIRE_SQPOLL", defaults::SQPOLL as u8) != 0,
            sqpoll_cpu: env_get("WIRE_SQPOLL_CPU", defaults::SQPOLL_CPU),
            sqpoll_idle_us: env_get("WIRE_SQPOLL_IDLE_US", defaults::SQPOLL_IDLE_US),
            queue_depth: env_get("WIRE_QUEUE_DEPTH", defaults::QUEUE_DEPTH) as u32,
            pending_writes: env_get("WIRE_PENDING_WRITES", defaults::PENDING_WRITES),
            drain_timeout_ms: env_get("WIRE_DRAIN_TIMEOUT_MS", defaults::DRAIN_TIMEOUT_MS),
        }
    }

    // ── Builder methods ──────────────────────────────────────────────

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn num_buffers(mut self, n: usize) -> Self {
        self.num_buffers = n;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    pub fn cpu_affinity(mut self, cpu: i64) -> Self {
        self.cpu_affinity = cpu;
        self
    }

    pub fn sqpoll(mut self, on: bool) -> Self {
        self.sqpoll = on;
        self
    }

    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn pending_writes(mut self, n: usize) -> Self {
        self.pending_writes = n;
        self
    }

    // ── Derived views ────────────────────────────────────────────────

    pub fn addr(&self) -> WireResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| {
                WireError::InvalidConfig(format!("bad address {}:{}", self.host, self.port))
            })
    }

    pub fn uring_config(&self) -> UringConfig {
        UringConfig {
            queue_depth: self.queue_depth,
            cq_entries: None,
            sqpoll: self.sqpoll,
            sqpoll_cpu: self.sqpoll_cpu as i32,
            sqpoll_idle_us: self.sqpoll_idle_us as u32,
        }
    }

    pub fn validate(&self) -> WireResult<()> {
        if !self.num_buffers.is_power_of_two() {
            return Err(WireError::InvalidConfig(format!(
                "num_buffers must be a power of two, got {}",
                self.num_buffers
            )));
        }
        if !self.pending_writes.is_power_of_two() {
            return Err(WireError::InvalidConfig(format!(
                "pending_writes must be a power of two, got {}",
                self.pending_writes
            )));
        }
        self.addr().map(|_| ())
    }
}
