//! Session layer configuration
//!
//! Every field has a default, so an empty JSON object (or no file at all) yields the
//! stock collector behaviour: 50 sessions, 3 connect attempts, a 64 KiB client window
//! ceiling until the client advertises one.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// ============================================================================
// Defaults
// ============================================================================

/// Maximum number of concurrently live sessions
pub const DEFAULT_SESSION_LIMIT: usize = 50;

/// TCP connect attempts before a session is abandoned
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Bytes in flight toward the client before any window has been advertised
pub const DEFAULT_CLIENT_WINDOW_CEILING: u32 = 65_535;

/// Per-buffer bound (4 MiB)
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the coordinator and reactor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory capacity; creation beyond this is refused
    pub session_limit: usize,
    /// Bounded TCP connect retries
    pub connect_attempts: u32,
    /// In-flight ceiling used while the client window is unknown
    pub client_window_ceiling: u32,
    /// How long a session may linger after the client's FIN was acknowledged
    pub fin_grace_secs: u64,
    /// Idle timeout for TCP sessions
    pub tcp_idle_timeout_secs: u64,
    /// Idle timeout for UDP sessions
    pub udp_idle_timeout_secs: u64,
    /// Upper bound for each session buffer
    pub max_buffer_bytes: usize,
    /// Bytes read from a real socket per read call
    pub read_chunk_size: usize,
    /// Retransmissions allowed for one unacknowledged segment
    pub resend_limit: u32,
    /// SO_KEEPALIVE on real TCP sockets
    pub tcp_keepalive: bool,
    /// TCP_NODELAY on real TCP sockets
    pub tcp_nodelay: bool,
    /// Interval between idle sweeps
    pub sweep_interval_ms: u64,
    /// Upper bound on a single reactor wait
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session_limit: DEFAULT_SESSION_LIMIT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            client_window_ceiling: DEFAULT_CLIENT_WINDOW_CEILING,
            fin_grace_secs: 60,
            tcp_idle_timeout_secs: 300,
            udp_idle_timeout_secs: 60,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            read_chunk_size: 16 * 1024,
            resend_limit: 3,
            tcp_keepalive: true,
            tcp_nodelay: false,
            sweep_interval_ms: 1_000,
            poll_interval_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file, then validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Parse configuration from JSON text, then validate it
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the layer refuse every flow or spin
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_limit == 0 {
            return Err(ConfigError::Invalid("session_limit must be at least 1"));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid("connect_attempts must be at least 1"));
        }
        if self.client_window_ceiling == 0 {
            return Err(ConfigError::Invalid("client_window_ceiling must be non-zero"));
        }
        if self.max_buffer_bytes == 0 || self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn fin_grace(&self) -> Duration {
        Duration::from_secs(self.fin_grace_secs)
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read
    Read(String),
    /// The JSON did not match the schema
    Parse(String),
    /// A value is out of range
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(msg) => write!(f, "cannot read config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "cannot parse config: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Tests
// ============================================================================
