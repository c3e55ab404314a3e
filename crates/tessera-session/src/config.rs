//! Configuration for the session manager.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::{LogLevel, LogSink};
use crate::memory;

/// Default provider name.
pub const DEFAULT_PROVIDER: &str = memory::PROVIDER_NAME;

/// Settings accepted by [`Manager::from_config`](crate::Manager::from_config).
///
/// Every field has a default, so a partial `[session]` table is enough:
///
/// ```toml
/// provider = "sqlite3"
/// max_idle_time = 900
/// kill_time = "03:00"
/// params = ["/var/lib/app/sessions.db"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Registered provider name.
    pub provider: String,

    /// Maximum session age in seconds, `0` to disable.
    pub max_life_time: u64,

    /// Maximum seconds without access, `0` to disable.
    pub max_idle_time: u64,

    /// Daily purge time, "HH:MM" or "HH:MM:SS"; empty to disable.
    pub kill_time: String,

    /// Provider-specific parameters, passed through untouched.
    pub params: Vec<String>,

    /// Verbosity of the GC log sink.
    pub log_level: LogLevel,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            max_life_time: 0,
            max_idle_time: 0,
            kill_time: String::new(),
            params: Vec::new(),
            log_level: LogLevel::Warn,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_max_life_time(mut self, seconds: u64) -> Self {
        self.max_life_time = seconds;
        self
    }

    pub fn with_max_idle_time(mut self, seconds: u64) -> Self {
        self.max_idle_time = seconds;
        self
    }

    pub fn with_kill_time(mut self, kill_time: impl Into<String>) -> Self {
        self.kill_time = kill_time.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sink writing to `writer` at the configured verbosity.
    pub fn log_sink(&self, writer: impl Write + Send + 'static) -> LogSink {
        LogSink::new(writer, self.log_level)
    }

    /// Whether any expiry policy is configured.
    pub fn has_expiry(&self) -> bool {
        self.max_life_time > 0 || self.max_idle_time > 0 || !self.kill_time.is_empty()
    }
}
