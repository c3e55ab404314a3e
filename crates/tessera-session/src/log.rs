//! Caller-supplied diagnostic sink for GC and scheduler activity.
//!
//! Lines are tab separated:
//! `<component>\t<RFC3339 timestamp>\t<LEVEL>\t<message>`.
//! A sink without a writer is silent. Every line is also mirrored as a
//! `tracing` event, which the host's subscriber filters independently.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Component name written when none is given.
pub const DEFAULT_COMPONENT: &str = "SessionManager";

/// Verbosity of a sink line. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Debug => write!(f, "DEBUG"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

struct SinkInner {
    writer: Option<Mutex<Box<dyn Write + Send>>>,
    level: LogLevel,
    component: String,
}

/// Shared handle to a line-oriented log writer.
///
/// Clones write to the same underlying writer.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    /// Sink writing lines at or below `level` to `writer`.
    pub fn new(writer: impl Write + Send + 'static, level: LogLevel) -> Self {
        Self::with_component(writer, level, DEFAULT_COMPONENT)
    }

    /// Sink with a custom component column.
    pub fn with_component(
        writer: impl Write + Send + 'static,
        level: LogLevel,
        component: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                writer: Some(Mutex::new(Box::new(writer))),
                level,
                component: component.into(),
            }),
        }
    }

    /// Sink that writes nothing.
    pub fn silent() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                writer: None,
                level: LogLevel::Error,
                component: DEFAULT_COMPONENT.to_string(),
            }),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.inner.level
    }

    /// Whether a line at `level` would be written.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.inner.writer.is_some() && level <= self.inner.level
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message.as_ref());
    }

    /// Write one line. Write failures are dropped.
    pub fn log(&self, level: LogLevel, message: &str) {
        let component = self.inner.component.as_str();
        match level {
            LogLevel::Error => tracing::error!(component, "{message}"),
            LogLevel::Warn => tracing::warn!(component, "{message}"),
            LogLevel::Debug => tracing::debug!(component, "{message}"),
        }

        if !self.enabled(level) {
            return;
        }
        if let Some(writer) = &self.inner.writer {
            let line = format_line(component, level, message);
            let mut writer = writer.lock();
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("component", &self.inner.component)
            .field("level", &self.inner.level)
            .field("silent", &self.inner.writer.is_none())
            .finish()
    }
}

fn format_line(component: &str, level: LogLevel, message: &str) -> String {
    let ts = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
    format!("{component}\t{ts}\t{level}\t{message}\n")
}

/// In-memory writer for inspecting sink output, mostly in tests.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(String::from).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
