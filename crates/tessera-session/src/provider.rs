//! The storage provider contract.
//!
//! A [`Provider`] decouples session semantics from storage technology. Each
//! backend decides how it enforces expiry: the bundled providers scan in
//! [`Provider::session_gc`] using [`ExpiryPolicy`], while a backend with
//! native per-key TTL only needs to enforce the idle component there.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::log::LogSink;
use crate::session::Session;
use crate::value::Value;

/// Storage backend for sessions.
///
/// Providers are shared as `Arc<dyn Provider>` between the registry, the
/// manager and the GC tasks, so every method takes `&self`.
pub trait Provider: Send + Sync {
    /// Backend-specific setup from opaque parameters.
    ///
    /// Fails with [`Error::Init`](crate::Error::Init) on missing or bad
    /// parameters or when the backend cannot be reached.
    fn init_provider(&self, params: &[String]) -> Result<()>;

    /// Create a new, empty session keyed by `id`.
    fn session_init(&self, id: &str) -> Result<Box<dyn Session>>;

    /// Load a session, creating it when `id` is unknown.
    fn session_read(&self, id: &str) -> Result<Box<dyn Session>>;

    /// Remove all stored state for `id`. Unknown ids are not an error.
    fn session_destroy(&self, id: &str) -> Result<()>;

    /// Release any per-session backend resource.
    fn session_close(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    /// Remove sessions that violate the idle or lifetime policy.
    ///
    /// Best effort: failures go to `log` and the scan continues.
    fn session_gc(&self, log: &LogSink);

    /// Remove every session under this provider.
    fn destroy_all_sessions(&self, log: &LogSink);

    /// Number of stored sessions.
    fn session_count(&self) -> Result<usize>;

    /// Maximum accepted session id length.
    fn session_id_len(&self) -> usize;

    fn max_life_time(&self) -> u64;

    fn set_max_life_time(&self, seconds: u64);

    fn max_idle_time(&self) -> u64;

    fn set_max_idle_time(&self, seconds: u64);

    /// Release backend connections.
    fn close_provider(&self) {}
}

/// Snapshot of a session written by a flush.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub values: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// Write seam between a staging handle and its backend.
///
/// [`StagedSession`](crate::StagedSession) calls `save` once per dirty
/// flush with the whole map, so a backend with per-record atomicity
/// persists the session in a single write.
pub trait PersistenceHook: Send + Sync {
    fn save(&self, record: &SessionRecord) -> Result<()>;
}

/// Idle and lifetime limits in seconds; `0` disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub max_life_time: u64,
    pub max_idle_time: u64,
}

impl ExpiryPolicy {
    pub fn new(max_life_time: u64, max_idle_time: u64) -> Self {
        Self {
            max_life_time,
            max_idle_time,
        }
    }

    /// Whether neither limit is set.
    pub fn is_disabled(&self) -> bool {
        self.max_life_time == 0 && self.max_idle_time == 0
    }

    pub fn idle_expired(&self, accessed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.max_idle_time > 0
            && deadline(accessed_at, self.max_idle_time).is_some_and(|d| d <= now)
    }

    pub fn life_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.max_life_time > 0
            && deadline(created_at, self.max_life_time).is_some_and(|d| d <= now)
    }

    /// Whether a session with these timestamps should be collected.
    pub fn is_expired(
        &self,
        created_at: DateTime<Utc>,
        accessed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        self.idle_expired(accessed_at, now) || self.life_expired(created_at, now)
    }
}

/// `start + secs`, or `None` when the sum leaves chrono's range.
fn deadline(start: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = Duration::try_seconds(i64::try_from(secs).ok()?)?;
    start.checked_add_signed(delta)
}
