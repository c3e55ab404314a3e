//! In-process provider keeping encoded sessions in a map.
//!
//! Sessions are stored in their encoded form, so every handle decodes its
//! own copy and nothing is shared between handles until a flush. Expiry is
//! enforced only by [`Provider::session_gc`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::id::{SESSION_ID_LEN, validate_session_id};
use crate::log::LogSink;
use crate::provider::{ExpiryPolicy, PersistenceHook, Provider, SessionRecord};
use crate::registry::ProviderRegistry;
use crate::session::{Session, StagedSession};
use crate::value::ValueCodec;

/// Registry name of the in-process provider.
pub const PROVIDER_NAME: &str = "memory";

const LOG_PREFIX: &str = "memory provider:";

#[derive(Debug, Clone)]
struct StoredSession {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
}

/// The map shared by the provider and the handles it hands out.
struct MemoryStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
    codec: ValueCodec,
}

impl PersistenceHook for MemoryStore {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        let data = self.codec.encode_map(&record.values)?;
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&record.id) {
            Some(stored) => {
                stored.data = data;
                stored.accessed_at = stored.accessed_at.max(record.accessed_at);
            }
            // Destroyed or collected since the handle was opened.
            None => trace!(session_id = %record.id, "Flush for a removed session dropped"),
        }
        Ok(())
    }
}

/// Provider backed by a process-local map.
pub struct MemoryProvider {
    store: Arc<MemoryStore>,
    max_life_time: AtomicU64,
    max_idle_time: AtomicU64,
    initialized: AtomicBool,
}

impl MemoryProvider {
    /// Provider that stores scalar values only.
    pub fn new() -> Self {
        Self::with_codec(ValueCodec::new())
    }

    /// Provider using `codec`, which carries the registered structured
    /// types.
    pub fn with_codec(codec: ValueCodec) -> Self {
        Self {
            store: Arc::new(MemoryStore {
                sessions: RwLock::new(HashMap::new()),
                codec,
            }),
            max_life_time: AtomicU64::new(0),
            max_idle_time: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Whether a session with `id` is stored.
    pub fn contains(&self, id: &str) -> bool {
        self.store.sessions.read().contains_key(id)
    }

    fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.max_life_time(), self.max_idle_time())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn hook(&self) -> Arc<dyn PersistenceHook> {
        self.store.clone()
    }

    /// Shift a stored session's timestamps into the past.
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, secs: i64) {
        let delta = chrono::Duration::seconds(secs);
        if let Some(stored) = self.store.sessions.write().get_mut(id) {
            stored.created_at -= delta;
            stored.accessed_at -= delta;
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MemoryProvider {
    fn init_provider(&self, _params: &[String]) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn session_init(&self, id: &str) -> Result<Box<dyn Session>> {
        self.ensure_initialized()?;
        validate_session_id(id, SESSION_ID_LEN)?;

        let now = Utc::now();
        // An existing record keeps its creation time and stored map until
        // the new handle flushes.
        let (created_at, accessed_at) = {
            let mut sessions = self.store.sessions.write();
            let stored = sessions
                .entry(id.to_string())
                .or_insert_with(|| StoredSession {
                    data: Vec::new(),
                    created_at: now,
                    accessed_at: now,
                });
            (stored.created_at, stored.accessed_at.max(now))
        };
        debug!(session_id = %id, "Session initialized");

        let record = SessionRecord {
            id: id.to_string(),
            values: HashMap::new(),
            created_at,
            accessed_at,
        };
        Ok(Box::new(StagedSession::from_record(record, self.hook())))
    }

    fn session_read(&self, id: &str) -> Result<Box<dyn Session>> {
        self.ensure_initialized()?;

        let loaded = {
            let mut sessions = self.store.sessions.write();
            sessions.get_mut(id).map(|stored| {
                stored.accessed_at = stored.accessed_at.max(Utc::now());
                stored.clone()
            })
        };

        let Some(stored) = loaded else {
            debug!(session_id = %id, "Session not found, starting fresh");
            return self.session_init(id);
        };

        let record = SessionRecord {
            id: id.to_string(),
            values: self.store.codec.decode_map(&stored.data)?,
            created_at: stored.created_at,
            accessed_at: stored.accessed_at,
        };
        Ok(Box::new(StagedSession::from_record(record, self.hook())))
    }

    fn session_destroy(&self, id: &str) -> Result<()> {
        if self.store.sessions.write().remove(id).is_some() {
            debug!(session_id = %id, "Session destroyed");
        }
        Ok(())
    }

    fn session_gc(&self, log: &LogSink) {
        let policy = self.policy();
        if policy.is_disabled() {
            return;
        }

        let now = Utc::now();
        let mut sessions = self.store.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, stored| !policy.is_expired(stored.created_at, stored.accessed_at, now));
        let removed = before - sessions.len();

        if removed > 0 {
            log.debug(format!("{LOG_PREFIX} SessionGC() removed {removed} sessions"));
        }
    }

    fn destroy_all_sessions(&self, log: &LogSink) {
        let mut sessions = self.store.sessions.write();
        let count = sessions.len();
        sessions.clear();
        log.debug(format!("{LOG_PREFIX} DestroyAllSessions() removed {count} sessions"));
    }

    fn session_count(&self) -> Result<usize> {
        Ok(self.store.sessions.read().len())
    }

    fn session_id_len(&self) -> usize {
        SESSION_ID_LEN
    }

    fn max_life_time(&self) -> u64 {
        self.max_life_time.load(Ordering::Relaxed)
    }

    fn set_max_life_time(&self, seconds: u64) {
        self.max_life_time.store(seconds, Ordering::Relaxed);
    }

    fn max_idle_time(&self) -> u64 {
        self.max_idle_time.load(Ordering::Relaxed)
    }

    fn set_max_idle_time(&self, seconds: u64) {
        self.max_idle_time.store(seconds, Ordering::Relaxed);
    }
}

/// Register a default [`MemoryProvider`] under [`PROVIDER_NAME`].
pub fn register(registry: &mut ProviderRegistry) -> Result<()> {
    registry.register(PROVIDER_NAME, Arc::new(MemoryProvider::new()))
}
