//! The session manager: one active provider plus its expiry policies.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveTime;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::error::Result;
use crate::gc::{GcScheduler, GcState, parse_kill_time};
use crate::id::generate_session_id;
use crate::log::LogSink;
use crate::provider::Provider;
use crate::registry::ProviderRegistry;
use crate::session::Session;

/// Opens, closes and destroys sessions through a single provider and owns
/// the GC scheduler that expires them.
///
/// Sessions can be removed three ways, all of which may be active at once:
/// - `max_idle_time`: seconds since the session was last accessed;
/// - `max_life_time`: seconds since the session was created;
/// - the daily kill time, at which every session is purged.
///
/// # Example
///
/// ```rust,ignore
/// let mut registry = ProviderRegistry::new();
/// tessera_session::memory::register(&mut registry)?;
///
/// let manager = Manager::new(&registry, "memory", 3600, 900, "03:00", &[])?;
/// manager.start_gc(LogSink::new(std::io::stderr(), LogLevel::Warn))?;
///
/// let session = manager.session_start("")?;
/// session.put("user", "ada".into())?;
/// ```
pub struct Manager {
    provider_name: String,
    provider: Arc<dyn Provider>,
    kill_time: RwLock<Option<NaiveTime>>,
    gc: GcScheduler,
}

impl Manager {
    /// Resolve `provider_name`, apply the expiry settings and initialize the
    /// provider with `params`.
    ///
    /// `kill_time` is empty or a daily time as "HH:MM" or "HH:MM:SS".
    /// Limits are in seconds, `0` disables one.
    pub fn new(
        registry: &ProviderRegistry,
        provider_name: &str,
        max_life_time: u64,
        max_idle_time: u64,
        kill_time: &str,
        params: &[String],
    ) -> Result<Self> {
        let provider = registry.lookup(provider_name)?;
        provider.set_max_life_time(max_life_time);
        provider.set_max_idle_time(max_idle_time);

        let kill_time = if kill_time.is_empty() {
            None
        } else {
            Some(parse_kill_time(kill_time)?)
        };

        provider.init_provider(params)?;
        info!(
            provider = %provider_name,
            max_life_time,
            max_idle_time,
            ?kill_time,
            "Session manager created"
        );

        Ok(Self {
            provider_name: provider_name.to_string(),
            provider,
            kill_time: RwLock::new(kill_time),
            gc: GcScheduler::new(),
        })
    }

    /// Build a manager from loaded configuration.
    pub fn from_config(registry: &ProviderRegistry, config: &ManagerConfig) -> Result<Self> {
        Self::new(
            registry,
            &config.provider,
            config.max_life_time,
            config.max_idle_time,
            &config.kill_time,
            &config.params,
        )
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Open a session. An empty id starts a new session with a generated
    /// id; any other id is read, or created if the provider does not know
    /// it.
    pub fn session_start(&self, id: &str) -> Result<Box<dyn Session>> {
        if id.is_empty() {
            let id = generate_session_id();
            debug!(session_id = %id, "Starting new session");
            return self.provider.session_init(&id);
        }
        self.provider.session_read(id)
    }

    /// Empty ids are ignored.
    pub fn session_close(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        self.provider.session_close(id)
    }

    /// Empty ids are ignored.
    pub fn session_destroy(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        self.provider.session_destroy(id)
    }

    pub fn session_gc(&self, log: &LogSink) {
        self.provider.session_gc(log);
    }

    pub fn destroy_all_sessions(&self, log: &LogSink) {
        self.provider.destroy_all_sessions(log);
    }

    pub fn session_id_len(&self) -> usize {
        self.provider.session_id_len()
    }

    pub fn max_life_time(&self) -> u64 {
        self.provider.max_life_time()
    }

    /// Takes effect for the GC schedule on the next [`start_gc`](Self::start_gc).
    pub fn set_max_life_time(&self, seconds: u64) {
        self.provider.set_max_life_time(seconds);
    }

    pub fn max_idle_time(&self) -> u64 {
        self.provider.max_idle_time()
    }

    /// Takes effect for the GC schedule on the next [`start_gc`](Self::start_gc).
    pub fn set_max_idle_time(&self, seconds: u64) {
        self.provider.set_max_idle_time(seconds);
    }

    pub fn sessions_kill_time(&self) -> Option<NaiveTime> {
        *self.kill_time.read()
    }

    /// Set the daily kill time from "HH:MM" or "HH:MM:SS".
    pub fn set_sessions_kill_time(&self, value: &str) -> Result<()> {
        let parsed = parse_kill_time(value)?;
        *self.kill_time.write() = Some(parsed);
        Ok(())
    }

    pub fn clear_sessions_kill_time(&self) {
        *self.kill_time.write() = None;
    }

    /// Start the GC loops for the current policies, logging to `log`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_gc(&self, log: LogSink) -> Result<GcState> {
        self.gc
            .start(Arc::clone(&self.provider), self.sessions_kill_time(), log)
    }

    pub fn stop_gc(&self) {
        self.gc.stop();
    }

    pub fn gc_state(&self) -> GcState {
        self.gc.state()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("provider", &self.provider_name)
            .field("max_life_time", &self.max_life_time())
            .field("max_idle_time", &self.max_idle_time())
            .field("kill_time", &self.sessions_kill_time())
            .field("gc", &self.gc)
            .finish()
    }
}
