//! SQLite session provider.
//!
//! Each session is one row in `session_vals`: the whole value map encoded
//! as a single blob plus creation and last-access times in unix
//! milliseconds. Handles stage changes in memory and a flush rewrites the
//! row in one `UPDATE`. Idle and lifetime expiry are enforced by
//! [`Provider::session_gc`] with two `DELETE` statements.
//!
//! `init_provider` expects one parameter: the database path (`:memory:`
//! for a private in-memory database).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};
use tessera_session::{
    Error, ExpiryPolicy, LogSink, PersistenceHook, Provider, ProviderRegistry, Result,
    SESSION_ID_LEN, Session, SessionRecord, StagedSession, ValueCodec, validate_session_id,
};
use tracing::{debug, info, trace};

/// Registry name of the SQLite provider.
pub const PROVIDER_NAME: &str = "sqlite3";

const LOG_PREFIX: &str = "sqlite provider:";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS session_vals (
        id TEXT PRIMARY KEY,
        val BLOB NOT NULL DEFAULT x'',
        create_time INTEGER NOT NULL,
        accessed_time INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_session_vals_accessed_time
        ON session_vals(accessed_time);

    CREATE INDEX IF NOT EXISTS idx_session_vals_create_time
        ON session_vals(create_time);
"#;

/// Open connection plus the codec used for the value blob.
struct SqliteStore {
    conn: Mutex<Connection>,
    codec: ValueCodec,
}

impl PersistenceHook for SqliteStore {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        let val = self.codec.encode_map(&record.values)?;
        let updated = self
            .conn
            .lock()
            .execute(
                "UPDATE session_vals
                 SET val = ?1, accessed_time = max(accessed_time, ?2)
                 WHERE id = ?3",
                params![val, record.accessed_at.timestamp_millis(), record.id],
            )
            .map_err(backend)?;

        if updated == 0 {
            trace!(session_id = %record.id, "Flush for a removed session dropped");
        }
        Ok(())
    }
}

/// Provider storing sessions in a SQLite database.
pub struct SqliteProvider {
    store: RwLock<Option<Arc<SqliteStore>>>,
    codec: ValueCodec,
    max_life_time: AtomicU64,
    max_idle_time: AtomicU64,
}

impl SqliteProvider {
    /// Provider that stores scalar values only.
    pub fn new() -> Self {
        Self::with_codec(ValueCodec::new())
    }

    /// Provider using `codec`, which carries the registered structured
    /// types.
    pub fn with_codec(codec: ValueCodec) -> Self {
        Self {
            store: RwLock::new(None),
            codec,
            max_life_time: AtomicU64::new(0),
            max_idle_time: AtomicU64::new(0),
        }
    }

    fn store(&self) -> Result<Arc<SqliteStore>> {
        self.store.read().clone().ok_or(Error::NotInitialized)
    }

    fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.max_life_time(), self.max_idle_time())
    }

    /// Run one expiry `DELETE`, logging instead of failing.
    fn expire_where(&self, conn: &Connection, column: &str, cutoff_ms: i64, log: &LogSink) {
        let sql = format!("DELETE FROM session_vals WHERE {column} <= ?1");
        match conn.execute(&sql, params![cutoff_ms]) {
            Ok(0) => {}
            Ok(removed) => log.debug(format!(
                "{LOG_PREFIX} SessionGC() removed {removed} sessions on {column}"
            )),
            Err(e) => log.error(format!(
                "{LOG_PREFIX} DELETE FROM session_vals WHERE {column} failed: {e}"
            )),
        }
    }
}

impl Default for SqliteProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for SqliteProvider {
    fn init_provider(&self, params: &[String]) -> Result<()> {
        let path = params
            .first()
            .ok_or_else(|| Error::Init("missing parameter: path to a database file".into()))?;

        let mut slot = self.store.write();
        if slot.is_some() {
            return Err(Error::Init(format!("{PROVIDER_NAME} provider already initialized")));
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Init(format!("failed to open {path}: {e}")))?;
        if path != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(|e| Error::Init(e.to_string()))?;
        }
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Init(format!("failed to create schema: {e}")))?;

        *slot = Some(Arc::new(SqliteStore {
            conn: Mutex::new(conn),
            codec: self.codec.clone(),
        }));
        info!(path = %path, "SQLite session provider initialized");
        Ok(())
    }

    fn session_init(&self, id: &str) -> Result<Box<dyn Session>> {
        let store = self.store()?;
        validate_session_id(id, SESSION_ID_LEN)?;

        let now = Utc::now().timestamp_millis();
        // An existing row keeps its creation time and stored map until the
        // new handle flushes.
        let (created, accessed) = {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO session_vals (id, create_time, accessed_time)
                 VALUES (?1, ?2, ?2)",
                params![id, now],
            )
            .map_err(backend)?;
            conn.query_row(
                "SELECT create_time, accessed_time FROM session_vals WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(backend)?
        };
        debug!(session_id = %id, "Session initialized");

        let record = SessionRecord {
            id: id.to_string(),
            values: HashMap::new(),
            created_at: from_millis(created),
            accessed_at: from_millis(accessed.max(now)),
        };
        Ok(Box::new(StagedSession::from_record(record, store)))
    }

    fn session_read(&self, id: &str) -> Result<Box<dyn Session>> {
        let store = self.store()?;
        let now = Utc::now().timestamp_millis();

        let row = {
            let conn = store.conn.lock();
            let updated = conn
                .execute(
                    "UPDATE session_vals SET accessed_time = max(accessed_time, ?1) WHERE id = ?2",
                    params![now, id],
                )
                .map_err(backend)?;
            if updated == 0 {
                None
            } else {
                conn.query_row(
                    "SELECT create_time, accessed_time, val FROM session_vals WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(backend)?
            }
        };

        let Some((created, accessed, val)) = row else {
            debug!(session_id = %id, "Session not found, starting fresh");
            return self.session_init(id);
        };

        let record = SessionRecord {
            id: id.to_string(),
            values: store.codec.decode_map(&val)?,
            created_at: from_millis(created),
            accessed_at: from_millis(accessed),
        };
        Ok(Box::new(StagedSession::from_record(record, store)))
    }

    fn session_destroy(&self, id: &str) -> Result<()> {
        let store = self.store()?;
        let removed = store
            .conn
            .lock()
            .execute("DELETE FROM session_vals WHERE id = ?1", params![id])
            .map_err(backend)?;
        if removed > 0 {
            debug!(session_id = %id, "Session destroyed");
        }
        Ok(())
    }

    fn session_gc(&self, log: &LogSink) {
        let policy = self.policy();
        if policy.is_disabled() {
            return;
        }
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => {
                log.error(format!("{LOG_PREFIX} SessionGC() skipped: {e}"));
                return;
            }
        };

        let now = Utc::now().timestamp_millis();
        let conn = store.conn.lock();
        if policy.max_idle_time > 0 {
            self.expire_where(&conn, "accessed_time", cutoff(now, policy.max_idle_time), log);
        }
        if policy.max_life_time > 0 {
            self.expire_where(&conn, "create_time", cutoff(now, policy.max_life_time), log);
        }
    }

    fn destroy_all_sessions(&self, log: &LogSink) {
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => {
                log.error(format!("{LOG_PREFIX} DestroyAllSessions() skipped: {e}"));
                return;
            }
        };

        match store.conn.lock().execute("DELETE FROM session_vals", []) {
            Ok(removed) => log.debug(format!(
                "{LOG_PREFIX} DestroyAllSessions() removed {removed} sessions"
            )),
            Err(e) => log.error(format!("{LOG_PREFIX} DELETE FROM session_vals failed: {e}")),
        }
    }

    fn session_count(&self) -> Result<usize> {
        let store = self.store()?;
        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM session_vals", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(usize::try_from(count).unwrap_or_default())
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

    fn close_provider(&self) {
        if self.store.write().take().is_some() {
            info!("SQLite session provider closed");
        }
    }
}

/// Register a default [`SqliteProvider`] under [`PROVIDER_NAME`].
pub fn register(registry: &mut ProviderRegistry) -> Result<()> {
    registry.register(PROVIDER_NAME, Arc::new(SqliteProvider::new()))
}

fn backend(e: rusqlite::Error) -> Error {
    Error::Backend(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// `now_ms` minus `secs` seconds, saturating.
fn cutoff(now_ms: i64, secs: u64) -> i64 {
    let window = i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1_000);
    now_ms.saturating_sub(window)
}
