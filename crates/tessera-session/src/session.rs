//! Session handles: typed access to one session's key/value state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::provider::{PersistenceHook, SessionRecord};
use crate::value::{SessionValue, Value};

/// A handle bound to one session id.
///
/// Handles are independent staging areas: two handles for the same id only
/// see each other's writes after a flush and a fresh read.
pub trait Session: Send + Sync {
    /// Stage a value. Nothing is persisted until [`flush`](Self::flush).
    ///
    /// Fails with [`Error::NonFiniteFloat`] for NaN or infinite floats.
    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Stage a value and flush immediately.
    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.set(key, value)?;
        self.flush()
    }

    /// Read a value, failing with [`Error::KeyNotFound`] when absent.
    fn get_value(&self, key: &str) -> Result<Value>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Persist staged changes to the provider.
    fn flush(&self) -> Result<()>;

    fn session_id(&self) -> &str;

    fn time_created(&self) -> DateTime<Utc>;

    fn time_accessed(&self) -> DateTime<Utc>;
}

/// Typed accessors available on every [`Session`].
///
/// The `get_bool`/`get_string`/`get_int`/`get_float`/`get_timestamp`
/// getters return the type's zero value when the key is missing or holds a
/// different type. Use [`get`](Self::get) to tell those cases apart.
pub trait SessionExt: Session {
    /// Strict typed read.
    fn get<T: SessionValue>(&self, key: &str) -> Result<T> {
        T::from_value(self.get_value(key)?)
    }

    fn set_as<T: SessionValue>(&self, key: &str, value: T) -> Result<()> {
        self.set(key, value.into_value()?)
    }

    fn put_as<T: SessionValue>(&self, key: &str, value: T) -> Result<()> {
        self.put(key, value.into_value()?)
    }

    fn get_bool(&self, key: &str) -> bool {
        self.get(key).unwrap_or_default()
    }

    fn get_string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default()
    }

    fn get_int(&self, key: &str) -> i64 {
        self.get(key).unwrap_or_default()
    }

    fn get_float(&self, key: &str) -> f64 {
        self.get(key).unwrap_or_default()
    }

    /// Unix epoch when missing or mistyped.
    fn get_timestamp(&self, key: &str) -> DateTime<Utc> {
        self.get(key).unwrap_or_default()
    }
}

impl<S: Session + ?Sized> SessionExt for S {}

#[derive(Debug)]
struct StagedState {
    values: HashMap<String, Value>,
    accessed_at: DateTime<Utc>,
    dirty: bool,
}

impl StagedState {
    /// Access time never moves backwards.
    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.accessed_at {
            self.accessed_at = now;
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.touch();
    }
}

/// Client-side staging handle shared by providers without per-call
/// persistence.
///
/// The map lives behind a lock scoped to this handle. A flush writes the
/// whole map through the provider's [`PersistenceHook`] and is skipped
/// entirely when nothing changed since the previous flush.
pub struct StagedSession {
    id: String,
    created_at: DateTime<Utc>,
    state: RwLock<StagedState>,
    hook: Arc<dyn PersistenceHook>,
}

impl StagedSession {
    /// A fresh, empty session.
    pub fn new(id: impl Into<String>, hook: Arc<dyn PersistenceHook>) -> Self {
        let now = Utc::now();
        Self::from_record(
            SessionRecord {
                id: id.into(),
                values: HashMap::new(),
                created_at: now,
                accessed_at: now,
            },
            hook,
        )
    }

    /// A handle over state loaded from the backend.
    pub fn from_record(record: SessionRecord, hook: Arc<dyn PersistenceHook>) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
            state: RwLock::new(StagedState {
                values: record.values,
                accessed_at: record.accessed_at,
                dirty: false,
            }),
            hook,
        }
    }

    /// Whether there are unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Number of staged keys.
    pub fn len(&self) -> usize {
        self.state.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().values.is_empty()
    }
}

impl Session for StagedSession {
    fn set(&self, key: &str, value: Value) -> Result<()> {
        value.ensure_storable()?;
        let mut state = self.state.write();
        if state.values.get(key) == Some(&value) {
            return Ok(());
        }
        state.values.insert(key.to_string(), value);
        state.mark_dirty();
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Value> {
        let mut state = self.state.write();
        let value = state
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        state.touch();
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.values.remove(key).is_some() {
            state.mark_dirty();
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(());
        }

        state.touch();
        let record = SessionRecord {
            id: self.id.clone(),
            values: state.values.clone(),
            created_at: self.created_at,
            accessed_at: state.accessed_at,
        };
        self.hook.save(&record)?;
        state.dirty = false;

        trace!(session_id = %self.id, keys = record.values.len(), "Session flushed");
        Ok(())
    }

    fn session_id(&self) -> &str {
        &self.id
    }

    fn time_created(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn time_accessed(&self) -> DateTime<Utc> {
        self.state.read().accessed_at
    }
}

impl std::fmt::Debug for StagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("StagedSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("accessed_at", &state.accessed_at)
            .field("keys", &state.values.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    /// Records every save so tests can count backend calls.
    #[derive(Default)]
    struct RecordingHook {
        saves: Mutex<Vec<SessionRecord>>,
    }

    impl RecordingHook {
        fn count(&self) -> usize {
            self.saves.lock().len()
        }

        fn last(&self) -> SessionRecord {
            self.saves.lock().last().cloned().expect("no saves recorded")
        }
    }

    impl PersistenceHook for RecordingHook {
        fn save(&self, record: &SessionRecord) -> Result<()> {
            self.saves.lock().push(record.clone());
            Ok(())
        }
    }

    struct FailingHook;

    impl PersistenceHook for FailingHook {
        fn save(&self, _record: &SessionRecord) -> Result<()> {
            Err(Error::Backend("disk full".into()))
        }
    }

    fn staged() -> (StagedSession, Arc<RecordingHook>) {
        let hook = Arc::new(RecordingHook::default());
        (StagedSession::new("session-1", hook.clone()), hook)
    }

    #[test]
    fn test_set_does_not_persist() {
        let (session, hook) = staged();
        session.set("n", Value::Int(42)).unwrap();

        assert!(session.is_dirty());
        assert_eq!(hook.count(), 0);
        assert_eq!(session.get::<i64>("n").unwrap(), 42);
    }

    #[test]
    fn test_flush_writes_whole_map_once() {
        let (session, hook) = staged();
        session.set("a", Value::from("x")).unwrap();
        session.set("b", Value::from(true)).unwrap();
        session.flush().unwrap();

        assert_eq!(hook.count(), 1);
        assert_eq!(hook.last().values.len(), 2);
        assert!(!session.is_dirty());
    }

    #[test]
    fn test_clean_flush_makes_no_backend_call() {
        let (session, hook) = staged();
        session.flush().unwrap();
        assert_eq!(hook.count(), 0);

        session.put("a", Value::Int(1)).unwrap();
        session.flush().unwrap();
        session.flush().unwrap();
        assert_eq!(hook.count(), 1);
    }

    #[test]
    fn test_setting_same_value_is_not_a_change() {
        let (session, hook) = staged();
        session.put("a", Value::Int(1)).unwrap();
        session.set("a", Value::Int(1)).unwrap();

        assert!(!session.is_dirty());
        session.flush().unwrap();
        assert_eq!(hook.count(), 1);
    }

    #[test]
    fn test_non_finite_float_not_staged() {
        let (session, hook) = staged();
        session.put("name", Value::from("ada")).unwrap();

        assert!(matches!(
            session.put("x", Value::Float(f64::INFINITY)),
            Err(Error::NonFiniteFloat(_))
        ));
        assert!(matches!(
            session.set_as("y", f64::NAN),
            Err(Error::NonFiniteFloat(_))
        ));

        assert!(!session.is_dirty());
        assert_eq!(hook.count(), 1);
        assert!(matches!(session.get_value("x"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_delete_marks_dirty() {
        let (session, hook) = staged();
        session.put("a", Value::Int(1)).unwrap();
        session.delete("a").unwrap();
        session.delete("missing").unwrap();
        session.flush().unwrap();

        assert_eq!(hook.count(), 2);
        assert!(hook.last().values.is_empty());
        assert!(matches!(session.get_value("a"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_failed_flush_stays_dirty() {
        let session = StagedSession::new("session-1", Arc::new(FailingHook));
        session.set("a", Value::Int(1)).unwrap();

        assert!(matches!(session.flush(), Err(Error::Backend(_))));
        assert!(session.is_dirty());
    }

    #[test]
    fn test_strict_get_errors() {
        let (session, _) = staged();
        session.set("s", Value::from("text")).unwrap();

        assert!(matches!(
            session.get::<i64>("missing"),
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            session.get::<i64>("s"),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_convenience_getters_degrade_to_zero() {
        let (session, _) = staged();
        session.set("s", Value::from("text")).unwrap();
        session.set("b", Value::from(true)).unwrap();
        session.set("f", Value::from(2.5)).unwrap();

        assert_eq!(session.get_string("s"), "text");
        assert!(session.get_bool("b"));
        assert_eq!(session.get_float("f"), 2.5);

        assert_eq!(session.get_int("s"), 0);
        assert!(!session.get_bool("missing"));
        assert_eq!(session.get_string("b"), "");
        assert_eq!(session.get_float("s"), 0.0);
        assert_eq!(session.get_timestamp("s"), DateTime::<Utc>::default());
    }

    #[test]
    fn test_access_time_advances() {
        let (session, _) = staged();
        let created = session.time_created();
        let first = session.time_accessed();

        thread::sleep(std::time::Duration::from_millis(5));
        session.set("a", Value::Int(1)).unwrap();

        assert!(session.time_accessed() > first);
        assert_eq!(session.time_created(), created);
    }

    #[test]
    fn test_concurrent_writers_on_one_handle() {
        let (session, hook) = staged();
        let session = Arc::new(session);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("k-{t}-{i}");
                        session.set(&key, Value::Int(i)).unwrap();
                        assert_eq!(session.get_int(&key), i);
                        if i % 10 == 0 {
                            session.flush().unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        session.flush().unwrap();

        assert_eq!(session.len(), 400);
        assert_eq!(hook.last().values.len(), 400);
    }
}
