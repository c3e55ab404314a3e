//! End-to-end session lifecycle through the manager and the memory provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tessera_session::{
    Error, GcState, LogLevel, LogSink, Manager, ManagerConfig, MemoryProvider, ProviderRegistry,
    SessionExt, SharedBuffer, Structured, StructuredValue, Value, ValueCodec, memory,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    memory::register(&mut registry).unwrap();
    registry
}

fn manager(max_life_time: u64, max_idle_time: u64, kill_time: &str) -> Manager {
    init_tracing();
    Manager::new(
        &registry(),
        "memory",
        max_life_time,
        max_idle_time,
        kill_time,
        &[],
    )
    .unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cart {
    items: Vec<String>,
    total_cents: u64,
}

impl StructuredValue for Cart {
    const TYPE_NAME: &'static str = "cart";
}

#[tokio::test]
async fn test_close_reopen_destroy() {
    let manager = manager(0, 0, "");

    let session = manager.session_start("").unwrap();
    let id = session.session_id().to_string();
    assert_eq!(id.len(), manager.session_id_len());

    session.set("n", Value::Int(42)).unwrap();
    session.flush().unwrap();
    manager.session_close(&id).unwrap();

    let reopened = manager.session_start(&id).unwrap();
    assert_eq!(reopened.get::<i64>("n").unwrap(), 42);

    manager.session_destroy(&id).unwrap();
    let after_destroy = manager.session_start(&id).unwrap();
    assert!(matches!(
        after_destroy.get_value("n"),
        Err(Error::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn test_all_value_kinds_survive_flush() {
    let manager = manager(0, 0, "");
    let now = chrono::Utc::now();

    let session = manager.session_start("").unwrap();
    session.set_as("name", "ada".to_string()).unwrap();
    session.set_as("visits", 7i64).unwrap();
    session.set_as("ratio", 0.1f64 + 0.2f64).unwrap();
    session.set_as("admin", true).unwrap();
    session.set_as("seen", now).unwrap();
    session.flush().unwrap();

    let reopened = manager.session_start(session.session_id()).unwrap();
    assert_eq!(reopened.get_string("name"), "ada");
    assert_eq!(reopened.get_int("visits"), 7);
    assert_eq!(reopened.get_float("ratio"), 0.1f64 + 0.2f64);
    assert!(reopened.get_bool("admin"));
    assert_eq!(reopened.get_timestamp("seen"), now);
    assert_eq!(reopened.get_int("missing"), 0);
}

#[tokio::test]
async fn test_structured_values_need_registration() {
    init_tracing();
    let cart = Cart {
        items: vec!["tea".into(), "scones".into()],
        total_cents: 1250,
    };

    let mut registry = ProviderRegistry::new();
    registry
        .register(
            "memory",
            Arc::new(MemoryProvider::with_codec(ValueCodec::new().with_type::<Cart>())),
        )
        .unwrap();
    let typed = Manager::new(&registry, "memory", 0, 0, "", &[]).unwrap();

    let session = typed.session_start("").unwrap();
    session.put_as("cart", Structured(cart.clone())).unwrap();
    let Structured(stored) = typed
        .session_start(session.session_id())
        .unwrap()
        .get::<Structured<Cart>>("cart")
        .unwrap();
    assert_eq!(stored, cart);

    // The default provider has no structured types registered.
    let plain = manager(0, 0, "");
    let session = plain.session_start("").unwrap();
    session.set_as("cart", Structured(cart)).unwrap();
    assert!(matches!(
        session.flush(),
        Err(Error::TypeMismatch { .. })
    ));
}

#[tokio::test]
async fn test_reused_id_overwrites_on_flush() {
    let manager = manager(0, 0, "");
    let first = manager.session_start("").unwrap();
    let id = first.session_id().to_string();
    first.put("a", Value::Int(1)).unwrap();

    // No collision check: init on a known id hands out an empty handle
    // whose flush replaces the stored map.
    let second = manager.provider().session_init(&id).unwrap();
    second.put("b", Value::Int(2)).unwrap();

    let reopened = manager.session_start(&id).unwrap();
    assert!(matches!(reopened.get_value("a"), Err(Error::KeyNotFound(_))));
    assert_eq!(reopened.get_int("b"), 2);
}

#[tokio::test]
async fn test_idle_sessions_expire() {
    let manager = manager(0, 1, "");
    assert_eq!(manager.start_gc(LogSink::silent()).unwrap(), GcState::Running);

    let session = manager.session_start("").unwrap();
    let id = session.session_id().to_string();
    assert_eq!(manager.provider().session_count().unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(manager.provider().session_count().unwrap(), 0);

    let fresh = manager.session_start(&id).unwrap();
    assert!(fresh.get_value("anything").is_err());
    manager.stop_gc();
}

#[tokio::test]
async fn test_lifetime_expires_despite_access() {
    let manager = manager(2, 0, "");
    manager.start_gc(LogSink::silent()).unwrap();

    let session = manager.session_start("").unwrap();
    let id = session.session_id().to_string();
    session.put("n", Value::Int(1)).unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.session_start(&id).unwrap().get_int("n"), 1);
    }
    tokio::time::sleep(Duration::from_millis(3_000)).await;

    let reopened = manager.session_start(&id).unwrap();
    assert!(matches!(reopened.get_value("n"), Err(Error::KeyNotFound(_))));
    manager.stop_gc();
}

#[tokio::test]
async fn test_daily_kill_time_purges_everything() {
    let kill_at = (Local::now() + chrono::Duration::seconds(2))
        .format("%H:%M:%S")
        .to_string();
    let manager = manager(0, 0, &kill_at);

    let buf = SharedBuffer::new();
    manager
        .start_gc(LogSink::new(buf.clone(), LogLevel::Debug))
        .unwrap();

    for _ in 0..5 {
        manager.session_start("").unwrap();
    }
    assert_eq!(manager.provider().session_count().unwrap(), 5);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(manager.provider().session_count().unwrap(), 0);

    let log = buf.contents();
    assert!(log.contains("WARN\twaiting session killer in"));
    assert!(log.contains("calling DestroyAllSessions()"));
    manager.stop_gc();
}

#[tokio::test]
async fn test_infinite_float_does_not_poison_session() {
    let manager = manager(0, 0, "");
    let session = manager.session_start("").unwrap();
    session.set("name", Value::from("ada")).unwrap();

    assert!(matches!(
        session.put("x", Value::Float(f64::INFINITY)),
        Err(Error::NonFiniteFloat(_))
    ));
    session.flush().unwrap();

    let reopened = manager.session_start(session.session_id()).unwrap();
    assert_eq!(reopened.get_string("name"), "ada");
    assert!(matches!(reopened.get_value("x"), Err(Error::KeyNotFound(_))));
}

#[tokio::test]
async fn test_clearing_kill_time_and_restarting_stops_the_purge() {
    let kill_at = (Local::now() + chrono::Duration::seconds(2))
        .format("%H:%M:%S")
        .to_string();
    let manager = manager(0, 0, &kill_at);
    assert_eq!(manager.start_gc(LogSink::silent()).unwrap(), GcState::Running);

    manager.clear_sessions_kill_time();
    assert_eq!(manager.start_gc(LogSink::silent()).unwrap(), GcState::Stopped);
    assert_eq!(manager.gc_state(), GcState::Stopped);

    manager.session_start("").unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(manager.provider().session_count().unwrap(), 1);
}

#[tokio::test]
async fn test_restart_applies_new_limits() {
    let manager = manager(0, 3600, "");
    manager.start_gc(LogSink::silent()).unwrap();
    manager.session_start("").unwrap();

    manager.stop_gc();
    assert_eq!(manager.gc_state(), GcState::Stopped);
    manager.set_max_idle_time(1);
    manager.start_gc(LogSink::silent()).unwrap();

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(manager.provider().session_count().unwrap(), 0);
    manager.stop_gc();
}

#[tokio::test]
async fn test_stopped_gc_leaves_sessions_alone() {
    let manager = manager(0, 1, "");
    manager.start_gc(LogSink::silent()).unwrap();
    manager.stop_gc();

    manager.session_start("").unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(manager.provider().session_count().unwrap(), 1);

    // A manual sweep still applies the limits.
    manager.session_gc(&LogSink::silent());
    assert_eq!(manager.provider().session_count().unwrap(), 0);
}

#[tokio::test]
async fn test_manager_from_toml_config() {
    init_tracing();
    let config = ManagerConfig::from_toml_str(
        r#"
        provider = "memory"
        max_idle_time = 900
        kill_time = "03:00"
        log_level = "debug"
        "#,
    )
    .unwrap();

    let manager = Manager::from_config(&registry(), &config).unwrap();
    assert_eq!(manager.max_idle_time(), 900);
    assert_eq!(manager.max_life_time(), 0);
    assert_eq!(
        manager.sessions_kill_time(),
        chrono::NaiveTime::from_hms_opt(3, 0, 0)
    );

    let buf = SharedBuffer::new();
    manager.start_gc(config.log_sink(buf.clone())).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(buf.contents().contains("running garbage collector every 900 seconds"));
    manager.stop_gc();
}

#[tokio::test]
async fn test_unknown_provider_and_bad_kill_time() {
    init_tracing();
    let registry = registry();
    assert!(matches!(
        Manager::new(&registry, "redis", 0, 0, "", &[]),
        Err(Error::UnknownProvider(name)) if name == "redis"
    ));
    assert!(matches!(
        Manager::new(&registry, "memory", 0, 0, "3am", &[]),
        Err(Error::InvalidTimeFormat(_))
    ));
}
