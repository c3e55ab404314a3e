//! Session lifecycle engine with pluggable storage providers.
//!
//! This crate provides:
//! - a [`Provider`] contract that decouples session semantics from storage
//! - typed session values with a serializing [`ValueCodec`]
//! - [`Session`] handles with client-side staging and dirty tracking
//! - a [`Manager`] whose GC scheduler enforces idle timeout, absolute
//!   lifetime and a fixed daily purge
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_session::{LogLevel, LogSink, Manager, ProviderRegistry, SessionExt};
//!
//! let mut registry = ProviderRegistry::new();
//! tessera_session::memory::register(&mut registry)?;
//!
//! let manager = Manager::new(&registry, "memory", 0, 1800, "", &[])?;
//! manager.start_gc(LogSink::new(std::io::stderr(), LogLevel::Warn))?;
//!
//! let session = manager.session_start("")?;
//! session.set_as("visits", 1i64)?;
//! session.flush()?;
//! ```

mod config;
mod error;
mod gc;
mod id;
mod log;
mod manager;
pub mod memory;
mod provider;
mod registry;
mod session;
mod value;

pub use config::{DEFAULT_PROVIDER, ManagerConfig};
pub use error::{Error, Result};
pub use gc::{GcScheduler, GcState, parse_kill_time, seconds_until, sweep_interval};
pub use id::{SESSION_ID_LEN, generate_session_id, validate_session_id};
pub use log::{DEFAULT_COMPONENT, LogLevel, LogSink, SharedBuffer};
pub use manager::Manager;
pub use memory::MemoryProvider;
pub use provider::{ExpiryPolicy, PersistenceHook, Provider, SessionRecord};
pub use registry::ProviderRegistry;
pub use session::{Session, SessionExt, StagedSession};
pub use value::{SessionValue, Structured, StructuredValue, Value, ValueCodec};
