//! Error types for session lifecycle operations.

/// Error type for session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No provider is registered under the requested name.
    #[error("Unknown session provider: {0}")]
    UnknownProvider(String),

    /// A provider name was registered twice.
    #[error("Session provider already registered: {0}")]
    DuplicateProvider(String),

    /// The daily kill time is not "HH:MM" or "HH:MM:SS".
    #[error("Invalid time format {0:?}, expected HH:MM or HH:MM:SS")]
    InvalidTimeFormat(String),

    /// Backend setup failed.
    #[error("Provider init failed: {0}")]
    Init(String),

    /// A session operation was attempted before `init_provider`.
    #[error("Provider not initialized")]
    NotInitialized,

    /// The session id is longer than the backend accepts.
    #[error("Session id length {len} exceeds maximum {max}")]
    IdTooLong { len: usize, max: usize },

    /// The key is not present in the session.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The stored value cannot be decoded into the requested type.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// The float cannot be written to storage and read back.
    #[error("Non-finite float cannot be stored: {0}")]
    NonFiniteFloat(f64),

    /// Value encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Error from the storage backend.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The GC scheduler could not reach an async runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Result type for session lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
