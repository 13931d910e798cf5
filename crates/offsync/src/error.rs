use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage corruption at key \"{key}\": persisted value could not be decoded")]
    Corruption {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode value for key \"{key}\"")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Classification of remote failures.
///
/// Replay treats every kind the same way unless a [`crate::config::RetryPolicy`]
/// with `max_attempts` is configured, in which case `Permanent` failures are
/// dead-lettered once the attempt budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network hiccup, timeout, 5xx.
    Transient,
    /// Validation failure or any other rejection that will not heal by itself.
    Permanent,
    /// Transport is known to be unreachable.
    Offline,
    /// The backend does not implement the requested operation.
    Unsupported,
    /// The target row does not exist remotely.
    NotFound,
}

/// Error returned by a [`crate::remote::RemoteBackend`] or
/// [`crate::remote::BlobStore`] call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: RemoteErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn offline() -> Self {
        Self::with_kind("transport unreachable", RemoteErrorKind::Offline)
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::with_kind(
            format!("{operation} is not supported by this backend"),
            RemoteErrorKind::Unsupported,
        )
    }

    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::with_kind(
            format!("{collection}/{id} does not exist remotely"),
            RemoteErrorKind::NotFound,
        )
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == RemoteErrorKind::Permanent
    }
}

// ---------------------------------------------------------------------------
// ControllerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Entity not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Index {index} out of range for ordering of length {len}")]
    InvalidIndex { index: usize, len: usize },

    #[error("Collection \"{0}\" has no ordering field configured")]
    Unordered(String),

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity {id} does not fit its model: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sync configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid sync configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// OffsyncError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OffsyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Crate-wide result; the error defaults to `OffsyncError`.
pub type Result<T, E = OffsyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
