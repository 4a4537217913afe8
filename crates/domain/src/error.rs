/// Shared error type used across all continuum crates.
///
/// The first five variants are the failure taxonomy the capture loop routes
/// on: transient source errors reconnect, expired auth escalates, storage and
/// cache errors are logged and absorbed, unknown sessions are dropped.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("source: {0}")]
    TransientSource(String),

    #[error("auth expired: {0}")]
    AuthExpired(String),

    #[error("storage {op} ({id}): {message}")]
    StorageWrite {
        op: String,
        id: String,
        message: String,
    },

    #[error("identity resolution for {identity}: {message}")]
    CacheResolution { identity: String, message: String },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("storage read {op}: {message}")]
    StorageRead { op: String, message: String },

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("shutdown")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn storage_write(op: &str, id: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageWrite {
            op: op.to_owned(),
            id: id.to_owned(),
            message: err.to_string(),
        }
    }

    pub fn storage_read(op: &str, err: impl std::fmt::Display) -> Self {
        Self::StorageRead {
            op: op.to_owned(),
            message: err.to_string(),
        }
    }

    /// Whether the error means the source session is no longer authorized.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    /// Whether retrying the same source call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSource(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
