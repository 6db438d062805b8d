use thiserror::Error;

/// Largest file `get_content` will load for inline editing (1 MiB)
pub const MAX_CONTENT_SIZE: u64 = 1024 * 1024;

pub type Result<T, E = ExplorerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ExplorerError {
    /// Backend unreachable or transport setup failed
    #[error("connect failed: {0}")]
    Connect(String),
    /// Backend reachable but refused the credentials
    #[error("authentication failed for user {0}")]
    AuthRejected(String),
    #[error("file explorer is not ready")]
    NotReady,
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} {path}: {message}")]
    Remote {
        op: &'static str,
        path: String,
        message: String,
    },
    #[error("{0}: no such file or directory")]
    NotFound(String),
    #[error("file too big, not supported for getContent: {path} ({size} bytes, max {MAX_CONTENT_SIZE})")]
    TooLarge { path: String, size: u64 },
    #[error("invalid permission code: {0:?}")]
    InvalidMode(String),
    #[error("{0}")]
    InvalidArgument(String),
    /// An established connection stopped working
    #[error("connection lost: {0}")]
    Disconnected(String),
}

impl ExplorerError {
    pub fn io(op: &'static str, path: impl Into<String>, source: std::io::Error) -> Self {
        ExplorerError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True when the error means the explorer itself is unusable, as opposed
    /// to a failure of the requested filesystem operation.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ExplorerError::Connect(_)
                | ExplorerError::AuthRejected(_)
                | ExplorerError::NotReady
                | ExplorerError::Disconnected(_)
        )
    }
}
