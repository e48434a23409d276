use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Local storage is full: {0}")]
    StorageFull(String),

    #[error("Storage error: {0}")]
    Storage(rusqlite::Error),

    #[error("Malformed legacy data under '{key}': {source}")]
    MalformedLegacy {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entity '{0}' not found")]
    EntityNotFound(String),

    #[error("A reconciliation pass is already in progress")]
    PassInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Timeouts, aborted connections and refused connections.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Network(_) | EngineError::Timeout(_))
    }

    /// A rejection that no amount of retrying will turn into a success.
    ///
    /// 408 and 429 are excluded: both mean "try again later".
    pub fn is_terminal_rejection(&self) -> bool {
        match self {
            EngineError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }

    pub fn is_storage_full(&self) -> bool {
        matches!(self, EngineError::StorageFull(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => EngineError::StorageFull(err.to_string()),
            _ => EngineError::Storage(err),
        }
    }
}

impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
