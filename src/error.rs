use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("write transaction timed out")]
    Timeout,

    #[error("key not found")]
    KeyNotFound,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown eviction policy: {0}")]
    UnknownPolicy(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// True when the error is the transient busy-timeout of the index store.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for CacheError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}
