//! Error types for the CGRA mapper
//!
//! Only genuinely fatal conditions surface as errors: bad configuration,
//! unparseable input, and artifact I/O. Mapping outcomes such as
//! "function is not a target" or "no feasible schedule" are reported
//! through the report record instead, mirroring how the pass never aborts
//! the host on them.

use thiserror::Error;

/// Result type for mapping operations
pub type MapperResult<T> = Result<T, MapperError>;

/// Fatal mapper errors
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Configuration error: missing or invalid key(s): {keys}")]
    Config { keys: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MapperError {
    pub fn config(keys: impl Into<String>) -> Self {
        MapperError::Config { keys: keys.into() }
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        MapperError::ParseError { message: msg.into() }
    }
}
