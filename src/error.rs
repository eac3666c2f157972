use std::error::Error as StdError;

use thiserror::Error;

/// Talkbox's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Talkbox's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// A call that is not legal in the player's current state.
    #[error("invalid state for {0}")]
    InvalidState(&'static str),

    /// The media container/header could not be parsed.
    #[error("unsupported or malformed media: {0}")]
    UnsupportedMedia(String),

    /// A source/sink adapter was missing or failed to open.
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
