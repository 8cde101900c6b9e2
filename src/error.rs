//! Error types for relay aggregation.

use thiserror::Error;

/// Result type for relaygraph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the library.
///
/// Transport failures on a single relay are normally absorbed into the
/// connection state and never reach callers; they only appear here when a
/// caller talks to one relay directly.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to or talking with a relay failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A relay sent something that is not valid NIP-01.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The relay is known but not in a state that allows requests.
    #[error("relay not connected: {0}")]
    NotConnected(String),

    /// A relay identifier failed validation.
    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),

    /// Event id or signature did not check out.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The signer failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The signer refused to sign.
    #[error("signing declined")]
    SigningDeclined,

    /// No owner list version with this id exists in the session.
    #[error("unknown list: {0}")]
    UnknownList(String),

    /// Only the newest fetched version of a list may be re-sent as is.
    #[error("not the newest fetched version: {0}")]
    NotLatest(String),

    /// A key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidRelayUrl(e.to_string())
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::InvalidEvent(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidKey(e.to_string())
    }
}
