//! Error types for AmpShare

use thiserror::Error;

/// An inbound message that could not be turned into a protocol event.
///
/// Handlers log these and drop the message; they never change state.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing or empty station_id")]
    MissingStationId,

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Unrecognized topic: {0}")]
    UnknownTopic(String),
}

/// Startup configuration errors. Fatal: the binaries exit with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed broker URI {0:?}, expected scheme://host:port")]
    MalformedUri(String),

    #[error("Unsupported broker scheme {0:?}, expected mqtt or tcp")]
    UnsupportedScheme(String),

    #[error("Invalid broker port in {0:?}")]
    InvalidPort(String),

    #[error("Invalid {kind} {value:?}: must be non-empty and contain no '/', '+' or '#'")]
    InvalidIdentifier { kind: &'static str, value: String },
}

/// Errors raised by a bus client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to queue request: {0}")]
    Request(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Request(e.to_string())
    }
}
