use thiserror::Error;

/// Errors surfaced by the bus core.
///
/// Most of these never leave the component that produced them: malformed
/// ingress is dropped, validation failures become `ERR` responses and
/// storage failures are logged at the write site.
#[derive(Error, Debug)]
pub enum BusError {
    /// Ingress bytes were not UTF-8 JSON or not a JSON object.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Peer closed the TCP stream before a full frame arrived.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// An RPC payload was missing or carried an invalid required field.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Outgoing payload could not be serialized or exceeds the datagram ceiling.
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BusError>;
