/// Errors raised while decoding or interpreting protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("no handler registered for key '{0}'")]
    UnknownKey(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
