/// Transport failures. Kept separate from protocol errors so callers can
/// tell a dropped frame from a closed channel without inspecting messages.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send queue full, frame dropped")]
    ChannelFull,

    #[error("channel closed")]
    ChannelClosed,

    #[error("subscription handshake failed: {0}")]
    Handshake(String),
}
