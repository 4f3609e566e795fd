use rpilot_network::NetworkError;
use rpilot_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
