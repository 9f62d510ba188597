use thiserror::Error;

/// Errors that can occur in the tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Cancellation is expected during shutdown and is never reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
