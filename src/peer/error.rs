use thiserror::Error;

/// Errors that end a peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Malformed frame or a message that violates the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,
}

impl PeerError {
    /// True for failures caused by bytes the peer sent, as opposed to the transport.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandshake
                | Self::InfoHashMismatch
                | Self::Protocol(_)
                | Self::UnknownMessageId(_)
        )
    }
}
