//! Error types for mesh orchestration

/// Result type alias using mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating mesh peers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling message could not be handled or delivered
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A peer with the same session id and sid already exists
    #[error("Peer already exists: id={id} sid={sid}")]
    DuplicatePeer { id: String, sid: String },

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Data channels are not available on this platform
    #[error("Data channels are not supported")]
    DataChannelUnsupported,

    /// Operation on a peer that has already ended
    #[error("Peer closed: {0}")]
    PeerClosed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Signaling transport is gone
    #[error("Signaling transport closed")]
    TransportClosed,

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::IceCandidateError(_) | Error::TransportClosed
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::DuplicatePeer { .. }
                | Error::PeerClosed(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }
}
