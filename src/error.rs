//! Error types for the broadcaster

/// Result type alias using the broadcaster Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in broadcaster operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shared graph construction or state-change error
    #[error("Graph error: {0}")]
    Graph(String),

    /// Per-viewer attachment link/unlink error
    #[error("Attachment error: {0}")]
    Attachment(String),

    /// Viewer not found in the registry
    #[error("Viewer not found: {0}")]
    ViewerNotFound(String),

    /// SDP negotiation error
    #[error("SDP error: {0}")]
    Sdp(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// TURN credential acquisition error
    #[error("TURN error: {0}")]
    Turn(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is fatal to the whole process
    ///
    /// Only graph-level failures end the broadcaster; everything else is
    /// scoped to a single viewer or degrades a single subsystem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Graph(_))
    }

    /// Check if this error is scoped to a single peer session
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::ViewerNotFound(_)
                | Error::Sdp(_)
                | Error::IceCandidate(_)
                | Error::PeerConnection(_)
                | Error::Attachment(_)
        )
    }

    /// Get a brief error code for logging and metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Graph(_) => "GRAPH_ERROR",
            Error::Attachment(_) => "ATTACHMENT_ERROR",
            Error::ViewerNotFound(_) => "VIEWER_NOT_FOUND",
            Error::Sdp(_) => "SDP_ERROR",
            Error::IceCandidate(_) => "ICE_CANDIDATE_ERROR",
            Error::PeerConnection(_) => "PEER_CONNECTION_ERROR",
            Error::Signaling(_) => "SIGNALING_ERROR",
            Error::WebSocket(_) => "WEBSOCKET_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Turn(_) => "TURN_ERROR",
            Error::OperationTimeout(_) => "OPERATION_TIMEOUT",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "OTHER_ERROR",
        }
    }
}
