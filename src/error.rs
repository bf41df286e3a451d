use thiserror::Error;

/// Why a camera capture attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera permission denied")]
    PermissionDenied,

    /// The device cannot satisfy `constraint` (e.g. `facingMode`).
    #[error("constraint '{constraint}' cannot be satisfied")]
    Overconstrained { constraint: String },

    #[error("camera is in use by another application")]
    DeviceBusy,

    #[error("no camera found")]
    NotFound,

    #[error("media capture is not supported on this platform")]
    Unsupported,

    #[error("capture failed: {0}")]
    Other(String),
}

/// Failures of the native negotiation layer (SDP, ICE, peer connection).
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to create peer connection: {0}")]
    PeerConnection(String),

    #[error("failed to create {kind}: {message}")]
    CreateDescription { kind: &'static str, message: String },

    #[error("failed to set {side} description: {message}")]
    SetDescription { side: &'static str, message: String },

    #[error("failed to add ICE candidate: {0}")]
    AddIceCandidate(String),

    #[error("failed to attach local track: {0}")]
    AddTrack(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl SignalingError {
    pub fn set_local(e: impl std::fmt::Display) -> Self {
        Self::SetDescription {
            side: "local",
            message: e.to_string(),
        }
    }

    pub fn set_remote(e: impl std::fmt::Display) -> Self {
        Self::SetDescription {
            side: "remote",
            message: e.to_string(),
        }
    }
}

/// The platform refused to start playback (autoplay policy, no source...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("playback refused: {0}")]
pub struct PlaybackError(pub String);
