//! The native peer-connection seam.
//!
//! The publisher and subscriber cores only talk to a [`PeerConnection`]
//! obtained from a [`PeerConnectionFactory`]. The production backend lives in
//! [`crate::media_setup`]; tests substitute recording mocks.

use crate::error::SignalingError;
use crate::media::{LocalTrack, TrackKind};
use crate::protocol::{IceMessage, Signal, DEFAULT_STUN_SERVERS};
use crate::types::SharedSignalSink;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A candidate the native layer can apply. The end-of-candidates marker has
/// no `IceCandidate` representation, so it cannot reach `add_ice_candidate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// `None` for the end-of-candidates marker.
    pub fn from_message(msg: &IceMessage) -> Option<Self> {
        msg.candidate.as_ref().map(|candidate| Self {
            candidate: candidate.clone(),
            sdp_mid: msg.sdp_mid.clone(),
            sdp_mline_index: msg.sdp_mline_index,
        })
    }

    pub fn into_message(self) -> IceMessage {
        IceMessage {
            candidate: Some(self.candidate),
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
        }
    }
}

/// Handle to a remote media stream. Two handles are equal when they refer to
/// the same native stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteStream {
    pub id: String,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream: RemoteStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// ICE servers supplied to every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn: None,
        }
    }
}

impl IceConfig {
    /// No servers at all: host candidates only.
    pub fn host_only() -> Self {
        Self {
            stun_urls: Vec::new(),
            turn: None,
        }
    }
}

pub type LocalCandidateHandler = Arc<dyn Fn(Option<IceCandidate>) + Send + Sync>;
pub type RemoteTrackHandler = Arc<dyn Fn(RemoteTrack) + Send + Sync>;

/// Callbacks registered on a connection at creation time.
#[derive(Clone, Default)]
pub struct PeerHandlers {
    pub on_local_candidate: Option<LocalCandidateHandler>,
    pub on_track: Option<RemoteTrackHandler>,
}

/// Relays every gathered local candidate as an ICE signal. The
/// end-of-candidates notification (`None`) is never relayed.
pub fn relay_local_candidates(sink: SharedSignalSink) -> LocalCandidateHandler {
    Arc::new(move |candidate: Option<IceCandidate>| {
        if let Some(candidate) = candidate {
            tracing::debug!(candidate = %candidate.candidate, "Relaying local ICE candidate");
            sink.emit(Signal::Ice(candidate.into_message()));
        }
    })
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), SignalingError>;
    async fn create_offer(&self) -> Result<SessionDescription, SignalingError>;
    async fn create_answer(&self) -> Result<SessionDescription, SignalingError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), SignalingError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError>;
    async fn close(&self) -> Result<(), SignalingError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceConfig,
        handlers: PeerHandlers,
    ) -> Result<Arc<dyn PeerConnection>, SignalingError>;
}

/// Closes a connection, logging instead of failing. Teardown always
/// proceeds.
pub async fn close_quietly(pc: Arc<dyn PeerConnection>) {
    if let Err(e) = pc.close().await {
        tracing::warn!(error = %e, "Failed to close peer connection");
    }
    crate::metrics::CAMLINK_LIVE_PEER_CONNECTIONS.dec();
}
