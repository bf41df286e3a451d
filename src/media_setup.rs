//! Native WebRTC backend for the peer-connection seam, on the `webrtc` crate.

use crate::error::SignalingError;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::{
    IceCandidate, IceConfig, PeerConnection, PeerConnectionFactory, PeerHandlers, RemoteStream,
    RemoteTrack, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub struct MediaSetup;

impl MediaSetup {
    /// Video-only engine: the camera link never carries audio.
    pub fn create_webrtc_api() -> Result<API, SignalingError> {
        let mut media_engine = MediaEngine::default();

        let codecs = [
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    ..Default::default()
                },
                payload_type: 96,
                ..Default::default()
            },
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_owned(),
                    ..Default::default()
                },
                payload_type: 102,
                ..Default::default()
            },
        ];
        for codec in codecs {
            let mime_type = codec.capability.mime_type.clone();
            media_engine
                .register_codec(codec, RTPCodecType::Video)
                .map_err(|e| {
                    SignalingError::PeerConnection(format!(
                        "failed to register {} codec: {}",
                        mime_type, e
                    ))
                })?;
        }

        let extensions = [
            "urn:ietf:params:rtp-hdrext:sdes:mid",
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            "urn:3gpp:video-orientation",
        ];
        for extension in extensions {
            if let Err(e) = media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: extension.to_string(),
                },
                RTPCodecType::Video,
                None,
            ) {
                warn!(extension, error = %e, "Failed to register header extension");
            }
        }

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    pub fn get_rtc_config(ice: &IceConfig) -> RTCConfiguration {
        let mut ice_servers = Vec::new();
        if !ice.stun_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice.stun_urls.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &ice.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }
}

/// Creates [`RtcPeerConnection`]s from one shared `webrtc` API instance.
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, SignalingError> {
        Ok(Self {
            api: MediaSetup::create_webrtc_api()?,
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        handlers: PeerHandlers,
    ) -> Result<Arc<dyn PeerConnection>, SignalingError> {
        let pc = self
            .api
            .new_peer_connection(MediaSetup::get_rtc_config(ice))
            .await
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))?;
        let pc = Arc::new(pc);
        register_handlers(&pc, handlers);
        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, handlers: PeerHandlers) {
    if let Some(on_local_candidate) = handlers.on_local_candidate {
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            match c.map(|c| c.to_json()) {
                Some(Ok(init)) => on_local_candidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Some(Err(e)) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                None => on_local_candidate(None),
            }
            Box::pin(async {})
        }));
    }

    if let Some(on_track) = handlers.on_track {
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let remote = RemoteTrack {
                id: track.id().to_string(),
                kind,
                stream: RemoteStream::new(track.stream_id().to_string()),
            };
            info!(
                track_id = %remote.id,
                stream_id = %remote.stream.id,
                ssrc = %track.ssrc(),
                "Remote track arrived"
            );
            on_track(remote);

            // Rendering happens outside this crate; keep the receive buffer
            // drained until the track ends.
            Box::pin(async move {
                let mut packets: u64 = 0;
                while track.read_rtp().await.is_ok() {
                    packets += 1;
                }
                debug!(packets, "Remote track ended");
            })
        }));
    }

    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        info!(state = %s, "ICE connection state changed");
        Box::pin(async {})
    }));
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        info!(state = %s, "Peer connection state changed");
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> webrtc::error::Result<RTCSessionDescription> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), SignalingError> {
        let rtp_sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SignalingError::AddTrack(e.to_string()))?;

        // RTCP has to be read for the interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((packets, _)) = rtp_sender.read(&mut rtcp_buf).await {
                trace!(count = packets.len(), "RTCP from remote");
            }
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SignalingError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SignalingError::CreateDescription {
                kind: SdpKind::Offer.as_str(),
                message: e.to_string(),
            })?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SignalingError::CreateDescription {
                kind: SdpKind::Answer.as_str(),
                message: e.to_string(),
            })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        let desc = to_rtc(desc).map_err(SignalingError::set_local)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(SignalingError::set_local)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        let desc = to_rtc(desc).map_err(SignalingError::set_remote)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(SignalingError::set_remote)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| SignalingError::AddIceCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.pc
            .close()
            .await
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::TurnServer;
    use crate::test_support::test_stream;

    #[test]
    fn test_rtc_config_carries_stun_and_turn() {
        let ice = IceConfig {
            stun_urls: vec!["stun:a:3478".into(), "stun:b:3478".into()],
            turn: Some(TurnServer {
                url: "turn:t:3478".into(),
                username: "u".into(),
                credential: "p".into(),
            }),
        };
        let config = MediaSetup::get_rtc_config(&ice);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls.len(), 2);
        assert_eq!(config.ice_servers[1].username, "u");
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);

        assert!(MediaSetup::get_rtc_config(&IceConfig::host_only())
            .ice_servers
            .is_empty());
    }

    #[tokio::test]
    async fn test_offer_from_native_connection() {
        let factory = RtcPeerFactory::new().unwrap();
        let pc = factory
            .create(&IceConfig::host_only(), PeerHandlers::default())
            .await
            .unwrap();

        pc.add_track(test_stream().tracks()[0].clone()).await.unwrap();
        let offer = pc.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        pc.set_local_description(offer).await.unwrap();

        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_remote_sdp_is_an_error() {
        let factory = RtcPeerFactory::new().unwrap();
        let pc = factory
            .create(&IceConfig::host_only(), PeerHandlers::default())
            .await
            .unwrap();

        let err = pc
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::SetDescription { side: "remote", .. }));
        pc.close().await.unwrap();
    }
}
