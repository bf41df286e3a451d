//! Recording doubles for the native seams, shared by the unit tests.

use crate::bus::ActionBus;
use crate::error::{CaptureError, SignalingError};
use crate::media::{LocalStream, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::{
    IceCandidate, IceConfig, PeerConnection, PeerConnectionFactory, PeerHandlers, RemoteStream,
    RemoteTrack, SessionDescription,
};
use crate::protocol::Signal;
use crate::types::SignalSink;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Lets spawned tasks (playback attempts, detached closes) run to completion.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Polls `cond` until it holds or a second has passed.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn test_stream() -> LocalStream {
    let rtc = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "camlink-test".to_owned(),
    ));
    LocalStream::new(
        uuid::Uuid::new_v4().to_string(),
        vec![Arc::new(LocalTrack::new(TrackKind::Video, rtc))],
    )
}

enum DeviceMode {
    Grant,
    Fail(CaptureError),
    RejectFacingMode,
    Exclusive,
}

pub struct MockDevices {
    mode: DeviceMode,
    attempts: Mutex<Vec<MediaConstraints>>,
    handed_out: Mutex<Vec<LocalStream>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockDevices {
    fn with_mode(mode: DeviceMode) -> Self {
        Self {
            mode,
            attempts: Mutex::new(Vec::new()),
            handed_out: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(DeviceMode::Grant)
    }

    pub fn failing(err: CaptureError) -> Self {
        Self::with_mode(DeviceMode::Fail(err))
    }

    /// Rejects any request carrying a facing mode as overconstrained.
    pub fn rejecting_facing_mode() -> Self {
        Self::with_mode(DeviceMode::RejectFacingMode)
    }

    /// Reports the camera busy while an earlier capture is still live.
    pub fn exclusive() -> Self {
        Self::with_mode(DeviceMode::Exclusive)
    }

    /// Holds every capture, like a pending permission prompt, until a permit
    /// is added to the returned semaphore.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn attempts(&self) -> Vec<MediaConstraints> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn handed_out(&self) -> Vec<LocalStream> {
        self.handed_out.lock().unwrap().clone()
    }

    fn grant(&self) -> Result<LocalStream, CaptureError> {
        let stream = test_stream();
        self.handed_out.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, CaptureError> {
        self.attempts.lock().unwrap().push(constraints.clone());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        match &self.mode {
            DeviceMode::Grant => self.grant(),
            DeviceMode::Fail(e) => Err(e.clone()),
            DeviceMode::RejectFacingMode => match constraints.facing_mode() {
                Some(_) => Err(CaptureError::Overconstrained {
                    constraint: "facingMode".to_string(),
                }),
                None => self.grant(),
            },
            DeviceMode::Exclusive => {
                let busy = self
                    .handed_out
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|s| s.tracks().iter().any(|t| !t.is_stopped()));
                if busy {
                    Err(CaptureError::DeviceBusy)
                } else {
                    self.grant()
                }
            }
        }
    }
}

#[derive(Default)]
struct MockPeerState {
    added_tracks: usize,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<String>,
    closed: bool,
    fail_remote: bool,
    remote_gate: Option<Arc<Semaphore>>,
}

pub struct MockPeer {
    index: usize,
    handlers: PeerHandlers,
    events: Arc<Mutex<Vec<String>>>,
    state: Mutex<MockPeerState>,
}

impl MockPeer {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn added_tracks(&self) -> usize {
        self.state.lock().unwrap().added_tracks
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn fail_remote_description(&self) {
        self.state.lock().unwrap().fail_remote = true;
    }

    /// Blocks this connection's next `set_remote_description` until a permit
    /// is added to the returned semaphore.
    pub fn hold_remote_description(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().remote_gate = Some(gate.clone());
        gate
    }

    /// Reports a gathered local candidate (`None` ends gathering).
    pub fn gather_candidate(&self, candidate: Option<&str>) {
        if let Some(handler) = &self.handlers.on_local_candidate {
            handler(candidate.map(|c| IceCandidate {
                candidate: c.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
    }

    /// Reports a remote track arriving on `stream`.
    pub fn emit_track(&self, track_id: &str, stream: &RemoteStream) {
        if let Some(handler) = &self.handlers.on_track {
            handler(RemoteTrack {
                id: track_id.to_string(),
                kind: TrackKind::Video,
                stream: stream.clone(),
            });
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_track(&self, _track: Arc<LocalTrack>) -> Result<(), SignalingError> {
        self.state.lock().unwrap().added_tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SignalingError> {
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError> {
        if self.state.lock().unwrap().remote.is_none() {
            return Err(SignalingError::CreateDescription {
                kind: "answer",
                message: "no remote offer".to_string(),
            });
        }
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.index)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.state.lock().unwrap().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        let gate = self.state.lock().unwrap().remote_gate.clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_remote {
                return Err(SignalingError::set_remote("malformed sdp"));
            }
            state.remote = Some(desc);
        }
        self.record(format!("remote:{}", self.index));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.remote.is_none() {
                return Err(SignalingError::AddIceCandidate(
                    "remote description not set".to_string(),
                ));
            }
            state.applied.push(candidate.candidate.clone());
        }
        self.record(format!("ice:{}:{}", self.index, candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.state.lock().unwrap().closed = true;
        self.record(format!("close:{}", self.index));
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    connections: Vec<Arc<MockPeer>>,
    fail_remote: bool,
    remote_gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
pub struct MockPeerFactory {
    events: Arc<Mutex<Vec<String>>>,
    state: Mutex<FactoryState>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self, index: usize) -> Arc<MockPeer> {
        self.state.lock().unwrap().connections[index].clone()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// `create:N`, `remote:N`, `ice:N:<candidate>` and `close:N`, in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Connections created from now on reject their remote description.
    pub fn fail_remote_descriptions(&self) {
        self.state.lock().unwrap().fail_remote = true;
    }

    /// Connections created from now on block in `set_remote_description`
    /// until a permit is added to the returned semaphore.
    pub fn hold_remote_descriptions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().unwrap().remote_gate = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
        handlers: PeerHandlers,
    ) -> Result<Arc<dyn PeerConnection>, SignalingError> {
        let mut state = self.state.lock().unwrap();
        let index = state.connections.len();
        let pc = Arc::new(MockPeer {
            index,
            handlers,
            events: self.events.clone(),
            state: Mutex::new(MockPeerState {
                fail_remote: state.fail_remote,
                remote_gate: state.remote_gate.clone(),
                ..Default::default()
            }),
        });
        state.connections.push(pc.clone());
        self.events.lock().unwrap().push(format!("create:{}", index));
        Ok(pc)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<Signal>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

impl SignalSink for RecordingSink {
    fn emit(&self, signal: Signal) {
        self.signals.lock().unwrap().push(signal);
    }
}

#[derive(Default)]
pub struct RecordingBus {
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.sent().into_iter().map(|(a, _)| a).collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.sent().iter().filter(|(a, _)| a == action).count()
    }
}

impl ActionBus for RecordingBus {
    fn send_action(&self, action: &str, payload: Value) {
        self.sent.lock().unwrap().push((action.to_string(), payload));
    }
}
