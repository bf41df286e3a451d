//! Local camera capture.
//!
//! Two platform APIs are supported behind one async trait: the modern
//! future-returning [`MediaDevices`] and the legacy callback-style
//! [`LegacyMediaDevices`], which [`LegacyCapture`] adapts.

use crate::error::CaptureError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const IDEAL_WIDTH: u32 = 640;
pub const IDEAL_HEIGHT: u32 = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacingMode::User => "user",
            FacingMode::Environment => "environment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: Option<FacingMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Camera only, no microphone, ideal 640x480.
    pub fn camera(facing_mode: Option<FacingMode>) -> Self {
        Self {
            audio: false,
            video: Some(VideoConstraints {
                ideal_width: IDEAL_WIDTH,
                ideal_height: IDEAL_HEIGHT,
                facing_mode,
            }),
        }
    }

    pub fn facing_mode(&self) -> Option<FacingMode> {
        self.video.as_ref().and_then(|v| v.facing_mode)
    }

    pub fn without_facing_mode(&self) -> Self {
        let mut relaxed = self.clone();
        if let Some(video) = relaxed.video.as_mut() {
            video.facing_mode = None;
        }
        relaxed
    }
}

/// A captured track. Holding it keeps the device open until [`stop`] is
/// called.
///
/// [`stop`]: LocalTrack::stop
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    stopped: watch::Sender<bool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, rtc: Arc<TrackLocalStaticSample>) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            rtc,
            stopped,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Releases the underlying device. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.send_replace(true) {
            debug!(track_id = %self.id, kind = %self.kind, "Local track stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves (via `changed()`) once the track is stopped; lets capture
    /// sources release the device.
    pub fn stopped_signal(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, CaptureError>;
}

pub type CaptureSuccess = Box<dyn FnOnce(LocalStream) + Send>;
pub type CaptureFailure = Box<dyn FnOnce(CaptureError) + Send>;

/// Callback-style capture API found on older platforms.
pub trait LegacyMediaDevices: Send + Sync {
    fn get_user_media(
        &self,
        constraints: MediaConstraints,
        on_success: CaptureSuccess,
        on_error: CaptureFailure,
    );
}

/// Presents a [`LegacyMediaDevices`] as [`MediaDevices`].
pub struct LegacyCapture {
    inner: Arc<dyn LegacyMediaDevices>,
}

impl LegacyCapture {
    pub fn new(inner: Arc<dyn LegacyMediaDevices>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MediaDevices for LegacyCapture {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, CaptureError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let tx_err = tx.clone();

        self.inner.get_user_media(
            constraints.clone(),
            Box::new(move |stream| {
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(Ok(stream));
                }
            }),
            Box::new(move |err| {
                if let Some(tx) = tx_err.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(Err(err));
                }
            }),
        );

        rx.await.unwrap_or_else(|_| {
            Err(CaptureError::Other(
                "legacy capture dropped both callbacks".to_string(),
            ))
        })
    }
}

/// The capture APIs a platform exposes. Either may be missing.
#[derive(Clone, Default)]
pub struct Navigator {
    media_devices: Option<Arc<dyn MediaDevices>>,
    legacy: Option<Arc<dyn LegacyMediaDevices>>,
}

impl Navigator {
    pub fn new(
        media_devices: Option<Arc<dyn MediaDevices>>,
        legacy: Option<Arc<dyn LegacyMediaDevices>>,
    ) -> Self {
        Self {
            media_devices,
            legacy,
        }
    }

    pub fn with_media_devices(devices: Arc<dyn MediaDevices>) -> Self {
        Self::new(Some(devices), None)
    }

    pub fn with_legacy(legacy: Arc<dyn LegacyMediaDevices>) -> Self {
        Self::new(None, Some(legacy))
    }

    /// The modern API when present, else the legacy one behind the same
    /// interface.
    pub fn capture_api(&self) -> Option<Arc<dyn MediaDevices>> {
        if let Some(devices) = &self.media_devices {
            return Some(devices.clone());
        }
        self.legacy
            .as_ref()
            .map(|legacy| Arc::new(LegacyCapture::new(legacy.clone())) as Arc<dyn MediaDevices>)
    }
}

/// Opens the camera. A rejected facing-mode constraint is retried once
/// without it.
pub async fn capture_camera(
    navigator: &Navigator,
    facing_mode: Option<FacingMode>,
) -> Result<LocalStream, CaptureError> {
    let api = navigator.capture_api().ok_or(CaptureError::Unsupported)?;
    let constraints = MediaConstraints::camera(facing_mode);

    match api.get_user_media(&constraints).await {
        Err(CaptureError::Overconstrained { constraint }) if facing_mode.is_some() => {
            warn!(
                constraint = %constraint,
                facing_mode = ?facing_mode.map(|f| f.as_str()),
                "Camera rejected constraint, retrying without facing mode"
            );
            api.get_user_media(&constraints.without_facing_mode()).await
        }
        other => other,
    }
}
