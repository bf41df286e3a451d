//! Synthetic camera for hosts without a capture device.
//!
//! Each capture yields one VP8 track fed with a fixed frame at a steady
//! rate until the track is stopped. Like a real camera it is exclusive:
//! a second capture while an earlier track is live fails with
//! [`CaptureError::DeviceBusy`].

use crate::error::CaptureError;
use crate::media::{LocalStream, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

// VP8 key frame header for a 2x2 frame followed by filler.
static PATTERN_FRAME: [u8; 16] = [
    0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x02, 0x00, 0x02, 0x00, 0x00, 0x47, 0x08, 0x85, 0x85, 0x88,
];

pub struct TestPatternDevices {
    frame_interval: Duration,
    live: Mutex<Option<Weak<LocalTrack>>>,
}

impl Default for TestPatternDevices {
    fn default() -> Self {
        Self::new(FRAME_INTERVAL)
    }
}

impl TestPatternDevices {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            live: Mutex::new(None),
        }
    }

    fn in_use(&self) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |track| !track.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for TestPatternDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, CaptureError> {
        let Some(video) = &constraints.video else {
            return Err(CaptureError::NotFound);
        };
        if self.in_use() {
            return Err(CaptureError::DeviceBusy);
        }

        let stream_id = format!("test-pattern-{}", uuid::Uuid::new_v4());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "camera".to_owned(),
            stream_id.clone(),
        ));
        let track = Arc::new(LocalTrack::new(TrackKind::Video, rtc));
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&track));

        info!(
            stream_id = %stream_id,
            width = video.ideal_width,
            height = video.ideal_height,
            facing_mode = ?video.facing_mode.map(|f| f.as_str()),
            "Test pattern camera opened"
        );
        tokio::spawn(feed_frames(
            track.rtc_track(),
            track.stopped_signal(),
            track.id().to_string(),
            self.frame_interval,
        ));

        Ok(LocalStream::new(stream_id, vec![track]))
    }
}

/// Runs until the track is stopped or dropped.
async fn feed_frames(
    rtc: Arc<TrackLocalStaticSample>,
    mut stopped: watch::Receiver<bool>,
    track_id: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut frames: u64 = 0;
    loop {
        if *stopped.borrow() {
            break;
        }
        tokio::select! {
            changed = stopped.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let sample = Sample {
                    data: Bytes::from_static(&PATTERN_FRAME),
                    duration: interval,
                    ..Default::default()
                };
                if let Err(e) = rtc.write_sample(&sample).await {
                    trace!(error = %e, "Dropped test pattern frame");
                }
                frames += 1;
            }
        }
    }
    debug!(track_id = %track_id, frames, "Test pattern camera closed");
}
