//! Player-side state machine: answers the phone's offer and renders the
//! inbound camera stream.
//!
//! `idle -> connecting` on an offer, `connecting -> active` when the first
//! remote track arrives (not when the answer is sent), `* -> idle` on stop.
//! There is no error state here; failures are returned to the caller.
//!
//! ICE that arrives before the remote description is applied is held in
//! the session's `pending_ice` queue and flushed, in arrival order, right
//! after `set_remote_description` resolves.

use crate::error::SignalingError;
use crate::metrics::{
    CAMLINK_ICE_FLUSHED_TOTAL, CAMLINK_ICE_QUEUED_TOTAL, CAMLINK_LIVE_PEER_CONNECTIONS,
    CAMLINK_SESSIONS_STARTED_TOTAL,
};
use crate::peer::{
    close_quietly, relay_local_candidates, IceCandidate, IceConfig, PeerConnection,
    PeerConnectionFactory, PeerHandlers, RemoteTrack, RemoteTrackHandler, SessionDescription,
};
use crate::protocol::{AnswerMessage, IceMessage, OfferMessage, Signal};
use crate::types::{SharedSignalSink, StateCallback};
use crate::video::{ListenerId, PlaybackEvent, PlaybackListener, VideoElement, VideoElementFactory};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStatus {
    Idle,
    Connecting,
    Active,
}

struct SubscriberState {
    status: SubscriberStatus,
    generation: u64,
    pc: Option<Arc<dyn PeerConnection>>,
    has_remote_description: bool,
    pending_ice: VecDeque<IceCandidate>,
    video: Option<Arc<dyn VideoElement>>,
    listeners: Vec<ListenerId>,
}

impl SubscriberState {
    fn set_status(&mut self, status: SubscriberStatus) -> Option<SubscriberStatus> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(status)
    }
}

struct Shared {
    factory: Arc<dyn PeerConnectionFactory>,
    videos: Arc<dyn VideoElementFactory>,
    ice: IceConfig,
    sink: SharedSignalSink,
    on_state_change: Option<StateCallback<SubscriberStatus>>,
    state: Mutex<SubscriberState>,
}

pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        videos: Arc<dyn VideoElementFactory>,
        ice: IceConfig,
        sink: SharedSignalSink,
        on_state_change: Option<StateCallback<SubscriberStatus>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                videos,
                ice,
                sink,
                on_state_change,
                state: Mutex::new(SubscriberState {
                    status: SubscriberStatus::Idle,
                    generation: 0,
                    pc: None,
                    has_remote_description: false,
                    pending_ice: VecDeque::new(),
                    video: None,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn status(&self) -> SubscriberStatus {
        self.shared.lock().status
    }

    pub fn video_element(&self) -> Option<Arc<dyn VideoElement>> {
        self.shared.lock().video.clone()
    }

    pub fn has_remote_description(&self) -> bool {
        self.shared.lock().has_remote_description
    }

    pub fn pending_ice_len(&self) -> usize {
        self.shared.lock().pending_ice.len()
    }

    /// Answers `offer`, superseding any current session.
    ///
    /// The session reset happens when this is called, not when the returned
    /// future is first polled, so ICE routed after this call already belongs
    /// to the new session.
    pub fn handle_offer(
        &self,
        offer: OfferMessage,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send + 'static {
        let shared = self.shared.clone();
        let (generation, previous) = shared.begin_session();
        async move {
            if let Some(previous) = previous {
                info!("Closing superseded peer connection");
                close_quietly(previous).await;
            }
            shared.negotiate(generation, offer).await
        }
    }

    /// Applies `ice` now if the remote description is set, otherwise queues
    /// it. The end-of-candidates marker is neither queued nor applied.
    pub fn handle_ice(
        &self,
        ice: IceMessage,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send + 'static {
        let target = self.shared.route_ice(&ice);
        async move {
            match target {
                Some((pc, candidate)) => pc.add_ice_candidate(candidate).await,
                None => Ok(()),
            }
        }
    }

    /// Releases the session. Safe to call at any time, any number of times.
    pub async fn stop(&self) {
        self.shared.stop().await
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, changed: Option<SubscriberStatus>) {
        if let (Some(status), Some(callback)) = (changed, &self.on_state_change) {
            callback(status);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn begin_session(&self) -> (u64, Option<Arc<dyn PeerConnection>>) {
        let (generation, previous, changed) = {
            let mut state = self.lock();
            state.generation += 1;
            state.has_remote_description = false;
            let dropped = state.pending_ice.len();
            state.pending_ice.clear();
            if dropped > 0 {
                debug!(dropped, "Discarded ICE queued for the previous session");
            }
            let changed = state.set_status(SubscriberStatus::Connecting);
            (state.generation, state.pc.take(), changed)
        };
        CAMLINK_SESSIONS_STARTED_TOTAL
            .with_label_values(&["subscriber"])
            .inc();
        self.notify(changed);
        (generation, previous)
    }

    async fn negotiate(
        self: Arc<Self>,
        generation: u64,
        offer: OfferMessage,
    ) -> Result<(), SignalingError> {
        let handlers = PeerHandlers {
            on_local_candidate: Some(relay_local_candidates(self.sink.clone())),
            on_track: Some(self.track_handler(generation)),
        };
        let pc = self.factory.create(&self.ice, handlers).await?;
        CAMLINK_LIVE_PEER_CONNECTIONS.inc();

        let superseded = {
            let mut state = self.lock();
            if state.generation == generation {
                state.pc = Some(pc.clone());
                false
            } else {
                true
            }
        };
        if superseded {
            close_quietly(pc).await;
            return Ok(());
        }

        info!(sdp_length = offer.sdp.len(), "Applying SDP offer");
        pc.set_remote_description(SessionDescription::offer(offer.sdp))
            .await?;
        self.flush_pending_ice(generation, &pc).await;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        if !self.is_current(generation) {
            return Ok(());
        }

        info!(sdp_length = answer.sdp.len(), "Sending SDP answer");
        self.sink.emit(Signal::Answer(AnswerMessage::new(answer.sdp)));
        Ok(())
    }

    /// Drains the queue one candidate at a time; `has_remote_description`
    /// only flips once it is empty, so ICE arriving mid-flush is appended
    /// behind the earlier candidates instead of overtaking them.
    async fn flush_pending_ice(&self, generation: u64, pc: &Arc<dyn PeerConnection>) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                match state.pending_ice.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        state.has_remote_description = true;
                        return;
                    }
                }
            };
            CAMLINK_ICE_FLUSHED_TOTAL
                .with_label_values(&["session"])
                .inc();
            if let Err(e) = pc.add_ice_candidate(next).await {
                warn!(error = %e, "Failed to apply queued ICE candidate");
            }
        }
    }

    fn route_ice(&self, ice: &IceMessage) -> Option<(Arc<dyn PeerConnection>, IceCandidate)> {
        let Some(candidate) = IceCandidate::from_message(ice) else {
            debug!("Remote end-of-candidates");
            return None;
        };
        let mut state = self.lock();
        if state.has_remote_description {
            if let Some(pc) = &state.pc {
                return Some((pc.clone(), candidate));
            }
        }
        state.pending_ice.push_back(candidate);
        CAMLINK_ICE_QUEUED_TOTAL
            .with_label_values(&["session"])
            .inc();
        debug!(
            queued = state.pending_ice.len(),
            "Remote description not set yet, queued ICE candidate"
        );
        None
    }

    fn track_handler(self: &Arc<Self>, generation: u64) -> RemoteTrackHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |track: RemoteTrack| {
            if let Some(shared) = weak.upgrade() {
                shared.on_remote_track(generation, track);
            }
        })
    }

    fn on_remote_track(&self, generation: u64, track: RemoteTrack) {
        let (video, changed) = {
            let mut state = self.lock();
            if state.generation != generation || state.pc.is_none() {
                debug!(track_id = %track.id, "Track from an ended session, ignoring");
                return;
            }

            let video = match &state.video {
                Some(video) => video.clone(),
                None => {
                    let video = self.videos.create();
                    video.set_autoplay(true);
                    video.set_plays_inline(true);
                    // The stream carries no audio; muted playback is always
                    // allowed to autoplay.
                    video.set_muted(true);
                    state.video = Some(video.clone());
                    video
                }
            };

            if state.listeners.is_empty() {
                for event in PlaybackEvent::RETRY_TRIGGERS {
                    let id = video.add_listener(event, retry_playback(&video));
                    state.listeners.push(id);
                }
            }

            if video.src_object().as_ref() != Some(&track.stream) {
                video.set_src_object(Some(track.stream.clone()));
            }

            (video, state.set_status(SubscriberStatus::Active))
        };

        info!(
            track_id = %track.id,
            kind = %track.kind,
            stream_id = %track.stream.id,
            "Remote track attached"
        );
        self.notify(changed);
        spawn_playback(video);
    }

    async fn stop(&self) {
        let (pc, video, listeners, changed) = {
            let mut state = self.lock();
            state.generation += 1;
            state.pending_ice.clear();
            state.has_remote_description = false;
            let listeners = std::mem::take(&mut state.listeners);
            let changed = state.set_status(SubscriberStatus::Idle);
            (state.pc.take(), state.video.take(), listeners, changed)
        };

        if let Some(video) = video {
            for id in listeners {
                video.remove_listener(id);
            }
            video.pause();
            video.set_src_object(None);
        }
        if let Some(pc) = pc {
            close_quietly(pc).await;
            info!("Subscriber stopped");
        }
        self.notify(changed);
    }
}

fn retry_playback(video: &Arc<dyn VideoElement>) -> PlaybackListener {
    let weak = Arc::downgrade(video);
    Arc::new(move || {
        if let Some(video) = weak.upgrade() {
            spawn_playback(video);
        }
    })
}

/// Playback refusals (autoplay policy) are expected; the next lifecycle
/// event tries again.
fn spawn_playback(video: Arc<dyn VideoElement>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("No runtime available for playback attempt");
        return;
    };
    handle.spawn(async move {
        if let Err(e) = video.play().await {
            debug!(error = %e, "Playback not started, waiting for next media event");
        }
    });
}
