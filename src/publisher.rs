//! Phone-side state machine: owns the camera capture and the outbound peer
//! connection.
//!
//! ```text
//! idle --start()--> (capture) --offer sent--> connecting --answer--> active
//!   ^                  |                            |                  |
//!   |                  +--capture/negotiation error-+-> error          |
//!   +------------------------------- stop() ---------------------------+
//! ```
//!
//! Every `start()` opens a new session generation. Work that resumes after
//! an `.await` re-checks the generation and releases what it acquired when
//! the session was stopped or superseded in the meantime.

use crate::error::SignalingError;
use crate::media::{capture_camera, FacingMode, LocalStream, Navigator};
use crate::metrics::{
    CAMLINK_FAILURES_TOTAL, CAMLINK_LIVE_PEER_CONNECTIONS, CAMLINK_SESSIONS_STARTED_TOTAL,
};
use crate::peer::{
    close_quietly, relay_local_candidates, IceCandidate, IceConfig, PeerConnection,
    PeerConnectionFactory, PeerHandlers, SessionDescription,
};
use crate::protocol::{AnswerMessage, IceMessage, OfferMessage, Signal, StopMessage};
use crate::types::SharedSignalSink;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherStatus {
    Idle,
    Connecting,
    Active,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub facing_mode: Option<FacingMode>,
}

impl StartOptions {
    pub fn facing(mode: FacingMode) -> Self {
        Self {
            facing_mode: Some(mode),
        }
    }
}

/// Progress of the subscriber's answer on the current connection.
enum RemoteDescription {
    Unset,
    /// Resolves to `true` once applied; the sender is dropped on failure.
    Applying(watch::Receiver<bool>),
    Applied,
}

struct PublisherState {
    status: PublisherStatus,
    generation: u64,
    stream: Option<LocalStream>,
    pc: Option<Arc<dyn PeerConnection>>,
    remote: RemoteDescription,
    last_error: Option<String>,
}

impl PublisherState {
    /// Ends the current session and returns what must be released.
    fn end(&mut self, status: PublisherStatus, last_error: Option<String>) -> Released {
        self.generation += 1;
        self.status = status;
        self.last_error = last_error;
        self.remote = RemoteDescription::Unset;
        Released {
            stream: self.stream.take(),
            pc: self.pc.take(),
        }
    }
}

/// What a teardown has to release once the state lock is dropped.
struct Released {
    stream: Option<LocalStream>,
    pc: Option<Arc<dyn PeerConnection>>,
}

impl Released {
    fn is_empty(&self) -> bool {
        self.stream.is_none() && self.pc.is_none()
    }

    async fn release(self) {
        if let Some(stream) = self.stream {
            stream.stop_all();
        }
        if let Some(pc) = self.pc {
            close_quietly(pc).await;
        }
    }
}

pub struct Publisher {
    navigator: Navigator,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: IceConfig,
    sink: SharedSignalSink,
    state: Mutex<PublisherState>,
}

impl Publisher {
    pub fn new(
        navigator: Navigator,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: IceConfig,
        sink: SharedSignalSink,
    ) -> Self {
        Self {
            navigator,
            factory,
            ice,
            sink,
            state: Mutex::new(PublisherState {
                status: PublisherStatus::Idle,
                generation: 0,
                stream: None,
                pc: None,
                remote: RemoteDescription::Unset,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> PublisherStatus {
        self.lock().status
    }

    pub fn stream(&self) -> Option<LocalStream> {
        self.lock().stream.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Captures the camera, opens a peer connection and sends an offer.
    ///
    /// A previous session is torn down first, camera included. Failures
    /// leave the publisher in `Error` with nothing allocated.
    pub async fn start(&self, options: StartOptions) -> Result<(), SignalingError> {
        let (generation, previous) = {
            let mut state = self.lock();
            let previous = state.end(PublisherStatus::Idle, None);
            (state.generation, previous)
        };
        if !previous.is_empty() {
            info!("Releasing previous publisher session before restart");
        }
        previous.release().await;

        CAMLINK_SESSIONS_STARTED_TOTAL
            .with_label_values(&["publisher"])
            .inc();

        let stream = match capture_camera(&self.navigator, options.facing_mode).await {
            Ok(stream) => stream,
            Err(e) => {
                CAMLINK_FAILURES_TOTAL.with_label_values(&["capture"]).inc();
                warn!(error = %e, "Camera capture failed");
                let mut state = self.lock();
                if state.generation == generation {
                    state.status = PublisherStatus::Error;
                    state.last_error = Some(e.to_string());
                }
                return Err(e.into());
            }
        };

        let superseded = {
            let mut state = self.lock();
            if state.generation == generation {
                state.stream = Some(stream.clone());
                false
            } else {
                true
            }
        };
        if superseded {
            debug!("Publisher session ended while capturing, releasing camera");
            stream.stop_all();
            return Ok(());
        }
        info!(
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "Camera captured"
        );

        if let Err(e) = self.negotiate(generation, &stream).await {
            CAMLINK_FAILURES_TOTAL
                .with_label_values(&["negotiation"])
                .inc();
            error!(error = %e, "Failed to negotiate publisher offer");
            self.fail(generation, &e, false).await;
            return Err(e);
        }
        Ok(())
    }

    async fn negotiate(&self, generation: u64, stream: &LocalStream) -> Result<(), SignalingError> {
        let handlers = PeerHandlers {
            on_local_candidate: Some(relay_local_candidates(self.sink.clone())),
            on_track: None,
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

        for track in stream.tracks() {
            pc.add_track(track.clone()).await?;
        }

        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;

        {
            let mut state = self.lock();
            if state.generation != generation {
                return Ok(());
            }
            state.status = PublisherStatus::Connecting;
        }
        info!(sdp_length = offer.sdp.len(), "Sending SDP offer");
        self.sink.emit(Signal::Offer(OfferMessage::new(offer.sdp)));
        Ok(())
    }

    /// Tears the session of `generation` down into `Error`.
    async fn fail(&self, generation: u64, err: &SignalingError, notify_remote: bool) {
        let released = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.end(PublisherStatus::Error, Some(err.to_string()))
        };
        released.release().await;
        if notify_remote {
            self.sink
                .emit(Signal::Stop(StopMessage::with_reason(err.to_string())));
        }
    }

    /// Applies the subscriber's answer. No-op without a peer connection.
    ///
    /// The answer is marked as applying before the returned future first
    /// suspends, so ICE handled after this call waits for it.
    pub fn handle_answer(
        self: &Arc<Self>,
        answer: AnswerMessage,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send + 'static {
        let pending = {
            let mut state = self.lock();
            match state.pc.clone() {
                Some(pc) => {
                    let (applied_tx, applied_rx) = watch::channel(false);
                    state.remote = RemoteDescription::Applying(applied_rx);
                    Some((state.generation, pc, applied_tx))
                }
                None => None,
            }
        };
        let publisher = self.clone();
        async move {
            let Some((generation, pc, applied_tx)) = pending else {
                debug!("Answer received without a peer connection, ignoring");
                return Ok(());
            };

            if let Err(e) = pc
                .set_remote_description(SessionDescription::answer(answer.sdp))
                .await
            {
                CAMLINK_FAILURES_TOTAL
                    .with_label_values(&["negotiation"])
                    .inc();
                error!(error = %e, "Failed to apply SDP answer");
                publisher.fail(generation, &e, true).await;
                return Err(e);
            }

            let mut state = publisher.lock();
            if state.generation == generation {
                state.remote = RemoteDescription::Applied;
                state.status = PublisherStatus::Active;
                applied_tx.send_replace(true);
                info!("Publisher session active");
            }
            Ok(())
        }
    }

    /// Applies a remote candidate directly. The subscriber only trickles
    /// after applying our offer, so its ICE is expected after the answer;
    /// anything before the answer is dropped, not queued. ICE racing an
    /// answer that is still being applied waits for it.
    pub fn handle_ice(
        &self,
        ice: IceMessage,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send + 'static {
        let route = IceCandidate::from_message(&ice).and_then(|candidate| {
            let state = self.lock();
            let wait = match (&state.pc, &state.remote) {
                (Some(_), RemoteDescription::Applied) => None,
                (Some(_), RemoteDescription::Applying(applied)) => Some(applied.clone()),
                (Some(_), RemoteDescription::Unset) => {
                    debug!("ICE candidate before answer, dropping");
                    return None;
                }
                (None, _) => {
                    debug!("ICE candidate without a peer connection, dropping");
                    return None;
                }
            };
            state.pc.clone().map(|pc| (candidate, pc, wait))
        });
        let end_of_candidates = ice.candidate.is_none();
        async move {
            let Some((candidate, pc, wait)) = route else {
                if end_of_candidates {
                    debug!("Remote end-of-candidates");
                }
                return Ok(());
            };
            if let Some(mut applied) = wait {
                let ready = applied.wait_for(|done| *done).await.is_ok();
                if !ready {
                    debug!("Answer failed or session ended, dropping ICE candidate");
                    return Ok(());
                }
            }
            pc.add_ice_candidate(candidate).await
        }
    }

    /// Stops the camera, closes the connection and tells the remote side.
    /// Idempotent; only a live session produces a stop message.
    pub async fn stop(&self) {
        let released = self.lock().end(PublisherStatus::Idle, None);
        let had_session = !released.is_empty();
        released.release().await;
        if had_session {
            info!("Publisher stopped");
            self.sink.emit(Signal::Stop(StopMessage::default()));
        }
    }

    /// Same teardown as [`stop`](Self::stop) without notifying the remote
    /// side, which already knows.
    pub async fn release(&self) {
        let released = self.lock().end(PublisherStatus::Idle, None);
        released.release().await;
    }

    /// Synchronous [`stop`](Self::stop) for drop paths: camera tracks stop
    /// immediately, the peer connection is closed on the current runtime if
    /// there is one, and the remote side is told.
    pub fn stop_detached(&self) {
        let released = self.lock().end(PublisherStatus::Idle, None);
        if released.is_empty() {
            return;
        }
        let Released { stream, pc } = released;
        if let Some(stream) = stream {
            stream.stop_all();
        }
        if let Some(pc) = pc {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(close_quietly(pc));
                }
                Err(_) => warn!("No runtime available to close peer connection"),
            }
        }
        info!("Publisher stopped on drop");
        self.sink.emit(Signal::Stop(StopMessage::default()));
    }
}
