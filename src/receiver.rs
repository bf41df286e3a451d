//! Player-side adapter between the room bus and a [`Subscriber`].
//!
//! Every inbound offer replaces the subscriber. ICE that arrives while no
//! subscriber exists yet is held in the adapter's own `pending_ice` queue
//! and handed to the next subscriber right after it receives its offer.

use crate::bus::{discard, done, ActionBus, ActionHandler, BusSink};
use crate::metrics::{
    CAMLINK_FAILURES_TOTAL, CAMLINK_ICE_FLUSHED_TOTAL, CAMLINK_ICE_QUEUED_TOTAL,
};
use crate::peer::{IceConfig, PeerConnectionFactory};
use crate::protocol::{
    parse_ice, parse_offer, parse_stop, Action, IceMessage, OfferMessage, Signal, StopMessage,
};
use crate::subscriber::{Subscriber, SubscriberStatus};
use crate::types::{ActionFuture, SharedSignalSink, StateCallback};
use crate::video::{VideoElement, VideoElementFactory};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn, Instrument, Span};

#[derive(Default)]
struct ReceiverState {
    subscriber: Option<Arc<Subscriber>>,
    pending_ice: VecDeque<IceMessage>,
    last_error: Option<String>,
}

struct Inner {
    factory: Arc<dyn PeerConnectionFactory>,
    videos: Arc<dyn VideoElementFactory>,
    ice: IceConfig,
    sink: SharedSignalSink,
    span: Span,
    /// Bumped by every offer and stop. Status updates from subscribers of
    /// an older epoch are not mirrored.
    epoch: AtomicU64,
    status_tx: watch::Sender<SubscriberStatus>,
    state: Mutex<ReceiverState>,
}

pub struct Receiver {
    inner: Arc<Inner>,
}

impl Receiver {
    pub fn new(
        bus: Arc<dyn ActionBus>,
        factory: Arc<dyn PeerConnectionFactory>,
        videos: Arc<dyn VideoElementFactory>,
        ice: IceConfig,
    ) -> Self {
        Self::with_span(bus, factory, videos, ice, Span::none())
    }

    pub fn with_span(
        bus: Arc<dyn ActionBus>,
        factory: Arc<dyn PeerConnectionFactory>,
        videos: Arc<dyn VideoElementFactory>,
        ice: IceConfig,
        span: Span,
    ) -> Self {
        let (status_tx, _) = watch::channel(SubscriberStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                factory,
                videos,
                ice,
                sink: Arc::new(BusSink::new(bus)),
                span,
                epoch: AtomicU64::new(0),
                status_tx,
                state: Mutex::new(ReceiverState::default()),
            }),
        }
    }

    pub fn status(&self) -> SubscriberStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SubscriberStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Current status followed by every change.
    pub fn status_stream(&self) -> WatchStream<SubscriberStatus> {
        WatchStream::new(self.inner.status_tx.subscribe())
    }

    pub fn video_element(&self) -> Option<Arc<dyn VideoElement>> {
        self.inner
            .lock()
            .subscriber
            .as_ref()
            .and_then(|s| s.video_element())
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// ICE buffered while no subscriber exists.
    pub fn pending_ice_len(&self) -> usize {
        self.inner.lock().pending_ice.len()
    }

    /// Tears down locally and asks the phone to release its camera.
    pub async fn stop(&self) {
        let previous = self.inner.reset();
        let inner = self.inner.clone();
        async move {
            inner.teardown(previous).await;
            info!("Receiver stopped, asking publisher to release camera");
            inner.sink.emit(Signal::Stop(StopMessage::default()));
        }
        .instrument(self.inner.span.clone())
        .await
    }

    fn on_offer(&self, payload: &Value) -> ActionFuture {
        let Some(offer) = parse_offer(payload) else {
            return discard("offer", "malformed");
        };
        let (epoch, previous) = {
            let mut state = self.inner.lock();
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            (epoch, state.subscriber.take())
        };
        let inner = self.inner.clone();
        let span = inner.span.clone();
        Box::pin(inner.accept_offer(epoch, previous, offer).instrument(span))
    }

    fn on_ice(&self, payload: &Value) -> ActionFuture {
        let Some(ice) = parse_ice(payload) else {
            return discard("ice", "malformed");
        };
        let subscriber = {
            let mut state = self.inner.lock();
            match &state.subscriber {
                Some(subscriber) => subscriber.clone(),
                None => {
                    if ice.candidate.is_none() {
                        debug!("End-of-candidates before offer, ignoring");
                        return done();
                    }
                    state.pending_ice.push_back(ice);
                    CAMLINK_ICE_QUEUED_TOTAL
                        .with_label_values(&["adapter"])
                        .inc();
                    debug!(
                        queued = state.pending_ice.len(),
                        "ICE before offer, buffering"
                    );
                    return done();
                }
            }
        };
        let apply = subscriber.handle_ice(ice);
        Box::pin(
            async move {
                if let Err(e) = apply.await {
                    warn!(error = %e, "Failed to apply remote ICE candidate");
                }
            }
            .instrument(self.inner.span.clone()),
        )
    }

    fn on_stop(&self, payload: &Value) -> ActionFuture {
        let Some(stop) = parse_stop(payload) else {
            return discard("stop", "malformed");
        };
        let previous = self.inner.reset();
        let inner = self.inner.clone();
        let span = inner.span.clone();
        Box::pin(
            async move {
                info!(reason = ?stop.reason, "Publisher stopped");
                inner.teardown(previous).await;
            }
            .instrument(span),
        )
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ReceiverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn mirror_status(self: &Arc<Self>, epoch: u64) -> StateCallback<SubscriberStatus> {
        let weak = Arc::downgrade(self);
        Arc::new(move |status| {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(epoch) {
                    inner.status_tx.send_replace(status);
                }
            }
        })
    }

    /// Drops the adapter queue and detaches the subscriber.
    fn reset(&self) -> Option<Arc<Subscriber>> {
        let mut state = self.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        state.pending_ice.clear();
        state.subscriber.take()
    }

    async fn teardown(&self, previous: Option<Arc<Subscriber>>) {
        if let Some(subscriber) = previous {
            subscriber.stop().await;
        }
        self.status_tx.send_replace(SubscriberStatus::Idle);
    }

    async fn accept_offer(
        self: Arc<Self>,
        epoch: u64,
        previous: Option<Arc<Subscriber>>,
        offer: OfferMessage,
    ) {
        if let Some(previous) = previous {
            info!("New offer, replacing current subscriber");
            previous.stop().await;
        }

        let (subscriber, negotiation, drained) = {
            let mut state = self.lock();
            if !self.is_current(epoch) {
                debug!("Offer superseded before its subscriber was installed");
                return;
            }
            let subscriber = Arc::new(Subscriber::new(
                self.factory.clone(),
                self.videos.clone(),
                self.ice.clone(),
                self.sink.clone(),
                Some(self.mirror_status(epoch)),
            ));
            let negotiation = subscriber.handle_offer(offer);
            let drained: Vec<_> = state
                .pending_ice
                .drain(..)
                .map(|ice| subscriber.handle_ice(ice))
                .collect();
            state.subscriber = Some(subscriber.clone());
            state.last_error = None;
            (subscriber, negotiation, drained)
        };
        if !drained.is_empty() {
            CAMLINK_ICE_FLUSHED_TOTAL
                .with_label_values(&["adapter"])
                .inc_by(drained.len() as u64);
            debug!(count = drained.len(), "Handed buffered ICE to subscriber");
        }

        if let Err(e) = negotiation.await {
            CAMLINK_FAILURES_TOTAL
                .with_label_values(&["negotiation"])
                .inc();
            error!(error = %e, "Failed to answer offer");
            let current = {
                let mut state = self.lock();
                let current = state
                    .subscriber
                    .as_ref()
                    .map_or(false, |s| Arc::ptr_eq(s, &subscriber));
                if current {
                    state.subscriber = None;
                    state.last_error = Some(e.to_string());
                }
                current
            };
            if current {
                self.epoch.fetch_add(1, Ordering::SeqCst);
                self.teardown(Some(subscriber)).await;
                self.sink
                    .emit(Signal::Stop(StopMessage::with_reason(e.to_string())));
            }
            return;
        }

        for apply in drained {
            if let Err(e) = apply.await {
                warn!(error = %e, "Failed to apply buffered ICE candidate");
            }
        }
    }
}

impl ActionHandler for Receiver {
    fn on_action(&self, action: &str, payload: &Value) -> ActionFuture {
        let _enter = self.inner.span.enter();
        match action.parse::<Action>() {
            Ok(Action::Offer) => self.on_offer(payload),
            Ok(Action::Ice) => self.on_ice(payload),
            Ok(Action::Stop) => self.on_stop(payload),
            Ok(other) => {
                debug!(action = %other, "Action not handled by receiver");
                done()
            }
            Err(_) => discard(action, "unknown_action"),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let Some(subscriber) = self.inner.reset() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { subscriber.stop().await });
            }
            Err(_) => warn!("No runtime available to stop subscriber"),
        }
    }
}
