//! Phone-side adapter between the [`Publisher`] and the room bus.

use crate::bus::{discard, done, ActionBus, ActionHandler, BusSink};
use crate::media::{LocalStream, Navigator};
use crate::peer::{IceConfig, PeerConnectionFactory};
use crate::protocol::{parse_answer, parse_ice, parse_stop, Action};
use crate::publisher::{Publisher, PublisherStatus, StartOptions};
use crate::types::ActionFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn, Instrument, Span};

pub struct Sender {
    bus: Arc<dyn ActionBus>,
    navigator: Navigator,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: IceConfig,
    span: Span,
    publisher: Mutex<Option<Arc<Publisher>>>,
}

impl Sender {
    pub fn new(
        bus: Arc<dyn ActionBus>,
        navigator: Navigator,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: IceConfig,
    ) -> Self {
        Self {
            bus,
            navigator,
            factory,
            ice,
            span: Span::none(),
            publisher: Mutex::new(None),
        }
    }

    /// Span every outbound and inbound operation is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Publisher>>> {
        self.publisher.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self) -> Option<Arc<Publisher>> {
        self.lock().clone()
    }

    pub fn status(&self) -> PublisherStatus {
        self.current()
            .map_or(PublisherStatus::Idle, |p| p.status())
    }

    pub fn stream(&self) -> Option<LocalStream> {
        self.current().and_then(|p| p.stream())
    }

    pub fn last_error(&self) -> Option<String> {
        self.current().and_then(|p| p.last_error())
    }

    /// Starts publishing the camera. Failures are logged and left in
    /// [`status`](Self::status) / [`last_error`](Self::last_error).
    pub async fn start(&self, options: StartOptions) -> PublisherStatus {
        let publisher = {
            let mut slot = self.lock();
            slot.get_or_insert_with(|| {
                Arc::new(Publisher::new(
                    self.navigator.clone(),
                    self.factory.clone(),
                    self.ice.clone(),
                    Arc::new(BusSink::new(self.bus.clone())),
                ))
            })
            .clone()
        };
        let result = publisher
            .start(options)
            .instrument(self.span.clone())
            .await;
        if let Err(e) = result {
            let _enter = self.span.enter();
            error!(error = %e, "Failed to start camera publishing");
        }
        publisher.status()
    }

    pub async fn stop(&self) {
        if let Some(publisher) = self.current() {
            publisher.stop().instrument(self.span.clone()).await;
        }
    }

    fn relay_answer(&self, payload: &Value) -> ActionFuture {
        let Some(answer) = parse_answer(payload) else {
            return discard("answer", "malformed");
        };
        let Some(publisher) = self.current() else {
            return discard("answer", "no_session");
        };
        let apply = publisher.handle_answer(answer);
        Box::pin(
            async move {
                if let Err(e) = apply.await {
                    error!(error = %e, "Failed to apply answer");
                }
            }
            .instrument(self.span.clone()),
        )
    }

    fn relay_ice(&self, payload: &Value) -> ActionFuture {
        let Some(ice) = parse_ice(payload) else {
            return discard("ice", "malformed");
        };
        let Some(publisher) = self.current() else {
            return discard("ice", "no_session");
        };
        let apply = publisher.handle_ice(ice);
        Box::pin(
            async move {
                if let Err(e) = apply.await {
                    warn!(error = %e, "Failed to apply remote ICE candidate");
                }
            }
            .instrument(self.span.clone()),
        )
    }

    /// The player hung up: release without echoing a stop back, and forget
    /// the publisher so the next `start()` begins clean.
    fn remote_stop(&self, payload: &Value) -> ActionFuture {
        let Some(stop) = parse_stop(payload) else {
            return discard("stop", "malformed");
        };
        let Some(publisher) = self.lock().take() else {
            return discard("stop", "no_session");
        };
        Box::pin(
            async move {
                info!(reason = ?stop.reason, "Remote side stopped, releasing camera");
                publisher.release().await;
            }
            .instrument(self.span.clone()),
        )
    }
}

impl ActionHandler for Sender {
    fn on_action(&self, action: &str, payload: &Value) -> ActionFuture {
        let _enter = self.span.enter();
        match action.parse::<Action>() {
            Ok(Action::Answer) => self.relay_answer(payload),
            Ok(Action::Ice) => self.relay_ice(payload),
            Ok(Action::Stop) => self.remote_stop(payload),
            Ok(other) => {
                debug!(action = %other, "Action not handled by sender");
                done()
            }
            Err(_) => discard(action, "unknown_action"),
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let publisher = self
            .publisher
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(publisher) = publisher {
            let _enter = self.span.enter();
            publisher.stop_detached();
        }
    }
}
