use crate::protocol::Signal;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a core sends the signaling messages it produces.
pub trait SignalSink: Send + Sync {
    fn emit(&self, signal: Signal);
}

/// Channel-backed sink, handy for hosts that pump signals themselves.
impl SignalSink for mpsc::UnboundedSender<Signal> {
    fn emit(&self, signal: Signal) {
        if self.send(signal).is_err() {
            tracing::debug!("Signal channel closed, dropping outbound signal");
        }
    }
}

/// Sink shared between a core and the native callbacks it registers.
pub type SharedSignalSink = Arc<dyn SignalSink>;

/// Observer invoked after a core changes observable state.
pub type StateCallback<S> = Arc<dyn Fn(S) + Send + Sync>;

/// Boxed `Send` future returned by the action handlers.
pub type ActionFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
