//! The room event bus seen from one member.
//!
//! [`ActionBus`] sends, [`ActionHandler`] receives. [`LocalHub`] is an
//! in-memory relay with the same delivery rules as the real room bus:
//! best-effort broadcast to the *other* current members, `*-request`
//! actions renamed to their relayed form, nothing replayed for late joiners.

use crate::id_types::{MemberId, RoomId};
use crate::metrics::{CAMLINK_MESSAGES_DISCARDED_TOTAL, CAMLINK_SIGNALS_SENT_TOTAL};
use crate::protocol::{Action, Signal};
use crate::types::{ActionFuture, SignalSink};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outbound half of the bus.
pub trait ActionBus: Send + Sync {
    fn send_action(&self, action: &str, payload: Value);
}

/// Inbound half of the bus.
///
/// `on_action` runs synchronously in delivery order and returns the work
/// that has to wait on the native layer. Anything that must observe
/// arrival order (session resets, queueing) happens before it returns.
pub trait ActionHandler: Send + Sync {
    fn on_action(&self, action: &str, payload: &Value) -> ActionFuture;
}

pub(crate) fn done() -> ActionFuture {
    Box::pin(std::future::ready(()))
}

/// Drops an inbound message, counting it under `reason`.
pub(crate) fn discard(action: &str, reason: &'static str) -> ActionFuture {
    CAMLINK_MESSAGES_DISCARDED_TOTAL
        .with_label_values(&[reason])
        .inc();
    debug!(action, reason, "Discarding inbound message");
    done()
}

/// Sends each core signal under its request action.
pub struct BusSink {
    bus: Arc<dyn ActionBus>,
}

impl BusSink {
    pub fn new(bus: Arc<dyn ActionBus>) -> Self {
        Self { bus }
    }
}

impl SignalSink for BusSink {
    fn emit(&self, signal: Signal) {
        let action = signal.request_action();
        CAMLINK_SIGNALS_SENT_TOTAL
            .with_label_values(&[action.as_str()])
            .inc();
        self.bus.send_action(action.as_str(), signal.to_payload());
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: MemberId,
    pub action: String,
    pub payload: Value,
}

const ROOM_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct LocalHub {
    rooms: Arc<DashMap<RoomId, broadcast::Sender<Envelope>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins `room` under a fresh member id.
    pub fn join(&self, room: impl Into<RoomId>) -> (HubMember, HubInbox) {
        self.join_as(room, MemberId::random())
    }

    pub fn join_as(&self, room: impl Into<RoomId>, member: MemberId) -> (HubMember, HubInbox) {
        let room = room.into();
        let tx = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone();
        let rx = tx.subscribe();
        debug!(room = %room, member = %member, "Joined room");
        (
            HubMember {
                room,
                member: member.clone(),
                tx,
            },
            HubInbox { member, rx },
        )
    }

    /// Members currently listening in `room`.
    pub fn member_count(&self, room: &RoomId) -> usize {
        self.rooms
            .get(room)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Forgets rooms nobody listens to any more. Returns how many went.
    pub fn prune(&self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, tx| tx.receiver_count() > 0);
        before - self.rooms.len()
    }
}

/// Sending side of one room membership.
#[derive(Clone)]
pub struct HubMember {
    room: RoomId,
    member: MemberId,
    tx: broadcast::Sender<Envelope>,
}

impl HubMember {
    pub fn id(&self) -> &MemberId {
        &self.member
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }
}

impl ActionBus for HubMember {
    fn send_action(&self, action: &str, payload: Value) {
        let relayed = match action.parse::<Action>() {
            Ok(a) => a.relayed().as_str().to_string(),
            Err(_) => action.to_string(),
        };
        let envelope = Envelope {
            from: self.member.clone(),
            action: relayed,
            payload,
        };
        if self.tx.send(envelope).is_err() {
            debug!(room = %self.room, action, "Nobody in room, action dropped");
        }
    }
}

/// Receiving side of one room membership. Skips the member's own messages.
pub struct HubInbox {
    member: MemberId,
    rx: broadcast::Receiver<Envelope>,
}

impl HubInbox {
    /// Next message from another member; `None` once the room is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.from == self.member => continue,
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(member = %self.member, skipped, "Inbox lagged, messages lost");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Feeds every inbound message to `handler`. Each `on_action` call runs
    /// on the loop in delivery order; the futures it returns run
    /// concurrently.
    pub fn dispatch(mut self, handler: Arc<dyn ActionHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                let work = handler.on_action(&envelope.action, &envelope.payload);
                tokio::spawn(work);
            }
            debug!(member = %self.member, "Inbox closed");
        })
    }
}
