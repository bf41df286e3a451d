use super::*;
use crate::media::Navigator;
use crate::peer::{IceConfig, RemoteStream};
use crate::test_support::{wait_until, MockDevices, MockPeerFactory};
use crate::video::OffscreenVideoFactory;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct Room {
    sender: Arc<Sender>,
    receiver: Arc<Receiver>,
    phone_peers: Arc<MockPeerFactory>,
    player_peers: Arc<MockPeerFactory>,
    devices: Arc<MockDevices>,
    hub: LocalHub,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Room {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn karaoke_room() -> Room {
    let hub = LocalHub::new();
    let phone_peers = Arc::new(MockPeerFactory::new());
    let player_peers = Arc::new(MockPeerFactory::new());
    let devices = Arc::new(MockDevices::exclusive());

    let (player_bus, player_inbox) = hub.join("karaoke");
    let receiver = Arc::new(Receiver::new(
        Arc::new(player_bus),
        player_peers.clone(),
        Arc::new(OffscreenVideoFactory::new()),
        IceConfig::host_only(),
    ));
    let (phone_bus, phone_inbox) = hub.join("karaoke");
    let sender = Arc::new(Sender::new(
        Arc::new(phone_bus),
        Navigator::with_media_devices(devices.clone()),
        phone_peers.clone(),
        IceConfig::host_only(),
    ));

    let tasks = vec![
        player_inbox.dispatch(receiver.clone()),
        phone_inbox.dispatch(sender.clone()),
    ];
    Room {
        sender,
        receiver,
        phone_peers,
        player_peers,
        devices,
        hub,
        tasks,
    }
}

#[tokio::test]
async fn test_offer_answer_round_trip_over_the_hub() {
    let room = karaoke_room();

    assert_eq!(
        room.sender.start(StartOptions::default()).await,
        PublisherStatus::Connecting
    );

    assert!(wait_until(|| room.sender.status() == PublisherStatus::Active).await);
    assert_eq!(room.receiver.status(), SubscriberStatus::Connecting);

    let player_pc = room.player_peers.connection(0);
    assert_eq!(
        player_pc.remote_description().map(|d| d.sdp),
        Some("mock-offer-0".to_string())
    );
    assert_eq!(
        room.phone_peers.connection(0).remote_description().map(|d| d.sdp),
        Some("mock-answer-0".to_string())
    );

    player_pc.emit_track("camera", &RemoteStream::new("phone"));
    assert_eq!(room.receiver.status(), SubscriberStatus::Active);
}

#[tokio::test]
async fn test_candidates_cross_the_hub_in_both_directions() {
    let room = karaoke_room();
    room.sender.start(StartOptions::default()).await;
    assert!(wait_until(|| room.sender.status() == PublisherStatus::Active).await);

    let phone_pc = room.phone_peers.connection(0);
    let player_pc = room.player_peers.connection(0);

    phone_pc.gather_candidate(Some("phone-host"));
    phone_pc.gather_candidate(None);
    player_pc.gather_candidate(Some("player-host"));
    player_pc.gather_candidate(None);

    assert!(wait_until(|| player_pc.applied_candidates() == vec!["phone-host"]).await);
    assert!(wait_until(|| phone_pc.applied_candidates() == vec!["player-host"]).await);
}

#[tokio::test]
async fn test_player_stop_releases_phone_camera() {
    let room = karaoke_room();
    room.sender.start(StartOptions::default()).await;
    assert!(wait_until(|| room.sender.status() == PublisherStatus::Active).await);
    let stream = room.sender.stream().unwrap();

    room.receiver.stop().await;

    assert!(wait_until(|| stream.tracks().iter().all(|t| t.is_stopped())).await);
    assert!(wait_until(|| room.phone_peers.connection(0).is_closed()).await);
    assert!(room.player_peers.connection(0).is_closed());
    assert_eq!(room.receiver.status(), SubscriberStatus::Idle);

    // The exclusive camera is free again for the next song.
    assert_eq!(
        room.sender.start(StartOptions::default()).await,
        PublisherStatus::Connecting
    );
    assert_eq!(room.devices.attempts().len(), 2);
}

#[tokio::test]
async fn test_phone_stop_tears_down_player() {
    let room = karaoke_room();
    room.sender.start(StartOptions::default()).await;
    assert!(wait_until(|| room.receiver.status() == SubscriberStatus::Connecting).await);

    room.sender.stop().await;

    assert!(wait_until(|| room.player_peers.connection(0).is_closed()).await);
    assert!(wait_until(|| room.receiver.status() == SubscriberStatus::Idle).await);
    assert!(room.sender.stream().is_none());
}

#[tokio::test]
async fn test_ice_ahead_of_offer_is_buffered_by_receiver() {
    let room = karaoke_room();
    let (stranger, _inbox) = room.hub.join("karaoke");

    stranger.send_action("ice-request", json!({"candidate": "early-1", "sdpMLineIndex": 0}));
    stranger.send_action("ice-request", json!({"candidate": null}));
    stranger.send_action("ice-request", json!({"candidate": "early-2", "sdpMLineIndex": 0}));
    assert!(wait_until(|| room.receiver.pending_ice_len() == 2).await);

    stranger.send_action("offer-request", json!({"sdp": "X", "type": "offer"}));

    assert!(
        wait_until(|| room
            .player_peers
            .created_count()
            == 1
            && room.player_peers.connection(0).applied_candidates()
                == vec!["early-1", "early-2"])
        .await
    );
    assert_eq!(room.receiver.pending_ice_len(), 0);
}

#[tokio::test]
async fn test_restart_replaces_the_player_session() {
    let room = karaoke_room();
    room.sender.start(StartOptions::default()).await;
    assert!(wait_until(|| room.sender.status() == PublisherStatus::Active).await);

    room.sender.start(StartOptions::default()).await;

    assert!(wait_until(|| room.player_peers.created_count() == 2).await);
    assert!(wait_until(|| room.player_peers.connection(0).is_closed()).await);
    assert!(room.phone_peers.connection(0).is_closed());
    assert!(wait_until(|| room.sender.status() == PublisherStatus::Active).await);
}
