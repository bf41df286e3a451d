//! Loopback demo: a phone (test-pattern camera) and a player joined to the
//! same in-memory room, negotiating over the bus with the native backend.

use anyhow::Context;
use camlink::bus::LocalHub;
use camlink::media::{FacingMode, Navigator};
use camlink::media_setup::RtcPeerFactory;
use camlink::publisher::StartOptions;
use camlink::receiver::Receiver;
use camlink::sender::Sender;
use camlink::test_pattern::TestPatternDevices;
use camlink::video::OffscreenVideoFactory;
use camlink::{config, logging, metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::validate_env().context("invalid configuration")?;
    logging::init(&config.rust_log);
    info!(
        room = %config.room,
        turn = config.ice.turn.is_some(),
        rust_log = %config.rust_log,
        "Configuration loaded"
    );

    metrics::register_metrics();
    if let Some(port) = config.metrics_port {
        tokio::spawn(metrics::serve(port));
    }

    let hub = LocalHub::new();
    let factory = Arc::new(RtcPeerFactory::new().context("failed to set up WebRTC")?);

    let (player_bus, player_inbox) = hub.join(config.room.as_str());
    let player_span = logging::adapter_span("receiver", &config.room, player_bus.id().as_ref());
    let receiver = Arc::new(Receiver::with_span(
        Arc::new(player_bus),
        factory.clone(),
        Arc::new(OffscreenVideoFactory::new()),
        config.ice.clone(),
        player_span,
    ));
    let player_task = player_inbox.dispatch(receiver.clone());

    let (phone_bus, phone_inbox) = hub.join(config.room.as_str());
    let phone_span = logging::adapter_span("sender", &config.room, phone_bus.id().as_ref());
    let sender = Arc::new(
        Sender::new(
            Arc::new(phone_bus),
            Navigator::with_media_devices(Arc::new(TestPatternDevices::default())),
            factory,
            config.ice.clone(),
        )
        .with_span(phone_span),
    );
    let phone_task = phone_inbox.dispatch(sender.clone());

    let mut statuses = receiver.status_stream();
    let watcher = tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            info!(status = ?status, "Receiver status");
        }
    });

    let started = sender
        .start(StartOptions::facing(FacingMode::Environment))
        .await;
    info!(status = ?started, room = %config.room, "Sender started, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    sender.stop().await;
    // Give the stop a moment to cross the bus before the player hangs up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    receiver.stop().await;

    phone_task.abort();
    player_task.abort();
    watcher.abort();
    Ok(())
}
