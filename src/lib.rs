pub mod bus;
pub mod config;
pub mod error;
pub mod id_types;
pub mod logging;
pub mod media;
pub mod media_setup;
pub mod metrics;
pub mod peer;
pub mod protocol;
pub mod publisher;
pub mod receiver;
pub mod sender;
pub mod subscriber;
pub mod test_pattern;
pub mod types;
pub mod video;

pub use bus::{ActionBus, ActionHandler, LocalHub};
pub use media_setup::{MediaSetup, RtcPeerFactory};
pub use publisher::{Publisher, PublisherStatus, StartOptions};
pub use receiver::Receiver;
pub use sender::Sender;
pub use subscriber::{Subscriber, SubscriberStatus};

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;
