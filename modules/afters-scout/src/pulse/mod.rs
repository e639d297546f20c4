//! Score propagation to subscribers.

mod broadcaster;
mod subscriber;

pub use broadcaster::{PulseBroadcaster, PulseSubscriber, SubscriptionId};
pub use subscriber::ChannelSubscriber;
