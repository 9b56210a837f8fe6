//! Alert broadcasting.
//!
//! Subscriptions are scoped to a [`Channel`]: either one entity's alerts or
//! the global broadcast channel. Delivery is either pulled from an
//! [`AlertStream`] or pushed to an [`AlertSink`].

mod alert;
mod channel;
mod hub;
mod sink;
mod stream;

pub use alert::{Alert, AlertId, AlertOrigin, AlertPayload};
pub use channel::{Channel, SubscriptionHandle, SubscriptionId};
pub use hub::{AlertBroadcaster, BroadcasterConfig, FanoutReport};
pub use sink::AlertSink;
pub use stream::AlertStream;
