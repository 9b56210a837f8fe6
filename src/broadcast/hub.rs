//! Alert fan-out hub.
//!
//! This module owns subscriber registrations and fans alerts out to
//! per-subscription mailboxes. Publishing never blocks: each delivery is a
//! `try_send` into a bounded channel, and a full mailbox drops that alert for
//! that subscriber only. Alerts that sit in a mailbox longer than the delivery
//! timeout are discarded by the consumer instead of being delivered late, and
//! a push delivery attempt is bounded by the same timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::{EntityId, SubscriberId};
use crate::error::{GeowatchError, GeowatchResult, ValidationError};
use crate::sync::KeyedSlots;

use super::alert::{Alert, AlertOrigin};
use super::channel::{Channel, SubscriptionHandle, SubscriptionId};
use super::sink::{forward_to_sink, AlertSink, Forwarder};
use super::stream::AlertStream;

/// Broadcaster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Per-subscription mailbox capacity.
    pub stream_capacity: usize,
    /// How long a queued alert stays deliverable, and how long one sink
    /// delivery attempt may take, in milliseconds.
    pub delivery_timeout_ms: u64,
    /// How often sink forwarders re-check for unsubscription, in milliseconds.
    pub sink_poll_interval_ms: u64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 256,
            delivery_timeout_ms: 2_000,
            sink_poll_interval_ms: 100,
        }
    }
}

impl BroadcasterConfig {
    /// Delivery timeout as a `Duration`.
    #[must_use]
    pub const fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Sink poll interval as a `Duration`.
    #[must_use]
    pub const fn sink_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sink_poll_interval_ms)
    }

    /// Rejects zero capacities and timeouts.
    ///
    /// # Errors
    /// `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let zero = [
            ("stream_capacity", self.stream_capacity == 0),
            ("delivery_timeout_ms", self.delivery_timeout_ms == 0),
            ("sink_poll_interval_ms", self.sink_poll_interval_ms == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ValidationError::InvalidConfig {
                reason: format!("broadcaster.{field} must be greater than zero"),
            }),
            None => Ok(()),
        }
    }
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutReport {
    /// Subscriptions the alert was handed to.
    pub queued: usize,
    /// Subscriptions that were unreachable (mailbox full or gone).
    pub dropped: usize,
    /// Subscriptions skipped because they belong to the originator.
    pub excluded: usize,
}

impl FanoutReport {
    /// Adds another report's counts to this one.
    pub fn merge(&mut self, other: Self) {
        self.queued += other.queued;
        self.dropped += other.dropped;
        self.excluded += other.excluded;
    }
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) alert: Arc<Alert>,
    pub(crate) deadline: Instant,
}

#[derive(Debug)]
pub(crate) struct SubscriberEntry {
    subscription_id: SubscriptionId,
    subscriber_id: SubscriberId,
    tx: Sender<Envelope>,
    active: Arc<AtomicBool>,
}

#[derive(Debug)]
pub(crate) struct HubInner {
    cfg: BroadcasterConfig,
    channels: KeyedSlots<Channel, Arc<SubscriberEntry>>,
    dropped: Arc<AtomicU64>,
    forwarders: Arc<AtomicUsize>,
}

impl HubInner {
    pub(crate) fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.channels.update_existing(&handle.channel, |subs| {
            let before = subs.len();
            subs.retain(|entry| {
                if entry.subscription_id == handle.id {
                    entry.active.store(false, Ordering::Release);
                    false
                } else {
                    true
                }
            });
            subs.len() != before
        });
        if removed {
            debug!(subscription = %handle.id, channel = %handle.channel, "unsubscribed");
        }
        removed
    }
}

/// Publish/subscribe hub with per-entity and broadcast channels.
#[derive(Debug)]
pub struct AlertBroadcaster {
    inner: Arc<HubInner>,
    sink_seq: AtomicU64,
}

impl Default for AlertBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl AlertBroadcaster {
    /// Creates an empty hub.
    #[must_use]
    pub fn new(cfg: BroadcasterConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                cfg,
                channels: KeyedSlots::default(),
                dropped: Arc::new(AtomicU64::new(0)),
                forwarders: Arc::new(AtomicUsize::new(0)),
            }),
            sink_seq: AtomicU64::new(0),
        }
    }

    /// The hub's configuration.
    #[must_use]
    pub fn config(&self) -> &BroadcasterConfig {
        &self.inner.cfg
    }

    /// Registers a pull subscription.
    ///
    /// Dropping the returned stream unsubscribes it.
    pub fn subscribe(&self, subscriber_id: SubscriberId, channel: Channel) -> AlertStream {
        let (tx, rx) = bounded::<Envelope>(self.inner.cfg.stream_capacity.max(1));
        let active = Arc::new(AtomicBool::new(true));
        let handle = SubscriptionHandle {
            id: SubscriptionId::new(),
            subscriber_id,
            channel,
        };

        let entry = Arc::new(SubscriberEntry {
            subscription_id: handle.id,
            subscriber_id,
            tx,
            active: Arc::clone(&active),
        });
        self.inner.channels.update(&channel, |subs| subs.push(entry));
        debug!(subscription = %handle.id, subscriber = %subscriber_id, channel = %channel, "subscribed");

        AlertStream::new(
            handle,
            rx,
            active,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.dropped),
        )
    }

    /// Registers a push subscription delivered to `sink` on a dedicated
    /// forwarder thread.
    ///
    /// A sink that blocks only delays its own alerts. Each attempt is given
    /// the delivery timeout as its deadline, and alerts that wait in the
    /// mailbox past it are dropped. The forwarder exits within one poll
    /// interval of unsubscribing, or once the attempt in progress returns.
    ///
    /// # Errors
    /// `Internal` if the forwarder thread cannot be spawned; the subscription
    /// is removed again in that case.
    pub fn subscribe_with_sink(
        &self,
        subscriber_id: SubscriberId,
        channel: Channel,
        sink: Arc<dyn AlertSink>,
    ) -> GeowatchResult<SubscriptionHandle> {
        let stream = self.subscribe(subscriber_id, channel);
        let handle = stream.handle();
        let fwd = Forwarder {
            sink,
            poll: self.inner.cfg.sink_poll_interval(),
            timeout: self.inner.cfg.delivery_timeout(),
            dropped: Arc::clone(&self.inner.dropped),
            live: Arc::clone(&self.inner.forwarders),
        };
        let seq = self.sink_seq.fetch_add(1, Ordering::Relaxed);

        self.inner.forwarders.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("geowatch-sink-{seq}"))
            .spawn(move || forward_to_sink(stream, fwd));
        if let Err(e) = spawned {
            // The closure, and with it the stream, was dropped: already unsubscribed.
            self.inner.forwarders.fetch_sub(1, Ordering::AcqRel);
            return Err(GeowatchError::internal(format!("failed to spawn sink forwarder: {e}")));
        }
        Ok(handle)
    }

    /// Removes a subscription. Idempotent; unknown handles are ignored.
    ///
    /// Returns true if the subscription was present.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.remove(handle)
    }

    /// Delivers `alert` to every subscriber of the entity's channel.
    pub fn publish_to_entity(&self, entity_id: EntityId, alert: Alert) -> FanoutReport {
        self.fan_out(Channel::Entity(entity_id), Arc::new(alert), None)
    }

    /// Delivers `alert` to every broadcast subscriber except the originator.
    ///
    /// The alert's `origin` is set to `origin`.
    pub fn publish_broadcast(&self, origin: AlertOrigin, mut alert: Alert) -> FanoutReport {
        alert.origin = origin;
        self.fan_out(Channel::Broadcast, Arc::new(alert), origin.subscriber())
    }

    /// Current number of subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.inner.channels.snapshot(channel).len()
    }

    /// Current number of subscriptions across all channels.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.channels.total_len()
    }

    /// Deliveries abandoned so far (full mailbox, gone, expired, or a failed
    /// or late sink attempt).
    #[must_use]
    pub fn dropped_deliveries(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Sink forwarder threads still running.
    #[must_use]
    pub fn sink_forwarder_count(&self) -> usize {
        self.inner.forwarders.load(Ordering::Acquire)
    }

    fn fan_out(&self, channel: Channel, alert: Arc<Alert>, exclude: Option<SubscriberId>) -> FanoutReport {
        // Iterate a snapshot: concurrent (un)subscribes publish a new list and
        // never disturb this pass.
        let subscribers = self.inner.channels.snapshot(&channel);
        let deadline = Instant::now() + self.inner.cfg.delivery_timeout();
        let mut report = FanoutReport::default();

        for entry in subscribers.iter() {
            if exclude == Some(entry.subscriber_id) {
                report.excluded += 1;
                continue;
            }
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            let envelope = Envelope {
                alert: Arc::clone(&alert),
                deadline,
            };
            match entry.tx.try_send(envelope) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = %entry.subscription_id,
                        alert = %alert.id,
                        "subscriber unreachable: mailbox full"
                    );
                }
                Err(TrySendError::Disconnected(_)) => {
                    report.dropped += 1;
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscription = %entry.subscription_id, "subscriber gone");
                }
            }
        }

        debug!(
            channel = %channel,
            alert = %alert.id,
            queued = report.queued,
            dropped = report.dropped,
            excluded = report.excluded,
            "alert published"
        );
        report
    }
}
