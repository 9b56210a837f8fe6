//! Push-style alert delivery.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{DeliveryError, ExecutionError, GeowatchError};

use super::alert::Alert;
use super::stream::AlertStream;

/// Receives alerts for one push subscription.
///
/// `deliver` runs on the subscription's own forwarder thread, so it may block
/// (for example on a socket write) without affecting other subscribers. It
/// must give up by `deadline`: an attempt that fails or returns late counts
/// as a dropped delivery, and a forwarder stuck in `deliver` cannot notice
/// that its subscription was removed.
pub trait AlertSink: Send + Sync {
    /// Hand one alert to the consumer before `deadline`.
    ///
    /// # Errors
    /// Any error is logged as the subscriber being unreachable for this alert;
    /// the subscription stays registered. Return [`DeliveryError::TimedOut`]
    /// when the deadline passes.
    fn deliver(&self, alert: &Alert, deadline: Instant) -> Result<(), DeliveryError>;
}

impl<F> AlertSink for F
where
    F: Fn(&Alert, Instant) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, alert: &Alert, deadline: Instant) -> Result<(), DeliveryError> {
        self(alert, deadline)
    }
}

/// Settings and shared counters of one forwarder.
pub(crate) struct Forwarder {
    pub(crate) sink: Arc<dyn AlertSink>,
    pub(crate) poll: Duration,
    pub(crate) timeout: Duration,
    pub(crate) dropped: Arc<AtomicU64>,
    pub(crate) live: Arc<AtomicUsize>,
}

/// Decrements the live forwarder count when the thread ends, however it ends.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs until the subscription is removed. The caller has already counted
/// this forwarder in `live`.
pub(crate) fn forward_to_sink(stream: AlertStream, fwd: Forwarder) {
    let _live = LiveGuard(fwd.live);
    let subscription_id = stream.handle().id;
    loop {
        match stream.recv_timeout(fwd.poll) {
            Ok(alert) => {
                let deadline = Instant::now() + fwd.timeout;
                let result = match fwd.sink.deliver(&alert, deadline) {
                    Ok(()) if Instant::now() > deadline => Err(DeliveryError::TimedOut {
                        timeout_ms: u64::try_from(fwd.timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                    other => other,
                };
                if let Err(err) = result {
                    fwd.dropped.fetch_add(1, Ordering::Relaxed);
                    let err = DeliveryError::SubscriberUnreachable {
                        subscription_id,
                        reason: err.to_string(),
                    };
                    warn!(alert = %alert.id, "{err}");
                }
            }
            // Timeout just re-checks whether we are still subscribed.
            Err(GeowatchError::Execution(ExecutionError::Timeout { .. })) => {}
            Err(_) => break,
        }
    }
    debug!(subscription = %subscription_id, "sink forwarder stopped");
}
