use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::warn;

use crate::error::{ExecutionError, GeowatchError, GeowatchResult};

use super::alert::Alert;
use super::channel::SubscriptionHandle;
use super::hub::{Envelope, HubInner};

/// A pull subscription to alerts.
///
/// Dropping this stream unsubscribes it.
#[derive(Debug)]
pub struct AlertStream {
    handle: SubscriptionHandle,
    rx: Receiver<Envelope>,
    active: Arc<AtomicBool>,
    hub: Weak<HubInner>,
    dropped: Arc<AtomicU64>,
}

fn disconnected() -> GeowatchError {
    GeowatchError::Execution(ExecutionError::Disconnected {
        path: "alert_stream".to_string(),
    })
}

impl AlertStream {
    pub(crate) fn new(
        handle: SubscriptionHandle,
        rx: Receiver<Envelope>,
        active: Arc<AtomicBool>,
        hub: Weak<HubInner>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            handle,
            rx,
            active,
            hub,
            dropped,
        }
    }

    /// The handle identifying this subscription.
    #[must_use]
    pub const fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// False once the subscription has been removed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes the subscription. Idempotent.
    ///
    /// Alerts still queued are not yielded afterwards.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.handle);
        }
    }

    /// Receive the next alert (blocking).
    ///
    /// # Errors
    /// `Disconnected` once unsubscribed or when the hub is gone.
    pub fn recv(&self) -> GeowatchResult<Arc<Alert>> {
        loop {
            if !self.is_active() {
                return Err(disconnected());
            }
            let envelope = self.rx.recv().map_err(|_| disconnected())?;
            if let Some(alert) = self.accept(envelope) {
                return Ok(alert);
            }
        }
    }

    /// Receive the next alert with a timeout.
    ///
    /// # Errors
    /// `Timeout` if nothing deliverable arrived in time, `Disconnected` as for
    /// [`AlertStream::recv`].
    pub fn recv_timeout(&self, timeout: Duration) -> GeowatchResult<Arc<Alert>> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_active() {
                return Err(disconnected());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(envelope) => {
                    if let Some(alert) = self.accept(envelope) {
                        return Ok(alert);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(GeowatchError::Execution(ExecutionError::Timeout {
                        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(disconnected()),
            }
        }
    }

    /// Next queued alert without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Arc<Alert>> {
        loop {
            if !self.is_active() {
                return None;
            }
            let envelope = self.rx.try_recv().ok()?;
            if let Some(alert) = self.accept(envelope) {
                return Some(alert);
            }
        }
    }

    fn accept(&self, envelope: Envelope) -> Option<Arc<Alert>> {
        if !self.is_active() {
            return None;
        }
        if Instant::now() > envelope.deadline {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                subscription = %self.handle.id,
                alert = %envelope.alert.id,
                "subscriber unreachable: delivery timed out"
            );
            return None;
        }
        Some(envelope.alert)
    }
}

impl Drop for AlertStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
