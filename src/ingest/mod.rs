//! Location ingestion pipeline.
//!
//! Every accepted update moves through
//! `Received -> Persisted -> Evaluated -> (Alerted | NoAlert)`.
//! Persistence is best-effort: a history store that stays down is logged and
//! skipped, and evaluation proceeds against the current fence set.

pub mod runtime;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broadcast::{Alert, AlertBroadcaster, AlertOrigin, FanoutReport};
use crate::detector::{self, Violation};
use crate::entity::{EntityId, SubscriberId};
use crate::error::{ExecutionError, GeowatchResult, ValidationError};
use crate::geo::GeoPoint;
use crate::history::HistoryStore;
use crate::location::LocationUpdate;
use crate::registry::FenceRegistry;

pub use runtime::{IngestHandle, IngestRuntime, RuntimeConfig};

/// Maximum length of a danger alert message, in bytes.
pub const MAX_DANGER_MESSAGE_LEN: usize = 1024;

/// Where fence violation alerts are published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRoute {
    /// The entity's own channel.
    #[default]
    Entity,
    /// The broadcast channel, with a system origin.
    Broadcast,
    /// Both channels. A subscriber on both receives the alert twice.
    Both,
}

/// Ingestion configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Channel(s) violation alerts go to.
    pub alert_route: AlertRoute,
    /// Total history append attempts per update, including the first.
    pub history_retry_attempts: u32,
    /// Base pause between append attempts; grows linearly per attempt.
    pub history_retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            alert_route: AlertRoute::Entity,
            history_retry_attempts: 3,
            history_retry_backoff_ms: 25,
        }
    }
}

impl IngestConfig {
    /// # Errors
    /// `InvalidConfig` when `history_retry_attempts` is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.history_retry_attempts == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "ingest.history_retry_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Pipeline stage of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    /// Validated and accepted.
    Received,
    /// Written to the history store (or given up on).
    Persisted,
    /// Checked against the entity's fences.
    Evaluated,
    /// A violation alert was published.
    Alerted,
    /// No violation.
    NoAlert,
}

impl IngestState {
    /// True for `Alerted` and `NoAlert`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Alerted | Self::NoAlert)
    }
}

/// Acknowledgement returned for an ingested update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Reporting entity.
    pub entity_id: EntityId,
    /// Time of the fix.
    pub timestamp: DateTime<Utc>,
    /// Final pipeline state.
    pub state: IngestState,
    /// False when the history store rejected the update after all retries.
    pub persisted: bool,
    /// The violation that was alerted, if any.
    pub violation: Option<Violation>,
    /// Fan-out of the violation alert across all routed channels.
    pub fanout: FanoutReport,
}

/// Runs updates through persist, evaluate and alert.
pub struct Ingestor {
    registry: Arc<FenceRegistry>,
    broadcaster: Arc<AlertBroadcaster>,
    history: Arc<dyn HistoryStore>,
    cfg: IngestConfig,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor").field("cfg", &self.cfg).finish_non_exhaustive()
    }
}

impl Ingestor {
    /// Creates an ingestor over shared components.
    #[must_use]
    pub fn new(
        registry: Arc<FenceRegistry>,
        broadcaster: Arc<AlertBroadcaster>,
        history: Arc<dyn HistoryStore>,
        cfg: IngestConfig,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            history,
            cfg,
        }
    }

    /// The ingestion configuration.
    #[must_use]
    pub const fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    /// Validates raw coordinates and ingests the update.
    ///
    /// # Errors
    /// `InvalidCoordinate`; nothing is persisted or evaluated in that case.
    pub fn submit(&self, entity_id: EntityId, lat: f64, lng: f64, timestamp: DateTime<Utc>) -> GeowatchResult<Ack> {
        let update = LocationUpdate::new(entity_id, lat, lng, timestamp)?;
        Ok(self.ingest(&update))
    }

    /// Ingests an already-validated update.
    pub fn ingest(&self, update: &LocationUpdate) -> Ack {
        let mut state = IngestState::Received;
        debug!(entity = %update.entity_id, point = %update.point, ?state, "update received");

        let persisted = self.persist(update);
        state = IngestState::Persisted;
        debug!(entity = %update.entity_id, persisted, ?state, "update persisted");

        // Snapshot taken after persisting so fence changes made meanwhile apply.
        let fences = self.registry.fences_for(update.entity_id);
        let violation = detector::evaluate(update, &fences);
        state = IngestState::Evaluated;
        debug!(entity = %update.entity_id, fences = fences.len(), ?state, "update evaluated");

        let mut fanout = FanoutReport::default();
        if let Some(violation) = &violation {
            fanout = self.publish_violation(violation);
            state = IngestState::Alerted;
            debug!(
                entity = %update.entity_id,
                fence = %violation.fence_id,
                queued = fanout.queued,
                "violation alerted"
            );
        } else {
            state = IngestState::NoAlert;
        }

        Ack {
            entity_id: update.entity_id,
            timestamp: update.timestamp,
            state,
            persisted,
            violation,
            fanout,
        }
    }

    /// Broadcasts a danger signal about `entity_id` to every broadcast
    /// subscriber except those of `origin`.
    ///
    /// # Errors
    /// `FieldTooLong` if the message exceeds [`MAX_DANGER_MESSAGE_LEN`].
    pub fn raise_danger_alert(
        &self,
        origin: SubscriberId,
        entity_id: EntityId,
        point: GeoPoint,
        message: Option<String>,
    ) -> GeowatchResult<FanoutReport> {
        if message.as_ref().is_some_and(|m| m.len() > MAX_DANGER_MESSAGE_LEN) {
            return Err(ValidationError::FieldTooLong {
                field: "message".to_string(),
                max_length: MAX_DANGER_MESSAGE_LEN,
            }
            .into());
        }
        let alert = Alert::danger(origin, entity_id, point, message);
        let report = self.broadcaster.publish_broadcast(AlertOrigin::Subscriber(origin), alert);
        warn!(
            entity = %entity_id,
            origin = %origin,
            queued = report.queued,
            "danger alert raised"
        );
        Ok(report)
    }

    fn persist(&self, update: &LocationUpdate) -> bool {
        let attempts = self.cfg.history_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.history.append(update.entity_id, update.point, update.timestamp) {
                Ok(()) => return true,
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(entity = %update.entity_id, attempt, error = %err, "history append failed, retrying");
                    let backoff = self.cfg.history_retry_backoff_ms.saturating_mul(u64::from(attempt));
                    if backoff > 0 {
                        thread::sleep(Duration::from_millis(backoff));
                    }
                    attempt += 1;
                }
                Err(err) => {
                    let err = ExecutionError::StoreUnavailable {
                        message: err.to_string(),
                    };
                    warn!(entity = %update.entity_id, attempts = attempt, "{err}");
                    return false;
                }
            }
        }
    }

    fn publish_violation(&self, violation: &Violation) -> FanoutReport {
        let alert = Alert::fence_violation(violation);
        match self.cfg.alert_route {
            AlertRoute::Entity => self.broadcaster.publish_to_entity(violation.entity_id, alert),
            AlertRoute::Broadcast => self.broadcaster.publish_broadcast(AlertOrigin::System, alert),
            AlertRoute::Both => {
                let mut report = self.broadcaster.publish_to_entity(violation.entity_id, alert.clone());
                report.merge(self.broadcaster.publish_broadcast(AlertOrigin::System, alert));
                report
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::broadcast::Channel;
    use crate::fence::{FenceGeometry, FenceId, FenceTemplate};
    use crate::history::{HistoryEntry, InMemoryHistoryStore, StoreError};

    struct FlakyStore {
        failures_left: AtomicU32,
        retryable: bool,
        inner: InMemoryHistoryStore,
    }

    impl FlakyStore {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                retryable,
                inner: InMemoryHistoryStore::new(),
            }
        }
    }

    impl HistoryStore for FlakyStore {
        fn append(&self, entity_id: EntityId, point: GeoPoint, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(if self.retryable {
                    StoreError::Unavailable("connection refused".to_string())
                } else {
                    StoreError::Backend("schema mismatch".to_string())
                });
            }
            self.inner.append(entity_id, point, timestamp)
        }

        fn query_recent(&self, entity_id: EntityId, max: usize) -> Result<Vec<HistoryEntry>, StoreError> {
            self.inner.query_recent(entity_id, max)
        }
    }

    fn setup(history: Arc<dyn HistoryStore>, route: AlertRoute) -> (Ingestor, Arc<FenceRegistry>, Arc<AlertBroadcaster>) {
        let registry = Arc::new(FenceRegistry::new());
        let broadcaster = Arc::new(AlertBroadcaster::default());
        let cfg = IngestConfig {
            alert_route: route,
            history_retry_backoff_ms: 1,
            ..IngestConfig::default()
        };
        let ingestor = Ingestor::new(Arc::clone(&registry), Arc::clone(&broadcaster), history, cfg);
        (ingestor, registry, broadcaster)
    }

    fn circle_fence(registry: &FenceRegistry, entity_id: EntityId) -> FenceId {
        let center = GeoPoint::new(40.0, -74.0).unwrap();
        let template = FenceTemplate::new(FenceGeometry::circle(center, 100.0).unwrap()).named("home");
        let fence = template.instantiate(FenceId::new()).unwrap();
        let id = fence.id;
        registry.add_fence(entity_id, fence).unwrap();
        id
    }

    #[test]
    fn invalid_coordinates_are_rejected_before_persisting() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let (ingestor, _, _) = setup(history.clone(), AlertRoute::Entity);
        let e = EntityId::new();
        let err = ingestor.submit(e, 91.0, 0.0, Utc::now()).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(history.len_for(e).unwrap(), 0);
    }

    #[test]
    fn update_without_fences_is_persisted_without_alert() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let (ingestor, _, _) = setup(history.clone(), AlertRoute::Entity);
        let e = EntityId::new();
        let ack = ingestor.submit(e, 10.0, 10.0, Utc::now()).unwrap();
        assert_eq!(ack.state, IngestState::NoAlert);
        assert!(ack.persisted);
        assert!(ack.violation.is_none());
        assert_eq!(history.len_for(e).unwrap(), 1);
    }

    #[test]
    fn outside_point_alerts_entity_channel() {
        let (ingestor, registry, broadcaster) = setup(Arc::new(InMemoryHistoryStore::new()), AlertRoute::Entity);
        let e = EntityId::new();
        let fence_id = circle_fence(&registry, e);
        let stream = broadcaster.subscribe(SubscriberId::new(), Channel::Entity(e));
        let everyone = broadcaster.subscribe(SubscriberId::new(), Channel::Broadcast);

        let inside = ingestor.submit(e, 40.0, -74.0, Utc::now()).unwrap();
        assert_eq!(inside.state, IngestState::NoAlert);

        let ack = ingestor.submit(e, 41.0, -74.0, Utc::now()).unwrap();
        assert_eq!(ack.state, IngestState::Alerted);
        assert_eq!(ack.fanout.queued, 1);
        let alert = stream.recv_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(alert.fence_id(), Some(fence_id));
        assert!(everyone.try_recv().is_none());
    }

    #[test]
    fn both_route_publishes_on_each_channel() {
        let (ingestor, registry, broadcaster) = setup(Arc::new(InMemoryHistoryStore::new()), AlertRoute::Both);
        let e = EntityId::new();
        circle_fence(&registry, e);
        let own = broadcaster.subscribe(SubscriberId::new(), Channel::Entity(e));
        let everyone = broadcaster.subscribe(SubscriberId::new(), Channel::Broadcast);

        let ack = ingestor.submit(e, 0.0, 0.0, Utc::now()).unwrap();
        assert_eq!(ack.fanout.queued, 2);
        let a = own.try_recv().unwrap();
        let b = everyone.try_recv().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.origin, AlertOrigin::System);
    }

    #[test]
    fn retryable_store_failure_is_retried() {
        let store = Arc::new(FlakyStore::new(2, true));
        let (ingestor, _, _) = setup(store.clone(), AlertRoute::Entity);
        let e = EntityId::new();
        let ack = ingestor.submit(e, 1.0, 1.0, Utc::now()).unwrap();
        assert!(ack.persisted);
        assert_eq!(store.inner.len_for(e).unwrap(), 1);
    }

    #[test]
    fn store_failure_does_not_block_evaluation() {
        let store = Arc::new(FlakyStore::new(1, false));
        let (ingestor, registry, _) = setup(store, AlertRoute::Entity);
        let e = EntityId::new();
        circle_fence(&registry, e);
        let ack = ingestor.submit(e, 0.0, 0.0, Utc::now()).unwrap();
        assert!(!ack.persisted);
        assert_eq!(ack.state, IngestState::Alerted);
    }

    #[test]
    fn exhausted_retries_give_up() {
        let store = Arc::new(FlakyStore::new(10, true));
        let (ingestor, _, _) = setup(store.clone(), AlertRoute::Entity);
        let ack = ingestor.submit(EntityId::new(), 1.0, 1.0, Utc::now()).unwrap();
        assert!(!ack.persisted);
        assert_eq!(ack.state, IngestState::NoAlert);
        // Three attempts consumed.
        assert_eq!(store.failures_left.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn danger_alert_skips_originator() {
        let (ingestor, _, broadcaster) = setup(Arc::new(InMemoryHistoryStore::new()), AlertRoute::Entity);
        let sender = SubscriberId::new();
        let own = broadcaster.subscribe(sender, Channel::Broadcast);
        let other = broadcaster.subscribe(SubscriberId::new(), Channel::Broadcast);
        let point = GeoPoint::new(5.0, 5.0).unwrap();

        let report = ingestor
            .raise_danger_alert(sender, EntityId::new(), point, Some("help".to_string()))
            .unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.excluded, 1);
        assert!(other.try_recv().is_some());
        assert!(own.try_recv().is_none());
    }

    #[test]
    fn oversized_danger_message_is_rejected() {
        let (ingestor, _, _) = setup(Arc::new(InMemoryHistoryStore::new()), AlertRoute::Entity);
        let message = "x".repeat(MAX_DANGER_MESSAGE_LEN + 1);
        let err = ingestor
            .raise_danger_alert(SubscriberId::new(), EntityId::new(), GeoPoint::new(0.0, 0.0).unwrap(), Some(message))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn config_defaults_and_validation() {
        let cfg = IngestConfig::default();
        assert_eq!(cfg.alert_route, AlertRoute::Entity);
        assert!(cfg.validate().is_ok());
        let cfg = IngestConfig {
            history_retry_attempts: 0,
            ..IngestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
