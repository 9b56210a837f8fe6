//! The geowatch engine.
//!
//! [`GeowatchEngine`] wires the fence registry, the alert broadcaster, the
//! history store and the ingestion runtime together and exposes the public
//! operations over them. It is `Send + Sync`; share it behind an `Arc`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::broadcast::{AlertBroadcaster, AlertSink, AlertStream, Channel, FanoutReport, SubscriptionHandle};
use crate::config::GeowatchConfig;
use crate::entity::{EntityId, SubscriberId};
use crate::error::{ExecutionError, GeowatchError, GeowatchResult};
use crate::fence::{FenceId, FenceTemplate, Geofence};
use crate::geo::GeoPoint;
use crate::history::{HistoryEntry, HistoryStore, InMemoryHistoryStore, DEFAULT_HISTORY_LIMIT};
use crate::ingest::{Ack, IngestHandle, IngestRuntime, Ingestor};
use crate::location::LocationUpdate;
use crate::registry::{BulkAddReport, FenceRegistry, FenceSet};

/// Geofence monitoring engine.
pub struct GeowatchEngine {
    cfg: GeowatchConfig,
    registry: Arc<FenceRegistry>,
    broadcaster: Arc<AlertBroadcaster>,
    history: Arc<dyn HistoryStore>,
    runtime: IngestRuntime,
}

impl std::fmt::Debug for GeowatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeowatchEngine")
            .field("cfg", &self.cfg)
            .field("fences", &self.registry.fence_count())
            .field("subscriptions", &self.broadcaster.subscription_count())
            .finish_non_exhaustive()
    }
}

impl GeowatchEngine {
    /// Builds an engine over `history` and starts its workers.
    ///
    /// # Errors
    /// `InvalidConfig` if `cfg` does not validate, `Internal` if workers
    /// cannot be started.
    pub fn new(cfg: GeowatchConfig, history: Arc<dyn HistoryStore>) -> GeowatchResult<Self> {
        cfg.validate()?;
        let registry = Arc::new(FenceRegistry::new());
        let broadcaster = Arc::new(AlertBroadcaster::new(cfg.broadcaster.clone()));
        let ingestor = Ingestor::new(
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            Arc::clone(&history),
            cfg.ingest.clone(),
        );
        let runtime = IngestRuntime::start(Arc::new(ingestor), &cfg.runtime)?;
        info!(
            workers = cfg.runtime.workers,
            alert_route = ?cfg.ingest.alert_route,
            "geowatch engine started"
        );
        Ok(Self {
            cfg,
            registry,
            broadcaster,
            history,
            runtime,
        })
    }

    /// Engine with default configuration and an in-memory history store.
    ///
    /// # Errors
    /// As for [`GeowatchEngine::new`].
    pub fn in_memory() -> GeowatchResult<Self> {
        Self::new(GeowatchConfig::default(), Arc::new(InMemoryHistoryStore::new()))
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &GeowatchConfig {
        &self.cfg
    }

    /// The fence registry.
    #[must_use]
    pub fn registry(&self) -> &FenceRegistry {
        &self.registry
    }

    /// The alert broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &AlertBroadcaster {
        &self.broadcaster
    }

    /// Ingests a location update and waits for its acknowledgement.
    ///
    /// Updates of one entity are processed in submission order.
    ///
    /// # Errors
    /// `InvalidCoordinate` (nothing persisted or evaluated), `QueueFull` when
    /// the entity already has a full backlog.
    pub fn submit_location(&self, entity_id: EntityId, lat: f64, lng: f64, timestamp: DateTime<Utc>) -> GeowatchResult<Ack> {
        self.submit_location_async(entity_id, lat, lng, timestamp)?.join()
    }

    /// Queues a location update without waiting.
    ///
    /// # Errors
    /// As for [`GeowatchEngine::submit_location`].
    pub fn submit_location_async(
        &self,
        entity_id: EntityId,
        lat: f64,
        lng: f64,
        timestamp: DateTime<Utc>,
    ) -> GeowatchResult<IngestHandle> {
        let update = LocationUpdate::new(entity_id, lat, lng, timestamp)?;
        self.runtime.submit_async(update)
    }

    /// Creates a fence for one entity.
    ///
    /// # Errors
    /// Validation errors for a bad template; `DuplicateFenceId` cannot occur
    /// for generated ids in practice but is propagated.
    pub fn create_fence(&self, entity_id: EntityId, template: &FenceTemplate) -> GeowatchResult<Geofence> {
        let fence = template.instantiate(FenceId::new())?;
        self.registry.add_fence(entity_id, fence.clone())?;
        info!(entity = %entity_id, fence = %fence.id, name = %fence.name, "fence created");
        Ok(fence)
    }

    /// Creates one fence per entity from the same template.
    ///
    /// # Errors
    /// Validation errors for a bad template, before any entity is touched.
    /// Per-entity failures are reported in the returned report.
    pub fn bulk_create_fence(&self, entity_ids: &[EntityId], template: &FenceTemplate) -> GeowatchResult<BulkAddReport> {
        template.validate()?;
        Ok(self.registry.bulk_add_fence(entity_ids, template))
    }

    /// Deletes a fence. Returns false if the entity has no such fence.
    pub fn delete_fence(&self, entity_id: EntityId, fence_id: FenceId) -> bool {
        let removed = self.registry.remove_fence(entity_id, fence_id);
        if removed {
            info!(entity = %entity_id, fence = %fence_id, "fence deleted");
        }
        removed
    }

    /// The entity's fences in evaluation order.
    #[must_use]
    pub fn fences_for(&self, entity_id: EntityId) -> FenceSet {
        self.registry.fences_for(entity_id)
    }

    /// Up to `max` recent positions, most recent first. `None` means
    /// [`DEFAULT_HISTORY_LIMIT`].
    ///
    /// # Errors
    /// `StoreUnavailable` when the history store fails.
    pub fn location_history(&self, entity_id: EntityId, max: Option<usize>) -> GeowatchResult<Vec<HistoryEntry>> {
        self.history
            .query_recent(entity_id, max.unwrap_or(DEFAULT_HISTORY_LIMIT))
            .map_err(|e| {
                GeowatchError::Execution(ExecutionError::StoreUnavailable {
                    message: e.to_string(),
                })
            })
    }

    /// Pull subscription to a channel.
    pub fn subscribe(&self, subscriber_id: SubscriberId, channel: Channel) -> AlertStream {
        self.broadcaster.subscribe(subscriber_id, channel)
    }

    /// Push subscription to a channel.
    ///
    /// # Errors
    /// `Internal` if the forwarder thread cannot be spawned.
    pub fn subscribe_with_sink(
        &self,
        subscriber_id: SubscriberId,
        channel: Channel,
        sink: Arc<dyn AlertSink>,
    ) -> GeowatchResult<SubscriptionHandle> {
        self.broadcaster.subscribe_with_sink(subscriber_id, channel, sink)
    }

    /// Removes a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.broadcaster.unsubscribe(handle)
    }

    /// Broadcasts a danger signal to everyone but `origin`.
    ///
    /// # Errors
    /// `FieldTooLong` for an oversized message.
    pub fn raise_danger_alert(
        &self,
        origin: SubscriberId,
        entity_id: EntityId,
        point: GeoPoint,
        message: Option<String>,
    ) -> GeowatchResult<FanoutReport> {
        self.runtime.ingestor().raise_danger_alert(origin, entity_id, point, message)
    }
}
