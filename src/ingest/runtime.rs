//! Ingestion runtime.
//!
//! Updates of one entity must be evaluated in submission order, while
//! different entities proceed in parallel. Every entity with pending work owns
//! a serial lane. A lane is put on the shared ready queue when it becomes
//! non-empty and is drained by whichever worker takes it, so an entity is never
//! pinned to a worker and a slow history write only holds up its own lane.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::EntityId;
use crate::error::{ExecutionError, GeowatchError, GeowatchResult, ValidationError};
use crate::location::LocationUpdate;

use super::{Ack, Ingestor};

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of ingestion workers, i.e. entities processed at once.
    pub workers: usize,
    /// Maximum updates waiting per entity.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// # Errors
    /// `InvalidConfig` when either field is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "runtime.workers must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "runtime.queue_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

enum Job {
    Ingest {
        update: LocationUpdate,
        reply: Sender<Ack>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

fn lane_path(entity_id: EntityId) -> String {
    format!("ingest:{entity_id}")
}

/// Pending jobs per entity.
///
/// An entity has an entry exactly while it sits on the ready queue or is being
/// drained by one worker; that is what keeps its jobs serial.
struct Lanes {
    pending: Mutex<HashMap<EntityId, VecDeque<Job>>>,
    capacity: usize,
}

impl Lanes {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn push(&self, entity_id: EntityId, job: Job, ready: &Sender<EntityId>) -> GeowatchResult<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.entry(entity_id) {
            Entry::Occupied(mut lane) => {
                if lane.get().len() >= self.capacity {
                    return Err(GeowatchError::Execution(ExecutionError::QueueFull {
                        path: lane_path(entity_id),
                        capacity: self.capacity,
                    }));
                }
                lane.get_mut().push_back(job);
            }
            Entry::Vacant(slot) => {
                // Unbounded: holds each entity at most once, so this never blocks.
                if ready.send(entity_id).is_err() {
                    return Err(GeowatchError::Execution(ExecutionError::Disconnected {
                        path: lane_path(entity_id),
                    }));
                }
                slot.insert(VecDeque::from([job]));
            }
        }
        Ok(())
    }

    /// Next job of the lane, or `None` after releasing the drained lane.
    fn next(&self, entity_id: EntityId) -> Option<Job> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let job = pending.get_mut(&entity_id).and_then(VecDeque::pop_front);
        if job.is_none() {
            pending.remove(&entity_id);
        }
        job
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn run_worker(ready: &Receiver<EntityId>, lanes: &Lanes, ingestor: &Ingestor) {
    // Exits once the runtime drops the sender and every ready lane is drained.
    while let Ok(entity_id) = ready.recv() {
        while let Some(job) = lanes.next(entity_id) {
            match job {
                Job::Ingest { update, reply } => {
                    let ack = ingestor.ingest(&update);
                    let _ = reply.send(ack);
                }

                #[cfg(test)]
                Job::Sleep { duration, reply } => {
                    thread::sleep(duration);
                    let _ = reply.send(());
                }
            }
        }
    }
}

/// Handle returned by [`IngestRuntime::submit_async`].
#[derive(Debug)]
pub struct IngestHandle {
    entity_id: EntityId,
    rx: Receiver<Ack>,
}

impl IngestHandle {
    /// Entity the queued update belongs to.
    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Waits for the update to finish.
    ///
    /// # Errors
    /// `Disconnected` if the runtime went away without answering.
    pub fn join(self) -> GeowatchResult<Ack> {
        self.rx.recv().map_err(|_| {
            GeowatchError::Execution(ExecutionError::Disconnected {
                path: lane_path(self.entity_id),
            })
        })
    }

    /// Waits for the update to finish, up to `timeout`.
    ///
    /// # Errors
    /// `Timeout`, or `Disconnected` as for [`IngestHandle::join`].
    pub fn join_timeout(self, timeout: Duration) -> GeowatchResult<Ack> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => GeowatchError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => GeowatchError::Execution(ExecutionError::Disconnected {
                path: lane_path(self.entity_id),
            }),
        })
    }
}

/// Worker pool that ingests updates with per-entity ordering.
pub struct IngestRuntime {
    ingestor: Arc<Ingestor>,
    lanes: Arc<Lanes>,
    ready: Option<Sender<EntityId>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for IngestRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestRuntime")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.lanes.capacity)
            .finish_non_exhaustive()
    }
}

impl IngestRuntime {
    /// Starts the workers.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero-sized config, `Internal` if a worker thread
    /// cannot be spawned (already started workers are shut down).
    pub fn start(ingestor: Arc<Ingestor>, config: &RuntimeConfig) -> GeowatchResult<Self> {
        config.validate()?;
        let (ready_tx, ready_rx) = unbounded::<EntityId>();
        let mut runtime = Self {
            ingestor,
            lanes: Arc::new(Lanes::new(config.queue_capacity)),
            ready: Some(ready_tx),
            workers: Vec::with_capacity(config.workers),
        };
        for idx in 0..config.workers {
            let ready = ready_rx.clone();
            let lanes = Arc::clone(&runtime.lanes);
            let ingestor = Arc::clone(&runtime.ingestor);
            // On error `runtime` is dropped, which joins the workers started so far.
            let handle = thread::Builder::new()
                .name(format!("geowatch-ingest-{idx}"))
                .spawn(move || run_worker(&ready, &lanes, &ingestor))
                .map_err(|e| GeowatchError::internal(format!("failed to spawn ingest worker: {e}")))?;
            runtime.workers.push(handle);
        }
        debug!(workers = config.workers, queue_capacity = config.queue_capacity, "ingest runtime started");
        Ok(runtime)
    }

    /// Number of workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The shared ingestor.
    #[must_use]
    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    /// Queues an update on its entity's lane.
    ///
    /// # Errors
    /// `QueueFull` when the entity already has `queue_capacity` updates
    /// waiting (the update is not ingested), `Disconnected` after shutdown.
    pub fn submit_async(&self, update: LocationUpdate) -> GeowatchResult<IngestHandle> {
        let entity_id = update.entity_id;
        let (reply, rx) = bounded::<Ack>(1);
        self.try_submit(entity_id, Job::Ingest { update, reply })?;
        Ok(IngestHandle { entity_id, rx })
    }

    /// Queues an update and waits for its acknowledgement.
    ///
    /// # Errors
    /// As for [`IngestRuntime::submit_async`] and [`IngestHandle::join`].
    pub fn submit(&self, update: LocationUpdate) -> GeowatchResult<Ack> {
        self.submit_async(update)?.join()
    }

    fn try_submit(&self, entity_id: EntityId, job: Job) -> GeowatchResult<()> {
        let Some(ready) = &self.ready else {
            return Err(GeowatchError::Execution(ExecutionError::Disconnected {
                path: lane_path(entity_id),
            }));
        };
        self.lanes.push(entity_id, job, ready)
    }

    #[cfg(test)]
    fn submit_sleep(&self, entity_id: EntityId, duration: Duration) -> GeowatchResult<Receiver<()>> {
        let (reply, rx) = bounded::<()>(1);
        self.try_submit(entity_id, Job::Sleep { duration, reply })?;
        Ok(rx)
    }
}

impl Drop for IngestRuntime {
    fn drop(&mut self) {
        // Closing the ready queue lets workers finish queued lanes and exit.
        drop(self.ready.take());
        for handle in std::mem::take(&mut self.workers) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use chrono::{DateTime, TimeDelta, Utc};

    use super::*;
    use crate::broadcast::AlertBroadcaster;
    use crate::geo::GeoPoint;
    use crate::history::{HistoryEntry, HistoryStore, InMemoryHistoryStore, StoreError};
    use crate::ingest::IngestConfig;
    use crate::registry::FenceRegistry;

    fn runtime_over(history: Arc<dyn HistoryStore>, workers: usize, queue_capacity: usize) -> IngestRuntime {
        let ingestor = Ingestor::new(
            Arc::new(FenceRegistry::new()),
            Arc::new(AlertBroadcaster::default()),
            history,
            IngestConfig::default(),
        );
        IngestRuntime::start(Arc::new(ingestor), &RuntimeConfig { workers, queue_capacity }).unwrap()
    }

    fn runtime(workers: usize, queue_capacity: usize) -> IngestRuntime {
        runtime_over(Arc::new(InMemoryHistoryStore::new()), workers, queue_capacity)
    }

    fn update(entity_id: EntityId, seq: i64) -> LocationUpdate {
        let ts = Utc::now() + TimeDelta::milliseconds(seq);
        LocationUpdate::new(entity_id, 0.0, 0.0, ts).unwrap()
    }

    #[derive(Default)]
    struct AppendLog(Mutex<Vec<(EntityId, DateTime<Utc>)>>);

    impl HistoryStore for AppendLog {
        fn append(&self, entity_id: EntityId, _: GeoPoint, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
            self.0.lock().unwrap().push((entity_id, timestamp));
            Ok(())
        }

        fn query_recent(&self, _: EntityId, _: usize) -> Result<Vec<HistoryEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Appends for one entity take `delay`; all others return at once.
    struct SlowFor {
        slow: EntityId,
        delay: Duration,
    }

    impl HistoryStore for SlowFor {
        fn append(&self, entity_id: EntityId, _: GeoPoint, _: DateTime<Utc>) -> Result<(), StoreError> {
            if entity_id == self.slow {
                thread::sleep(self.delay);
            }
            Ok(())
        }

        fn query_recent(&self, _: EntityId, _: usize) -> Result<Vec<HistoryEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn updates_of_one_entity_are_processed_in_order() {
        let log = Arc::new(AppendLog::default());
        let rt = runtime_over(log.clone(), 4, 512);

        let entities: Vec<EntityId> = (0..4).map(|_| EntityId::new()).collect();
        let mut handles = Vec::new();
        for i in 0..100 {
            for e in &entities {
                handles.push(rt.submit_async(update(*e, i)).unwrap());
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let log = log.0.lock().unwrap();
        assert_eq!(log.len(), 400);
        for e in &entities {
            let seen: Vec<DateTime<Utc>> = log.iter().filter(|(id, _)| id == e).map(|(_, ts)| *ts).collect();
            assert_eq!(seen.len(), 100);
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn slow_history_write_does_not_delay_other_entities() {
        let slow = EntityId::new();
        let rt = runtime_over(
            Arc::new(SlowFor {
                slow,
                delay: Duration::from_millis(500),
            }),
            2,
            16,
        );

        let pending = rt.submit_async(update(slow, 0)).unwrap();
        let queued_behind = rt.submit_async(update(slow, 1)).unwrap();
        // Let a worker start on the slow append.
        thread::sleep(Duration::from_millis(20));

        for seq in 0..10 {
            let other = EntityId::new();
            let started = Instant::now();
            rt.submit_async(update(other, seq))
                .unwrap()
                .join_timeout(Duration::from_millis(100))
                .unwrap();
            assert!(started.elapsed() < Duration::from_millis(100));
        }

        pending.join_timeout(Duration::from_secs(2)).unwrap();
        queued_behind.join_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn busy_entity_does_not_stall_others() {
        let rt = runtime(2, 16);
        let busy = EntityId::new();
        let sleep = rt.submit_sleep(busy, Duration::from_millis(200)).unwrap();
        thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        rt.submit_async(update(EntityId::new(), 0))
            .unwrap()
            .join_timeout(Duration::from_millis(150))
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));
        sleep.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn drained_lanes_are_released() {
        let rt = runtime(2, 16);
        let entities: Vec<EntityId> = (0..8).map(|_| EntityId::new()).collect();
        for e in &entities {
            rt.submit(update(*e, 0)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while rt.lanes.len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rt.lanes.len(), 0);
    }

    #[test]
    fn full_lane_is_reported() {
        let rt = runtime(1, 1);
        let e = EntityId::new();
        let sleep = rt.submit_sleep(e, Duration::from_millis(100)).unwrap();
        // Wait until the worker has picked up the sleep job.
        thread::sleep(Duration::from_millis(20));
        let queued = rt.submit_async(update(e, 0)).unwrap();
        let err = rt.submit_async(update(e, 1)).unwrap_err();
        assert!(matches!(
            err,
            GeowatchError::Execution(ExecutionError::QueueFull { capacity: 1, .. })
        ));
        assert!(err.is_retryable());

        // Other entities have their own lanes.
        let other = rt.submit_async(update(EntityId::new(), 0)).unwrap();

        sleep.recv_timeout(Duration::from_secs(1)).unwrap();
        queued.join().unwrap();
        other.join().unwrap();
    }

    #[test]
    fn shutdown_drains_queued_updates() {
        let rt = runtime(1, 64);
        let e = EntityId::new();
        let _sleep = rt.submit_sleep(e, Duration::from_millis(20)).unwrap();
        let handles: Vec<IngestHandle> = (0..10).map(|i| rt.submit_async(update(e, i)).unwrap()).collect();
        drop(rt);
        for handle in handles {
            assert!(handle.join_timeout(Duration::from_millis(10)).is_ok());
        }
    }

    #[test]
    fn join_reports_disconnected_when_reply_sender_dropped() {
        let (tx, rx) = bounded::<Ack>(1);
        drop(tx);
        let entity_id = EntityId::new();
        let handle = IngestHandle { entity_id, rx };
        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        let GeowatchError::Execution(ExecutionError::Disconnected { path }) = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(path, format!("ingest:{entity_id}"));
    }

    #[test]
    fn zero_workers_is_invalid() {
        assert!(RuntimeConfig { workers: 0, queue_capacity: 1 }.validate().is_err());
        assert!(RuntimeConfig::default().validate().is_ok());
    }
}
