//! # geowatch - Real-time geofence monitoring and alert broadcast
//!
//! geowatch ingests per-entity location updates, checks each one against the
//! entity's geofences and pushes violation alerts to subscribers within
//! seconds.
//!
//! ## Core Concepts
//!
//! - **Geofence**: A permitted zone (circle or polygon) attached to an entity.
//!   Leaving any of an entity's fences is a violation.
//! - **LocationUpdate**: One validated position fix of an entity.
//! - **Alert**: A transient notification published on an entity channel or the
//!   broadcast channel.
//! - **HistoryStore**: The pluggable append-only store every accepted update is
//!   written through to.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use geowatch::{Channel, EntityId, FenceGeometry, FenceTemplate, GeoPoint, GeowatchEngine, SubscriberId};
//!
//! # fn main() -> geowatch::GeowatchResult<()> {
//! let engine = GeowatchEngine::in_memory()?;
//! let child = EntityId::new();
//!
//! let school = GeoPoint::new(40.7128, -74.0060)?;
//! let template = FenceTemplate::new(FenceGeometry::circle(school, 250.0)?).named("school");
//! engine.create_fence(child, &template)?;
//!
//! let alerts = engine.subscribe(SubscriberId::new(), Channel::Entity(child));
//! engine.submit_location(child, 40.80, -74.0060, Utc::now())?;
//! let alert = alerts.recv()?;
//! println!("{} left {:?}", alert.source_entity_id, alert.fence_id());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod entity;
pub mod error;
pub mod fence;
pub mod geo;
pub mod location;

// Pipeline components
pub mod broadcast;
pub mod detector;
pub mod history;
pub mod ingest;
pub mod registry;

// Engine and configuration
pub mod config;
pub mod engine;

mod sync;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use broadcast::{
    Alert, AlertBroadcaster, AlertId, AlertOrigin, AlertPayload, AlertSink, AlertStream, BroadcasterConfig, Channel,
    FanoutReport, SubscriptionHandle, SubscriptionId,
};
pub use config::GeowatchConfig;
pub use detector::Violation;
pub use engine::GeowatchEngine;
pub use entity::{EntityId, SubscriberId};
pub use error::{DeliveryError, ExecutionError, GeowatchError, GeowatchResult, RegistryError, ValidationError};
pub use fence::{FenceGeometry, FenceId, FenceKind, FenceTemplate, Geofence};
pub use geo::GeoPoint;
pub use history::{HistoryEntry, HistoryStore, InMemoryHistoryStore, StoreError};
pub use ingest::{Ack, AlertRoute, IngestConfig, IngestState, Ingestor, RuntimeConfig};
pub use location::LocationUpdate;
pub use registry::{BulkAddReport, FenceRegistry, FenceSet};
