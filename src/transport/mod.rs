//! gRPC transport layer for geowatch.
//!
//! Identifiers travel as strings and structured values as JSON bytes, so the
//! wire format is exactly the library's serde representation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::broadcast::Channel;
use crate::engine::GeowatchEngine;
use crate::entity::{EntityId, SubscriberId};
use crate::error::{ExecutionError, GeowatchError};
use crate::fence::{FenceId, FenceTemplate};
use crate::geo::GeoPoint;

pub mod proto {
    #![allow(missing_docs, clippy::pedantic)]
    tonic::include_proto!("geowatch");
}

use proto::geowatch_server::{Geowatch, GeowatchServer};

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum size of a request JSON payload.
const MAX_REQUEST_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Maximum size of a response JSON payload.
const MAX_RESPONSE_JSON_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Maximum size of one streamed alert.
const MAX_ALERT_JSON_BYTES: usize = 64 * 1024;

/// Maximum number of entities in one bulk request.
const MAX_BULK_ENTITIES: usize = 10_000;

/// Maximum history entries returned by one request.
const MAX_HISTORY_ENTRIES: usize = 10_000;

/// How often a subscription stream checks for client disconnect.
const SUBSCRIBE_POLL: Duration = Duration::from_secs(1);

/// Buffered alerts per subscription stream.
const SUBSCRIBE_BUFFER: usize = 128;

/// gRPC service implementation.
pub struct GeowatchService {
    engine: Arc<GeowatchEngine>,
}

impl GeowatchService {
    /// Service over a shared engine.
    #[must_use]
    pub fn new(engine: Arc<GeowatchEngine>) -> Self {
        Self { engine }
    }

    /// Wraps the service for `tonic::transport::Server::add_service`.
    #[must_use]
    pub fn into_server(self) -> GeowatchServer<Self> {
        GeowatchServer::new(self)
    }
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn parse_id<T: std::str::FromStr>(s: &str, field: &str) -> Result<T, Status> {
    if s.is_empty() {
        return Err(invalid_argument(format!("{field} is required")));
    }
    if s.len() > 64 {
        return Err(invalid_argument(format!("{field} too long")));
    }
    s.parse().map_err(|_| invalid_argument(format!("invalid {field}: expected UUID")))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], field: &str) -> Result<T, Status> {
    if bytes.is_empty() {
        return Err(invalid_argument(format!("{field} is required")));
    }
    if bytes.len() > MAX_REQUEST_JSON_BYTES {
        return Err(invalid_argument(format!("{field} exceeds maximum size")));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid_argument(format!("invalid {field}: {e}")))
}

fn encode_json<T: Serialize>(value: &T, max: usize) -> Result<Vec<u8>, Status> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("failed to serialize response JSON: {e}")))?;
    if bytes.len() > max {
        return Err(Status::resource_exhausted("serialized JSON exceeds size limit"));
    }
    Ok(bytes)
}

fn parse_timestamp(ms: i64) -> Result<DateTime<Utc>, Status> {
    if ms == 0 {
        return Ok(Utc::now());
    }
    DateTime::from_timestamp_millis(ms).ok_or_else(|| invalid_argument("timestamp_ms out of range"))
}

fn status_from_geowatch_error(err: GeowatchError) -> Status {
    match err {
        GeowatchError::Validation(v) => Status::invalid_argument(v.to_string()),
        GeowatchError::Registry(r) => Status::already_exists(r.to_string()),
        GeowatchError::Delivery(d) => Status::unavailable(d.to_string()),
        GeowatchError::Internal { message } => Status::internal(message),
        GeowatchError::Execution(e) => match e {
            ExecutionError::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            ExecutionError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
            ExecutionError::StoreUnavailable { .. } => Status::unavailable(e.to_string()),
            ExecutionError::Disconnected { .. } => Status::internal(e.to_string()),
        },
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, Status>
where
    F: FnOnce() -> Result<T, GeowatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Status::internal(format!("blocking task failed: {e}")))?
        .map_err(status_from_geowatch_error)
}

#[tonic::async_trait]
impl Geowatch for GeowatchService {
    async fn submit_location(
        &self,
        request: Request<proto::SubmitLocationRequest>,
    ) -> Result<Response<proto::SubmitLocationResponse>, Status> {
        let req = request.into_inner();
        let entity_id: EntityId = parse_id(&req.entity_id, "entity_id")?;
        let timestamp = parse_timestamp(req.timestamp_ms)?;

        // The history store may block; keep it off the async workers.
        let engine = Arc::clone(&self.engine);
        let ack = run_blocking(move || engine.submit_location(entity_id, req.lat, req.lng, timestamp)).await?;
        let ack_json = encode_json(&ack, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::SubmitLocationResponse { ack_json }))
    }

    async fn create_fence(
        &self,
        request: Request<proto::CreateFenceRequest>,
    ) -> Result<Response<proto::CreateFenceResponse>, Status> {
        let req = request.into_inner();
        let entity_id: EntityId = parse_id(&req.entity_id, "entity_id")?;
        let template: FenceTemplate = decode_json(&req.template_json, "template_json")?;

        let fence = self
            .engine
            .create_fence(entity_id, &template)
            .map_err(status_from_geowatch_error)?;
        let fence_json = encode_json(&fence, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::CreateFenceResponse { fence_json }))
    }

    async fn bulk_create_fence(
        &self,
        request: Request<proto::BulkCreateFenceRequest>,
    ) -> Result<Response<proto::BulkCreateFenceResponse>, Status> {
        let req = request.into_inner();
        if req.entity_ids.len() > MAX_BULK_ENTITIES {
            return Err(invalid_argument("too many entity_ids"));
        }
        let entity_ids = req
            .entity_ids
            .iter()
            .map(|s| parse_id::<EntityId>(s, "entity_ids"))
            .collect::<Result<Vec<_>, _>>()?;
        let template: FenceTemplate = decode_json(&req.template_json, "template_json")?;

        let report = self
            .engine
            .bulk_create_fence(&entity_ids, &template)
            .map_err(status_from_geowatch_error)?;
        let report_json = encode_json(&report, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::BulkCreateFenceResponse { report_json }))
    }

    async fn delete_fence(
        &self,
        request: Request<proto::DeleteFenceRequest>,
    ) -> Result<Response<proto::DeleteFenceResponse>, Status> {
        let req = request.into_inner();
        let entity_id: EntityId = parse_id(&req.entity_id, "entity_id")?;
        let fence_id: FenceId = parse_id(&req.fence_id, "fence_id")?;

        let deleted = self.engine.delete_fence(entity_id, fence_id);
        Ok(Response::new(proto::DeleteFenceResponse { deleted }))
    }

    async fn list_fences(
        &self,
        request: Request<proto::ListFencesRequest>,
    ) -> Result<Response<proto::ListFencesResponse>, Status> {
        let req = request.into_inner();
        let entity_id: EntityId = parse_id(&req.entity_id, "entity_id")?;

        let fences = self.engine.fences_for(entity_id);
        let fences_json = encode_json(&*fences, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::ListFencesResponse { fences_json }))
    }

    async fn location_history(
        &self,
        request: Request<proto::LocationHistoryRequest>,
    ) -> Result<Response<proto::LocationHistoryResponse>, Status> {
        let req = request.into_inner();
        let entity_id: EntityId = parse_id(&req.entity_id, "entity_id")?;
        let max = match req.max {
            0 => None,
            n => Some(usize::try_from(n).unwrap_or(MAX_HISTORY_ENTRIES).min(MAX_HISTORY_ENTRIES)),
        };

        let engine = Arc::clone(&self.engine);
        let entries = run_blocking(move || engine.location_history(entity_id, max)).await?;
        let entries_json = encode_json(&entries, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::LocationHistoryResponse { entries_json }))
    }

    async fn raise_danger_alert(
        &self,
        request: Request<proto::RaiseDangerAlertRequest>,
    ) -> Result<Response<proto::RaiseDangerAlertResponse>, Status> {
        let req = request.into_inner();
        let origin: SubscriberId = parse_id(&req.subscriber_id, "subscriber_id")?;
        let entity_id: EntityId = parse_id(&req.entity_id, "entity_id")?;
        let point = GeoPoint::new(req.lat, req.lng).map_err(|e| status_from_geowatch_error(e.into()))?;
        let message = Some(req.message).filter(|m| !m.is_empty());

        let report = self
            .engine
            .raise_danger_alert(origin, entity_id, point, message)
            .map_err(status_from_geowatch_error)?;
        let report_json = encode_json(&report, MAX_RESPONSE_JSON_BYTES)?;
        Ok(Response::new(proto::RaiseDangerAlertResponse { report_json }))
    }

    type SubscribeStream = ReceiverStream<Result<proto::AlertEvent, Status>>;

    async fn subscribe(
        &self,
        request: Request<proto::SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let subscriber_id: SubscriberId = parse_id(&req.subscriber_id, "subscriber_id")?;
        let channel = if req.entity_id.is_empty() {
            Channel::Broadcast
        } else {
            Channel::Entity(parse_id(&req.entity_id, "entity_id")?)
        };

        // Registered before returning so nothing published after this call is missed.
        let stream = self.engine.subscribe(subscriber_id, channel);
        debug!(subscription = %stream.handle().id, channel = %channel, "grpc subscription opened");

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<proto::AlertEvent, Status>>(SUBSCRIBE_BUFFER);
        tokio::task::spawn_blocking(move || loop {
            match stream.recv_timeout(SUBSCRIBE_POLL) {
                Ok(alert) => {
                    let event = encode_json(&*alert, MAX_ALERT_JSON_BYTES).map(|alert_json| proto::AlertEvent { alert_json });
                    let fatal = event.is_err();
                    if tx.blocking_send(event).is_err() || fatal {
                        stream.unsubscribe();
                        break;
                    }
                }
                Err(GeowatchError::Execution(ExecutionError::Timeout { .. })) => {
                    // Timeout: check for client disconnect, otherwise keep polling.
                    if tx.is_closed() {
                        stream.unsubscribe();
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(status_from_geowatch_error(err)));
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub use proto::geowatch_client::GeowatchClient;

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_stream::StreamExt;
    use tonic::Request;

    use crate::broadcast::Alert;
    use crate::fence::{FenceGeometry, Geofence};
    use crate::ingest::{Ack, IngestState};

    fn service() -> GeowatchService {
        GeowatchService::new(Arc::new(GeowatchEngine::in_memory().unwrap()))
    }

    fn circle_template() -> Vec<u8> {
        let center = GeoPoint::new(51.5, -0.12).unwrap();
        let template = FenceTemplate::new(FenceGeometry::circle(center, 500.0).unwrap()).named("office");
        serde_json::to_vec(&template).unwrap()
    }

    #[tokio::test]
    async fn create_list_and_delete_fence() {
        let svc = service();
        let entity_id = EntityId::new().to_string();

        let resp = svc
            .create_fence(Request::new(proto::CreateFenceRequest {
                entity_id: entity_id.clone(),
                template_json: circle_template(),
            }))
            .await
            .unwrap()
            .into_inner();
        let fence: Geofence = serde_json::from_slice(&resp.fence_json).unwrap();
        assert_eq!(fence.name, "office");

        let listed = svc
            .list_fences(Request::new(proto::ListFencesRequest {
                entity_id: entity_id.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        let fences: Vec<Geofence> = serde_json::from_slice(&listed.fences_json).unwrap();
        assert_eq!(fences, vec![fence.clone()]);

        let deleted = svc
            .delete_fence(Request::new(proto::DeleteFenceRequest {
                entity_id,
                fence_id: fence.id.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(deleted.deleted);
    }

    #[tokio::test]
    async fn bad_inputs_are_invalid_argument() {
        let svc = service();
        let err = svc
            .submit_location(Request::new(proto::SubmitLocationRequest {
                entity_id: EntityId::new().to_string(),
                lat: 95.0,
                lng: 0.0,
                timestamp_ms: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = svc
            .create_fence(Request::new(proto::CreateFenceRequest {
                entity_id: "not-a-uuid".to_string(),
                template_json: circle_template(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = svc
            .create_fence(Request::new(proto::CreateFenceRequest {
                entity_id: EntityId::new().to_string(),
                template_json: b"{}".to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn subscriber_receives_violation_alert() {
        let svc = service();
        let entity = EntityId::new();
        svc.create_fence(Request::new(proto::CreateFenceRequest {
            entity_id: entity.to_string(),
            template_json: circle_template(),
        }))
        .await
        .unwrap();

        let mut alerts = svc
            .subscribe(Request::new(proto::SubscribeRequest {
                subscriber_id: SubscriberId::new().to_string(),
                entity_id: entity.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        let resp = svc
            .submit_location(Request::new(proto::SubmitLocationRequest {
                entity_id: entity.to_string(),
                lat: 52.0,
                lng: -0.12,
                timestamp_ms: 1_700_000_000_000,
            }))
            .await
            .unwrap()
            .into_inner();
        let ack: Ack = serde_json::from_slice(&resp.ack_json).unwrap();
        assert_eq!(ack.state, IngestState::Alerted);

        let event = tokio::time::timeout(Duration::from_secs(2), alerts.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let alert: Alert = serde_json::from_slice(&event.alert_json).unwrap();
        assert_eq!(alert.source_entity_id, entity);
        assert_eq!(alert.timestamp.timestamp_millis(), 1_700_000_000_000);

        let listed = svc
            .list_fences(Request::new(proto::ListFencesRequest {
                entity_id: entity.to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        let fences: Vec<Geofence> = serde_json::from_slice(&listed.fences_json).unwrap();
        assert_eq!(alert.fence_id(), Some(fences[0].id));
    }

    #[tokio::test]
    async fn history_is_returned_most_recent_first() {
        let svc = service();
        let entity_id = EntityId::new().to_string();
        for ms in [1_000, 3_000, 2_000] {
            svc.submit_location(Request::new(proto::SubmitLocationRequest {
                entity_id: entity_id.clone(),
                lat: 1.0,
                lng: 1.0,
                timestamp_ms: ms,
            }))
            .await
            .unwrap();
        }
        let resp = svc
            .location_history(Request::new(proto::LocationHistoryRequest { entity_id, max: 2 }))
            .await
            .unwrap()
            .into_inner();
        let entries: Vec<crate::history::HistoryEntry> = serde_json::from_slice(&resp.entries_json).unwrap();
        let ms: Vec<i64> = entries.iter().map(|e| e.timestamp.timestamp_millis()).collect();
        assert_eq!(ms, vec![3_000, 2_000]);
    }
}
