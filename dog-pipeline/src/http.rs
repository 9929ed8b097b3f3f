//! HTTP surface over a [`PipelineHandle`].
//!
//! | Method | Path                       | Body / query                    |
//! |--------|----------------------------|---------------------------------|
//! | POST   | `/queues/{queue}/jobs`     | `{ payload, options? }`         |
//! | GET    | `/queues/{queue}/stats`    |                                 |
//! | GET    | `/jobs?ownerId=`           |                                 |
//! | GET    | `/jobs/{id}`               |                                 |
//! | DELETE | `/jobs/{id}`               |                                 |
//! | GET    | `/jobs/{id}/events`        | `lastSeenSequence` or `Last-Event-ID` |
//! | POST   | `/cache/invalidate`        | `{ pattern }`                   |
//! | POST   | `/cache/warm`              | `{ entries: [...] }`            |
//! | GET    | `/cache/stats`             |                                 |
//! | GET    | `/metrics`                 |                                 |

use std::convert::Infallible;

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::cache::WarmEntry;
use crate::gateway::Frame;
use crate::pipeline::PipelineHandle;
use crate::queue::JobOptions;
use crate::{JobId, JobPayload, PipelineError};

/// `PipelineError` rendered as a JSON error response
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Validation(_) | PipelineError::SerializationError(_) => StatusCode::BAD_REQUEST,
            PipelineError::JobNotFound(_) | PipelineError::QueueNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::JobCanceled | PipelineError::JobAlreadyTerminal => StatusCode::CONFLICT,
            PipelineError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn name(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::NOT_FOUND => "NotFound",
            StatusCode::CONFLICT => "Conflict",
            StatusCode::SERVICE_UNAVAILABLE => "Unavailable",
            _ => "GeneralError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "request failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };
        let body = json!({
            "name": self.name(),
            "message": message,
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

fn map_json_rejection(rejection: JsonRejection) -> ApiError {
    ApiError(PipelineError::validation(format!(
        "Failed to parse the request body as JSON: {}",
        rejection
    )))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    payload: JobPayload,
    #[serde(default)]
    options: JobOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    last_seen_sequence: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    owner_id: String,
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    pattern: String,
}

#[derive(Debug, Deserialize)]
struct WarmRequest {
    entries: Vec<WarmEntry>,
}

/// Router exposing the pipeline
pub fn router(handle: PipelineHandle) -> Router<()> {
    Router::new()
        .route("/queues/{queue}/jobs", routing::post(submit))
        .route("/queues/{queue}/stats", routing::get(queue_stats))
        .route("/jobs", routing::get(list_jobs))
        .route("/jobs/{id}", routing::get(get_status).delete(cancel))
        .route("/jobs/{id}/events", routing::get(events))
        .route("/cache/invalidate", routing::post(invalidate))
        .route("/cache/warm", routing::post(warm))
        .route("/cache/stats", routing::get(cache_stats))
        .route("/metrics", routing::get(metrics))
        .with_state(handle)
}

async fn submit(
    State(handle): State<PipelineHandle>,
    Path(queue): Path<String>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(map_json_rejection)?;
    let job = handle.submit(&queue, request.payload, request.options).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn queue_stats(State(handle): State<PipelineHandle>, Path(queue): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(handle.queue_stats(&queue).await?))
}

async fn list_jobs(State(handle): State<PipelineHandle>, Query(query): Query<ListQuery>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(handle.list_jobs(&query.owner_id).await?))
}

async fn get_status(State(handle): State<PipelineHandle>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(handle.get_status(&JobId::from(id)).await?))
}

async fn cancel(State(handle): State<PipelineHandle>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let cancelled = handle.cancel(&JobId::from(id)).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn events(
    State(handle): State<PipelineHandle>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let job_id = JobId::from(id);
    let last_seen = query.last_seen_sequence.or_else(|| last_event_id(&headers));
    let stream = handle.subscribe(&job_id, last_seen).await?;

    let interval = handle.config().gateway.heartbeat_interval;
    let events = stream.filter_map(|event| async move {
        match Frame::from_event(&event) {
            Ok(frame) => Some(Ok(to_sse(frame))),
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "dropping unencodable event");
                None
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(interval)))
}

fn to_sse(frame: Frame) -> SseEvent {
    let mut event = SseEvent::default().event(frame.event);
    if let Some(id) = frame.id {
        event = event.id(id.to_string());
    }
    if let Some(data) = frame.data {
        event = event.data(data);
    }
    event
}

async fn invalidate(
    State(handle): State<PipelineHandle>,
    body: Result<Json<InvalidateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(map_json_rejection)?;
    if request.pattern.is_empty() {
        return Err(ApiError(PipelineError::validation("pattern must not be empty")));
    }
    Ok(Json(handle.invalidate_cache(&request.pattern).await))
}

async fn warm(
    State(handle): State<PipelineHandle>,
    body: Result<Json<WarmRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(map_json_rejection)?;
    Ok(Json(handle.warm_cache(request.entries).await))
}

async fn cache_stats(State(handle): State<PipelineHandle>) -> impl IntoResponse {
    Json(handle.cache_stats())
}

async fn metrics(State(handle): State<PipelineHandle>) -> impl IntoResponse {
    Json(handle.metrics())
}
