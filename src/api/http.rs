//! HTTP transport - maps REST requests onto the services.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `GET /health`
//! - `POST /v1/subscriptions`, `GET /v1/subscriptions`
//! - `GET|DELETE /v1/subscriptions/:name`
//! - `PATCH /v1/subscriptions/:name/prefill` with `{ "status": "done" }`
//! - `GET /v1/subscriptions/:name/messages?timeout=5&pop=true&count=10`
//!   (`timeout` in seconds)
//! - `POST /v1/subscriptions/:name/messages-status` with
//!   `{ "sequence_number": 3, "status": "ok" }`
//! - `POST /v1/messages` - ingest a change event
//!
//! Errors are `{ "error": "..." }` with the status from
//! [`ServiceError::status_code`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{EventIngestor, Registration, ServiceError, SubscriptionService};
use crate::delivery::{MessageProcessingStatus, MessageService};
use crate::model::{IngestRequest, NewSubscription, PrefillStatus};

const MAX_TIMEOUT_SECS: f64 = 300.0;

/// Services shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub subscriptions: Arc<SubscriptionService>,
    pub messages: Arc<MessageService>,
    pub ingestor: Arc<EventIngestor>,
    /// Read timeout when the request does not give one.
    pub default_timeout: Duration,
}

/// Build the axum `Router` for the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/v1/subscriptions",
            post(register_handler).get(list_handler),
        )
        .route(
            "/v1/subscriptions/:name",
            get(get_handler).delete(delete_handler),
        )
        .route(
            "/v1/subscriptions/:name/prefill",
            axum::routing::patch(prefill_status_handler),
        )
        .route("/v1/subscriptions/:name/messages", get(messages_handler))
        .route(
            "/v1/subscriptions/:name/messages-status",
            post(message_status_handler),
        )
        .route("/v1/messages", post(ingest_handler))
        .with_state(state)
}

/// Serve the API at the given address (e.g. `"0.0.0.0:7777"`) until
/// `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn register_handler(
    State(state): State<AppState>,
    Json(input): Json<NewSubscription>,
) -> Result<Response, ServiceError> {
    let registration = state.subscriptions.register(input).await?;
    let status = match registration {
        Registration::Created(_) => StatusCode::CREATED,
        Registration::AlreadyExists(_) => StatusCode::OK,
    };
    Ok((status, Json(registration.subscription().clone())).into_response())
}

async fn list_handler(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(state.subscriptions.list().await?).into_response())
}

async fn get_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ServiceError> {
    Ok(Json(state.subscriptions.get(&name).await?).into_response())
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ServiceError> {
    state.subscriptions.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct PrefillStatusInput {
    status: PrefillStatus,
}

async fn prefill_status_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<PrefillStatusInput>,
) -> Result<Response, ServiceError> {
    let subscription = state
        .subscriptions
        .set_prefill_status(&name, input.status)
        .await?;
    Ok(Json(subscription).into_response())
}

#[derive(Deserialize)]
struct MessagesQuery {
    /// Seconds.
    timeout: Option<f64>,
    #[serde(default)]
    pop: bool,
    count: Option<usize>,
}

async fn messages_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Response, ServiceError> {
    let timeout = query
        .timeout
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(|t| Duration::from_secs_f64(t.min(MAX_TIMEOUT_SECS)))
        .unwrap_or(state.default_timeout);
    let messages = state
        .messages
        .get_messages(&name, timeout, query.pop, query.count.unwrap_or(1))
        .await?;
    Ok(Json(messages).into_response())
}

#[derive(Deserialize)]
struct MessageStatusInput {
    sequence_number: u64,
    status: MessageProcessingStatus,
}

async fn message_status_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<MessageStatusInput>,
) -> Result<Response, ServiceError> {
    state
        .messages
        .update_message_status(&name, input.sequence_number, input.status)
        .await?;
    Ok(Json(json!({ "sequence_number": input.sequence_number, "status": input.status })).into_response())
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(input): Json<IngestRequest>,
) -> Result<Response, ServiceError> {
    let event = state.ingestor.ingest(input).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "event_id": event.event_id() })),
    )
        .into_response())
}
