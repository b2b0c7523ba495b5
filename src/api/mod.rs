//! HTTP API: order creation, status, event stream and health checks

use crate::chain::AdapterRegistry;
use crate::config::ApiConfig;
use crate::error::{ErrorClass, SwapError, SwapResult};
use crate::events::{MonitorEvent, WireEvent};
use crate::order::service::OrderService;
use crate::order::OrderRequest;
use crate::state::OrderStore;

use async_stream::stream;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Streams stay open this long after `completed` so clients can read it
const STREAM_CLOSE_DELAY: Duration = Duration::from_secs(1);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrderService>,
    pub store: Arc<dyn OrderStore>,
    pub adapters: Arc<AdapterRegistry>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/events", get(order_events))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Config(format!("Cannot bind API on {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Error body: `{"error": "..."}`
pub struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.class()) {
            (SwapError::OrderNotFound { .. }, _) => StatusCode::NOT_FOUND,
            (_, ErrorClass::Validation) => StatusCode::BAD_REQUEST,
            (_, ErrorClass::Transient) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn parse_order_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(SwapError::Validation(format!("Invalid order id {}", raw))))
}

async fn create_order(
    State(state): State<AppState>,
    body: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body.map_err(|e| ApiError(SwapError::Validation(e.body_text())))?;
    let created = state.service.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.service.status(order_id).await?))
}

/// Server-sent events for one order: `connected`, the current status, then
/// every monitor event until `completed`
async fn order_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let monitor = state.service.monitor().clone();

    // Subscribe before reading the order so no transition falls in between
    let subscribed = monitor.subscribe(order_id);
    let order = state.service.order(order_id).await?;
    let receiver = match subscribed {
        Some(receiver) => Some(receiver),
        None if !order.is_terminal() => Some(monitor.start_monitoring(order.clone()).subscribe()),
        None => None,
    };

    let events = stream! {
        yield Ok(sse_event(&WireEvent::connected(order_id)));

        match receiver {
            None => {
                yield Ok(sse_event(&MonitorEvent::completed(&order).to_wire()));
            }
            Some(mut receiver) => {
                yield Ok(sse_event(&MonitorEvent::status_update(&order, order.phase).to_wire()));

                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let done = event.is_completed();
                            yield Ok(sse_event(&event.to_wire()));
                            if done {
                                tokio::time::sleep(STREAM_CLOSE_DELAY).await;
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Event stream for order {} skipped {} events", order_id, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(wire: &WireEvent) -> Event {
    Event::default()
        .json_data(wire)
        .unwrap_or_else(|e| Event::default().comment(format!("unserializable event: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = state.adapters.health_check().await;
    let chains_ok = !chain_health.is_empty() && chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = db_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database: db_ok,
            chains: chains_ok,
            details: chain_health.into_iter().map(ChainHealth::from).collect(),
        }),
    )
}

/// Service status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.adapters.health_check().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connected_chains: state.adapters.connected_chains(),
        active_monitors: state.service.monitor().active_count(),
        tracked_transactions: state.service.monitor().tracker().pending_count().await,
        chain_status: chain_health.into_iter().map(ChainHealth::from).collect(),
    })
}

/// Get connected chains
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state.adapters.connected_chains(),
    })
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: String,
    healthy: bool,
}

impl From<(String, bool)> for ChainHealth {
    fn from((chain, healthy): (String, bool)) -> Self {
        Self { chain, healthy }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    connected_chains: Vec<String>,
    active_monitors: usize,
    tracked_transactions: usize,
    chain_status: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::service::tests::{harness, request, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(h: &Harness) -> Router {
        router(AppState {
            service: h.service.clone(),
            store: h.store.clone(),
            adapters: h.adapters.clone(),
            started_at: Instant::now(),
        })
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_fetch_order() {
        let h = harness(true);
        let body = serde_json::to_value(request(1000)).unwrap();

        let (status, bytes) = send(app(&h), post_json("/orders", &body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let created: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created["toAmount"], "2000");
        assert_eq!(created["secret"].as_str().unwrap().len(), 64);

        let id = created["orderId"].as_str().unwrap();
        let (status, bytes) = send(app(&h), get(&format!("/orders/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        let view: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(view["status"], "created");
        assert_eq!(view["progress"], 20);
        assert_eq!(view["fromAmount"], "1000");
        assert!(view.get("secret").is_none());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_bad_requests() {
        let h = harness(true);

        let mut body = serde_json::to_value(request(1000)).unwrap();
        body["srcTimelockSecs"] = json!(600);
        body["dstTimelockSecs"] = json!(1200);
        let (status, bytes) = send(app(&h), post_json("/orders", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(error["error"].as_str().unwrap().contains("timelock"));

        let (status, _) = send(app(&h), post_json("/orders", &json!({"fromChain": "alpha"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app(&h), get("/orders/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let h = harness(true);
        let uri = format!("/orders/{}", Uuid::new_v4());
        let (status, bytes) = send(app(&h), get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(error["error"].as_str().unwrap().contains("not found"));

        let (status, _) = send(app(&h), get(&format!("{}/events", uri))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_stream_of_finished_order() {
        let h = harness(true);
        let created = h.service.create_order(request(1000)).await.unwrap();
        h.service.monitor().stop_monitoring(created.order_id);

        let mut order = h.service.order(created.order_id).await.unwrap();
        order.fail("operator abort", chrono::Utc::now()).unwrap();
        h.store.save(&order).await.unwrap();

        let response = app(&h)
            .oneshot(get(&format!("/orders/{}/events", created.order_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let connected = text.find("\"type\":\"connected\"").unwrap();
        let completed = text.find("\"type\":\"completed\"").unwrap();
        assert!(connected < completed);
        assert!(text.contains("\"status\":\"failed\""));
    }

    #[tokio::test]
    async fn test_health_and_chains() {
        let h = harness(true);

        let (status, _) = send(app(&h), get("/health")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, bytes) = send(app(&h), get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        let ready: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ready["ready"], true);

        let (status, bytes) = send(app(&h), get("/chains")).await;
        assert_eq!(status, StatusCode::OK);
        let chains: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(chains["chains"], json!(["alpha", "beta"]));
    }
}
