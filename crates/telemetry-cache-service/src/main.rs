use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use telemetry_cache_core::{
    HistoryEntry, NodeKey, Snapshot, StoreConfig, TelemetryError, DEFAULT_HISTORY_CAPACITY,
};
use telemetry_cache_store::{IngestionGate, QueryFacade, StoreStats, TelemetryStore};
use time::OffsetDateTime;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_CONTRACT_VERSION: &str = "telemetry.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    gate: IngestionGate,
    query: QueryFacade,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Copy)]
struct HttpLimits {
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5_000),
            max_body_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    InvalidJson,
    PayloadTooLarge,
    MalformedReading,
    Internal,
}

impl FailureKind {
    fn code(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::PayloadTooLarge => "payload_too_large",
            Self::MalformedReading => "malformed_reading",
            Self::Internal => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct UpdateResponse {
    status: &'static str,
    node_id: NodeKey,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    store: StoreStats,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    ingest_accepted_total: AtomicU64,
    ingest_rejected_total: AtomicU64,
    invalid_json_total: AtomicU64,
    oversized_body_total: AtomicU64,
    internal_errors_total: AtomicU64,
    queries_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    ingest_accepted_total: u64,
    ingest_rejected_total: u64,
    invalid_json_total: u64,
    oversized_body_total: u64,
    internal_errors_total: u64,
    queries_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "telemetry-cache-service")]
#[command(about = "HTTP ingestion and query service for sensor node telemetry")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history_capacity: usize,
    #[arg(long, default_value_t = 5_000)]
    request_timeout_ms: u64,
    #[arg(long, default_value_t = 16 * 1024)]
    max_body_bytes: usize,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(store: Arc<TelemetryStore>) -> Self {
        Self {
            gate: IngestionGate::new(Arc::clone(&store)),
            query: QueryFacade::new(store),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn failure(
        &self,
        status: StatusCode,
        kind: FailureKind,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        self.telemetry.record_failure(kind);
        ServiceFailure { status, code: kind.code(), message: message.into(), details }
    }

    fn unreadable_body(&self, rejection: &BytesRejection) -> ServiceFailure {
        let status = rejection.status();
        let kind = if status == StatusCode::PAYLOAD_TOO_LARGE {
            FailureKind::PayloadTooLarge
        } else {
            FailureKind::InvalidJson
        };
        tracing::warn!(%status, code = kind.code(), "rejected unreadable telemetry body");
        self.failure(status, kind, rejection.body_text(), None)
    }

    fn invalid_json(&self, err: &serde_json::Error) -> ServiceFailure {
        tracing::warn!(error = %err, "rejected unparseable telemetry body");
        self.failure(
            StatusCode::BAD_REQUEST,
            FailureKind::InvalidJson,
            format!("request body is not valid JSON: {err}"),
            Some(json!({"line": err.line(), "column": err.column()})),
        )
    }

    fn classify_telemetry_error(&self, err: &TelemetryError) -> ServiceFailure {
        match err {
            TelemetryError::MalformedReading(reason) => {
                tracing::warn!(%reason, "rejected malformed telemetry report");
                self.failure(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    FailureKind::MalformedReading,
                    err.to_string(),
                    None,
                )
            }
            TelemetryError::Configuration(_) | TelemetryError::Timestamp(_) => {
                tracing::error!(error = %err, "telemetry ingestion failed");
                self.failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    FailureKind::Internal,
                    err.to_string(),
                    None,
                )
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::InvalidJson => &self.invalid_json_total,
            FailureKind::PayloadTooLarge => &self.oversized_body_total,
            FailureKind::MalformedReading => &self.ingest_rejected_total,
            FailureKind::Internal => &self.internal_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            ingest_accepted_total: self.ingest_accepted_total.load(Ordering::Relaxed),
            ingest_rejected_total: self.ingest_rejected_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            oversized_body_total: self.oversized_body_total.load(Ordering::Relaxed),
            internal_errors_total: self.internal_errors_total.load(Ordering::Relaxed),
            queries_total: self.queries_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState, limits: HttpLimits) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/update", post(update))
        .route("/data", get(data))
        .route("/history/:node_id", get(history))
        .with_state(state)
        .layer(DefaultBodyLimit::max(limits.max_body_bytes))
        .layer(TimeoutLayer::new(limits.request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
            tracing::info_span!("http", method = %req.method(), uri = %req.uri())
        }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let store = TelemetryStore::with_config(StoreConfig { history_capacity: args.history_capacity })
        .context("invalid store configuration")?;
    let limits = HttpLimits {
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        max_body_bytes: args.max_body_bytes,
    };

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(
        bind = %args.bind,
        history_capacity = args.history_capacity,
        "telemetry cache listening"
    );

    axum::serve(listener, app(ServiceState::new(Arc::new(store)), limits))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("telemetry cache stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    state.telemetry.record_request();
    Json(envelope(HealthResponse {
        status: "ok",
        store: state.query.stats(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn update(
    State(state): State<ServiceState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<UpdateResponse>, ServiceFailure> {
    state.telemetry.record_request();
    // Devices do not reliably send a JSON content type, so the body is parsed
    // whatever the header says.
    let body = body.map_err(|rejection| state.unreadable_body(&rejection))?;
    let payload: Value =
        serde_json::from_slice(&body).map_err(|err| state.invalid_json(&err))?;
    let ack = state.gate.submit(&payload).map_err(|err| state.classify_telemetry_error(&err))?;

    state.telemetry.ingest_accepted_total.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(node_id = %ack.node_id, "reading ingested");
    Ok(Json(UpdateResponse { status: "success", node_id: ack.node_id, timestamp: ack.timestamp }))
}

async fn data(State(state): State<ServiceState>) -> Json<BTreeMap<NodeKey, Snapshot>> {
    state.telemetry.record_request();
    state.telemetry.queries_total.fetch_add(1, Ordering::Relaxed);
    Json(state.query.get_all_latest())
}

async fn history(
    State(state): State<ServiceState>,
    Path(node_id): Path<String>,
) -> Json<Vec<HistoryEntry>> {
    state.telemetry.record_request();
    state.telemetry.queries_total.fetch_add(1, Ordering::Relaxed);
    let entries = NodeKey::parse(&node_id)
        .map(|key| state.query.get_history(&key))
        .unwrap_or_default();
    Json(entries)
}
