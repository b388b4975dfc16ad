use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures_util::{Stream, StreamExt, stream};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::Fingerprint;
use crate::config::Config;
use crate::engine::{Providers, SyncEngine};
use crate::error::{ActionError, ReadError};
use crate::metrics as app_metrics;

/// Shared application state available to all handlers.
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

/// Build the HTTP surface over an engine.
///
/// Separated from [`run`] so integration tests can serve their own engine
/// on port 0 without starting the metrics listener.
pub fn router(engine: Arc<SyncEngine>) -> Router {
    let state = Arc::new(AppState { engine });
    Router::new()
        .route("/health", get(health_check))
        .route("/entities/{fingerprint}", get(get_entity).delete(evict_entity))
        .route(
            "/actions/{slot}",
            get(get_action).post(invoke_action).delete(reset_action),
        )
        .route("/actions/{slot}/events", get(action_events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    app_metrics::init_metrics(&config.server.metrics)?;

    let providers = Providers::from_config(&config)?;
    let engine = Arc::new(SyncEngine::new(&config, providers)?);
    let _tasks = engine.start();
    let app = router(engine);

    if config.server.metrics.enabled {
        let metrics_addr = format!(
            "{}:{}",
            config.server.metrics.address, config.server.metrics.port
        );
        let metrics_router = Router::new().route(
            &config.server.metrics.path,
            get(app_metrics::metrics_handler),
        );
        let listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
        info!(addr = %metrics_addr, "metrics server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router).await {
                warn!(error = %e, "metrics server stopped");
            }
        });
    }

    let addr = format!("{}:{}", config.server.address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "vaultsync listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "head": state.engine.watcher().last_height(),
        "entries": state.engine.cache().len(),
    }))
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ActionError::Busy(_) | ActionError::NotResettable(_) => StatusCode::CONFLICT,
            ActionError::UnknownSlot(_) => StatusCode::NOT_FOUND,
            ActionError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
        };
        error_body(status, self)
    }
}

impl IntoResponse for ReadError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReadError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReadError::Permanent(_) => StatusCode::BAD_GATEWAY,
            ReadError::Cancelled => StatusCode::GONE,
        };
        error_body(status, self)
    }
}

/// Read-through: a miss loads, a stale entry is returned and refreshed.
async fn get_entity(State(state): State<Arc<AppState>>, Path(raw): Path<String>) -> Response {
    let fp: Fingerprint = match raw.parse() {
        Ok(fp) => fp,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    match state.engine.read(&fp).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn evict_entity(State(state): State<Arc<AppState>>, Path(raw): Path<String>) -> Response {
    let fp: Fingerprint = match raw.parse() {
        Ok(fp) => fp,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    if state.engine.evict(&fp) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_body(StatusCode::NOT_FOUND, format!("no entry for {fp}"))
    }
}

async fn get_action(
    State(state): State<Arc<AppState>>,
    Path(slot): Path<String>,
) -> Result<impl IntoResponse, ActionError> {
    Ok(Json(state.engine.transactions().record(&slot)?))
}

/// Start an action; answers with the `submitting` record.
async fn invoke_action(
    State(state): State<Arc<AppState>>,
    Path(slot): Path<String>,
    body: Bytes,
) -> Response {
    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("invalid JSON payload: {e}")),
        }
    };
    match state.engine.invoke_action(&slot, payload) {
        Ok(mut records) => (StatusCode::ACCEPTED, Json(records.next().await)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn reset_action(
    State(state): State<Arc<AppState>>,
    Path(slot): Path<String>,
) -> Result<impl IntoResponse, ActionError> {
    Ok(Json(state.engine.reset_action(&slot)?))
}

/// Server-sent events: the current record, then every transition.
async fn action_events(
    State(state): State<Arc<AppState>>,
    Path(slot): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ActionError> {
    let transactions = state.engine.transactions();
    let rx = transactions.transitions(&slot)?;
    let current = transactions.record(&slot)?;

    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(record) => return Some((record, rx)),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    let events = stream::once(async move { current })
        .chain(updates)
        .map(|record| Event::default().event("record").json_data(record));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
