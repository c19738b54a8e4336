//! HTTP server for asking questions over collections.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Ask a question against a set of resources |
//! | `POST` | `/cache/clear` | Drop all cached collections and checkouts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /ask` returns JSON by default; with `"stream": true` it returns a
//! `text/event-stream` body encoded by [`crate::stream::encode`]. Blocks
//! reach the client as the model produces them — nothing is buffered
//! beyond the event in hand.
//!
//! # Error Contract
//!
//! Non-stream error responses all share one schema:
//!
//! ```json
//! { "error": { "code": "invalid_reference", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `invalid_reference` (400),
//! `not_found` (404), `fetch_failed` (502/500), `model_error` (502),
//! `internal` (500). Once a stream has started, failures arrive as
//! in-band `error` events instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::{BuildError, CollectionCache, LoadRequest};
use crate::collection::Collection;
use crate::config::Config;
use crate::fetch::FetchErrorKind;
use crate::provider::AnswerProvider;
use crate::stream::{encode, StreamEvent};

/// Shared application state passed to all route handlers via Axum's
/// `State` extractor.
#[derive(Clone)]
struct AppState {
    cache: Arc<CollectionCache>,
    provider: Arc<dyn AnswerProvider>,
}

/// Starts the HTTP server on the address in `[server].bind` and serves
/// until the process is terminated.
pub async fn run_server(
    config: &Config,
    cache: Arc<CollectionCache>,
    provider: Arc<dyn AnswerProvider>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState { cache, provider };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ask", post(handle_ask))
        .route("/cache/clear", post(handle_cache_clear))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("askrepo server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"invalid_reference"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Map a collection build failure onto the HTTP error contract. Client
/// mistakes (bad references, conflicting names) are 400s; upstream fetch
/// trouble is a gateway problem, not ours.
fn classify_build_error(err: BuildError) -> AppError {
    match &err {
        BuildError::Empty | BuildError::DuplicateName(_) => bad_request(err.to_string()),
        BuildError::Resolution(_) => {
            AppError::new(StatusCode::BAD_REQUEST, "invalid_reference", err.to_string())
        }
        BuildError::Materialize { error, .. } => match error.kind {
            FetchErrorKind::NotFound => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
            FetchErrorKind::Network | FetchErrorKind::Auth => {
                AppError::new(StatusCode::BAD_GATEWAY, "fetch_failed", err.to_string())
            }
            FetchErrorKind::Tool | FetchErrorKind::Io => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "fetch_failed", err.to_string())
            }
        },
        BuildError::Cancelled | BuildError::Internal(_) => internal(err.to_string()),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    /// Resource names or raw references.
    resources: Vec<String>,
    /// When true, respond with a `text/event-stream` body.
    #[serde(default)]
    stream: bool,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
    model: String,
    resources: Vec<String>,
    collection_key: String,
}

/// Handler for `POST /ask`.
///
/// Loads (or reuses) the collection for the requested resources, then
/// asks the configured model. Concurrent requests for the same resource
/// set share a single build.
async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let collection = state
        .cache
        .load(LoadRequest {
            resource_names: req.resources,
            quiet: true,
        })
        .await
        .map_err(classify_build_error)?;

    if req.stream {
        return stream_answer(&state, collection, &req.question).await;
    }

    let answer = state
        .provider
        .ask(&collection, &req.question)
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_GATEWAY, "model_error", format!("{:#}", e)))?;

    Ok(Json(AskResponse {
        answer,
        model: state.provider.model_name().to_string(),
        resources: collection.resource_names,
        collection_key: collection.key,
    })
    .into_response())
}

/// Stream the answer as wire-encoded event blocks. Failing to *start*
/// the model stream is still an HTTP error; anything after the first
/// byte arrives as an in-band `error` event.
async fn stream_answer(
    state: &AppState,
    collection: Collection,
    question: &str,
) -> Result<Response, AppError> {
    let rx = state
        .provider
        .ask_stream(&collection, question)
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_GATEWAY, "model_error", format!("{:#}", e)))?;

    let meta = StreamEvent::Meta {
        model: state.provider.model_name().to_string(),
        resources: collection.resource_names.clone(),
        collection_key: collection.key.clone(),
        collection_path: collection.path.display().to_string(),
    };

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });
    let body = Body::from_stream(encode(meta, events).map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// ============ POST /cache/clear ============

#[derive(Serialize)]
struct ClearResponse {
    status: String,
}

/// Handler for `POST /cache/clear`. In-flight builds finish and resolve
/// their waiters but are not kept.
async fn handle_cache_clear(State(state): State<AppState>) -> Result<Json<ClearResponse>, AppError> {
    state
        .cache
        .clear()
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(ClearResponse {
        status: "cleared".to_string(),
    }))
}
