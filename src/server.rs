//! HTTP surface for the query pipeline and the maintenance triggers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Run one free-text query through the pipeline |
//! | `POST` | `/index/append` | Fire-and-forget: index one new record |
//! | `POST` | `/index/rebuild` | Fire-and-forget: rebuild the whole index |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `/query` returns JSON `{query, code, answer}` for textual answers, or an
//! `application/octet-stream` download when the executed artifact produced
//! a file. Error responses follow one schema:
//!
//! ```json
//! { "error": { "code": "safety_rejected", "message": "..." } }
//! ```
//!
//! A safety rejection and generation exhaustion are client-visible 400s
//! with their own codes; stage failures map to 502 with the stage name in
//! the code, so callers can tell "your query was unsafe" from "our service
//! is down".
//!
//! Maintenance triggers return `202 Accepted` immediately and run in a
//! spawned background task; they never block a live query.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::maintain::Maintainer;
use crate::models::{QueryOutcome, Stage};
use crate::pipeline::Pipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    maintainer: Arc<Maintainer>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(
    config: &Config,
    pipeline: Arc<Pipeline>,
    maintainer: Arc<Maintainer>,
) -> anyhow::Result<()> {
    let state = AppState {
        pipeline,
        maintainer,
    };

    let app = build_router(state);

    let bind_addr = &config.server.bind;
    tracing::info!(%bind_addr, "server listening");
    println!("tally server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/index/append", post(handle_append))
        .route("/index/rebuild", post(handle_rebuild))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error envelope.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable code (e.g. `"safety_rejected"`, `"search_failed"`).
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: code.to_string(),
        message: message.into(),
    }
}

/// Map a pipeline stage failure to an HTTP error. Input validation is the
/// caller's fault; everything downstream is an upstream/service fault.
fn stage_error(stage: Stage, message: String) -> AppError {
    let status = match stage {
        Stage::Validate => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    AppError {
        status,
        code: format!("{stage}_failed"),
        message,
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

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
}

#[derive(Serialize)]
struct QueryResponse {
    query: String,
    /// The accepted artifact, returned for auditability.
    code: String,
    answer: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, AppError> {
    match state.pipeline.answer(&request.query).await {
        QueryOutcome::Answered(answer) => Ok(Json(QueryResponse {
            query: answer.query,
            code: answer.code,
            answer: answer.answer,
        })
        .into_response()),

        QueryOutcome::FileProduced {
            filename, bytes, ..
        } => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", filename.replace('"', "")),
                )
                .body(Body::from(bytes))
                .map_err(|e| stage_error(Stage::Format, e.to_string()))?;
            Ok(response)
        }

        QueryOutcome::Rejected { reason } => Err(bad_request(
            "safety_rejected",
            format!("Query not allowed: {reason}"),
        )),

        QueryOutcome::Exhausted { detail } => Err(bad_request("generation_exhausted", detail)),

        QueryOutcome::Failed { stage, message } => Err(stage_error(stage, message)),
    }
}

// ============ POST /index/append, /index/rebuild ============

#[derive(Deserialize)]
struct AppendRequest {
    record_id: i64,
}

#[derive(Serialize)]
struct JobResponse {
    status: String,
}

async fn handle_append(
    State(state): State<AppState>,
    Json(request): Json<AppendRequest>,
) -> (StatusCode, Json<JobResponse>) {
    let maintainer = state.maintainer.clone();
    let record_id = request.record_id;
    tokio::spawn(async move {
        if let Err(e) = maintainer.append(record_id).await {
            tracing::error!(record_id, error = %format!("{e:#}"), "index append failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(JobResponse {
            status: "queued".to_string(),
        }),
    )
}

async fn handle_rebuild(State(state): State<AppState>) -> (StatusCode, Json<JobResponse>) {
    let maintainer = state.maintainer.clone();
    tokio::spawn(async move {
        if let Err(e) = maintainer.full_rebuild().await {
            tracing::error!(error = %format!("{e:#}"), "index rebuild failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(JobResponse {
            status: "queued".to_string(),
        }),
    )
}
