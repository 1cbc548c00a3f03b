//! REST API server
//!
//! `POST /query` runs the pipeline for one question. CORS is wide open
//! (any origin, method and header, credentials allowed); it mirrors the
//! request instead of answering `*`, which is not safe for production.

use crate::pipeline::{Answer, QueryPipeline};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// API State - Shared between handlers
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<QueryPipeline>,
}

/// Request for a natural-language query
#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

fn error_response(status: StatusCode, detail: String) -> Response {
    (status, Json(ErrorResponse { detail })).into_response()
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

/// Question endpoint
async fn query(
    State(state): State<ApiState>,
    request: Result<Json<QuestionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    let span = info_span!("query", request_id = %Uuid::new_v4());
    async move {
        info!(question = %request.question, "Received question");
        match state.pipeline.answer(&request.question).await {
            Ok(answer) => (StatusCode::OK, Json::<Answer>(answer)).into_response(),
            Err(e) => {
                error!(code = e.kind(), "Query failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/query", post(query))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Start the API server
pub async fn start_server(host: &str, port: u16, state: ApiState) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Query API listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
