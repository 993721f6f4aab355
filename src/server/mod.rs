//! The JSON-over-HTTP API.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::storage::sqlite::Store;
use crate::verify::VerificationRegistry;
use crate::whitelist::LinkWhitelist;
use crate::Cancelled;

mod handlers;

/// Process-wide state handed to every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub registry: Arc<VerificationRegistry>,
    pub whitelist: Arc<LinkWhitelist>,
    /// Root cancellation signal; handlers derive child tokens from it so
    /// shutdown propagates into scans, loads, and transactions.
    pub shutdown: CancellationToken,
}

/// Errors that cross the HTTP boundary, each with its status code. Anything
/// uncategorized surfaces as a 500.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            ApiError::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason),
            ApiError::Forbidden(reason) => (StatusCode::FORBIDDEN, reason),
            ApiError::NotFound(reason) => (StatusCode::NOT_FOUND, reason),
            ApiError::Internal(err) => {
                if err.downcast_ref::<Cancelled>().is_some() {
                    (
                        StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                        "operation cancelled".to_string(),
                    )
                } else {
                    tracing::error!(error = %format!("{err:#}"), "request failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
                }
            }
        };
        (
            status,
            Json(json!({ "status": "ERROR", "reason": reason })),
        )
            .into_response()
    }
}

/// Shorthand for mapping validation-shaped errors onto 400s.
pub(crate) fn bad_request(err: anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err:#}"))
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/register/start", post(handlers::register_start))
        .route("/register/finish", post(handlers::register_finish))
        .route("/deregister/start", post(handlers::deregister_start))
        .route("/deregister/finish", post(handlers::deregister_finish))
        .route("/query", post(handlers::query))
        .route("/retrieve/metadata", get(handlers::retrieve_metadata))
        .route("/retrieve/file", get(handlers::retrieve_file))
        .route("/list", get(handlers::list_directory))
        .route("/registered", get(handlers::list_registered))
        .route("/fields", get(handlers::list_fields))
        .route("/tokens", get(handlers::list_tokens))
        .with_state(state.clone());

    let app = if state.config.url_prefix.is_empty() {
        api
    } else {
        Router::new().nest(&state.config.url_prefix, api)
    };
    app.layer(cors)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, prefix = %state.config.url_prefix, "listening");
    axum::serve(listener, router(state).into_make_service())
        .await
        .context("server exited")?;
    Ok(())
}
