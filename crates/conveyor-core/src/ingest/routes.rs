//! HTTP routes of the ingestion endpoint.

use axum::extract::State;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use crate::domain::StoreError;
use crate::ingest::{IngestError, IngestService, PushCredentials};
use crate::status::wire::{
    DB_HEADER, LOG_PATH, LogPush, PROGRESS_PATH, ProgressPush, STAGE_PATH, StagePush, TOKEN_HEADER,
};

/// Cookie name of an interactive user session.
const SESSION_COOKIE: &str = "session_id";

/// `POST /log`, `POST /stage`, `POST /progress`.
///
/// Nest it under the configured prefix to match the clients' base URL.
pub fn router(service: IngestService) -> Router {
    Router::new()
        .route(LOG_PATH, post(log_handler))
        .route(STAGE_PATH, post(stage_handler))
        .route(PROGRESS_PATH, post(progress_handler))
        .with_state(service)
}

/// The router nested under `prefix` (e.g. `/conveyor`); a blank or `/`
/// prefix serves it at the root.
pub fn mount(prefix: &str, service: IngestService) -> Router {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return router(service);
    }
    if prefix.starts_with('/') {
        Router::new().nest(prefix, router(service))
    } else {
        Router::new().nest(&format!("/{prefix}"), router(service))
    }
}

async fn log_handler(
    State(service): State<IngestService>,
    headers: HeaderMap,
    Json(push): Json<LogPush>,
) -> Result<String, IngestError> {
    let id = service.push_log(&credentials(&headers), push).await?;
    Ok(id.get().to_string())
}

async fn stage_handler(
    State(service): State<IngestService>,
    headers: HeaderMap,
    Json(push): Json<StagePush>,
) -> Result<String, IngestError> {
    let id = service.create_stage(&credentials(&headers), push).await?;
    Ok(id.get().to_string())
}

async fn progress_handler(
    State(service): State<IngestService>,
    headers: HeaderMap,
    Json(push): Json<ProgressPush>,
) -> Result<(), IngestError> {
    service.push_progress(&credentials(&headers), push).await
}

fn credentials(headers: &HeaderMap) -> PushCredentials {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    PushCredentials {
        database: text(DB_HEADER),
        token: text(TOKEN_HEADER),
        session_present: headers.contains_key(AUTHORIZATION) || has_session_cookie(headers),
    }
}

fn has_session_cookie(headers: &HeaderMap) -> bool {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .any(|(name, value)| name.trim() == SESSION_COOKIE && !value.trim().is_empty())
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::MissingHeader(_) => (StatusCode::BAD_REQUEST, "MISSING_HEADER"),
            Self::UnknownDatabase(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_DATABASE"),
            Self::InvalidToken => (StatusCode::FORBIDDEN, "INVALID_TOKEN"),
            Self::SessionPresent => (StatusCode::FORBIDDEN, "SESSION_PRESENT"),
            Self::ForeignStage(_) => (StatusCode::FORBIDDEN, "FOREIGN_STAGE"),
            Self::RootStageExists(_) => (StatusCode::CONFLICT, "ROOT_STAGE_EXISTS"),
            Self::Store(StoreError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Store(err) => {
                tracing::error!(error = ?err, "ingest store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
            }
        };

        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": code,
        });
        (status, Json(body)).into_response()
    }
}
