//! HTTP handlers and router assembly.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::enums::{HealthStatus, ReadyStatus};
use crate::errors::ServiceError;
use crate::middleware::{self, Chain};
use crate::models::{HealthResponse, ReadyResponse, ShortenRequest, UrlInfoResponse};
use crate::service::CreateUrlRequest;
use crate::state::AppState;

/// Builds the full router: routes first, then the middleware chain wraps
/// the lot so the request passes identity → rate limit → trace → timeout →
/// CORS → handler.
pub fn router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api/v1/shorten", post(shorten))
        .route("/api/v1/urls/:code", get(url_info).delete(delete_url))
        .route("/api/v1/analytics/:code", get(analytics))
        .route("/:code", get(redirect))
        .with_state(Arc::clone(&state));

    let request_timeout = state.config.read_timeout + state.config.write_timeout;
    let rate_state = Arc::clone(&state);
    Chain::new()
        .append(|router: Router| router.layer(axum::middleware::from_fn(middleware::request_id)))
        .append(move |router: Router| {
            router.layer(axum::middleware::from_fn_with_state(
                Arc::clone(&rate_state),
                middleware::rate_limit,
            ))
        })
        .append(|router: Router| router.layer(TraceLayer::new_for_http()))
        .append(move |router: Router| router.layer(TimeoutLayer::new(request_timeout)))
        .append(|router: Router| router.layer(CorsLayer::permissive()))
        .then(routes)
}

fn observe(state: &AppState, handler: &'static str, method: &'static str, status: StatusCode) {
    state
        .metrics
        .http_requests_total
        .with_label_values(&[handler, method, status.as_str()])
        .inc();
}

fn respond_err(state: &AppState, handler: &'static str, method: &'static str, err: ServiceError) -> Response {
    observe(state, handler, method, err.status());
    err.into_response()
}

// ── Health / readiness / metrics ──────────────────────────────────────────────

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let timestamp = Utc::now().to_rfc3339();
    if !state.ready.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: ReadyStatus::NotReady,
                timestamp,
                checks: None,
            }),
        )
            .into_response();
    }

    let mut checks = BTreeMap::new();
    let repo_ok = state.repo.health_check(&state.shutdown).await.is_ok();
    checks.insert(
        "repository".to_string(),
        if repo_ok { "ok" } else { "error" }.to_string(),
    );

    let (status, ready_status) = if repo_ok {
        (StatusCode::OK, ReadyStatus::Ready)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, ReadyStatus::NotReady)
    };
    (
        status,
        Json(ReadyResponse {
            status: ready_status,
            timestamp,
            checks: Some(checks),
        }),
    )
        .into_response()
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    crate::metrics::gather(&state.registry)
}

// ── POST /api/v1/shorten ──────────────────────────────────────────────────────

pub async fn shorten(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ShortenRequest>,
) -> Response {
    let timer = state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&["shorten"])
        .start_timer();

    let expires_in = match payload.expires_in.as_deref() {
        Some(raw) => match humantime::parse_duration(raw.trim()) {
            Ok(duration) => Some(duration),
            Err(_) => {
                timer.observe_duration();
                return respond_err(
                    &state,
                    "shorten",
                    "POST",
                    ServiceError::InvalidExpiresIn(raw.to_string()),
                );
            }
        },
        None => None,
    };

    let result = state
        .urls
        .create(
            CreateUrlRequest {
                original_url: payload.url,
                expires_in,
            },
            &state.shutdown,
        )
        .await;
    timer.observe_duration();

    match result {
        Ok(created) => {
            observe(&state, "shorten", "POST", StatusCode::CREATED);
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(err) => respond_err(&state, "shorten", "POST", err),
    }
}

// ── GET /api/v1/urls/:code ────────────────────────────────────────────────────

pub async fn url_info(State(state): State<Arc<AppState>>, Path(code): Path<String>) -> Response {
    if code.trim().is_empty() {
        return respond_err(&state, "url_info", "GET", ServiceError::InvalidShortCode);
    }
    match state.urls.get(&code, &state.shutdown).await {
        Ok(url) => {
            observe(&state, "url_info", "GET", StatusCode::OK);
            Json(UrlInfoResponse::from_url(&url, state.urls.base_url())).into_response()
        }
        Err(err) => respond_err(&state, "url_info", "GET", err),
    }
}

// ── DELETE /api/v1/urls/:code ─────────────────────────────────────────────────

pub async fn delete_url(State(state): State<Arc<AppState>>, Path(code): Path<String>) -> Response {
    if code.trim().is_empty() {
        return respond_err(&state, "delete_url", "DELETE", ServiceError::InvalidShortCode);
    }
    match state.urls.delete(&code, &state.shutdown).await {
        Ok(()) => {
            observe(&state, "delete_url", "DELETE", StatusCode::NO_CONTENT);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => respond_err(&state, "delete_url", "DELETE", err),
    }
}

// ── GET /api/v1/analytics/:code ───────────────────────────────────────────────

pub async fn analytics(State(state): State<Arc<AppState>>, Path(code): Path<String>) -> Response {
    if code.trim().is_empty() {
        return respond_err(&state, "analytics", "GET", ServiceError::InvalidShortCode);
    }
    match state.analytics.get_url_stats(&code, &state.shutdown).await {
        Ok(stats) => {
            observe(&state, "analytics", "GET", StatusCode::OK);
            Json(stats).into_response()
        }
        Err(err) => respond_err(&state, "analytics", "GET", err),
    }
}

// ── GET /:code (redirect hot path) ────────────────────────────────────────────

pub async fn redirect(State(state): State<Arc<AppState>>, Path(code): Path<String>) -> Response {
    let timer = state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&["redirect"])
        .start_timer();
    if code.trim().is_empty() {
        timer.observe_duration();
        return respond_err(&state, "redirect", "GET", ServiceError::InvalidShortCode);
    }

    let result = state.redirects.redirect(&code, &state.shutdown).await;
    timer.observe_duration();

    match result {
        Ok(resolved) => {
            // `permanent` is always false today; a 302 keeps intermediaries
            // from caching the hop and hiding clicks.
            let status = if resolved.permanent {
                StatusCode::MOVED_PERMANENTLY
            } else {
                StatusCode::FOUND
            };
            observe(&state, "redirect", "GET", status);
            let mut response = status.into_response();
            match HeaderValue::from_str(&resolved.original_url) {
                Ok(location) => {
                    response.headers_mut().insert(header::LOCATION, location);
                    response
                }
                Err(_) => ServiceError::Internal(anyhow::anyhow!("unencodable location header"))
                    .into_response(),
            }
        }
        Err(err) => respond_err(&state, "redirect", "GET", err),
    }
}
