use actix_web::{get, post, web, HttpRequest, HttpResponse};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::keys::{CursorType, Key};
use crate::models::{
    ApiError, HealthResponse, StatusResponse, WatchEventOptions, WatchEventResp,
    MAX_CONCURRENT_WATCHES, PROJECT_ID, REQUEST_ID_HEADER,
};
use crate::redis_db::RedisDb;
use crate::watch::{watch_from_now, watch_with_cursor, watch_with_start_from};
use crate::AppState;

pub(crate) async fn require_db(state: &AppState) -> Result<Arc<RedisDb>, ApiError> {
    state
        .db
        .read()
        .await
        .clone()
        .ok_or(ApiError::CacheUnavailable)
}

fn request_id(req: &HttpRequest) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("-")
        .to_string()
}

/// Watch a resource's event chain.
///
/// Dispatches on client intent: a cursor long-polls the chain strictly after
/// it, a starting timestamp scans the retained range, and an empty body
/// watches from now. Responses are always HTTP 200; failures carry the
/// error envelope in the body.
#[utoipa::path(
    post,
    path = "/watch/event/{resource}",
    params(
        ("resource" = String, Path, description = "Watched resource name, e.g. host or host_relation")
    ),
    request_body = WatchEventOptions,
    responses(
        (status = 200, description = "Matched events, or a one-element miss list; errors carry the envelope body", body = Vec<WatchEventResp>),
    ),
    tag = "watch"
)]
#[post("/watch/event/{resource}")]
pub async fn watch_event_handler(
    path: web::Path<String>,
    body: web::Bytes,
    app_state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let rid = request_id(&req);

    let resource = CursorType::from_path(&path).inspect_err(|_| {
        tracing::error!(target: PROJECT_ID, rid = %rid, resource = %path.as_str(), "unknown watch resource");
    })?;
    let opts: WatchEventOptions = serde_json::from_slice(&body).map_err(|error| {
        tracing::error!(target: PROJECT_ID, rid = %rid, %error, "decode watch request body failed");
        ApiError::JsonDecodeFailed(error.to_string())
    })?;
    opts.validate().inspect_err(|error| {
        tracing::error!(target: PROJECT_ID, rid = %rid, %error, "invalid watch request options");
    })?;
    let key = Key::new(resource);

    // Atomically claim a watch slot; rollback if over limit. Long polls hold
    // their connection for up to the deadline, so admission is capped.
    let prev = app_state.watch_count.fetch_add(1, Ordering::Relaxed);
    if prev >= MAX_CONCURRENT_WATCHES {
        app_state.watch_count.fetch_sub(1, Ordering::Relaxed);
        return Err(ApiError::ServerBusy);
    }
    let _guard = WatchGuard(Arc::clone(&app_state.watch_count));

    let db = require_db(&app_state).await?;

    tracing::info!(
        target: PROJECT_ID,
        rid = %rid,
        resource = %resource,
        cursor = %opts.cursor,
        start_from = opts.start_from,
        "POST /watch/event"
    );

    let events = if !opts.cursor.is_empty() {
        watch_with_cursor(db.as_ref(), &key, &opts, &rid).await?
    } else if opts.start_from != 0 {
        watch_with_start_from(db.as_ref(), &key, &opts, &rid).await?
    } else {
        // from-now is a single response; the list shape is kept for
        // transport uniformity
        vec![watch_from_now(db.as_ref(), &key, &opts, &rid).await?]
    };

    Ok(HttpResponse::Ok().json(events))
}

/// RAII guard that releases the watch slot when the request future drops,
/// including on client disconnect mid-poll.
struct WatchGuard(Arc<AtomicUsize>);
impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Cache unavailable", body = HealthResponse)
    ),
    tag = "health"
)]
#[get("/health")]
pub async fn health_check(app_state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let db = app_state.db.read().await.clone();
    match db.as_ref() {
        Some(db) => match db.health_check().await {
            Ok(_) => Ok(HttpResponse::Ok().json(HealthResponse {
                status: "ok".to_string(),
                cache: None,
            })),
            Err(e) => {
                tracing::warn!(target: PROJECT_ID, error = %e, "health check failed");
                Ok(HttpResponse::ServiceUnavailable().json(HealthResponse {
                    status: "degraded".to_string(),
                    cache: Some("unavailable".to_string()),
                }))
            }
        },
        None => Ok(HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "degraded".to_string(),
            cache: Some("unavailable".to_string()),
        })),
    }
}

/// Service status: cache connectivity and server time
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Service status", body = StatusResponse),
    ),
    tag = "health"
)]
#[get("/status")]
pub async fn status_handler(app_state: web::Data<AppState>) -> HttpResponse {
    let cache_connected = app_state.db.read().await.is_some();
    HttpResponse::Ok().json(StatusResponse {
        cache_connected,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
