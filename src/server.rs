//! HTTP trigger surface: `/health`, `/queue`, `/metrics`, `/trigger`, `/enqueue`.
//!
//! An axum `Router` built from a `State` extractor carrying shared state,
//! wired through a permissive `CorsLayer`, with plain JSON handlers for
//! body coercion, bearer/custom-header auth and status mapping.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::config::HttpConfig;
use crate::queue::{JobQueue, QueueJob, QueueSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub config: Arc<HttpConfig>,
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET, Method::POST]).allow_headers(Any);

    Router::new()
        .route("/health", get(snapshot_handler))
        .route("/queue", get(snapshot_handler))
        .route("/metrics", get(metrics_handler))
        .route("/trigger", post(trigger_handler))
        .route("/enqueue", post(trigger_handler))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

/// Renders the process-wide Prometheus recorder installed at startup; empty
/// body (still 200) if the daemon was started without metrics installed,
/// which only happens in tests that build a router directly.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(|h| h.render()).unwrap_or_default();
    (StatusCode::OK, body)
}

async fn snapshot_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(snapshot_json(&state.queue.snapshot())))
}

fn snapshot_json(snapshot: &QueueSnapshot) -> Value {
    json!({
        "running": snapshot.running,
        "queue_size": snapshot.queue_size,
        "pending": snapshot.pending,
        "active": snapshot.active,
        "total_enqueued": snapshot.total_enqueued,
        "total_duplicates": snapshot.total_duplicates,
        "total_processed": snapshot.total_processed,
        "total_failed": snapshot.total_failed,
    })
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"})))
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_request"}))).into_response()
}

fn unauthorized() -> Response {
    crate::metrics::http::unauthorized();
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_token"}))).into_response()
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some((scheme, credential)) = value.split_once(' ') {
            if scheme.eq_ignore_ascii_case("bearer") && credential == token {
                return true;
            }
        }
    }
    if let Some(value) = headers.get("x-converter-token").and_then(|v| v.to_str().ok()) {
        if value == token {
            return true;
        }
    }
    false
}

/// Coerced, pre-merge trigger body. Every field is optional; missing ones
/// fall back to the server's configured defaults.
#[derive(Debug, Deserialize, Default)]
struct TriggerBody {
    receiver_db: Option<String>,
    catalog_db: Option<String>,
    parser_name: Option<String>,
    batch_size: Option<i64>,
    max_batches: Option<i64>,
    run_id: Option<String>,
    source: Option<String>,
}

async fn trigger_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let path = "/trigger";

    if let Some(token) = &state.config.auth_token {
        if !authorized(&headers, token) {
            let response = unauthorized();
            crate::metrics::http::request(path, response.status().as_u16(), started.elapsed().as_secs_f64());
            return response;
        }
    }

    let parsed = match parse_body(&body) {
        Some(body) => body,
        None => {
            let response = bad_request();
            crate::metrics::http::request(path, response.status().as_u16(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let receiver_db = non_empty(parsed.receiver_db).or_else(|| state.config.default_receiver_db.clone());
    let catalog_db = non_empty(parsed.catalog_db).or_else(|| state.config.default_catalog_db.clone());
    let (Some(receiver_db), Some(catalog_db)) = (receiver_db, catalog_db) else {
        let response = bad_request();
        crate::metrics::http::request(path, response.status().as_u16(), started.elapsed().as_secs_f64());
        return response;
    };

    let parser_name = non_empty(parsed.parser_name).unwrap_or_else(|| state.config.default_parser_name.clone());
    let batch_size = parsed
        .batch_size
        .filter(|v| *v >= 1)
        .map(|v| v as u32)
        .unwrap_or(state.config.default_batch_size);
    let max_batches = parsed
        .max_batches
        .filter(|v| *v >= 0)
        .map(|v| v as u32)
        .unwrap_or(state.config.default_max_batches);
    let source = non_empty(parsed.source).unwrap_or_else(|| state.config.default_source.clone());

    let job = QueueJob {
        receiver_db,
        catalog_db,
        parser_name,
        batch_size,
        max_batches,
        run_id: parsed.run_id,
        source: Some(source),
    };

    let result = state.queue.enqueue(job.clone());
    let status = if !result.accepted && !result.duplicate {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::ACCEPTED
    };

    let body = json!({
        "accepted": result.accepted,
        "duplicate": result.duplicate,
        "reason": result.reason,
        "queue_size": result.queue_size,
        "key": result.key,
        "job": {
            "receiver_db": job.receiver_db,
            "catalog_db": job.catalog_db,
            "parser_name": job.parser_name,
            "batch_size": job.batch_size,
            "max_batches": job.max_batches,
            "run_id": job.run_id,
            "source": job.source,
        },
    });

    crate::metrics::http::request(path, status.as_u16(), started.elapsed().as_secs_f64());
    (status, Json(body)).into_response()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Absent/empty body coerces to `{}`; anything non-object or malformed is
/// rejected here so the caller turns it into a 400.
fn parse_body(body: &Bytes) -> Option<TriggerBody> {
    if body.is_empty() {
        return Some(TriggerBody::default());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(_)) => serde_json::from_slice(body).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(auth_token: Option<&str>) -> AppState {
        AppState {
            queue: Arc::new(JobQueue::new(10)),
            metrics: None,
            config: Arc::new(HttpConfig {
                bind_address: "0.0.0.0:0".to_string(),
                auth_token: auth_token.map(str::to_string),
                default_receiver_db: Some("receiver.sqlite3".to_string()),
                default_catalog_db: Some("catalog.sqlite3".to_string()),
                default_parser_name: "fixprice".to_string(),
                default_batch_size: 250,
                default_max_batches: 0,
                default_source: "receiver".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn health_returns_200_with_snapshot() {
        let router = build_router(state(None));
        let response = router.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_route_returns_200_even_without_an_installed_recorder() {
        let router = build_router(state(None));
        let response = router.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let router = build_router(state(None));
        let response = router.oneshot(Request::get("/nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_without_token_is_401_when_configured() {
        let router = build_router(state(Some("s3cr3t")));
        let response = router
            .oneshot(Request::post("/trigger").header("content-type", "application/json").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_with_bearer_token_is_accepted() {
        let router = build_router(state(Some("s3cr3t")));
        let response = router
            .oneshot(
                Request::post("/trigger")
                    .header("authorization", "Bearer s3cr3t")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn trigger_with_non_object_body_is_400() {
        let router = build_router(state(None));
        let response = router
            .oneshot(
                Request::post("/trigger")
                    .header("content-type", "application/json")
                    .body(Body::from("[1,2,3]"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_trigger_still_reports_202() {
        let router = build_router(state(None));
        let first = router
            .clone()
            .oneshot(Request::post("/trigger").header("content-type", "application/json").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = router
            .oneshot(Request::post("/trigger").header("content-type", "application/json").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::ACCEPTED);
    }
}
