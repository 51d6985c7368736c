//! HTTP surface: prerender endpoint, Prometheus scrape and health
//!
//! `GET /render?url=...` answers with the rendered markup and the status the
//! page reported through its status marker.

use crate::logging::{self, Severity};
use crate::{QueueStats, RenderError, RenderRequest, RenderService};
use axum::body::{Body, HttpBody};
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub const PRERENDER_STATUS_HEADER: &str = "x-prerender-status";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RenderService>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/render", get(render))
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(access_log))
}

pub async fn serve(bind: SocketAddr, state: AppState) -> Result<(), RenderError> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

#[derive(Debug, Deserialize)]
struct RenderQuery {
    url: String,
}

async fn render(
    State(state): State<AppState>,
    Query(query): Query<RenderQuery>,
    headers: HeaderMap,
) -> Response {
    let mut request = RenderRequest::new(query.url);
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    match state.service.render(request).await {
        Ok(result) => {
            let status = result
                .http_status()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);

            let mut response = (status, Html(result.page_content)).into_response();
            if let Some(marker) = result
                .status_code
                .as_deref()
                .and_then(|code| HeaderValue::from_str(code).ok())
            {
                response
                    .headers_mut()
                    .insert(PRERENDER_STATUS_HEADER, marker);
            }
            response
        }
        Err(err) => error_response(&err),
    }
}

fn error_status(err: &RenderError) -> StatusCode {
    match err {
        RenderError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
        RenderError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        err if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &RenderError) -> Response {
    let body = json!({
        "error": err.kind(),
        "message": err.to_string(),
    });
    (error_status(err), Json(body)).into_response()
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    queue: QueueStats,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        queue: state.service.stats(),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Logs every response with its timing; the level follows the status class.
pub async fn access_log(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let user_agent =
        header_value(request.headers(), "user-agent").unwrap_or_else(|| "not set".to_string());
    let real_ip = header_value(request.headers(), "x-real-ip");
    let trace_id = header_value(request.headers(), "x-trace-id");

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let content_length = header_value(response.headers(), CONTENT_LENGTH.as_str())
        .and_then(|length| length.parse::<u64>().ok())
        .or_else(|| response.body().size_hint().exact());

    logging::emit(
        Severity::from_http_status(status),
        "Request",
        &json!({
            "method": method.as_str(),
            "url": uri.path(),
            "query": uri.query(),
            "statusCode": status,
            "contentLength": content_length,
            "userAgent": user_agent,
            "userIp": real_ip,
            "processTime": start.elapsed().as_secs_f64() * 1000.0,
            "traceId": trace_id,
        }),
    );

    response
}
