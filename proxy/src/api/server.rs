/// HTTP binding of the mining API
///
/// Routes:
/// - GET  /:login[/:id]/mining/candidate
/// - POST /:login[/:id]/mining/solution
/// - GET  /health, /status, /metrics

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use super::handlers::{Gateway, SubmitResult};
use super::protocol::{is_valid_login, worker_id, ErrorReply};
use crate::metrics::prometheus as metrics;

#[derive(Clone)]
pub struct ApiState {
    pub gateway: Gateway,
    pub limit_body_size: usize,
    pub behind_reverse_proxy: bool,
}

impl ApiState {
    /// Forwarded address when running behind a proxy, else the peer.
    fn client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        if self.behind_reverse_proxy {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        peer.ip()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/status", get(api_status))
        .route("/metrics", get(api_metrics))
        .route("/:login/mining/candidate", get(get_work).fallback(unknown_method))
        .route("/:login/:id/mining/candidate", get(get_work).fallback(unknown_method))
        .route("/:login/mining/solution", post(submit_solution).fallback(unknown_method))
        .route("/:login/:id/mining/solution", post(submit_solution).fallback(unknown_method))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let redis_ok = state.gateway.storage_ok().await;
    let work_ok = state.gateway.get_work().is_ok();
    Json(json!({"status": "ok", "redis": redis_ok, "work": work_ok}))
}

async fn api_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.gateway.status())
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn get_work(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = state.client_ip(&headers, peer);
    if state.gateway.is_banned(ip) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match state.gateway.get_work() {
        Ok(work) => Json(work).into_response(),
        Err(e) => Json(e).into_response(),
    }
}

async fn submit_solution(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let ip = state.client_ip(&headers, peer);
    if state.gateway.is_banned(ip) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let login = params.get("login").map(String::as_str).unwrap_or_default();
    if !is_valid_login(login) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let worker = worker_id(params.get("id").map(String::as_str));

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if declared > state.limit_body_size {
        return request_too_large(&state, ip);
    }
    let body = match to_bytes(body, state.limit_body_size).await {
        Ok(body) => body,
        Err(_) => return request_too_large(&state, ip),
    };

    let result = state.gateway.submit(login, &worker, ip, &body).await;
    submit_response(result)
}

fn request_too_large(state: &ApiState, ip: IpAddr) -> Response {
    tracing::warn!("Socket flood from {}", ip);
    state.gateway.apply_malformed_policy(ip);
    (StatusCode::EXPECTATION_FAILED, "Request too large").into_response()
}

fn submit_response(result: SubmitResult) -> Response {
    let mut response = match (&result.error, result.valid) {
        (Some(e), _) => Json(e.clone()).into_response(),
        (None, true) => Json(json!({"success": "Solution is valid"})).into_response(),
        (None, false) => Json(json!({"error": "Solution is invalid"})).into_response(),
    };
    if result.close {
        response
            .headers_mut()
            .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
    }
    response
}

async fn unknown_method(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = state.client_ip(&headers, peer);
    tracing::warn!("Unknown request method from {}", ip);
    state.gateway.apply_malformed_policy(ip);
    Json(ErrorReply::method_not_found()).into_response()
}
