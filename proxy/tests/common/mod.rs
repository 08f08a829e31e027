#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ergo_proxy::config::Config;
use ergo_proxy::policy::Policy;
use ergo_proxy::shares::{BlockRecord, ShareRecord, ShareStorage, Solution};

pub const LOGIN: &str = "9fRAWhdxEsTcdb8PhGNrZfwqa65zfkuYHAMmkQLcic1gdLSV5vA";

// ─── Fake node ───

#[derive(Debug, Clone)]
pub struct NodeInner {
    pub header: String,
    pub height: u64,
    /// Raw JSON numeral for `/info` difficulty
    pub difficulty: String,
    pub available: bool,
    pub submit_status: u16,
    pub submit_detail: Option<String>,
    /// Header/height to switch to once a solution is accepted
    pub next_on_accept: Option<(String, u64)>,
    pub candidate_calls: usize,
    pub info_calls: usize,
    pub submit_calls: usize,
    /// Raw body of the last submitted solution
    pub last_solution: Option<String>,
}

#[derive(Clone)]
pub struct FakeNode {
    pub url: String,
    state: Arc<Mutex<NodeInner>>,
}

impl FakeNode {
    pub async fn start(header: &str, height: u64) -> Self {
        let state = Arc::new(Mutex::new(NodeInner {
            header: header.to_string(),
            height,
            difficulty: "1234567890123456789012345".to_string(),
            available: true,
            submit_status: 200,
            submit_detail: None,
            next_on_accept: None,
            candidate_calls: 0,
            info_calls: 0,
            submit_calls: 0,
            last_solution: None,
        }));

        let app = Router::new()
            .route("/mining/candidate", get(candidate))
            .route("/info", get(info))
            .route("/mining/solution", post(solution_reply))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut NodeInner) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn set_work(&self, header: &str, height: u64) {
        self.with(|n| {
            n.header = header.to_string();
            n.height = height;
        });
    }

    pub fn set_available(&self, available: bool) {
        self.with(|n| n.available = available);
    }

    pub fn snapshot(&self) -> NodeInner {
        self.state.lock().clone()
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn candidate(State(state): State<Arc<Mutex<NodeInner>>>) -> Response {
    let mut n = state.lock();
    n.candidate_calls += 1;
    if !n.available {
        return json_response(StatusCode::SERVICE_UNAVAILABLE, r#"{"detail":"not synced"}"#.into());
    }
    json_response(
        StatusCode::OK,
        format!(
            r#"{{"msg":"{}","b":18446744073709551616000,"pk":"0350e25cee8562697d55275c96bb01b34228f9bd68fd9933f2a25ff195526864f5"}}"#,
            n.header
        ),
    )
}

async fn info(State(state): State<Arc<Mutex<NodeInner>>>) -> Response {
    let mut n = state.lock();
    n.info_calls += 1;
    if !n.available {
        return json_response(StatusCode::SERVICE_UNAVAILABLE, "{}".into());
    }
    json_response(
        StatusCode::OK,
        format!(
            r#"{{"name":"fake","headersHeight":{},"fullHeight":{},"difficulty":{},"isMining":true}}"#,
            n.height, n.height, n.difficulty
        ),
    )
}

async fn solution_reply(State(state): State<Arc<Mutex<NodeInner>>>, body: Bytes) -> Response {
    let mut n = state.lock();
    n.submit_calls += 1;
    n.last_solution = Some(String::from_utf8_lossy(&body).to_string());

    let status = StatusCode::from_u16(n.submit_status).unwrap();
    if status.is_success() {
        if let Some((header, height)) = n.next_on_accept.take() {
            n.header = header;
            n.height = height;
        }
        return json_response(status, "{}".into());
    }
    let detail = n.submit_detail.clone().unwrap_or_default();
    json_response(status, serde_json::json!({ "detail": detail }).to_string())
}

// ─── Recording storage ───

#[derive(Default)]
pub struct RecordingStorage {
    pub shares: Mutex<Vec<ShareRecord>>,
    pub blocks: Mutex<Vec<BlockRecord>>,
    pub node_states: Mutex<Vec<(String, u64, BigUint)>>,
    /// Order of successful share/block writes
    pub writes: Mutex<Vec<&'static str>>,
    pub report_duplicate: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl RecordingStorage {
    pub fn share_count(&self) -> usize {
        self.shares.lock().len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn set_duplicate(&self, dup: bool) {
        self.report_duplicate.store(dup, Ordering::SeqCst);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ShareStorage for RecordingStorage {
    async fn write_share(&self, share: &ShareRecord) -> Result<bool> {
        self.check()?;
        self.shares.lock().push(share.clone());
        self.writes.lock().push("share");
        Ok(self.report_duplicate.load(Ordering::SeqCst))
    }

    async fn write_block(&self, block: &BlockRecord) -> Result<()> {
        self.check()?;
        self.blocks.lock().push(block.clone());
        self.writes.lock().push("block");
        Ok(())
    }

    async fn write_node_state(&self, name: &str, height: u64, difficulty: &BigUint) -> Result<()> {
        self.check()?;
        self.node_states
            .lock()
            .push((name.to_string(), height, difficulty.clone()));
        Ok(())
    }
}

// ─── Recording policy ───

pub struct RecordingPolicy {
    pub malformed: Mutex<Vec<IpAddr>>,
    pub shares: Mutex<Vec<(IpAddr, bool)>>,
    pub banned: Mutex<HashSet<IpAddr>>,
    pub allow: AtomicBool,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            malformed: Mutex::new(Vec::new()),
            shares: Mutex::new(Vec::new()),
            banned: Mutex::new(HashSet::new()),
            allow: AtomicBool::new(true),
        }
    }
}

impl RecordingPolicy {
    pub fn malformed_count(&self) -> usize {
        self.malformed.lock().len()
    }

    pub fn deny(&self) {
        self.allow.store(false, Ordering::SeqCst);
    }
}

impl Policy for RecordingPolicy {
    fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.lock().contains(&ip)
    }

    fn apply_malformed_policy(&self, ip: IpAddr) {
        self.malformed.lock().push(ip);
    }

    fn apply_share_policy(&self, ip: IpAddr, valid: bool) -> bool {
        self.shares.lock().push((ip, valid));
        self.allow.load(Ordering::SeqCst)
    }
}

// ─── Helpers ───

pub fn config(upstreams: &[&str]) -> Config {
    let upstream: Vec<serde_json::Value> = upstreams
        .iter()
        .enumerate()
        .map(|(i, url)| serde_json::json!({ "name": format!("node{}", i), "url": url, "timeout_secs": 2 }))
        .collect();
    let cfg = serde_json::json!({
        "name": "test-proxy",
        "proxy": {
            "difficulty": 2000000000u64,
            "max_fails": 2,
            "backlog_window": 3,
            "block_refresh_interval_ms": 50,
            "state_update_interval_secs": 1
        },
        "upstream_check_interval_secs": 1,
        "upstream": upstream
    });
    Config::from_json(&cfg.to_string()).unwrap()
}

pub fn solution(msg: Option<&str>) -> Solution {
    let body = match msg {
        Some(m) => format!(
            r#"{{"pk":"0350e25c","w":"0366ea25","n":"0000000409a0ec3b","d":987608143196393228498590745416384101,"msg":"{}"}}"#,
            m
        ),
        None => r#"{"pk":"0350e25c","w":"0366ea25","n":"0000000409a0ec3b","d":987608143196393228498590745416384101}"#.to_string(),
    };
    ergo_proxy::api::protocol::parse_solution(body.as_bytes()).unwrap()
}

pub fn solution_body(msg: &str) -> String {
    format!(
        r#"{{"pk":"0350e25c","w":"0366ea25","n":"0000000409a0ec3b","d":987608143196393228498590745416384101,"msg":"{}"}}"#,
        msg
    )
}

pub fn test_ip() -> IpAddr {
    IpAddr::from([192, 0, 2, 10])
}

/// Minimal HTTP client for exercising the proxy's own router.
pub async fn http(method: &str, url: &str, body: Option<String>, headers: &[(&str, &str)]) -> (StatusCode, axum::http::HeaderMap, String) {
    let client: Client<_, Full<Bytes>> =
        Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
    let mut builder = hyper::Request::builder().method(method).uri(url);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    let req = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), client.request(req))
        .await
        .unwrap()
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).to_string())
}

/// Serve `state` on an ephemeral port, returning its base URL.
pub async fn serve_api(state: ergo_proxy::api::ApiState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        ergo_proxy::api::serve(listener, state, std::future::pending()).await.unwrap();
    });
    format!("http://{}", addr)
}
