/// Upstream node client - Communication with one Ergo node
///
/// Speaks the node's mining REST API (`/mining/candidate`, `/info`,
/// `/mining/solution`) and keeps per-node health with hysteresis so a
/// couple of transient errors never flip the node's state.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use num_bigint::BigUint;
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;

use crate::metrics::prometheus as metrics;
use crate::shares::Solution;

/// Consecutive identical outcomes required to flip health state.
pub const HEALTH_THRESHOLD: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("missing or invalid field `{0}` in node reply")]
    Field(&'static str),
}

/// Health bookkeeping for one node.
///
/// Failures reset the success streak; successes do not reset the failure
/// streak until the node has fully recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthState {
    sick: bool,
    successes: u32,
    failures: u32,
}

impl HealthState {
    pub fn is_sick(&self) -> bool {
        self.sick
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns true when this failure turned a healthy node sick.
    pub fn record_failure(&mut self) -> bool {
        self.successes = 0;
        self.failures = self.failures.saturating_add(1);
        if self.failures >= HEALTH_THRESHOLD && !self.sick {
            self.sick = true;
            return true;
        }
        false
    }

    /// Returns true when this success brought a sick node back.
    pub fn record_success(&mut self) -> bool {
        self.successes = self.successes.saturating_add(1);
        if self.successes >= HEALTH_THRESHOLD {
            let recovered = self.sick;
            self.sick = false;
            self.successes = 0;
            self.failures = 0;
            return recovered;
        }
        false
    }
}

/// Reply of `GET /mining/candidate`.
#[derive(Debug, Clone)]
pub struct CandidateReply {
    /// Header message to mine on, used as the work key
    pub msg: String,
    /// Node-side target `b`
    pub target: BigUint,
    /// Seed / public key material
    pub pk: String,
}

#[derive(Deserialize)]
struct RawCandidate {
    msg: Option<String>,
    b: Option<Box<RawValue>>,
    pk: Option<String>,
}

/// The parts of `GET /info` the proxy cares about.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub height: u64,
    pub difficulty: BigUint,
}

#[derive(Deserialize)]
struct RawInfo {
    #[serde(rename = "headersHeight")]
    headers_height: Option<u64>,
    difficulty: Option<Box<RawValue>>,
}

/// What the node said about a submitted solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

#[derive(Serialize)]
struct SolutionBody<'a> {
    pk: &'a str,
    w: &'a str,
    n: &'a str,
    d: &'a RawValue,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    detail: Option<String>,
}

/// Parse a JSON numeral that may exceed 64 bits.
///
/// Integers are taken exactly; anything else (fractions, exponents) goes
/// through f64 and is truncated.
pub fn parse_numeral(raw: &str) -> Option<BigUint> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return BigUint::parse_bytes(raw.as_bytes(), 10);
    }
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    BigUint::from_f64(value.trunc())
}

pub struct UpstreamNode {
    name: String,
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    health: Mutex<HealthState>,
}

impl UpstreamNode {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        let url: String = url.into();

        Self {
            name: name.into(),
            url: url.trim_end_matches('/').to_string(),
            timeout,
            client,
            health: Mutex::new(HealthState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Copy of the current health bookkeeping.
    pub fn health(&self) -> HealthState {
        *self.health.lock()
    }

    pub fn is_sick(&self) -> bool {
        self.health.lock().is_sick()
    }

    fn mark_sick(&self) {
        let tripped = self.health.lock().record_failure();
        if tripped {
            tracing::warn!("🔌 Upstream {} marked sick after {} failures", self.name, HEALTH_THRESHOLD);
        }
    }

    fn mark_alive(&self) {
        let recovered = self.health.lock().record_success();
        if recovered {
            tracing::info!("✅ Upstream {} recovered", self.name);
        }
    }

    /// Fetch current work.
    pub async fn get_work(&self) -> Result<CandidateReply, NodeError> {
        let result = self
            .get("/mining/candidate")
            .await
            .and_then(|body| Self::decode_candidate(&body));
        self.track(result)
    }

    /// Fetch chain height and network difficulty.
    pub async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        let result = self
            .get("/info")
            .await
            .and_then(|body| Self::decode_info(&body));
        self.track(result)
    }

    /// Forward a solution to the node.
    ///
    /// A non-2xx answer is the node rejecting the solution, not a failure
    /// of the node itself.
    pub async fn submit_solution(&self, solution: &Solution) -> Result<SubmitOutcome, NodeError> {
        let payload = SolutionBody {
            pk: &solution.pk,
            w: &solution.w,
            n: &solution.n,
            d: &solution.d,
        };
        let body = serde_json::to_vec(&payload)?;
        let sent = self.send(Method::POST, "/mining/solution", Bytes::from(body)).await;
        let (status, reply) = self.track(sent)?;

        if status.is_success() {
            return Ok(SubmitOutcome::Accepted);
        }
        Ok(SubmitOutcome::Rejected(Self::detail(status, &reply)))
    }

    /// Used by the health check: a lightweight work fetch.
    ///
    /// Healthy means the health check succeeded and the node is not sick.
    pub async fn check(&self) -> bool {
        match self.get_work().await {
            Ok(_) => !self.is_sick(),
            Err(e) => {
                tracing::warn!("Health check failed on {}: {}", self.name, e);
                false
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Bytes, NodeError> {
        let (status, body) = self.send(Method::GET, path, Bytes::new()).await?;
        if !status.is_success() {
            return Err(NodeError::Status {
                status: status.as_u16(),
                detail: Self::detail(status, &body),
            });
        }
        Ok(body)
    }

    /// Record the outcome of one call in the node's health state.
    fn track<T>(&self, result: Result<T, NodeError>) -> Result<T, NodeError> {
        match &result {
            Ok(_) => self.mark_alive(),
            Err(_) => {
                metrics::inc_node_errors();
                self.mark_sick();
            }
        }
        result
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), NodeError> {
        metrics::inc_node_requests();

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.url, path))
            .header("Accept", "application/json");
        if !body.is_empty() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder
            .body(Full::new(body))
            .map_err(|e| NodeError::Request(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| NodeError::Connection(e.to_string()))?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, NodeError>((status, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| NodeError::Timeout(self.timeout))?
    }

    fn decode_candidate(body: &[u8]) -> Result<CandidateReply, NodeError> {
        let raw: RawCandidate = serde_json::from_slice(body)?;
        let msg = raw.msg.filter(|m| !m.is_empty()).ok_or(NodeError::Field("msg"))?;
        let target = raw
            .b
            .as_deref()
            .and_then(|b| parse_numeral(b.get()))
            .ok_or(NodeError::Field("b"))?;
        let pk = raw.pk.ok_or(NodeError::Field("pk"))?;
        Ok(CandidateReply { msg, target, pk })
    }

    fn decode_info(body: &[u8]) -> Result<NodeInfo, NodeError> {
        let raw: RawInfo = serde_json::from_slice(body)?;
        let height = raw.headers_height.ok_or(NodeError::Field("headersHeight"))?;
        let difficulty = raw
            .difficulty
            .as_deref()
            .and_then(|d| parse_numeral(d.get()))
            .ok_or(NodeError::Field("difficulty"))?;
        Ok(NodeInfo { height, difficulty })
    }

    fn detail(status: StatusCode, body: &[u8]) -> String {
        serde_json::from_slice::<ErrorDetail>(body)
            .ok()
            .and_then(|e| e.detail)
            .unwrap_or_else(|| status.to_string())
    }
}

impl std::fmt::Debug for UpstreamNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamNode")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .field("health", &self.health())
            .finish()
    }
}
