/// Gateway - the operations the HTTP layer exposes to miners
///
/// Work fetch and solution submit, independent of routing and sockets.

use num_bigint::BigUint;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;

use super::protocol::{parse_solution, ErrorReply, WorkReply};
use crate::blockchain::{PendingBlock, TemplateCache, UpstreamPool};
use crate::orchestrator::ProxyHealth;
use crate::policy::Policy;
use crate::shares::{ShareProcessor, ShareStorage, Submitter};

/// Result of a solution submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub valid: bool,
    pub error: Option<ErrorReply>,
    /// The submitter exceeded the policy and should be disconnected
    pub close: bool,
}

impl SubmitResult {
    fn rejected(error: ErrorReply) -> Self {
        Self {
            valid: false,
            error: Some(error),
            close: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReply {
    pub name: String,
    pub height: Option<u64>,
    pub header: Option<String>,
    #[serde(rename = "pendingBlock")]
    pub pending_block: Option<PendingBlock>,
    pub upstream: String,
    #[serde(rename = "upstreamIndex")]
    pub upstream_index: usize,
    pub sick: bool,
    pub fails: u64,
}

#[derive(Clone)]
pub struct Gateway {
    pub(crate) name: String,
    pub(crate) templates: Arc<TemplateCache>,
    pub(crate) upstreams: Arc<UpstreamPool>,
    pub(crate) processor: Arc<ShareProcessor>,
    pub(crate) storage: Arc<dyn ShareStorage>,
    pub(crate) policy: Arc<dyn Policy>,
    pub(crate) health: Arc<ProxyHealth>,
    /// Share target derived from the configured difficulty
    pub(crate) target: BigUint,
}

impl Gateway {
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.policy.is_banned(ip)
    }

    pub fn apply_malformed_policy(&self, ip: IpAddr) {
        self.policy.apply_malformed_policy(ip);
    }

    /// Current work for miners.
    pub fn get_work(&self) -> Result<WorkReply, ErrorReply> {
        let snapshot = match self.templates.current() {
            Some(t) if !t.header.is_empty() && !self.health.is_sick() => t,
            _ => return Err(ErrorReply::work_not_ready()),
        };

        Ok(WorkReply {
            msg: snapshot.header.clone(),
            b: self.target.clone(),
            pk: snapshot.seed.clone(),
        })
    }

    /// Handle a solution body from `login`/`worker` at `ip`.
    pub async fn submit(&self, login: &str, worker: &str, ip: IpAddr, body: &[u8]) -> SubmitResult {
        let solution = match parse_solution(body) {
            Ok(solution) => solution,
            Err(e) => {
                tracing::warn!("Malformed request from {}: {}", ip, e);
                self.policy.apply_malformed_policy(ip);
                return SubmitResult::rejected(ErrorReply::malformed());
            }
        };

        let Some(snapshot) = self.templates.current() else {
            return SubmitResult::rejected(ErrorReply::work_not_ready());
        };

        let submitter = Submitter {
            login: login.to_string(),
            worker: worker.to_string(),
            ip: ip.to_string(),
        };
        let node = self.upstreams.active();
        let verdict = self.processor.process(&submitter, &snapshot, &node, &solution).await;
        let ok = self
            .policy
            .apply_share_policy(ip, !verdict.duplicate && verdict.valid);

        if verdict.duplicate {
            tracing::info!("Duplicate share from {}@{}", login, ip);
            return SubmitResult {
                valid: false,
                error: Some(ErrorReply::duplicate_share()),
                close: !ok,
            };
        }

        if !verdict.valid {
            tracing::info!("Invalid share from {}@{}", login, ip);
            return SubmitResult {
                valid: false,
                error: (!ok).then(ErrorReply::invalid_share),
                close: !ok,
            };
        }

        tracing::info!("Valid share from {}@{}", login, ip);
        SubmitResult {
            valid: true,
            error: (!ok).then(ErrorReply::rate_limited),
            close: !ok,
        }
    }

    pub fn pending_block(&self) -> Option<PendingBlock> {
        self.templates.current().map(|t| t.pending_block.clone())
    }

    pub fn status(&self) -> StatusReply {
        let snapshot = self.templates.current();
        let active = self.upstreams.active();
        StatusReply {
            name: self.name.clone(),
            height: snapshot.as_ref().map(|t| t.height),
            header: snapshot.as_ref().map(|t| t.header.clone()),
            pending_block: snapshot.as_ref().map(|t| t.pending_block.clone()),
            upstream: active.name().to_string(),
            upstream_index: self.upstreams.active_index(),
            sick: self.health.is_sick(),
            fails: self.health.fails(),
        }
    }

    /// Storage reachability.
    pub async fn storage_ok(&self) -> bool {
        self.storage.ping().await.is_ok()
    }
}
