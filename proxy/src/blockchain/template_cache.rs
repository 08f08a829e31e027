/// Work template cache - the single authoritative snapshot of minable work
///
/// Snapshots are immutable once published. A refresh builds a complete new
/// snapshot off to the side (carrying the recent-header backlog forward)
/// and swaps it in atomically, so readers never block and never see a
/// half-built snapshot.

use arc_swap::ArcSwapOption;
use num_bigint::BigUint;
use num_traits::One;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::node::{CandidateReply, NodeError, NodeInfo, UpstreamNode};
use crate::metrics::prometheus as metrics;

/// Share target advertised to miners: `(2^256 - 1) / difficulty`.
pub fn target_from_difficulty(difficulty: u64) -> BigUint {
    let max = (BigUint::one() << 256u32) - BigUint::one();
    max / BigUint::from(difficulty.max(1))
}

/// First few characters of a header for log lines.
pub fn short_header(header: &str) -> &str {
    header.get(..10).unwrap_or(header)
}

/// Difficulty and height a header was published at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    pub difficulty: BigUint,
    pub height: u64,
}

/// Pre-rendered summary of the block being mined.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PendingBlock {
    pub number: String,
    pub difficulty: String,
}

#[derive(Debug, Clone)]
pub struct WorkSnapshot {
    pub header: String,
    pub seed: String,
    /// Target `b` as the node reported it
    pub node_target: BigUint,
    pub difficulty: BigUint,
    pub height: u64,
    pub pending_block: PendingBlock,
    backlog: HashMap<String, BacklogEntry>,
}

impl WorkSnapshot {
    /// Build the successor of `previous` from fresh node state.
    ///
    /// Every prior backlog entry with `height > new_height - window` is
    /// carried forward; the new header is always present.
    pub fn build(
        previous: Option<&WorkSnapshot>,
        work: CandidateReply,
        info: NodeInfo,
        share_difficulty: u64,
        backlog_window: u64,
    ) -> Self {
        let height = info.height;
        let mut backlog = HashMap::new();
        backlog.insert(
            work.msg.clone(),
            BacklogEntry {
                difficulty: info.difficulty.clone(),
                height,
            },
        );

        if let Some(prev) = previous {
            for (header, entry) in &prev.backlog {
                if entry.height.saturating_add(backlog_window) > height {
                    backlog.entry(header.clone()).or_insert_with(|| entry.clone());
                }
            }
        }

        Self {
            header: work.msg,
            seed: work.pk,
            node_target: work.target,
            difficulty: info.difficulty,
            height,
            pending_block: PendingBlock {
                number: format!("0x{:x}", height),
                difficulty: format!("0x{:x}", share_difficulty),
            },
            backlog,
        }
    }

    /// Backlog entry for `header`; `None` means stale or unknown.
    pub fn lookup(&self, header: &str) -> Option<&BacklogEntry> {
        self.backlog.get(header)
    }

    pub fn backlog(&self) -> impl Iterator<Item = (&str, &BacklogEntry)> {
        self.backlog.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Published(Arc<WorkSnapshot>),
    Unchanged,
}

pub struct TemplateCache {
    current: ArcSwapOption<WorkSnapshot>,
    publish_gate: Mutex<()>,
    generation: AtomicU64,
    share_difficulty: u64,
    backlog_window: u64,
}

impl TemplateCache {
    pub fn new(share_difficulty: u64, backlog_window: u64) -> Self {
        tracing::info!(
            "TemplateCache: share_difficulty={}, backlog_window={}",
            share_difficulty,
            backlog_window
        );

        Self {
            current: ArcSwapOption::empty(),
            publish_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            share_difficulty,
            backlog_window,
        }
    }

    /// Latest published snapshot, if any refresh ever succeeded.
    pub fn current(&self) -> Option<Arc<WorkSnapshot>> {
        self.current.load_full()
    }

    /// Backlog entry for `header` in the current snapshot.
    pub fn lookup(&self, header: &str) -> Option<BacklogEntry> {
        self.current.load().as_ref()?.lookup(header).cloned()
    }

    /// Number of snapshots published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn backlog_window(&self) -> u64 {
        self.backlog_window
    }

    /// Pull fresh work from `node` and publish it if the header moved.
    ///
    /// On node failure the current snapshot stays in place.
    pub async fn refresh(&self, node: &UpstreamNode) -> Result<RefreshOutcome, NodeError> {
        let fetched = async {
            let work = node.get_work().await?;
            if self.is_current(&work.msg) {
                return Ok(None);
            }
            let info = node.get_info().await?;
            Ok(Some((work, info)))
        }
        .await;

        let (work, info) = match fetched {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return Ok(RefreshOutcome::Unchanged),
            Err(e) => {
                metrics::inc_template_fetch_errors();
                tracing::error!("Error while refreshing block template on {}: {}", node.name(), e);
                return Err(e);
            }
        };

        match self.publish(work, info) {
            Some(snapshot) => {
                tracing::info!(
                    "📋 New block to mine on {} at height {} / {}",
                    node.name(),
                    snapshot.height,
                    short_header(&snapshot.header)
                );
                metrics::set_template_height(snapshot.height);
                metrics::inc_template_updates();
                Ok(RefreshOutcome::Published(snapshot))
            }
            None => Ok(RefreshOutcome::Unchanged),
        }
    }

    fn is_current(&self, header: &str) -> bool {
        self.current
            .load()
            .as_ref()
            .map(|t| t.header == header)
            .unwrap_or(false)
    }

    /// Build and swap in a successor snapshot.
    ///
    /// Writers are serialized so concurrent refreshes never drop each
    /// other's backlog entries; readers are never blocked.
    fn publish(&self, work: CandidateReply, info: NodeInfo) -> Option<Arc<WorkSnapshot>> {
        let _gate = self.publish_gate.lock();

        let previous = self.current.load_full();
        if previous.as_ref().map(|t| t.header == work.msg).unwrap_or(false) {
            return None;
        }

        let snapshot = Arc::new(WorkSnapshot::build(
            previous.as_deref(),
            work,
            info,
            self.share_difficulty,
            self.backlog_window,
        ));
        self.current.store(Some(snapshot.clone()));
        self.generation.fetch_add(1, Ordering::AcqRel);

        Some(snapshot)
    }
}
