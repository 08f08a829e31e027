/// Share Processing Pipeline - classification + forwarding + persistence
///
/// Complete flow:
/// 1. Look the referenced header up in the snapshot backlog (stale if absent)
/// 2. Forward the solution to the node
/// 3. On acceptance refresh work
/// 4. Record the share (storage reports duplicates)
/// 5. On acceptance record a block candidate, closing the round
/// 6. Return (duplicate, valid) to the caller

use std::sync::Arc;
use std::time::Duration;

use super::solution::{Solution, Submitter};
use super::storage::{BlockRecord, ShareRecord, ShareStorage};
use crate::blockchain::template_cache::short_header;
use crate::blockchain::{SubmitOutcome, TemplateCache, UpstreamNode, WorkSnapshot};
use crate::metrics::prometheus as metrics;

/// Classification of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShareVerdict {
    pub duplicate: bool,
    pub valid: bool,
}

impl ShareVerdict {
    pub const STALE: ShareVerdict = ShareVerdict { duplicate: false, valid: false };
}

/// Share processor - orchestrates forwarding + storage
pub struct ShareProcessor {
    templates: Arc<TemplateCache>,
    storage: Arc<dyn ShareStorage>,
    share_difficulty: u64,
    hashrate_expiration: Duration,
}

impl ShareProcessor {
    pub fn new(
        templates: Arc<TemplateCache>,
        storage: Arc<dyn ShareStorage>,
        share_difficulty: u64,
        hashrate_expiration: Duration,
    ) -> Self {
        Self {
            templates,
            storage,
            share_difficulty,
            hashrate_expiration,
        }
    }

    pub fn share_difficulty(&self) -> u64 {
        self.share_difficulty
    }

    /// Process one submitted solution (main entry point)
    ///
    /// Validity of the proof of work itself is left to the node; a share
    /// that is not stale and not a duplicate is valid even when the node
    /// rejects it as a block.
    pub async fn process(
        &self,
        submitter: &Submitter,
        snapshot: &WorkSnapshot,
        node: &UpstreamNode,
        solution: &Solution,
    ) -> ShareVerdict {
        let header = solution.msg.as_deref().unwrap_or(&snapshot.header);

        // Step 1: Staleness
        let entry = match snapshot.lookup(header) {
            Some(entry) => entry.clone(),
            None => {
                tracing::info!(
                    "Stale share from {}@{} on {}",
                    submitter.login,
                    submitter.ip,
                    short_header(header)
                );
                metrics::inc_share("stale");
                return ShareVerdict::STALE;
            }
        };

        // Step 2: Forward to the node
        metrics::inc_block_submits();
        let accepted = match node.submit_solution(solution).await {
            Err(e) => {
                tracing::error!(
                    "Block submission failure on {} at height {} for {}: {}",
                    node.name(),
                    entry.height,
                    short_header(header),
                    e
                );
                false
            }
            Ok(SubmitOutcome::Rejected(detail)) => {
                metrics::inc_blocks_rejected();
                tracing::info!(
                    "Block rejected by {} at height {} for {}: {}",
                    node.name(),
                    entry.height,
                    short_header(header),
                    detail
                );
                false
            }
            Ok(SubmitOutcome::Accepted) => {
                metrics::inc_blocks_accepted();
                // A new height is expected now; errors are already logged by the cache
                let _ = self.templates.refresh(node).await;
                true
            }
        };

        // Step 3: Credit the share, before a found block closes the round
        let share = ShareRecord {
            login: submitter.login.clone(),
            worker: submitter.worker.clone(),
            solution: solution.clone(),
            share_difficulty: self.share_difficulty,
            height: entry.height,
            expiration: self.hashrate_expiration,
        };
        let duplicate = match self.storage.write_share(&share).await {
            Ok(duplicate) => duplicate,
            Err(e) => {
                metrics::inc_storage_errors();
                tracing::error!("Failed to insert share data into backend: {}", e);
                false
            }
        };

        // Step 4: Record the block candidate against the work it solved
        if accepted {
            let block = BlockRecord {
                login: submitter.login.clone(),
                worker: submitter.worker.clone(),
                solution: solution.clone(),
                share_difficulty: self.share_difficulty,
                network_difficulty: entry.difficulty.clone(),
                height: entry.height,
                expiration: self.hashrate_expiration,
                header: header.to_string(),
            };
            match self.storage.write_block(&block).await {
                Ok(()) => tracing::info!(
                    "🎉 Block found by miner {}@{} at height {}",
                    submitter.login,
                    submitter.ip,
                    entry.height
                ),
                Err(e) => {
                    metrics::inc_storage_errors();
                    tracing::error!("Failed to insert block candidate into backend: {}", e);
                }
            }
        }

        if duplicate {
            metrics::inc_share("duplicate");
            return ShareVerdict { duplicate: true, valid: false };
        }
        metrics::inc_share("valid");
        ShareVerdict { duplicate: false, valid: true }
    }
}
