/// Upstream pool - ordered node list with priority failover
///
/// The first node in configured order that passed the latest health check
/// is active. The primary (index 0) is always preferred; the rest are
/// failover targets only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::node::UpstreamNode;
use crate::config::ConfigError;
use crate::metrics::prometheus as metrics;

/// Index of the node to use given this cycle's health check results.
///
/// Falls back to the primary when nothing is healthy.
pub fn select_active(healthy: &[bool]) -> usize {
    healthy.iter().position(|ok| *ok).unwrap_or(0)
}

pub struct UpstreamPool {
    nodes: Vec<Arc<UpstreamNode>>,
    active: AtomicUsize,
}

impl UpstreamPool {
    pub fn new(nodes: Vec<UpstreamNode>) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }

        for node in &nodes {
            tracing::info!("Upstream: {} => {}", node.name(), node.url());
        }
        tracing::info!("Default upstream: {} => {}", nodes[0].name(), nodes[0].url());

        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            active: AtomicUsize::new(0),
        })
    }

    /// Currently selected node.
    pub fn active(&self) -> Arc<UpstreamNode> {
        self.nodes[self.active_index()].clone()
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn nodes(&self) -> &[Arc<UpstreamNode>] {
        &self.nodes
    }

    /// Check every node in order and switch to the best healthy one.
    ///
    /// Returns the index that is active afterwards.
    pub async fn check(&self) -> usize {
        let mut healthy = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            healthy.push(node.check().await);
        }

        let candidate = select_active(&healthy);
        let previous = self.active.swap(candidate, Ordering::AcqRel);
        if previous != candidate {
            tracing::warn!("🔀 Switching to {} upstream", self.nodes[candidate].name());
            metrics::inc_upstream_switches();
        }
        metrics::set_active_upstream(candidate);

        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_healthy_wins() {
        assert_eq!(select_active(&[true, false, true]), 0);
        assert_eq!(select_active(&[false, false, true]), 2);
        assert_eq!(select_active(&[false, true, true]), 1);
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(UpstreamPool::new(Vec::new()), Err(ConfigError::NoUpstreams)));
    }

    #[test]
    fn test_falls_back_to_primary() {
        assert_eq!(select_active(&[false, false, false]), 0);
        assert_eq!(select_active(&[]), 0);
    }

    #[tokio::test]
    async fn test_all_down_keeps_primary() {
        let pool = UpstreamPool::new(vec![
            UpstreamNode::new("main", "http://127.0.0.1:1", Duration::from_millis(200)),
            UpstreamNode::new("backup", "http://127.0.0.1:2", Duration::from_millis(200)),
        ])
        .unwrap();
        assert_eq!(pool.active().name(), "main");
        assert_eq!(pool.check().await, 0);
        assert_eq!(pool.active_index(), 0);
    }
}
