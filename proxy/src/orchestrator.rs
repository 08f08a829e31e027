/// Orchestrator - wiring and periodic background tasks
///
/// Three independent loops run alongside request handling:
/// - template refresh from the active upstream
/// - upstream health check and failover
/// - node state publication (drives the proxy health gate)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::api::Gateway;
use crate::blockchain::template_cache::target_from_difficulty;
use crate::blockchain::{RefreshOutcome, TemplateCache, UpstreamNode, UpstreamPool};
use crate::config::{Config, ConfigError};
use crate::metrics::prometheus as metrics;
use crate::policy::Policy;
use crate::shares::{ShareProcessor, ShareStorage};

/// Consecutive state-publication failures, gating work handout.
#[derive(Debug)]
pub struct ProxyHealth {
    fails: AtomicU64,
    enabled: bool,
    max_fails: u64,
}

impl ProxyHealth {
    pub fn new(enabled: bool, max_fails: u64) -> Self {
        Self {
            fails: AtomicU64::new(0),
            enabled,
            max_fails,
        }
    }

    pub fn mark_sick(&self) {
        let fails = self.fails.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_proxy_sick(self.enabled && fails >= self.max_fails);
    }

    pub fn mark_ok(&self) {
        self.fails.store(0, Ordering::Release);
        metrics::set_proxy_sick(false);
    }

    pub fn is_sick(&self) -> bool {
        self.enabled && self.fails.load(Ordering::Acquire) >= self.max_fails
    }

    pub fn fails(&self) -> u64 {
        self.fails.load(Ordering::Acquire)
    }
}

/// Handles of the spawned loops; aborted on drop.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

pub struct Orchestrator {
    config: Config,
    upstreams: Arc<UpstreamPool>,
    templates: Arc<TemplateCache>,
    processor: Arc<ShareProcessor>,
    storage: Arc<dyn ShareStorage>,
    policy: Arc<dyn Policy>,
    health: Arc<ProxyHealth>,
}

impl Orchestrator {
    /// Build every component from a validated config.
    pub fn new(
        config: Config,
        storage: Arc<dyn ShareStorage>,
        policy: Arc<dyn Policy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let nodes = config
            .upstream
            .iter()
            .map(|u| UpstreamNode::new(u.name.clone(), u.url.clone(), u.timeout()))
            .collect();
        let upstreams = Arc::new(UpstreamPool::new(nodes)?);
        let templates = Arc::new(TemplateCache::new(
            config.proxy.difficulty,
            config.proxy.backlog_window,
        ));
        let processor = Arc::new(ShareProcessor::new(
            templates.clone(),
            storage.clone(),
            config.proxy.difficulty,
            config.proxy.hashrate_expiration(),
        ));
        let health = Arc::new(ProxyHealth::new(
            config.proxy.health_check,
            config.proxy.max_fails,
        ));

        Ok(Self {
            config,
            upstreams,
            templates,
            processor,
            storage,
            policy,
            health,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn upstreams(&self) -> &Arc<UpstreamPool> {
        &self.upstreams
    }

    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    pub fn health(&self) -> &Arc<ProxyHealth> {
        &self.health
    }

    /// Request-facing surface sharing this orchestrator's components.
    pub fn gateway(&self) -> Gateway {
        Gateway {
            name: self.config.name.clone(),
            templates: self.templates.clone(),
            upstreams: self.upstreams.clone(),
            processor: self.processor.clone(),
            storage: self.storage.clone(),
            policy: self.policy.clone(),
            health: self.health.clone(),
            target: target_from_difficulty(self.config.proxy.difficulty),
        }
    }

    /// Refresh work from the active upstream.
    pub async fn refresh_template(&self) -> Option<RefreshOutcome> {
        let node = self.upstreams.active();
        self.templates.refresh(&node).await.ok()
    }

    /// Check all upstreams and update the active one.
    pub async fn check_upstreams(&self) -> usize {
        self.upstreams.check().await
    }

    /// Publish the current snapshot's height and difficulty to storage.
    ///
    /// Does nothing until a snapshot exists.
    pub async fn publish_state(&self) {
        let Some(snapshot) = self.templates.current() else {
            return;
        };
        match self
            .storage
            .write_node_state(&self.config.name, snapshot.height, &snapshot.difficulty)
            .await
        {
            Ok(()) => self.health.mark_ok(),
            Err(e) => {
                metrics::inc_storage_errors();
                tracing::error!("Failed to write node state to backend: {}", e);
                self.health.mark_sick();
            }
        }
        self.policy.cleanup();
    }

    /// Initial refresh, then spawn the periodic loops.
    pub async fn start(self: &Arc<Self>) -> BackgroundTasks {
        self.refresh_template().await;

        let refresh_every = self.config.proxy.block_refresh_interval();
        let check_every = self.config.upstream_check_interval();
        let state_every = self.config.proxy.state_update_interval();
        tracing::info!("Set block refresh every {:?}", refresh_every);

        let mut handles = Vec::with_capacity(3);

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = delayed(refresh_every);
            loop {
                ticker.tick().await;
                this.refresh_template().await;
            }
        }));

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = delayed(check_every);
            loop {
                ticker.tick().await;
                this.check_upstreams().await;
            }
        }));

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = delayed(state_every);
            loop {
                ticker.tick().await;
                this.publish_state().await;
            }
        }));

        BackgroundTasks { handles }
    }
}

/// Ticker whose first tick is one period from now. `period` must be non-zero.
fn delayed(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
