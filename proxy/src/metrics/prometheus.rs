use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static NODE_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static NODE_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_SWITCHES: OnceLock<IntCounter> = OnceLock::new();

static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCK_SUBMITS: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_REJECTED: OnceLock<IntCounter> = OnceLock::new();

static MALFORMED_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static BANS: OnceLock<IntCounter> = OnceLock::new();
static STORAGE_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_UPSTREAM: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static PROXY_SICK: OnceLock<IntGauge> = OnceLock::new();

const SHARE_STATUSES: [&str; 3] = ["valid", "stale", "duplicate"];

// Names and help strings below are static, so construction cannot fail.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static counter definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("static gauge definition")
}

fn node_requests() -> &'static IntCounter {
    NODE_REQUESTS.get_or_init(|| counter("node_requests_total", "Total HTTP requests to upstream nodes"))
}

fn node_errors() -> &'static IntCounter {
    NODE_ERRORS.get_or_init(|| counter("node_errors_total", "Total failed upstream node requests"))
}

fn upstream_switches() -> &'static IntCounter {
    UPSTREAM_SWITCHES.get_or_init(|| counter("upstream_switches_total", "Total active upstream changes"))
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES
        .get_or_init(|| counter("block_template_updates_total", "Total work snapshots published"))
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        counter(
            "block_template_fetch_errors_total",
            "Total failed work refreshes",
        )
    })
}

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        let vec = IntCounterVec::new(
            Opts::new("shares_total", "Processed shares by outcome"),
            &["status"],
        )
        .expect("static counter vec definition");
        // An empty family fails text encoding
        for status in SHARE_STATUSES {
            vec.with_label_values(&[status]);
        }
        vec
    })
}

fn block_submits() -> &'static IntCounter {
    BLOCK_SUBMITS.get_or_init(|| counter("block_submit_attempts_total", "Total solutions forwarded to a node"))
}

fn blocks_accepted() -> &'static IntCounter {
    BLOCKS_ACCEPTED.get_or_init(|| counter("blocks_accepted_total", "Total block candidates accepted by a node"))
}

fn blocks_rejected() -> &'static IntCounter {
    BLOCKS_REJECTED.get_or_init(|| counter("blocks_rejected_total", "Total solutions rejected by a node"))
}

fn malformed_requests() -> &'static IntCounter {
    MALFORMED_REQUESTS.get_or_init(|| counter("malformed_requests_total", "Total malformed miner requests"))
}

fn bans() -> &'static IntCounter {
    BANS.get_or_init(|| counter("policy_bans_total", "Total IP bans issued"))
}

fn storage_errors() -> &'static IntCounter {
    STORAGE_ERRORS.get_or_init(|| counter("storage_errors_total", "Total storage operation errors"))
}

fn active_upstream() -> &'static IntGauge {
    ACTIVE_UPSTREAM.get_or_init(|| gauge("active_upstream_index", "Index of the active upstream node"))
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| gauge("block_template_height", "Height of the current work snapshot"))
}

fn proxy_sick() -> &'static IntGauge {
    PROXY_SICK.get_or_init(|| gauge("proxy_sick", "Proxy health gate closed (1/0)"))
}

pub fn inc_node_requests() {
    node_requests().inc();
}

pub fn inc_node_errors() {
    node_errors().inc();
}

pub fn inc_upstream_switches() {
    upstream_switches().inc();
}

pub fn set_active_upstream(index: usize) {
    active_upstream().set(index as i64);
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

/// `status` is one of `valid`, `stale`, `duplicate`.
pub fn inc_share(status: &str) {
    shares().with_label_values(&[status]).inc();
}

pub fn inc_block_submits() {
    block_submits().inc();
}

pub fn inc_blocks_accepted() {
    blocks_accepted().inc();
}

pub fn inc_blocks_rejected() {
    blocks_rejected().inc();
}

pub fn inc_malformed() {
    malformed_requests().inc();
}

pub fn inc_bans() {
    bans().inc();
}

pub fn inc_storage_errors() {
    storage_errors().inc();
}

pub fn set_proxy_sick(sick: bool) {
    proxy_sick().set(if sick { 1 } else { 0 });
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(node_requests().collect());
    mfs.extend(node_errors().collect());
    mfs.extend(upstream_switches().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(shares().collect());
    mfs.extend(block_submits().collect());
    mfs.extend(blocks_accepted().collect());
    mfs.extend(blocks_rejected().collect());
    mfs.extend(malformed_requests().collect());
    mfs.extend(bans().collect());
    mfs.extend(storage_errors().collect());
    mfs.extend(active_upstream().collect());
    mfs.extend(template_height().collect());
    mfs.extend(proxy_sick().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_families() {
        inc_share("valid");
        inc_node_requests();
        set_template_height(42);

        let text = render();
        assert!(text.contains("shares_total"));
        assert!(text.contains("status=\"valid\""));
        assert!(text.contains("node_requests_total"));
        assert!(text.contains("block_template_height"));
    }

    #[test]
    fn test_render_includes_families_after_shares() {
        let text = render();
        assert!(text.contains("status=\"duplicate\""));
        assert!(!text.contains("status=\"invalid\""));
        assert!(text.contains("proxy_sick"));
    }
}
