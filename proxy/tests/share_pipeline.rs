mod common;

use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeNode, RecordingStorage};
use ergo_proxy::blockchain::{TemplateCache, UpstreamNode};
use ergo_proxy::shares::{ShareProcessor, ShareVerdict, Submitter};

const SHARE_DIFF: u64 = 2_000_000_000;

struct Pipeline {
    fake: FakeNode,
    node: UpstreamNode,
    cache: Arc<TemplateCache>,
    storage: Arc<RecordingStorage>,
    processor: ShareProcessor,
}

async fn pipeline(header: &str, height: u64) -> Pipeline {
    let fake = FakeNode::start(header, height).await;
    let node = UpstreamNode::new("main", fake.url.clone(), Duration::from_secs(2));
    let cache = Arc::new(TemplateCache::new(SHARE_DIFF, 3));
    cache.refresh(&node).await.unwrap();

    let storage = Arc::new(RecordingStorage::default());
    let processor = ShareProcessor::new(
        cache.clone(),
        storage.clone(),
        SHARE_DIFF,
        Duration::from_secs(10800),
    );
    Pipeline { fake, node, cache, storage, processor }
}

fn submitter() -> Submitter {
    Submitter {
        login: common::LOGIN.to_string(),
        worker: "rig1".to_string(),
        ip: "192.0.2.10".to_string(),
    }
}

#[tokio::test]
async fn test_stale_share_makes_no_calls() {
    let p = pipeline("current", 500).await;
    let snapshot = p.cache.current().unwrap();

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(Some("long-gone")))
        .await;

    assert_eq!(verdict, ShareVerdict::STALE);
    assert_eq!(p.fake.snapshot().submit_calls, 0);
    assert_eq!(p.storage.share_count(), 0);
    assert_eq!(p.storage.block_count(), 0);
}

#[tokio::test]
async fn test_accepted_solution_records_block_and_refreshes() {
    let p = pipeline("H", 500).await;
    p.fake.with(|n| n.next_on_accept = Some(("H-next".to_string(), 501)));
    let snapshot = p.cache.current().unwrap();

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(Some("H")))
        .await;
    assert_eq!(verdict, ShareVerdict { duplicate: false, valid: true });

    // Refreshed before returning
    let current = p.cache.current().unwrap();
    assert_eq!(current.header, "H-next");
    assert_eq!(current.height, 501);

    let blocks = p.storage.blocks.lock();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].height, 500);
    assert_eq!(
        blocks[0].network_difficulty,
        BigUint::parse_bytes(b"1234567890123456789012345", 10).unwrap()
    );
    assert_eq!(blocks[0].header, "H");
    assert_eq!(blocks[0].share_difficulty, SHARE_DIFF);
    assert_eq!(blocks[0].worker, "rig1");

    let shares = p.storage.shares.lock();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].height, 500);
    assert_eq!(shares[0].expiration, Duration::from_secs(10800));

    // The winning share lands in the round the block closes
    assert_eq!(*p.storage.writes.lock(), vec!["share", "block"]);

    // The node received the solution without the header reference
    let sent = p.fake.snapshot().last_solution.unwrap();
    assert!(sent.contains(r#""d":987608143196393228498590745416384101"#));
    assert!(!sent.contains("msg"));
    let sent: serde_json::Value = serde_json::from_str(&sent).unwrap();
    assert_eq!(sent["n"], "0000000409a0ec3b");
    assert_eq!(sent["w"], "0366ea25");
}

#[tokio::test]
async fn test_rejected_solution_still_credits_share() {
    let p = pipeline("H", 500).await;
    p.fake.with(|n| {
        n.submit_status = 400;
        n.submit_detail = Some("Invalid solution".to_string());
    });
    let snapshot = p.cache.current().unwrap();

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(None))
        .await;

    assert_eq!(verdict, ShareVerdict { duplicate: false, valid: true });
    assert_eq!(p.storage.block_count(), 0);
    assert_eq!(p.storage.share_count(), 1);
    // A rejection is a working node
    assert_eq!(p.node.health().failures(), 0);
}

#[tokio::test]
async fn test_transport_failure_is_not_invalid() {
    let p = pipeline("H", 500).await;
    let snapshot = p.cache.current().unwrap();
    let dead = UpstreamNode::new("dead", "http://127.0.0.1:1", Duration::from_millis(300));

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &dead, &common::solution(Some("H")))
        .await;

    assert_eq!(verdict, ShareVerdict { duplicate: false, valid: true });
    assert_eq!(p.storage.block_count(), 0);
    assert_eq!(p.storage.share_count(), 1);
    assert_eq!(dead.health().failures(), 1);
}

#[tokio::test]
async fn test_duplicate_reported_by_storage() {
    let p = pipeline("H", 500).await;
    p.fake.with(|n| n.submit_status = 400);
    p.storage.set_duplicate(true);
    let snapshot = p.cache.current().unwrap();

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(Some("H")))
        .await;

    assert_eq!(verdict, ShareVerdict { duplicate: true, valid: false });
    // Forwarded before the duplicate was known
    assert_eq!(p.fake.snapshot().submit_calls, 1);
}

#[tokio::test]
async fn test_storage_failure_is_not_fatal() {
    let p = pipeline("H", 500).await;
    p.storage.set_failing(true);
    let snapshot = p.cache.current().unwrap();

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(Some("H")))
        .await;

    assert_eq!(verdict, ShareVerdict { duplicate: false, valid: true });
    assert_eq!(p.storage.share_count(), 0);
    assert_eq!(p.storage.block_count(), 0);
}

#[tokio::test]
async fn test_recent_header_within_window_accepted() {
    let p = pipeline("hdr-100", 100).await;
    p.fake.set_work("hdr-101", 101);
    p.cache.refresh(&p.node).await.unwrap();
    p.fake.with(|n| n.submit_status = 400);
    let snapshot = p.cache.current().unwrap();

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(Some("hdr-100")))
        .await;

    assert!(verdict.valid);
    assert_eq!(p.storage.shares.lock()[0].height, 100);
}

#[tokio::test]
async fn test_block_on_backlog_header_keeps_its_own_work() {
    let p = pipeline("hdr-100", 100).await;
    p.fake.with(|n| n.difficulty = "777".to_string());
    p.fake.set_work("hdr-101", 101);
    p.cache.refresh(&p.node).await.unwrap();
    let snapshot = p.cache.current().unwrap();
    assert_eq!(snapshot.header, "hdr-101");

    let verdict = p
        .processor
        .process(&submitter(), &snapshot, &p.node, &common::solution(Some("hdr-100")))
        .await;
    assert!(verdict.valid);

    let blocks = p.storage.blocks.lock();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].header, "hdr-100");
    assert_eq!(blocks[0].height, 100);
    assert_eq!(
        blocks[0].network_difficulty,
        BigUint::parse_bytes(b"1234567890123456789012345", 10).unwrap()
    );
}
