//! Discovery cycle behavior with a scripted listing source.

mod common;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use argus_core::config::DiscoveryConfig;
use argus_core::domains::discovery::source::{DiscoveredPost, ListingSource};
use argus_core::domains::discovery::DiscoveryService;
use argus_core::dto::ScrapeJob;
use argus_core::kernel::bus::{subjects, TestBus};
use argus_core::kernel::cache::MemoryStore;
use argus_core::kernel::dedup::{Deduplicator, PROCESSED_TTL};

struct FixedSource {
    posts: Vec<DiscoveredPost>,
}

#[async_trait]
impl ListingSource for FixedSource {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn fetch(&self, _tag: &str) -> Result<Vec<DiscoveredPost>> {
        Ok(self.posts.clone())
    }
}

struct BrokenSource;

#[async_trait]
impl ListingSource for BrokenSource {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn fetch(&self, _tag: &str) -> Result<Vec<DiscoveredPost>> {
        anyhow::bail!("captcha unresolved on tag listing")
    }
}

fn post(id: &str) -> DiscoveredPost {
    DiscoveredPost {
        id: id.to_string(),
        url: format!("https://www.tiktok.com/@u/video/{id}"),
    }
}

fn config(tags: &[&str]) -> DiscoveryConfig {
    DiscoveryConfig {
        hashtags: tags.iter().map(|t| t.to_string()).collect(),
        interval_seconds: 30,
        workers: 2,
        max_posts: 150,
    }
}

#[tokio::test]
async fn cycle_publishes_new_posts_and_skips_processed_ones() {
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());

    // post 222 was already handled by a scrape worker
    dedup
        .mark("processed_job", "222", PROCESSED_TTL)
        .await
        .unwrap();

    let source = Arc::new(FixedSource {
        posts: vec![post("111"), post("222"), post("333")],
    }) as Arc<dyn ListingSource>;

    let service = DiscoveryService::new(
        vec![source],
        bus.clone(),
        Arc::clone(&dedup),
        config(&["alpha"]),
    );
    service.run_cycle(&CancellationToken::new()).await;

    let jobs = bus.messages_for_subject(subjects::SCRAPE);
    assert_eq!(jobs.len(), 2);
    let first: ScrapeJob = bus.deserialize_message(&jobs[0]).unwrap();
    assert_eq!(first.video_id, "111");
    assert_eq!(first.hashtag, "alpha");
    assert!(first.video_url.ends_with("/video/111"));

    // enqueued + duplicates + failed == total candidates
    assert_eq!(dedup.counter("discovery", "enqueued").await, 2);
    assert_eq!(dedup.counter("discovery", "duplicates").await, 1);
    assert_eq!(dedup.counter("discovery", "failed").await, 0);
}

#[tokio::test]
async fn publish_failures_count_as_failed() {
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());
    bus.fail_subject(subjects::SCRAPE);

    let source = Arc::new(FixedSource {
        posts: vec![post("111"), post("222")],
    }) as Arc<dyn ListingSource>;

    let service = DiscoveryService::new(
        vec![source],
        bus.clone(),
        Arc::clone(&dedup),
        config(&["alpha"]),
    );
    service.run_cycle(&CancellationToken::new()).await;

    assert_eq!(dedup.counter("discovery", "enqueued").await, 0);
    assert_eq!(dedup.counter("discovery", "failed").await, 2);
    assert_eq!(dedup.counter("discovery", "duplicates").await, 0);
}

#[tokio::test]
async fn a_failing_tag_does_not_poison_the_cycle() {
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());

    let service = DiscoveryService::new(
        vec![Arc::new(BrokenSource) as Arc<dyn ListingSource>],
        bus.clone(),
        Arc::clone(&dedup),
        config(&["alpha", "beta"]),
    );
    // must terminate despite every tag failing
    service.run_cycle(&CancellationToken::new()).await;

    assert_eq!(bus.publish_count_for(subjects::SCRAPE), 0);
    assert_eq!(dedup.counter("discovery", "enqueued").await, 0);
}

#[tokio::test]
async fn two_replicas_may_both_publish_the_same_post() {
    // Discovery never sets the processed marker itself; the scrape
    // worker's envelope absorbs the duplicate downstream.
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());

    let make_service = || {
        DiscoveryService::new(
            vec![Arc::new(FixedSource {
                posts: vec![post("777")],
            }) as Arc<dyn ListingSource>],
            bus.clone(),
            Arc::clone(&dedup),
            config(&["alpha"]),
        )
    };

    let replica_a = make_service();
    let replica_b = make_service();
    let token = CancellationToken::new();
    tokio::join!(replica_a.run_cycle(&token), replica_b.run_cycle(&token));

    assert_eq!(bus.publish_count_for(subjects::SCRAPE), 2);
    assert_eq!(dedup.counter("discovery", "enqueued").await, 2);
}
