//! Envelope lifecycle behavior, driven with in-memory doubles.

mod common;

use std::sync::Arc;
use std::time::Duration;

use argus_core::dto::{DlqRecord, ScrapeJob};
use argus_core::kernel::bus::TestBus;
use argus_core::kernel::cache::MemoryStore;
use argus_core::kernel::dedup::{Deduplicator, LOCK_TTL, PROCESSED_TTL};
use argus_core::kernel::envelope::{
    Disposition, Envelope, HandlerOutcome, StageError, StagePolicy,
};

use common::TestMessage;

use std::sync::atomic::{AtomicBool, Ordering};

const TEST_STAGE: StagePolicy = StagePolicy::new("scraper", "processed_job", 15);

fn setup() -> (Envelope, Arc<Deduplicator>, Arc<TestBus>) {
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());
    let envelope = Envelope::new(TEST_STAGE, Arc::clone(&dedup), bus.clone());
    (envelope, dedup, bus)
}

fn job(id: &str) -> ScrapeJob {
    ScrapeJob {
        video_id: id.to_string(),
        video_url: format!("https://www.tiktok.com/@u/video/{id}"),
        hashtag: "alpha".to_string(),
    }
}

#[tokio::test]
async fn success_marks_processed_then_acks() {
    let (envelope, dedup, _bus) = setup();
    let msg = TestMessage::json(&job("111"), 1);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Ok(HandlerOutcome::Complete) },
        )
        .await;

    assert_eq!(disposition, Disposition::Completed);
    assert!(msg.was_acked());
    assert!(msg.nak_delays().is_empty());
    assert!(dedup.processed("processed_job", "111").await.unwrap());
    // the lock was released
    assert!(dedup.try_lock("111", LOCK_TTL).await.unwrap());
}

#[tokio::test]
async fn duplicate_delivery_is_acked_without_running_handler() {
    let (envelope, dedup, _bus) = setup();
    dedup
        .mark("processed_job", "111", PROCESSED_TTL)
        .await
        .unwrap();

    let ran = AtomicBool::new(false);
    let msg = TestMessage::json(&job("111"), 2);
    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok(HandlerOutcome::Complete)
            },
        )
        .await;

    assert_eq!(disposition, Disposition::Duplicate);
    assert!(msg.was_acked());
    assert!(!ran.load(Ordering::SeqCst), "handler must not run for duplicates");
}

#[tokio::test]
async fn unreadable_metadata_is_acked_and_dropped() {
    let (envelope, _dedup, _bus) = setup();
    let msg = TestMessage::raw(br#"{"video_id":"1","video_url":"u","hashtag":"h"}"#, None);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Ok(HandlerOutcome::Complete) },
        )
        .await;

    assert_eq!(disposition, Disposition::Malformed);
    assert!(msg.was_acked());
}

#[tokio::test]
async fn malformed_payload_is_acked_and_dropped() {
    let (envelope, _dedup, bus) = setup();
    let msg = TestMessage::raw(b"not json at all", Some(1));

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Ok(HandlerOutcome::Complete) },
        )
        .await;

    assert_eq!(disposition, Disposition::Malformed);
    assert!(msg.was_acked());
    assert!(!bus.was_published_with_prefix("argus.dlq."));
}

#[tokio::test]
async fn handler_error_naks_with_exponential_backoff() {
    let (envelope, dedup, _bus) = setup();
    let msg = TestMessage::json(&job("111"), 3);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Err(StageError::Retry(anyhow::anyhow!("browser hung"))) },
        )
        .await;

    // third delivery: 5 * 5^2 = 125s base, plus up to 20% jitter
    let delays = msg.nak_delays();
    assert_eq!(delays.len(), 1);
    assert!(delays[0] >= Duration::from_secs(125));
    assert!(delays[0] <= Duration::from_secs(150));
    assert!(matches!(disposition, Disposition::Retried { .. }));
    assert!(!msg.was_acked());
    assert!(!dedup.processed("processed_job", "111").await.unwrap());
    assert_eq!(dedup.counter("scraper", "failed").await, 1);
}

#[tokio::test]
async fn sixteenth_delivery_goes_to_the_dlq() {
    let (envelope, dedup, bus) = setup();
    let ran = AtomicBool::new(false);
    let msg = TestMessage::json(&job("poison"), 16);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok(HandlerOutcome::Complete)
            },
        )
        .await;

    assert_eq!(disposition, Disposition::DeadLettered);
    assert!(msg.was_acked());
    assert!(!ran.load(Ordering::SeqCst), "handler must not run past the retry budget");

    let dead = bus.messages_for_subject("argus.dlq.scraper");
    assert_eq!(dead.len(), 1);
    let record: DlqRecord = bus.deserialize_message(&dead[0]).unwrap();
    assert_eq!(record.error, "Max retries exceeded");
    assert_eq!(record.metadata.num_delivered, 16);
    assert_eq!(record.job["video_id"], "poison");

    // dead-lettering is not success: no processed marker
    assert!(!dedup.processed("processed_job", "poison").await.unwrap());
}

#[tokio::test]
async fn fifteenth_delivery_still_runs_the_handler() {
    let (envelope, _dedup, bus) = setup();
    let msg = TestMessage::json(&job("edge"), 15);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Ok(HandlerOutcome::Complete) },
        )
        .await;

    assert_eq!(disposition, Disposition::Completed);
    assert!(!bus.was_published_with_prefix("argus.dlq."));
}

#[tokio::test]
async fn dlq_publish_failure_keeps_the_message_in_the_stream() {
    let (envelope, _dedup, bus) = setup();
    bus.fail_subject("argus.dlq.scraper");
    let msg = TestMessage::json(&job("poison"), 16);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Ok(HandlerOutcome::Complete) },
        )
        .await;

    assert!(matches!(disposition, Disposition::Retried { .. }));
    assert!(!msg.was_acked());
    assert_eq!(msg.nak_delays(), vec![Duration::from_secs(60)]);
}

#[tokio::test]
async fn locked_entity_naks_with_jitter() {
    let (envelope, dedup, _bus) = setup();
    // another worker holds the lock
    assert!(dedup.try_lock("777", LOCK_TTL).await.unwrap());

    let ran = AtomicBool::new(false);
    let msg = TestMessage::json(&job("777"), 1);
    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok(HandlerOutcome::Complete)
            },
        )
        .await;

    assert!(!ran.load(Ordering::SeqCst), "handler must not run while the entity is locked");
    let delays = msg.nak_delays();
    assert_eq!(delays.len(), 1);
    assert!(delays[0] >= Duration::from_secs(30));
    assert!(delays[0] < Duration::from_secs(60));
    assert!(matches!(disposition, Disposition::LockBusy { .. }));
    assert!(!msg.was_acked());
}

#[tokio::test]
async fn exactly_one_of_two_concurrent_workers_proceeds() {
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());
    let envelope_a = Envelope::new(TEST_STAGE, Arc::clone(&dedup), bus.clone());
    let envelope_b = Envelope::new(TEST_STAGE, Arc::clone(&dedup), bus.clone());

    let msg_a = TestMessage::json(&job("777"), 1);
    let msg_b = TestMessage::json(&job("777"), 1);

    // Handlers overlap: both hold their critical section at once.
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let run_a = envelope_a.process::<ScrapeJob, _, _, _>(
        &msg_a,
        |j| j.video_id.clone(),
        |_| async {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(HandlerOutcome::Complete)
        },
    );
    let run_b = async {
        let _ = started_rx.await;
        envelope_b
            .process::<ScrapeJob, _, _, _>(
                &msg_b,
                |j| j.video_id.clone(),
                |_| async { Ok(HandlerOutcome::Complete) },
            )
            .await
    };

    let (disp_a, disp_b) = tokio::join!(run_a, run_b);
    assert_eq!(disp_a, Disposition::Completed);
    assert!(matches!(disp_b, Disposition::LockBusy { .. }));
}

#[tokio::test]
async fn rate_limited_handler_naks_exactly_one_minute() {
    let (envelope, dedup, _bus) = setup();
    let msg = TestMessage::json(&job("x"), 2);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Err(StageError::RateLimited("429".into())) },
        )
        .await;

    assert_eq!(
        disposition,
        Disposition::RateLimited {
            delay: Duration::from_secs(60)
        }
    );
    assert_eq!(msg.nak_delays(), vec![Duration::from_secs(60)]);
    // rate limiting is not a handler failure
    assert_eq!(dedup.counter("scraper", "failed").await, 0);
}

#[tokio::test]
async fn discard_acks_without_marking() {
    let (envelope, dedup, _bus) = setup();
    let msg = TestMessage::json(&job("quiet"), 1);

    let disposition = envelope
        .process::<ScrapeJob, _, _, _>(
            &msg,
            |j| j.video_id.clone(),
            |_| async { Ok(HandlerOutcome::Discard) },
        )
        .await;

    assert_eq!(disposition, Disposition::Discarded);
    assert!(msg.was_acked());
    // a later scrape of the same post may still publish
    assert!(!dedup.processed("processed_job", "quiet").await.unwrap());
    assert_eq!(dedup.counter("scraper", "failed").await, 0);
}
