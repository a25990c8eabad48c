//! Enricher flow against in-memory doubles and a scripted directory.

mod common;

use std::sync::Arc;

use argus_core::domains::enrichment::{EnrichHandler, DIRECTORY_SERVICE, STAGE};
use argus_core::dto::InviteEnrichJob;
use argus_core::kernel::bus::TestBus;
use argus_core::kernel::cache::MemoryStore;
use argus_core::kernel::dedup::Deduplicator;
use argus_core::kernel::envelope::{Disposition, Envelope, HandlerOutcome, StageError};
use argus_core::repository::{ArtifactStore, MemoryArtifactStore, NewArtifact};
use argus_core::search::{MemorySearchIndex, SearchDoc, SearchIndex};
use directory_client::DirectoryError;

use common::{invite, ScriptedProvider, TestMessage};

struct Setup {
    envelope: Envelope,
    handler: EnrichHandler,
    dedup: Arc<Deduplicator>,
    repo: Arc<MemoryArtifactStore>,
    search: Arc<MemorySearchIndex>,
    provider: Arc<ScriptedProvider>,
}

fn setup(responses: Vec<Result<directory_client::InviteInfo, DirectoryError>>) -> Setup {
    let dedup = Arc::new(Deduplicator::new(Arc::new(MemoryStore::new())));
    let bus = Arc::new(TestBus::new());
    let repo = Arc::new(MemoryArtifactStore::new());
    let search = Arc::new(MemorySearchIndex::new());
    let provider = Arc::new(ScriptedProvider::new(responses));
    Setup {
        envelope: Envelope::new(STAGE, Arc::clone(&dedup), bus),
        handler: EnrichHandler::new(
            Arc::clone(&dedup),
            repo.clone() as Arc<dyn ArtifactStore>,
            search.clone() as Arc<dyn SearchIndex>,
            provider.clone(),
        ),
        dedup,
        repo,
        search,
        provider,
    }
}

async fn seed_rows(repo: &MemoryArtifactStore, code: &str, urls: &[&str]) {
    for url in urls {
        repo.upsert_shallow(NewArtifact {
            source_url: url.to_string(),
            author_id: "creator".into(),
            invite_code: code.to_string(),
            raw_text: "text".into(),
            risk_score: 0,
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn happy_path_completes_rows_and_document() {
    let s = setup(vec![Ok(invite("abc", "Alpha", 42))]);
    seed_rows(&s.repo, "abc", &["u1", "u2"]).await;

    let msg = TestMessage::json(
        &InviteEnrichJob {
            invite_code: "abc".into(),
        },
        1,
    );
    let disposition = s
        .envelope
        .process::<InviteEnrichJob, _, _, _>(
            &msg,
            |j| j.invite_code.clone(),
            |j| s.handler.handle(j),
        )
        .await;

    assert_eq!(disposition, Disposition::Completed);
    assert_eq!(s.provider.calls(), 1);

    for row in s.repo.rows_for_code("abc") {
        assert_eq!(row.server_name, "Alpha");
        assert_eq!(row.server_id, "G");
        assert_eq!(row.member_count, 42);
        assert_eq!(row.status, "active");
        assert!(row.server_icon_url.contains("/icons/G/i.png"));
    }

    let doc = s.search.get("abc").await.unwrap().unwrap();
    assert_eq!(doc.server_name, "Alpha");
    assert_eq!(doc.member_count, 42);
    assert_eq!(doc.status, "active");

    // idempotency marker under the enricher prefix, not the post prefix
    assert!(s.dedup.processed("enricher", "abc").await.unwrap());
    assert!(!s.dedup.processed("processed_job", "abc").await.unwrap());
}

#[tokio::test]
async fn already_enriched_document_short_circuits_the_api_call() {
    let s = setup(vec![Ok(invite("abc", "Alpha", 42))]);
    s.search.seed(SearchDoc {
        invite_code: "abc".into(),
        server_name: "Alpha".into(),
        icon_url: "https://cdn/icons/G/i.png".into(),
        status: "active".into(),
        member_count: 42,
        ..Default::default()
    });

    let outcome = s
        .handler
        .handle(InviteEnrichJob {
            invite_code: "abc".into(),
        })
        .await
        .unwrap();

    assert_eq!(outcome, HandlerOutcome::Complete);
    assert_eq!(s.provider.calls(), 0);
}

#[tokio::test]
async fn expired_invite_is_a_terminal_negative_not_a_failure() {
    let s = setup(vec![Err(DirectoryError::NotFound)]);
    seed_rows(&s.repo, "gone", &["u1"]).await;

    let msg = TestMessage::json(
        &InviteEnrichJob {
            invite_code: "gone".into(),
        },
        1,
    );
    let disposition = s
        .envelope
        .process::<InviteEnrichJob, _, _, _>(
            &msg,
            |j| j.invite_code.clone(),
            |j| s.handler.handle(j),
        )
        .await;

    assert_eq!(disposition, Disposition::Completed);
    assert!(msg.was_acked());

    let row = &s.repo.rows_for_code("gone")[0];
    assert_eq!(row.status, "expired");
    assert_eq!(row.server_name, "");

    let doc = s.search.get("gone").await.unwrap().unwrap();
    assert_eq!(doc.status, "expired");

    assert_eq!(s.dedup.counter("enricher", "failed").await, 0);
    assert_eq!(s.dedup.counter("enricher", "expired").await, 1);
}

#[tokio::test]
async fn rate_limit_opens_the_circuit_and_spares_other_codes() {
    let s = setup(vec![Err(DirectoryError::RateLimited)]);
    seed_rows(&s.repo, "x", &["u1"]).await;

    let first = s
        .handler
        .handle(InviteEnrichJob {
            invite_code: "x".into(),
        })
        .await;
    assert!(matches!(first, Err(StageError::RateLimited(_))));
    assert!(s.dedup.circuit_open(DIRECTORY_SERVICE).await.unwrap());
    assert_eq!(s.provider.calls(), 1);

    // any other code now naks without touching the directory
    let second = s
        .handler
        .handle(InviteEnrichJob {
            invite_code: "y".into(),
        })
        .await;
    assert!(matches!(second, Err(StageError::RateLimited(_))));
    assert_eq!(s.provider.calls(), 1);
}

#[tokio::test]
async fn transient_directory_errors_are_retried() {
    let s = setup(vec![Err(DirectoryError::Status(502))]);

    let result = s
        .handler
        .handle(InviteEnrichJob {
            invite_code: "flaky".into(),
        })
        .await;
    assert!(matches!(result, Err(StageError::Retry(_))));
}

#[tokio::test]
async fn zero_member_count_is_stored_not_rejected() {
    let s = setup(vec![Ok(invite("abc", "Tiny", 0))]);
    seed_rows(&s.repo, "abc", &["u1"]).await;

    let outcome = s
        .handler
        .handle(InviteEnrichJob {
            invite_code: "abc".into(),
        })
        .await
        .unwrap();

    assert_eq!(outcome, HandlerOutcome::Complete);
    assert_eq!(s.repo.rows_for_code("abc")[0].member_count, 0);
    assert_eq!(s.search.get("abc").await.unwrap().unwrap().member_count, 0);
}

#[tokio::test]
async fn iconless_guild_never_blanks_an_existing_icon() {
    // Enrichment response without an icon must not clear a previously
    // indexed icon_url.
    let mut iconless = invite("abc", "Alpha", 10);
    iconless.guild.icon = String::new();
    let s = setup(vec![Ok(iconless)]);
    s.search.seed(SearchDoc {
        invite_code: "abc".into(),
        icon_url: "https://cdn/icons/G/old.png".into(),
        ..Default::default()
    });
    seed_rows(&s.repo, "abc", &["u1"]).await;

    s.handler
        .handle(InviteEnrichJob {
            invite_code: "abc".into(),
        })
        .await
        .unwrap();

    let doc = s.search.get("abc").await.unwrap().unwrap();
    assert_eq!(doc.icon_url, "https://cdn/icons/G/old.png");
    assert_eq!(doc.server_name, "Alpha");
}
