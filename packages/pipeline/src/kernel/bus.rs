//! JetStream connectivity and the publisher abstraction.
//!
//! Publishing goes through the [`BusPublisher`] trait so handlers can be
//! tested against [`TestBus`], which records messages instead of sending
//! them.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{Context as _, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;

/// Subject names shared across services.
pub mod subjects {
    pub const SCRAPE: &str = "jobs.scrape";
    pub const TEXT_EXTRACTED: &str = "data.text_extracted";
    pub const ENRICH_DISCORD: &str = "jobs.enrich.discord";

    pub fn dlq(stage: &str) -> String {
        format!("argus.dlq.{stage}")
    }
}

/// Durable consumer names; part of the deployment contract.
pub mod consumers {
    pub const SCRAPE_WORKERS: &str = "scraper-worker-group";
    pub const FAST_INGESTION: &str = "parser-fast-ingestion";
    pub const ENRICHER: &str = "discord-enricher";
}

/// Connects to the bus and returns both the core client and the JetStream
/// context. Failure here is fatal at startup.
pub async fn connect(url: &str) -> Result<(async_nats::Client, jetstream::Context)> {
    let client = async_nats::connect(url)
        .await
        .with_context(|| format!("connecting to nats at {url}"))?;
    let context = jetstream::new(client.clone());
    Ok((client, context))
}

/// Idempotently creates a file-backed stream for the given subjects.
pub async fn ensure_stream(
    js: &jetstream::Context,
    name: &str,
    stream_subjects: &[&str],
) -> Result<()> {
    js.get_or_create_stream(jetstream::stream::Config {
        name: name.to_string(),
        subjects: stream_subjects.iter().map(|s| s.to_string()).collect(),
        storage: jetstream::stream::StorageType::File,
        ..Default::default()
    })
    .await
    .with_context(|| format!("ensuring stream {name}"))?;
    Ok(())
}

/// Ensures every pipeline stream exists. Any service may run first, so all
/// of them create the full set.
pub async fn ensure_pipeline_streams(js: &jetstream::Context) -> Result<()> {
    ensure_stream(js, "SCRAPE", &[subjects::SCRAPE]).await?;
    ensure_stream(js, "DATA", &[subjects::TEXT_EXTRACTED]).await?;
    ensure_stream(js, "ENRICH", &["jobs.enrich.>"]).await?;
    Ok(())
}

/// A message captured by [`TestBus`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Publish side of the bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publishes and waits for the stream acknowledgement.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;
}

/// Production publisher over a JetStream context.
pub struct JetStreamPublisher {
    context: jetstream::Context,
}

impl JetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl BusPublisher for JetStreamPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.context
            .publish(subject.clone(), payload)
            .await
            .with_context(|| format!("publishing to {subject}"))?
            .await
            .with_context(|| format!("awaiting stream ack for {subject}"))?;
        Ok(())
    }
}

/// Recording publisher for tests.
///
/// Tracks everything published and can be told to fail specific subjects
/// to exercise error paths.
#[derive(Default)]
pub struct TestBus {
    published: RwLock<Vec<PublishedMessage>>,
    failing: RwLock<HashSet<String>>,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes publishes to `subject` fail until cleared.
    pub fn fail_subject(&self, subject: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn messages_for_subject(&self, subject: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub fn publish_count_for(&self, subject: &str) -> usize {
        self.messages_for_subject(subject).len()
    }

    pub fn was_published_to(&self, subject: &str) -> bool {
        self.publish_count_for(subject) > 0
    }

    pub fn was_published_with_prefix(&self, prefix: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.subject.starts_with(prefix))
    }

    pub fn messages_by_subject(&self) -> HashMap<String, Vec<PublishedMessage>> {
        let mut by_subject: HashMap<String, Vec<PublishedMessage>> = HashMap::new();
        for msg in self.published_messages() {
            by_subject.entry(msg.subject.clone()).or_default().push(msg);
        }
        by_subject
    }

    pub fn deserialize_message<T: serde::de::DeserializeOwned>(
        &self,
        msg: &PublishedMessage,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&msg.payload)
    }
}

#[async_trait]
impl BusPublisher for TestBus {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&subject)
        {
            anyhow::bail!("simulated publish failure for {subject}");
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage { subject, payload });
        Ok(())
    }
}
