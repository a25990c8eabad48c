//! Shared infrastructure for all pipeline services.
//!
//! - [`bus`] - JetStream connection, streams and the publisher trait
//! - [`cache`] - shared key-value cache behind the [`cache::CacheStore`] trait
//! - [`dedup`] - idempotency markers, processing locks, circuit breaker, counters
//! - [`envelope`] - the uniform message-handler wrapper (retry, DLQ, locking)
//! - [`metrics`] - Prometheus text endpoint over cache-held counters
//! - [`service_host`] - long-running service lifecycle and graceful drain

pub mod bus;
pub mod cache;
pub mod dedup;
pub mod envelope;
pub mod metrics;
pub mod service_host;

pub use bus::{BusPublisher, JetStreamPublisher, TestBus};
pub use cache::{CacheStore, MemoryStore, RedisStore};
pub use dedup::Deduplicator;
pub use envelope::{
    Disposition, Envelope, HandlerOutcome, InboundMessage, StageError, StagePolicy,
};
pub use service_host::{Service, ServiceHost};
