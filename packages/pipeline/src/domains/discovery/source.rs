//! Listing-source abstraction.
//!
//! One deployment ships one source today, but discovery iterates a list
//! so additional platforms slot in without touching the cycle logic.

use anyhow::Result;
use async_trait::async_trait;

/// A post found on a listing page. Only identity; content extraction is
/// the scrape worker's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPost {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerates candidate posts for one tag query. Capped and
    /// de-duplicated by the source; the caller applies the dedup filter.
    async fn fetch(&self, tag: &str) -> Result<Vec<DiscoveredPost>>;
}
