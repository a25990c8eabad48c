//! Pipeline stages.
//!
//! Each domain owns one stage of the data flow:
//! discovery -> `jobs.scrape` -> scrape -> `data.text_extracted` ->
//! ingestion -> `jobs.enrich.discord` -> enrichment -> {rows, index}.

pub mod discovery;
pub mod enrichment;
pub mod ingestion;
pub mod scrape;
