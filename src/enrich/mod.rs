//! AI enrichment: provider client and worker.

pub mod provider;
pub mod worker;

pub use provider::AiClient;
pub use worker::{
    fallback_commentary, EnrichError, Enricher, EnrichmentOutcome, BACKOFF_BASE, MAX_ATTEMPTS,
};
