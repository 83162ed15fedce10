//! Staging + canonical persistence and outbound HTTP utilities for Duende.

use std::collections::HashSet;

use async_trait::async_trait;
use duende_core::{CanonicalArtist, CanonicalEventRecord, CanonicalVenue, RunSummary, StagedRecord};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RequestPacer, RetryDisposition,
};
pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "duende-storage";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot be reached; a run must stop here.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused a single write (constraint violation and the like).
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same identity key was already present.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Everything a reconcile run reads or writes. Each method is a single-row
/// (or single-statement) atomic operation; no cross-row transaction is assumed.
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn stage_records(&self, records: &[StagedRecord]) -> Result<usize, StoreError>;

    async fn fetch_staged(&self) -> Result<Vec<StagedRecord>, StoreError>;

    async fn retire_staged(&self, id: Uuid) -> Result<(), StoreError>;

    /// Subset of `lookup_values` already present as canonical events, in one query.
    async fn existing_identity_keys(
        &self,
        lookup_values: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    async fn insert_event(&self, record: &CanonicalEventRecord) -> Result<InsertOutcome, StoreError>;

    async fn upsert_artist(&self, artist: &CanonicalArtist) -> Result<UpsertOutcome, StoreError>;

    async fn upsert_venue(&self, venue: &CanonicalVenue) -> Result<UpsertOutcome, StoreError>;

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError>;
}
