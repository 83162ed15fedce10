use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use duende_core::{CanonicalArtist, CanonicalEventRecord, CanonicalVenue, RunSummary, StagedRecord};
use uuid::Uuid;

use crate::{InsertOutcome, ReconcileStore, StoreError, UpsertOutcome};

/// Process-local store with the same atomicity as the Postgres store, plus
/// switches for simulating rejected writes and lost connectivity.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    staged: Vec<StagedRecord>,
    events: BTreeMap<String, CanonicalEventRecord>,
    artists: BTreeMap<String, CanonicalArtist>,
    venues: BTreeMap<String, CanonicalVenue>,
    runs: Vec<RunSummary>,
    existence_queries: usize,
    event_inserts: usize,
    rejected_keys: HashSet<String>,
    offline_after_inserts: Option<usize>,
    offline: bool,
    fail_run_audit: bool,
}

impl State {
    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable("in-memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a canonical event as if an earlier run had admitted it.
    pub fn seed_event(&self, record: CanonicalEventRecord) {
        let key = record.identity_key.lookup_value();
        self.state().events.insert(key, record);
    }

    /// Reject inserts for this identity key as a constraint violation would.
    pub fn reject_inserts_for(&self, lookup_value: impl Into<String>) {
        self.state().rejected_keys.insert(lookup_value.into());
    }

    /// Lose connectivity once `n` more event inserts have been attempted.
    pub fn go_offline_after_inserts(&self, n: usize) {
        let mut state = self.state();
        let attempted = state.event_inserts;
        state.offline_after_inserts = Some(attempted + n);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn fail_run_audit(&self) {
        self.state().fail_run_audit = true;
    }

    pub fn events(&self) -> Vec<CanonicalEventRecord> {
        self.state().events.values().cloned().collect()
    }

    pub fn event(&self, lookup_value: &str) -> Option<CanonicalEventRecord> {
        self.state().events.get(lookup_value).cloned()
    }

    pub fn artists(&self) -> Vec<CanonicalArtist> {
        self.state().artists.values().cloned().collect()
    }

    pub fn venues(&self) -> Vec<CanonicalVenue> {
        self.state().venues.values().cloned().collect()
    }

    pub fn staged(&self) -> Vec<StagedRecord> {
        self.state().staged.clone()
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        self.state().runs.clone()
    }

    pub fn existence_query_count(&self) -> usize {
        self.state().existence_queries
    }
}

#[async_trait]
impl ReconcileStore for InMemoryStore {
    async fn stage_records(&self, records: &[StagedRecord]) -> Result<usize, StoreError> {
        let mut state = self.state();
        state.ensure_online()?;
        state.staged.extend_from_slice(records);
        Ok(records.len())
    }

    async fn fetch_staged(&self) -> Result<Vec<StagedRecord>, StoreError> {
        let state = self.state();
        state.ensure_online()?;
        Ok(state.staged.clone())
    }

    async fn retire_staged(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state();
        state.ensure_online()?;
        state.staged.retain(|record| record.id != id);
        Ok(())
    }

    async fn existing_identity_keys(
        &self,
        lookup_values: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let mut state = self.state();
        state.ensure_online()?;
        state.existence_queries += 1;
        Ok(lookup_values
            .iter()
            .filter(|key| state.events.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn insert_event(&self, record: &CanonicalEventRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state();
        state.ensure_online()?;
        if state.offline_after_inserts == Some(state.event_inserts) {
            state.offline = true;
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        state.event_inserts += 1;

        let key = record.identity_key.lookup_value();
        if state.rejected_keys.contains(&key) {
            return Err(StoreError::Rejected(format!("constraint violation for {key}")));
        }
        if state.events.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        state.events.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn upsert_artist(&self, artist: &CanonicalArtist) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state();
        state.ensure_online()?;
        let previous = state
            .artists
            .insert(artist.external_id.clone(), artist.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn upsert_venue(&self, venue: &CanonicalVenue) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state();
        state.ensure_online()?;
        let previous = state.venues.insert(venue.external_id.clone(), venue.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_run_audit {
            return Err(StoreError::Rejected("ingest_runs unavailable".into()));
        }
        state.ensure_online()?;
        state.runs.push(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use duende_core::{sanitize, IdentityKey, StagedEventCandidate};

    fn record(url: &str) -> CanonicalEventRecord {
        let candidate = sanitize(StagedEventCandidate {
            performer: Some("Rocío Márquez".into()),
            date: Some("2024-03-02".into()),
            reference_url: Some(url.into()),
            ..Default::default()
        });
        CanonicalEventRecord::admit(
            candidate,
            IdentityKey::Reference { url: url.into() },
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_identity_key() {
        let store = InMemoryStore::new();
        let first = store.insert_event(&record("https://a")).await.unwrap();
        let second = store.insert_event(&record("https://a")).await.unwrap();
        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyExists);
        assert_eq!(store.events().len(), 1);
    }

    #[tokio::test]
    async fn existence_lookup_counts_one_query_per_call() {
        let store = InMemoryStore::new();
        store.seed_event(record("https://a"));
        let keys = vec!["ref:https://a".to_string(), "ref:https://b".to_string()];
        let found = store.existing_identity_keys(&keys).await.unwrap();
        assert_eq!(found, HashSet::from(["ref:https://a".to_string()]));
        assert_eq!(store.existence_query_count(), 1);
    }

    #[tokio::test]
    async fn offline_switch_trips_after_configured_inserts() {
        let store = InMemoryStore::new();
        store.go_offline_after_inserts(1);
        assert!(store.insert_event(&record("https://a")).await.is_ok());
        let err = store.insert_event(&record("https://b")).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(store.fetch_staged().await.unwrap_err().is_fatal());
    }
}
