use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duende_core::{
    resolve_identity, sanitize, CanonicalEventRecord, IdentityKey, RunOutcome, RunSummary,
    SanitizedEventCandidate, StagedArtist, StagedPayload, StagedVenue,
};
use duende_storage::{InsertOutcome, ReconcileStore, StoreError, UpsertOutcome};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::WriteFailurePolicy;
use crate::geocode::{GeoResolution, GeocodingResolver};
use crate::summary::{CommitOutcome, RecordCategory, RunSummaryRecorder};

/// Conditions that stop a run before every staged record is settled.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run exceeded its {0:?} time budget")]
    TimedOut(Duration),
}

impl ReconcileError {
    pub fn outcome(&self) -> RunOutcome {
        match self {
            Self::Store(_) => RunOutcome::Failed,
            Self::TimedOut(_) => RunOutcome::TimedOut,
        }
    }
}

/// A run that stopped early, with the counters it reached.
#[derive(Debug, Error)]
#[error("reconcile run {} aborted: {error}", .partial.run_id)]
pub struct AbortedRun {
    pub error: ReconcileError,
    pub partial: RunSummary,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub run_timeout: Duration,
    pub write_failure_policy: WriteFailurePolicy,
    pub persist_audit: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(540),
            write_failure_policy: WriteFailurePolicy::Drop,
            persist_audit: true,
        }
    }
}

struct PendingEvent {
    staged_id: Uuid,
    candidate: SanitizedEventCandidate,
    key: Option<IdentityKey>,
}

pub struct ReconcilePipeline {
    store: Arc<dyn ReconcileStore>,
    resolver: GeocodingResolver,
    options: ReconcileOptions,
}

impl ReconcilePipeline {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        resolver: GeocodingResolver,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            store,
            resolver,
            options,
        }
    }

    /// Drain the staging area once. The returned summary (or the partial one
    /// inside [`AbortedRun`]) is also written to the run audit when enabled.
    pub async fn run_once(&self) -> Result<RunSummary, AbortedRun> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id);

        async move {
            let mut recorder = RunSummaryRecorder::start(run_id);
            let result = match tokio::time::timeout(
                self.options.run_timeout,
                self.reconcile(&mut recorder),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ReconcileError::TimedOut(self.options.run_timeout)),
            };

            let result = match result {
                Ok(()) => Ok(recorder.finish()),
                Err(error) => Err(AbortedRun {
                    partial: recorder.abort(error.outcome(), &error),
                    error,
                }),
            };

            let summary = match &result {
                Ok(summary) => summary,
                Err(aborted) => &aborted.partial,
            };
            self.persist_audit(summary).await;
            log_summary(summary);
            result
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self, recorder: &mut RunSummaryRecorder) -> Result<(), ReconcileError> {
        let staged = self.store.fetch_staged().await?;
        info!(staged = staged.len(), "loaded staging area");

        let mut artists = Vec::new();
        let mut venues = Vec::new();
        let mut events = Vec::new();
        for record in staged {
            match record.decode() {
                Ok(StagedPayload::Event(candidate)) => {
                    let candidate = sanitize(candidate);
                    let key = resolve_identity(&candidate);
                    events.push(PendingEvent {
                        staged_id: record.id,
                        candidate,
                        key,
                    });
                }
                Ok(StagedPayload::Artist(artist)) => artists.push((record.id, artist)),
                Ok(StagedPayload::Venue(venue)) => venues.push((record.id, venue)),
                Err(err) => {
                    warn!(staged_id = %record.id, kind = %record.kind, error = %err, "undecodable staging record");
                    let category = RecordCategory::from_kind(&record.kind);
                    self.settle(recorder, record.id, category, CommitOutcome::Invalid)
                        .await?;
                }
            }
        }

        for (staged_id, artist) in artists {
            let outcome = self.commit_artist(artist).await?;
            self.settle(recorder, staged_id, RecordCategory::Artists, outcome)
                .await?;
        }
        for (staged_id, venue) in venues {
            let outcome = self.commit_venue(venue).await?;
            self.settle(recorder, staged_id, RecordCategory::Venues, outcome)
                .await?;
        }

        self.commit_events(recorder, events).await
    }

    /// Commits events in input order, one resolver-sized chunk at a time, so
    /// a run cut short by its deadline keeps everything settled so far.
    async fn commit_events(
        &self,
        recorder: &mut RunSummaryRecorder,
        events: Vec<PendingEvent>,
    ) -> Result<(), ReconcileError> {
        let lookups: Vec<String> = events
            .iter()
            .filter_map(|event| event.key.as_ref().map(IdentityKey::lookup_value))
            .collect();
        let existing = self.check_existing(&lookups).await?;

        let mut committed: HashSet<String> = HashSet::new();
        let mut remaining = events.into_iter();
        loop {
            let chunk: Vec<PendingEvent> = remaining
                .by_ref()
                .take(self.resolver.concurrency())
                .collect();
            if chunk.is_empty() {
                break;
            }
            self.commit_chunk(recorder, chunk, &existing, &mut committed)
                .await?;
        }

        Ok(())
    }

    async fn commit_chunk(
        &self,
        recorder: &mut RunSummaryRecorder,
        chunk: Vec<PendingEvent>,
        existing: &HashSet<String>,
        committed: &mut HashSet<String>,
    ) -> Result<(), ReconcileError> {
        // Geocode only the first occurrence of each key that is not yet canonical.
        let mut seen = HashSet::new();
        let to_resolve: Vec<(usize, &SanitizedEventCandidate)> = chunk
            .iter()
            .enumerate()
            .filter_map(|(idx, event)| {
                let lookup = event.key.as_ref()?.lookup_value();
                (!existing.contains(&lookup) && !committed.contains(&lookup) && seen.insert(lookup))
                    .then_some((idx, &event.candidate))
            })
            .collect();
        debug!(candidates = to_resolve.len(), "resolving locations");
        let mut resolutions: HashMap<usize, GeoResolution> =
            self.resolver.resolve_batch(to_resolve).await;

        for (idx, event) in chunk.into_iter().enumerate() {
            let PendingEvent {
                staged_id,
                candidate,
                key,
            } = event;

            let Some(key) = key else {
                debug!(%staged_id, "no identity key derivable");
                self.settle(recorder, staged_id, RecordCategory::Events, CommitOutcome::Invalid)
                    .await?;
                continue;
            };
            if key.is_structural() {
                recorder.structural_key();
            }

            let lookup = key.lookup_value();
            if existing.contains(&lookup) || committed.contains(&lookup) {
                debug!(%staged_id, identity = %lookup, "duplicate identity key");
                self.settle(recorder, staged_id, RecordCategory::Events, CommitOutcome::Duplicate)
                    .await?;
                continue;
            }

            // A repeat of a key whose first occurrence failed to commit was
            // not part of the batch; resolve it here.
            let resolution = match resolutions.remove(&idx) {
                Some(resolution) => resolution,
                None => self.resolver.resolve(&candidate).await,
            };
            recorder.record_geocoding(&resolution);

            let record = CanonicalEventRecord::admit(candidate, key, resolution.point(), Utc::now());
            let outcome = match self.store.insert_event(&record).await {
                Ok(InsertOutcome::Inserted) => {
                    debug!(%staged_id, identity = %lookup, "event admitted as pending");
                    committed.insert(lookup);
                    CommitOutcome::Added
                }
                Ok(InsertOutcome::AlreadyExists) => {
                    committed.insert(lookup);
                    CommitOutcome::Duplicate
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!(%staged_id, identity = %lookup, error = %err, "event write rejected");
                    CommitOutcome::Failed
                }
            };
            self.settle(recorder, staged_id, RecordCategory::Events, outcome)
                .await?;
        }

        Ok(())
    }

    /// One bulk lookup; no query at all for an empty batch.
    async fn check_existing(&self, lookups: &[String]) -> Result<HashSet<String>, StoreError> {
        let mut unique: Vec<String> = lookups.to_vec();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Ok(HashSet::new());
        }
        let existing = self.store.existing_identity_keys(&unique).await?;
        debug!(checked = unique.len(), existing = existing.len(), "existence check");
        Ok(existing)
    }

    async fn commit_artist(&self, artist: StagedArtist) -> Result<CommitOutcome, ReconcileError> {
        let Some(artist) = artist.into_canonical() else {
            return Ok(CommitOutcome::Invalid);
        };
        upsert_outcome(self.store.upsert_artist(&artist).await, &artist.external_id)
    }

    async fn commit_venue(&self, venue: StagedVenue) -> Result<CommitOutcome, ReconcileError> {
        let Some(venue) = venue.into_canonical() else {
            return Ok(CommitOutcome::Invalid);
        };
        upsert_outcome(self.store.upsert_venue(&venue).await, &venue.external_id)
    }

    /// Count the outcome and retire the staging record. Under the restage
    /// policy a failed write stays staged for the next run.
    async fn settle(
        &self,
        recorder: &mut RunSummaryRecorder,
        staged_id: Uuid,
        category: RecordCategory,
        outcome: CommitOutcome,
    ) -> Result<(), StoreError> {
        recorder.record(category, outcome);
        if outcome == CommitOutcome::Failed
            && self.options.write_failure_policy == WriteFailurePolicy::Restage
        {
            warn!(%staged_id, "leaving failed record staged for retry");
            return Ok(());
        }
        self.store.retire_staged(staged_id).await
    }

    async fn persist_audit(&self, summary: &RunSummary) {
        if !self.options.persist_audit {
            return;
        }
        if let Err(err) = self.store.record_run(summary).await {
            warn!(error = %err, "failed to persist run audit record");
        }
    }
}

fn upsert_outcome(
    result: Result<UpsertOutcome, StoreError>,
    external_id: &str,
) -> Result<CommitOutcome, ReconcileError> {
    match result {
        Ok(UpsertOutcome::Inserted) => Ok(CommitOutcome::Added),
        Ok(UpsertOutcome::Updated) => Ok(CommitOutcome::Updated),
        Err(err) if err.is_fatal() => Err(err.into()),
        Err(err) => {
            warn!(external_id, error = %err, "upsert rejected");
            Ok(CommitOutcome::Failed)
        }
    }
}

fn log_summary(summary: &RunSummary) {
    let events = &summary.events;
    match summary.outcome {
        RunOutcome::Completed => info!(
            duration_ms = summary.duration_ms,
            processed = events.processed,
            added = events.added,
            duplicates = events.duplicates,
            invalid = events.invalid,
            failed = events.failed,
            approximate = summary.geocoding.approximate,
            unresolved = summary.geocoding.unresolved,
            structural_keys = summary.structural_keys,
            "reconcile run completed"
        ),
        outcome => warn!(
            outcome = outcome.as_str(),
            duration_ms = summary.duration_ms,
            processed = events.processed,
            error = summary.error.as_deref().unwrap_or_default(),
            "reconcile run aborted"
        ),
    }
}
