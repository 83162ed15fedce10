use std::time::Instant;

use chrono::{DateTime, Utc};
use duende_core::{CategoryCounts, GeocodeCounts, RunOutcome, RunSummary};
use uuid::Uuid;

use crate::geocode::GeoResolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCategory {
    Events,
    Artists,
    Venues,
}

impl RecordCategory {
    /// Category for a staging `kind` column, used when the payload itself
    /// cannot be decoded.
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "artist" => Self::Artists,
            "venue" => Self::Venues,
            _ => Self::Events,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Added,
    Updated,
    Duplicate,
    Invalid,
    Failed,
}

/// Accumulates counters for one run; every staged record ends up in exactly
/// one outcome bucket of its category.
#[derive(Debug)]
pub struct RunSummaryRecorder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    events: CategoryCounts,
    artists: CategoryCounts,
    venues: CategoryCounts,
    geocoding: GeocodeCounts,
    structural_keys: u64,
}

impl RunSummaryRecorder {
    pub fn start(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            clock: Instant::now(),
            events: CategoryCounts::default(),
            artists: CategoryCounts::default(),
            venues: CategoryCounts::default(),
            geocoding: GeocodeCounts::default(),
            structural_keys: 0,
        }
    }

    pub fn record(&mut self, category: RecordCategory, outcome: CommitOutcome) {
        let counts = match category {
            RecordCategory::Events => &mut self.events,
            RecordCategory::Artists => &mut self.artists,
            RecordCategory::Venues => &mut self.venues,
        };
        counts.processed += 1;
        match outcome {
            CommitOutcome::Added => counts.added += 1,
            CommitOutcome::Updated => counts.updated += 1,
            CommitOutcome::Duplicate => counts.duplicates += 1,
            CommitOutcome::Invalid => counts.invalid += 1,
            CommitOutcome::Failed => counts.failed += 1,
        }
    }

    pub fn record_geocoding(&mut self, resolution: &GeoResolution) {
        match resolution {
            GeoResolution::PreLocated(_) => self.geocoding.pre_located += 1,
            GeoResolution::Exact(_) => self.geocoding.exact += 1,
            GeoResolution::Approximate(_) => self.geocoding.approximate += 1,
            GeoResolution::Unresolved => self.geocoding.unresolved += 1,
        }
    }

    pub fn structural_key(&mut self) {
        self.structural_keys += 1;
    }

    pub fn finish(&self) -> RunSummary {
        self.snapshot(RunOutcome::Completed, None)
    }

    /// Partial summary for a run that stopped early.
    pub fn abort(&self, outcome: RunOutcome, error: impl ToString) -> RunSummary {
        self.snapshot(outcome, Some(error.to_string()))
    }

    fn snapshot(&self, outcome: RunOutcome, error: Option<String>) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
            events: self.events,
            artists: self.artists,
            venues: self.venues,
            geocoding: self.geocoding,
            structural_keys: self.structural_keys,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_record_lands_in_one_bucket() {
        let mut recorder = RunSummaryRecorder::start(Uuid::new_v4());
        recorder.record(RecordCategory::Events, CommitOutcome::Added);
        recorder.record(RecordCategory::Events, CommitOutcome::Duplicate);
        recorder.record(RecordCategory::Events, CommitOutcome::Invalid);
        recorder.record(RecordCategory::Artists, CommitOutcome::Updated);

        let summary = recorder.finish();
        let e = summary.events;
        assert_eq!(e.processed, 3);
        assert_eq!(e.added + e.updated + e.duplicates + e.invalid + e.failed, e.processed);
        assert_eq!(summary.artists.updated, 1);
        assert_eq!(summary.venues, CategoryCounts::default());
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert!(summary.error.is_none());
    }

    #[test]
    fn abort_keeps_partial_counts_and_error() {
        let mut recorder = RunSummaryRecorder::start(Uuid::new_v4());
        recorder.record(RecordCategory::Venues, CommitOutcome::Failed);
        recorder.record_geocoding(&GeoResolution::Unresolved);
        recorder.structural_key();

        let summary = recorder.abort(RunOutcome::TimedOut, "deadline");
        assert_eq!(summary.outcome, RunOutcome::TimedOut);
        assert_eq!(summary.error.as_deref(), Some("deadline"));
        assert_eq!(summary.venues.failed, 1);
        assert_eq!(summary.geocoding.unresolved, 1);
        assert_eq!(summary.structural_keys, 1);
        assert!(summary.finished_at >= summary.started_at);
    }

    #[test]
    fn undecodable_kinds_map_to_categories() {
        assert_eq!(RecordCategory::from_kind("artist"), RecordCategory::Artists);
        assert_eq!(RecordCategory::from_kind("venue"), RecordCategory::Venues);
        assert_eq!(RecordCategory::from_kind("event"), RecordCategory::Events);
        assert_eq!(RecordCategory::from_kind("garbage"), RecordCategory::Events);
    }
}
