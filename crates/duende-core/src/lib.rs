//! Core domain model for Duende event reconciliation.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "duende-core";

/// Version of the staging payload layout written by the staging adapters.
pub const STAGING_SCHEMA_VERSION: u32 = 1;

pub const PERFORMER_PLACEHOLDER: &str = "Artist not specified";
pub const DATE_PLACEHOLDER: &str = "Date not specified";
pub const DESCRIPTION_PLACEHOLDER: &str = "No description available";

/// Point location in GeoJSON order: `[longitude, latitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Point", rename_all = "camelCase")]
pub struct GeoPoint {
    pub coordinates: [f64; 2],
    pub is_approximate: bool,
}

impl GeoPoint {
    /// Returns `None` for non-finite or out-of-range coordinates.
    pub fn new(lon: f64, lat: f64, is_approximate: bool) -> Option<Self> {
        let valid = lon.is_finite()
            && lat.is_finite()
            && (-180.0..=180.0).contains(&lon)
            && (-90.0..=90.0).contains(&lat);
        valid.then_some(Self {
            coordinates: [lon, lat],
            is_approximate,
        })
    }

    pub fn lon(&self) -> f64 {
        self.coordinates[0]
    }

    pub fn lat(&self) -> f64 {
        self.coordinates[1]
    }
}

/// Location object as the scraper left it; may be incomplete or malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartialLocation {
    pub coordinates: Option<Vec<f64>>,
    pub is_approximate: Option<bool>,
}

impl PartialLocation {
    pub fn to_point(&self) -> Option<GeoPoint> {
        match self.coordinates.as_deref() {
            Some([lon, lat]) => GeoPoint::new(*lon, *lat, self.is_approximate.unwrap_or(false)),
            _ => None,
        }
    }
}

/// Event candidate as produced by the scraper, in the canonical staging layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedEventCandidate {
    pub performer: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub venue: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub date: Option<String>,
    pub reference_url: Option<String>,
    pub location: Option<PartialLocation>,
}

/// Candidate whose required display fields are guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedEventCandidate {
    pub performer: String,
    pub title: Option<String>,
    pub description: String,
    pub venue: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub date: String,
    pub reference_url: Option<String>,
    pub location: Option<PartialLocation>,
}

impl SanitizedEventCandidate {
    /// Coordinates supplied by the scraper, if they form a valid point.
    pub fn usable_location(&self) -> Option<GeoPoint> {
        self.location.as_ref().and_then(PartialLocation::to_point)
    }
}

fn default_if_blank(value: Option<String>, placeholder: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => placeholder.to_string(),
    }
}

/// Fill placeholders for absent or blank performer, date and description.
pub fn sanitize(candidate: StagedEventCandidate) -> SanitizedEventCandidate {
    SanitizedEventCandidate {
        performer: default_if_blank(candidate.performer, PERFORMER_PLACEHOLDER),
        title: candidate.title,
        description: default_if_blank(candidate.description, DESCRIPTION_PLACEHOLDER),
        venue: candidate.venue,
        city: candidate.city,
        country: candidate.country,
        address: candidate.address,
        date: default_if_blank(candidate.date, DATE_PLACEHOLDER),
        reference_url: candidate.reference_url,
        location: candidate.location,
    }
}

/// Trimmed value, or `None` when blank or equal to the placeholder.
fn specified<'a>(value: &'a str, placeholder: &str) -> Option<&'a str> {
    let trimmed = value.trim();
    (!trimmed.is_empty() && trimmed != placeholder).then_some(trimmed)
}

/// Trimmed value of an optional free-text field, `None` when blank.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Value deciding whether two candidates describe the same real-world event.
///
/// The structural variant conflates distinct events that share a performer
/// and a date; callers count these keys so the loss stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityKey {
    Reference { url: String },
    Structural { performer: String, date: String },
}

impl IdentityKey {
    /// Flat string stored in the canonical identity column.
    pub fn lookup_value(&self) -> String {
        match self {
            Self::Reference { url } => format!("ref:{url}"),
            Self::Structural { performer, date } => format!(
                "perf:{}|{}",
                performer.replace('|', "\\|"),
                date.replace('|', "\\|")
            ),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reference { .. } => "reference",
            Self::Structural { .. } => "structural",
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural { .. })
    }
}

/// Reference URL first, then performer + date; `None` when neither is usable.
pub fn resolve_identity(candidate: &SanitizedEventCandidate) -> Option<IdentityKey> {
    if let Some(url) = non_blank(candidate.reference_url.as_deref()) {
        return Some(IdentityKey::Reference {
            url: url.to_string(),
        });
    }

    let performer = specified(&candidate.performer, PERFORMER_PLACEHOLDER)?;
    let date = specified(&candidate.date, DATE_PLACEHOLDER)?;
    Some(IdentityKey::Structural {
        performer: performer.to_string(),
        date: date.to_string(),
    })
}

/// Calendar day of an ISO date or RFC 3339 timestamp; free text yields `None`.
pub fn parse_start_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.date_naive());
    }
    trimmed
        .get(..10)
        .filter(|_| trimmed.as_bytes().get(10) == Some(&b'T'))
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Moderation state. Reconciliation only ever assigns `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Pending,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
        }
    }
}

/// Durable, deduplicated event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEventRecord {
    pub id: Uuid,
    pub identity_key: IdentityKey,
    pub performer: String,
    pub title: Option<String>,
    pub description: String,
    pub venue: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub date: String,
    pub starts_on: Option<NaiveDate>,
    pub reference_url: Option<String>,
    pub location: Option<GeoPoint>,
    pub content_status: ContentStatus,
    pub created_at: DateTime<Utc>,
}

impl CanonicalEventRecord {
    /// Build the record admitted for a first-seen identity key.
    pub fn admit(
        candidate: SanitizedEventCandidate,
        identity_key: IdentityKey,
        location: Option<GeoPoint>,
        now: DateTime<Utc>,
    ) -> Self {
        let starts_on = parse_start_date(&candidate.date);
        Self {
            id: Uuid::new_v4(),
            identity_key,
            performer: candidate.performer,
            title: candidate.title,
            description: candidate.description,
            venue: candidate.venue,
            city: candidate.city,
            country: candidate.country,
            address: candidate.address,
            date: candidate.date,
            starts_on,
            reference_url: candidate.reference_url,
            location,
            content_status: ContentStatus::Pending,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedArtist {
    pub external_id: Option<String>,
    pub name: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedVenue {
    pub external_id: Option<String>,
    pub name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalArtist {
    pub external_id: String,
    pub name: Option<String>,
    pub attributes: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVenue {
    pub external_id: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub attributes: BTreeMap<String, JsonValue>,
}

impl StagedArtist {
    pub fn into_canonical(self) -> Option<CanonicalArtist> {
        let external_id = non_blank(self.external_id.as_deref())?.to_string();
        Some(CanonicalArtist {
            external_id,
            name: self.name,
            attributes: self.attributes,
        })
    }
}

impl StagedVenue {
    pub fn into_canonical(self) -> Option<CanonicalVenue> {
        let external_id = non_blank(self.external_id.as_deref())?.to_string();
        Some(CanonicalVenue {
            external_id,
            name: self.name,
            city: self.city,
            country: self.country,
            address: self.address,
            attributes: self.attributes,
        })
    }
}

/// Typed staging payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum StagedPayload {
    Event(StagedEventCandidate),
    Artist(StagedArtist),
    Venue(StagedVenue),
}

impl StagedPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Artist(_) => "artist",
            Self::Venue(_) => "venue",
        }
    }
}

#[derive(Debug, Error)]
pub enum StagingDecodeError {
    #[error("unsupported staging schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("malformed staging payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One row of the staging area. The payload stays untyped until decoded so a
/// malformed row can be rejected without failing the whole fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub id: Uuid,
    pub schema_version: u32,
    pub kind: String,
    pub staged_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl StagedRecord {
    pub fn new(payload: &StagedPayload, staged_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            schema_version: STAGING_SCHEMA_VERSION,
            kind: payload.kind().to_string(),
            staged_at,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode(&self) -> Result<StagedPayload, StagingDecodeError> {
        if self.schema_version != STAGING_SCHEMA_VERSION {
            return Err(StagingDecodeError::UnsupportedVersion {
                found: self.schema_version,
                expected: STAGING_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Per-category reconciliation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub processed: u64,
    pub added: u64,
    pub updated: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodeCounts {
    pub pre_located: u64,
    pub exact: u64,
    pub approximate: u64,
    pub unresolved: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Totals of one reconcile run. Also the shape of the persisted audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub events: CategoryCounts,
    pub artists: CategoryCounts,
    pub venues: CategoryCounts,
    pub geocoding: GeocodeCounts,
    pub structural_keys: u64,
    pub error: Option<String>,
}
