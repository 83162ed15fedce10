use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use duende_core::{CanonicalArtist, CanonicalEventRecord, CanonicalVenue, RunSummary, StagedRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{InsertOutcome, ReconcileStore, StoreError, UpsertOutcome};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => StoreError::Rejected(db.to_string()),
            sqlx::Error::Encode(e) => StoreError::Rejected(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn stage_records(&self, records: &[StagedRecord]) -> Result<usize, StoreError> {
        let mut staged = 0usize;
        for record in records {
            let schema_version = schema_version_column(record.schema_version)?;
            sqlx::query(
                r#"
                INSERT INTO staged_records (id, schema_version, kind, payload, staged_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.id)
            .bind(schema_version)
            .bind(&record.kind)
            .bind(Json(&record.payload))
            .bind(record.staged_at)
            .execute(&self.pool)
            .await?;
            staged += 1;
        }
        Ok(staged)
    }

    async fn fetch_staged(&self) -> Result<Vec<StagedRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, schema_version, kind, payload, staged_at
              FROM staged_records
             ORDER BY staged_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let schema_version: i32 = row.try_get("schema_version").map_err(unreadable)?;
            let Json(payload): Json<serde_json::Value> = row.try_get("payload").map_err(unreadable)?;
            out.push(StagedRecord {
                id: row.try_get("id").map_err(unreadable)?,
                schema_version: u32::try_from(schema_version).unwrap_or(0),
                kind: row.try_get("kind").map_err(unreadable)?,
                staged_at: row.try_get("staged_at").map_err(unreadable)?,
                payload,
            });
        }
        Ok(out)
    }

    async fn retire_staged(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM staged_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn existing_identity_keys(
        &self,
        lookup_values: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if lookup_values.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query("SELECT identity_key FROM events WHERE identity_key = ANY($1)")
            .bind(lookup_values)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("identity_key").map_err(unreadable))
            .collect()
    }

    async fn insert_event(&self, record: &CanonicalEventRecord) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO events (
                id, identity_key, identity_kind, performer, title, description,
                venue, city, country, address, event_date, starts_on, reference_url,
                location, location_lon, location_lat, content_status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18)
            ON CONFLICT (identity_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(record.identity_key.lookup_value())
        .bind(record.identity_key.kind())
        .bind(&record.performer)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.venue)
        .bind(&record.city)
        .bind(&record.country)
        .bind(&record.address)
        .bind(&record.date)
        .bind(record.starts_on)
        .bind(&record.reference_url)
        .bind(record.location.map(Json))
        .bind(record.location.map(|p| p.lon()))
        .bind(record.location.map(|p| p.lat()))
        .bind(record.content_status.as_str())
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn upsert_artist(&self, artist: &CanonicalArtist) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO artists (external_id, name, attributes)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   attributes = EXCLUDED.attributes,
                   updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&artist.external_id)
        .bind(&artist.name)
        .bind(Json(&artist.attributes))
        .fetch_one(&self.pool)
        .await?;
        upsert_outcome(&row)
    }

    async fn upsert_venue(&self, venue: &CanonicalVenue) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO venues (external_id, name, city, country, address, attributes)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   city = EXCLUDED.city,
                   country = EXCLUDED.country,
                   address = EXCLUDED.address,
                   attributes = EXCLUDED.attributes,
                   updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&venue.external_id)
        .bind(&venue.name)
        .bind(&venue.city)
        .bind(&venue.country)
        .bind(&venue.address)
        .bind(Json(&venue.attributes))
        .fetch_one(&self.pool)
        .await?;
        upsert_outcome(&row)
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let counters = serde_json::json!({
            "events": summary.events,
            "artists": summary.artists,
            "venues": summary.venues,
            "geocoding": summary.geocoding,
            "structural_keys": summary.structural_keys,
        });
        sqlx::query(
            r#"
            INSERT INTO ingest_runs (run_id, started_at, finished_at, duration_ms, outcome, counters, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(i64::try_from(summary.duration_ms).unwrap_or(i64::MAX))
        .bind(summary.outcome.as_str())
        .bind(Json(counters))
        .bind(&summary.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn upsert_outcome(row: &sqlx::postgres::PgRow) -> Result<UpsertOutcome, StoreError> {
    let inserted: bool = row.try_get("inserted").map_err(unreadable)?;
    Ok(if inserted {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    })
}

fn unreadable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(format!("unreadable row: {err}"))
}

fn schema_version_column(version: u32) -> Result<i32, StoreError> {
    i32::try_from(version)
        .map_err(|_| StoreError::Rejected(format!("schema version {version} out of range")))
}
