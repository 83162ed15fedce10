//! Staging → canonical reconciliation: configuration, geocoding fallback,
//! commit engine and run accounting.

mod config;
mod geocode;
mod pipeline;
mod summary;

use std::sync::Arc;

use anyhow::Result;
use duende_core::RunSummary;
use duende_storage::PgStore;

pub use config::{
    ConfigError, GeocoderConfig, GeocoderProvider, ReconcileConfig, WriteFailurePolicy,
    MAX_GEOCODER_CONCURRENCY,
};
pub use geocode::{GeoResolution, GeocodingResolver, ResolverSettings};
pub use pipeline::{AbortedRun, ReconcileError, ReconcileOptions, ReconcilePipeline};
pub use summary::{CommitOutcome, RecordCategory, RunSummaryRecorder};

pub const CRATE_NAME: &str = "duende-sync";

impl ReconcileConfig {
    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            country_code: self.geocoder.country_code.clone(),
            country_hint: self.geocoder.country_hint.clone(),
            concurrency: self.geocoder.concurrency,
            request_timeout: self.geocoder.request_timeout,
        }
    }

    pub fn options(&self) -> ReconcileOptions {
        ReconcileOptions {
            run_timeout: self.run_timeout,
            write_failure_policy: self.write_failure_policy,
            persist_audit: self.persist_audit,
        }
    }
}

pub async fn run_reconcile_once_from_env() -> Result<RunSummary> {
    let config = ReconcileConfig::from_env()?;
    let store = PgStore::connect(&config.database_url).await?;
    let resolver = GeocodingResolver::new(config.geocoder.build_geocoder()?, config.resolver_settings());
    let pipeline = ReconcilePipeline::new(Arc::new(store), resolver, config.options());
    Ok(pipeline.run_once().await?)
}
