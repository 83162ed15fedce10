use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use duende_adapters::{GeocodeQuery, Geocoder};
use duende_core::{non_blank, GeoPoint, SanitizedEventCandidate};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

/// Terminal state of the exact → city → unresolved fallback chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoResolution {
    /// The scraper already supplied valid coordinates.
    PreLocated(GeoPoint),
    Exact(GeoPoint),
    Approximate(GeoPoint),
    Unresolved,
}

impl GeoResolution {
    pub fn point(&self) -> Option<GeoPoint> {
        match self {
            Self::PreLocated(p) | Self::Exact(p) | Self::Approximate(p) => Some(*p),
            Self::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub country_code: Option<String>,
    /// Appended to city-level queries when the candidate names no country.
    pub country_hint: Option<String>,
    pub concurrency: usize,
    pub request_timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            country_code: Some("es".to_string()),
            country_hint: Some("España".to_string()),
            concurrency: 4,
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GeocodingResolver {
    geocoder: Arc<dyn Geocoder>,
    settings: ResolverSettings,
}

impl GeocodingResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>, settings: ResolverSettings) -> Self {
        Self { geocoder, settings }
    }

    pub fn concurrency(&self) -> usize {
        self.settings.concurrency.max(1)
    }

    pub async fn resolve(&self, candidate: &SanitizedEventCandidate) -> GeoResolution {
        if let Some(point) = candidate.usable_location() {
            return GeoResolution::PreLocated(point);
        }

        let scope = self.scope_for(candidate);
        if let Some(address) = non_blank(candidate.address.as_deref()) {
            if let Some(point) = self.first_point(address.to_string(), scope.clone(), false).await {
                return GeoResolution::Exact(point);
            }
        }

        if let Some(city) = non_blank(candidate.city.as_deref()) {
            let hint = non_blank(candidate.country.as_deref()).or(self.settings.country_hint.as_deref());
            let text = match hint {
                Some(country) => format!("{city}, {country}"),
                None => city.to_string(),
            };
            debug!(query = %text, "falling back to city-level geocoding");
            if let Some(point) = self.first_point(text, scope, true).await {
                return GeoResolution::Approximate(point);
            }
        }

        GeoResolution::Unresolved
    }

    /// Resolve many candidates with at most `concurrency` lookups in flight.
    /// Results come back keyed by the caller's identifier.
    pub async fn resolve_batch<'a, K>(
        &self,
        candidates: Vec<(K, &'a SanitizedEventCandidate)>,
    ) -> HashMap<K, GeoResolution>
    where
        K: Eq + std::hash::Hash,
    {
        stream::iter(candidates)
            .map(|(id, candidate)| async move { (id, self.resolve(candidate).await) })
            .buffer_unordered(self.concurrency())
            .collect()
            .await
    }

    /// Country restriction for this candidate's lookups. A candidate placed in
    /// another country is looked up unscoped.
    fn scope_for(&self, candidate: &SanitizedEventCandidate) -> Option<String> {
        let code = self.settings.country_code.clone()?;
        match non_blank(candidate.country.as_deref()) {
            None => Some(code),
            Some(country) => {
                let country = country.to_lowercase();
                let in_scope = country == code.to_lowercase()
                    || self
                        .settings
                        .country_hint
                        .as_deref()
                        .is_some_and(|hint| hint.to_lowercase() == country);
                in_scope.then_some(code)
            }
        }
    }

    /// First usable match for `text`; provider errors, timeouts and invalid
    /// coordinates all count as no match.
    async fn first_point(
        &self,
        text: String,
        country_code: Option<String>,
        is_approximate: bool,
    ) -> Option<GeoPoint> {
        let query = GeocodeQuery { text, country_code };
        let provider = self.geocoder.provider();

        match tokio::time::timeout(self.settings.request_timeout, self.geocoder.geocode(&query)).await {
            Ok(Ok(matches)) => {
                let first = matches.first()?;
                let point = GeoPoint::new(first.lon, first.lat, is_approximate);
                if point.is_none() {
                    warn!(provider, query = %query.text, lon = first.lon, lat = first.lat, "discarding out-of-range geocode match");
                }
                point
            }
            Ok(Err(err)) => {
                warn!(provider, query = %query.text, error = %err, "geocode request failed");
                None
            }
            Err(_) => {
                warn!(provider, query = %query.text, timeout = ?self.settings.request_timeout, "geocode request timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duende_adapters::{GeocodeError, GeocodeMatch};
    use duende_core::{sanitize, StagedEventCandidate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers by exact query text; anything else is an empty result.
    #[derive(Default)]
    struct ScriptedGeocoder {
        answers: HashMap<String, Result<Vec<GeocodeMatch>, String>>,
        calls: Mutex<Vec<(String, Option<String>)>>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedGeocoder {
        fn answer(mut self, query: &str, lon: f64, lat: f64) -> Self {
            self.answers
                .insert(query.to_string(), Ok(vec![GeocodeMatch { lon, lat }]));
            self
        }

        fn fail(mut self, query: &str) -> Self {
            self.answers.insert(query.to_string(), Err("502 bad gateway".into()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(text, _)| text.clone()).collect()
        }

        fn scopes(&self) -> Vec<Option<String>> {
            self.calls.lock().unwrap().iter().map(|(_, scope)| scope.clone()).collect()
        }
    }

    #[async_trait]
    impl Geocoder for ScriptedGeocoder {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        async fn geocode(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, GeocodeError> {
            self.calls
                .lock()
                .unwrap()
                .push((query.text.clone(), query.country_code.clone()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.answers.get(&query.text) {
                Some(Ok(matches)) => Ok(matches.clone()),
                Some(Err(msg)) => Err(GeocodeError::Provider {
                    status: "UNKNOWN_ERROR".into(),
                    message: msg.clone(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    fn candidate(address: Option<&str>, city: Option<&str>) -> SanitizedEventCandidate {
        sanitize(StagedEventCandidate {
            performer: Some("X".into()),
            date: Some("2024-01-01".into()),
            address: address.map(Into::into),
            city: city.map(Into::into),
            ..Default::default()
        })
    }

    fn resolver(geocoder: Arc<ScriptedGeocoder>) -> GeocodingResolver {
        GeocodingResolver::new(geocoder, ResolverSettings::default())
    }

    #[tokio::test]
    async fn exact_hit_skips_city_lookup() {
        let geocoder = Arc::new(
            ScriptedGeocoder::default()
                .answer("Plaza Mayor, Madrid", -3.7074, 40.4155)
                .answer("Madrid, España", -3.7038, 40.4168),
        );
        let resolution = resolver(geocoder.clone())
            .resolve(&candidate(Some("Plaza Mayor, Madrid"), Some("Madrid")))
            .await;

        assert_eq!(
            resolution,
            GeoResolution::Exact(GeoPoint::new(-3.7074, 40.4155, false).unwrap())
        );
        assert_eq!(geocoder.calls(), vec!["Plaza Mayor, Madrid".to_string()]);
    }

    #[tokio::test]
    async fn exact_miss_falls_back_to_approximate_city() {
        let geocoder = Arc::new(ScriptedGeocoder::default().answer("Madrid, España", -3.7038, 40.4168));
        let resolution = resolver(geocoder.clone())
            .resolve(&candidate(Some("Calle Inexistente 99"), Some("Madrid")))
            .await;

        let point = resolution.point().unwrap();
        assert!(point.is_approximate);
        assert_eq!(point.coordinates, [-3.7038, 40.4168]);
        assert_eq!(geocoder.calls().len(), 2);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_city() {
        let geocoder = Arc::new(
            ScriptedGeocoder::default()
                .fail("Calle Betis 1")
                .answer("Sevilla, España", -5.99, 37.38),
        );
        let resolution = resolver(geocoder)
            .resolve(&candidate(Some("Calle Betis 1"), Some("Sevilla")))
            .await;
        assert!(matches!(resolution, GeoResolution::Approximate(_)));
    }

    #[tokio::test]
    async fn candidate_country_overrides_hint() {
        let geocoder = Arc::new(ScriptedGeocoder::default().answer("Lisboa, Portugal", -9.14, 38.72));
        let mut c = candidate(None, Some("Lisboa"));
        c.country = Some("Portugal".into());
        let resolution = resolver(geocoder.clone()).resolve(&c).await;
        assert!(matches!(resolution, GeoResolution::Approximate(_)));
        assert_eq!(geocoder.calls(), vec!["Lisboa, Portugal".to_string()]);
    }

    #[tokio::test]
    async fn foreign_candidate_is_looked_up_without_country_scope() {
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let mut c = candidate(Some("Rua Augusta 1"), Some("Lisboa"));
        c.country = Some("Portugal".into());
        resolver(geocoder.clone()).resolve(&c).await;
        assert_eq!(
            geocoder.calls(),
            vec!["Rua Augusta 1".to_string(), "Lisboa, Portugal".to_string()]
        );
        assert_eq!(geocoder.scopes(), vec![None, None]);
    }

    #[tokio::test]
    async fn domestic_or_unstated_country_keeps_the_configured_scope() {
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let mut named = candidate(None, Some("Cádiz"));
        named.country = Some("españa".into());
        let unstated = candidate(Some("Calle Ancha 3"), None);

        let resolver = resolver(geocoder.clone());
        resolver.resolve(&named).await;
        resolver.resolve(&unstated).await;

        assert_eq!(
            geocoder.scopes(),
            vec![Some("es".to_string()), Some("es".to_string())]
        );
    }

    #[tokio::test]
    async fn nothing_to_look_up_is_unresolved_without_calls() {
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let resolution = resolver(geocoder.clone()).resolve(&candidate(None, None)).await;
        assert_eq!(resolution, GeoResolution::Unresolved);
        assert!(geocoder.calls().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_match_is_not_accepted() {
        let geocoder = Arc::new(ScriptedGeocoder::default().answer("Somewhere 1", 500.0, 40.0));
        let resolution = resolver(geocoder).resolve(&candidate(Some("Somewhere 1"), None)).await;
        assert_eq!(resolution, GeoResolution::Unresolved);
    }

    #[tokio::test]
    async fn pre_located_candidate_is_not_geocoded() {
        let geocoder = Arc::new(ScriptedGeocoder::default());
        let mut c = candidate(Some("Plaza Mayor, Madrid"), Some("Madrid"));
        c.location = Some(duende_core::PartialLocation {
            coordinates: Some(vec![-3.7, 40.4]),
            is_approximate: Some(true),
        });
        let resolution = resolver(geocoder.clone()).resolve(&c).await;
        assert_eq!(
            resolution,
            GeoResolution::PreLocated(GeoPoint::new(-3.7, 40.4, true).unwrap())
        );
        assert!(geocoder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_per_request() {
        let geocoder = Arc::new(ScriptedGeocoder {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedGeocoder::default().answer("Plaza Mayor, Madrid", -3.7, 40.4)
        });
        let resolution = resolver(geocoder.clone())
            .resolve(&candidate(Some("Plaza Mayor, Madrid"), Some("Madrid")))
            .await;
        assert_eq!(resolution, GeoResolution::Unresolved);
        assert_eq!(geocoder.calls().len(), 2);
    }

    #[tokio::test]
    async fn batch_resolution_keeps_caller_keys() {
        let geocoder = Arc::new(
            ScriptedGeocoder::default()
                .answer("A 1", 1.0, 1.0)
                .answer("B 2", 2.0, 2.0),
        );
        let a = candidate(Some("A 1"), None);
        let b = candidate(Some("B 2"), None);
        let c = candidate(None, None);
        let results = resolver(geocoder)
            .resolve_batch(vec![("a", &a), ("b", &b), ("c", &c)])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results["a"].point().unwrap().coordinates, [1.0, 1.0]);
        assert_eq!(results["b"].point().unwrap().coordinates, [2.0, 2.0]);
        assert_eq!(results["c"], GeoResolution::Unresolved);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_never_exceeds_configured_concurrency() {
        let geocoder = Arc::new(ScriptedGeocoder {
            delay: Some(Duration::from_millis(200)),
            ..ScriptedGeocoder::default()
        });
        let candidates: Vec<SanitizedEventCandidate> = (0..12)
            .map(|n| candidate(Some(format!("Calle {n}").as_str()), None))
            .collect();
        let resolver = GeocodingResolver::new(
            geocoder.clone(),
            ResolverSettings {
                concurrency: 3,
                ..ResolverSettings::default()
            },
        );

        let results = resolver
            .resolve_batch(candidates.iter().enumerate().collect())
            .await;

        assert_eq!(results.len(), 12);
        assert_eq!(geocoder.calls().len(), 12);
        assert_eq!(geocoder.peak_in_flight.load(Ordering::SeqCst), 3);
    }
}
