//! Boundary adapters: geocoding providers and the scraper staging export.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use duende_core::{
    PartialLocation, StagedArtist, StagedEventCandidate, StagedPayload, StagedVenue,
};
use duende_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "duende-adapters";

pub const NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org";
pub const GOOGLE_GEOCODE_BASE_URL: &str = "https://maps.googleapis.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeQuery {
    pub text: String,
    /// ISO 3166-1 alpha-2 code restricting matches to one country.
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodeMatch {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("geocoder status {status}: {message}")]
    Provider { status: String, message: String },
    #[error("malformed coordinate {0:?} in geocoder response")]
    Malformed(String),
}

/// External geocoding capability. An empty result means "no match".
#[async_trait]
pub trait Geocoder: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn geocode(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, GeocodeError>;
}

/// Geocoder used when enrichment is switched off; never matches.
#[derive(Debug, Default)]
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    fn provider(&self) -> &'static str {
        "none"
    }

    async fn geocode(&self, _query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NominatimPlace {
    pub lat: String,
    pub lon: String,
}

/// OpenStreetMap Nominatim `/search` endpoint.
#[derive(Debug)]
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| NOMINATIM_BASE_URL.to_string()),
        }
    }

    pub fn parse_places(places: Vec<NominatimPlace>) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        places
            .into_iter()
            .map(|place| {
                let lon = place
                    .lon
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| GeocodeError::Malformed(place.lon.clone()))?;
                let lat = place
                    .lat
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| GeocodeError::Malformed(place.lat.clone()))?;
                Ok(GeocodeMatch { lon, lat })
            })
            .collect()
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn provider(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let mut params = vec![
            ("q", query.text.clone()),
            ("format", "json".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(code) = &query.country_code {
            params.push(("countrycodes", code.to_ascii_lowercase()));
        }
        let places: Vec<NominatimPlace> = self.http.get_json(&url, &params).await?;
        Self::parse_places(places)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleGeocodeResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<GoogleGeocodeResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleGeocodeResult {
    pub geometry: GoogleGeometry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleGeometry {
    pub location: GoogleLatLng,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GoogleLatLng {
    pub lat: f64,
    pub lng: f64,
}

/// Google Maps Geocoding API.
#[derive(Debug)]
pub struct GoogleGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(http: Arc<HttpFetcher>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| GOOGLE_GEOCODE_BASE_URL.to_string()),
            api_key,
        }
    }

    /// `ZERO_RESULTS` is an empty match list; any other non-`OK` status is an error.
    pub fn parse_response(resp: GoogleGeocodeResponse) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        match resp.status.as_str() {
            "OK" => Ok(resp
                .results
                .into_iter()
                .map(|r| GeocodeMatch {
                    lon: r.geometry.location.lng,
                    lat: r.geometry.location.lat,
                })
                .collect()),
            "ZERO_RESULTS" => Ok(Vec::new()),
            _ => Err(GeocodeError::Provider {
                status: resp.status,
                message: resp.error_message.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn provider(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        let url = format!("{}/maps/api/geocode/json", self.base_url.trim_end_matches('/'));
        let mut params = vec![("address", query.text.clone()), ("key", self.api_key.clone())];
        if let Some(code) = &query.country_code {
            params.push(("components", format!("country:{}", code.to_ascii_uppercase())));
        }
        let resp: GoogleGeocodeResponse = self.http.get_json(&url, &params).await?;
        Self::parse_response(resp)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("staging export is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("staging export has no events, artists or venues collection")]
    UnrecognizedShape,
}

const EVENT_COLLECTIONS: &[&str] = &["events", "eventos"];
const ARTIST_COLLECTIONS: &[&str] = &["artists", "artistas"];
const VENUE_COLLECTIONS: &[&str] = &["venues", "salas", "salas_tablos_festivales"];

const PERFORMER_KEYS: &[&str] = &["performer", "artist", "artista"];
const TITLE_KEYS: &[&str] = &["title", "name", "nombre", "titulo"];
const DESCRIPTION_KEYS: &[&str] = &["description", "descripcion"];
const VENUE_KEYS: &[&str] = &["venue", "sala"];
const CITY_KEYS: &[&str] = &["city", "ciudad"];
const COUNTRY_KEYS: &[&str] = &["country", "pais"];
const ADDRESS_KEYS: &[&str] = &["address", "direccion"];
const DATE_KEYS: &[&str] = &["date", "fecha"];
const REFERENCE_KEYS: &[&str] = &["reference_url", "referenceUrl", "url", "sourceUrl", "source_url"];
const ARTIST_ID_KEYS: &[&str] = &["external_id", "id", "id_artista"];
const VENUE_ID_KEYS: &[&str] = &["external_id", "id", "id_sala"];
const NAME_KEYS: &[&str] = &["name", "nombre"];

/// Read a scraper export file and translate it into typed staging payloads.
pub fn load_staging_export(path: &Path) -> anyhow::Result<Vec<StagedPayload>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_staging_export(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Accepts a bare array of events or an object holding any of the known
/// collection names; field names may use any known alias.
pub fn parse_staging_export(text: &str) -> Result<Vec<StagedPayload>, AdapterError> {
    let root: JsonValue = serde_json::from_str(text)?;
    let mut payloads = Vec::new();

    match root {
        JsonValue::Array(items) => {
            payloads.extend(objects("events", &items).map(|o| StagedPayload::Event(event_from(o))));
        }
        JsonValue::Object(map) => {
            let mut recognized = false;
            if let Some(items) = collection(&map, EVENT_COLLECTIONS) {
                recognized = true;
                payloads.extend(objects("events", items).map(|o| StagedPayload::Event(event_from(o))));
            }
            if let Some(items) = collection(&map, ARTIST_COLLECTIONS) {
                recognized = true;
                payloads.extend(objects("artists", items).map(|o| StagedPayload::Artist(artist_from(o))));
            }
            if let Some(items) = collection(&map, VENUE_COLLECTIONS) {
                recognized = true;
                payloads.extend(objects("venues", items).map(|o| StagedPayload::Venue(venue_from(o))));
            }
            if !recognized {
                return Err(AdapterError::UnrecognizedShape);
            }
        }
        _ => return Err(AdapterError::UnrecognizedShape),
    }

    Ok(payloads)
}

fn collection<'a>(map: &'a Map<String, JsonValue>, names: &[&str]) -> Option<&'a Vec<JsonValue>> {
    names.iter().find_map(|name| map.get(*name).and_then(JsonValue::as_array))
}

fn objects<'a>(
    collection: &'static str,
    items: &'a [JsonValue],
) -> impl Iterator<Item = &'a Map<String, JsonValue>> + 'a {
    items.iter().enumerate().filter_map(move |(index, item)| {
        let object = item.as_object();
        if object.is_none() {
            warn!(collection, index, "skipping non-object entry in staging export");
        }
        object
    })
}

fn pick(object: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn event_from(object: &Map<String, JsonValue>) -> StagedEventCandidate {
    let location = object.get("location").and_then(|raw| {
        match serde_json::from_value::<PartialLocation>(raw.clone()) {
            Ok(location) => Some(location),
            Err(err) => {
                warn!(error = %err, "dropping unreadable location object");
                None
            }
        }
    });

    StagedEventCandidate {
        performer: pick(object, PERFORMER_KEYS),
        title: pick(object, TITLE_KEYS),
        description: pick(object, DESCRIPTION_KEYS),
        venue: pick(object, VENUE_KEYS),
        city: pick(object, CITY_KEYS),
        country: pick(object, COUNTRY_KEYS),
        address: pick(object, ADDRESS_KEYS),
        date: pick(object, DATE_KEYS),
        reference_url: pick(object, REFERENCE_KEYS),
        location,
    }
}

fn remaining_attributes(
    object: &Map<String, JsonValue>,
    consumed: &[&[&str]],
) -> BTreeMap<String, JsonValue> {
    object
        .iter()
        .filter(|(key, _)| key.as_str() != "_id")
        .filter(|(key, _)| !consumed.iter().any(|keys| keys.contains(&key.as_str())))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn artist_from(object: &Map<String, JsonValue>) -> StagedArtist {
    StagedArtist {
        external_id: pick(object, ARTIST_ID_KEYS),
        name: pick(object, NAME_KEYS),
        attributes: remaining_attributes(object, &[ARTIST_ID_KEYS, NAME_KEYS]),
    }
}

fn venue_from(object: &Map<String, JsonValue>) -> StagedVenue {
    StagedVenue {
        external_id: pick(object, VENUE_ID_KEYS),
        name: pick(object, NAME_KEYS),
        city: pick(object, CITY_KEYS),
        country: pick(object, COUNTRY_KEYS),
        address: pick(object, ADDRESS_KEYS),
        attributes: remaining_attributes(
            object,
            &[VENUE_ID_KEYS, NAME_KEYS, CITY_KEYS, COUNTRY_KEYS, ADDRESS_KEYS],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn legacy_spanish_export_maps_to_canonical_fields() {
        let payloads = parse_staging_export(
            r#"{
                "eventos": [{
                    "artista": "Farruquito",
                    "nombre": "Gala flamenca",
                    "fecha": "2024-05-10",
                    "ciudad": "Sevilla",
                    "direccion": "Calle Betis 1, Sevilla",
                    "url": "https://tablao.example/gala"
                }],
                "artistas": [{"id_artista": "farruquito", "nombre": "Farruquito", "estilo": "baile"}],
                "salas_tablos_festivales": [{"id_sala": "triana", "nombre": "Tablao Triana", "ciudad": "Sevilla"}]
            }"#,
        )
        .unwrap();

        assert_eq!(payloads.len(), 3);
        let StagedPayload::Event(event) = &payloads[0] else {
            panic!("expected event first");
        };
        assert_eq!(event.performer.as_deref(), Some("Farruquito"));
        assert_eq!(event.title.as_deref(), Some("Gala flamenca"));
        assert_eq!(event.date.as_deref(), Some("2024-05-10"));
        assert_eq!(event.reference_url.as_deref(), Some("https://tablao.example/gala"));

        let StagedPayload::Artist(artist) = &payloads[1] else {
            panic!("expected artist second");
        };
        assert_eq!(artist.external_id.as_deref(), Some("farruquito"));
        assert_eq!(artist.attributes.get("estilo"), Some(&JsonValue::from("baile")));
        assert!(!artist.attributes.contains_key("nombre"));

        let StagedPayload::Venue(venue) = &payloads[2] else {
            panic!("expected venue third");
        };
        assert_eq!(venue.external_id.as_deref(), Some("triana"));
        assert_eq!(venue.city.as_deref(), Some("Sevilla"));
    }

    #[test]
    fn bare_array_is_a_list_of_events() {
        let payloads = parse_staging_export(
            r#"[{"artist": "X", "date": "2024-01-01", "location": {"coordinates": [-3.7, 40.4]}}, 7]"#,
        )
        .unwrap();
        assert_eq!(payloads.len(), 1);
        let StagedPayload::Event(event) = &payloads[0] else {
            panic!("expected event");
        };
        assert_eq!(
            event.location.as_ref().and_then(PartialLocation::to_point).map(|p| p.coordinates),
            Some([-3.7, 40.4])
        );
    }

    #[test]
    fn unknown_shape_is_rejected() {
        assert!(matches!(
            parse_staging_export(r#"{"data": []}"#),
            Err(AdapterError::UnrecognizedShape)
        ));
        assert!(matches!(parse_staging_export("not json"), Err(AdapterError::Json(_))));
    }

    #[test]
    fn export_file_is_loaded_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"events": [{{"performer": "Y", "date": "2024-02-02"}}]}}"#).unwrap();
        let payloads = load_staging_export(file.path()).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].kind(), "event");
    }

    #[test]
    fn nominatim_places_parse_string_coordinates() {
        let places = vec![NominatimPlace {
            lat: "40.4155".into(),
            lon: "-3.7074".into(),
        }];
        let matches = NominatimGeocoder::parse_places(places).unwrap();
        assert_eq!(matches, vec![GeocodeMatch { lon: -3.7074, lat: 40.4155 }]);

        let bad = vec![NominatimPlace {
            lat: "north".into(),
            lon: "-3.7".into(),
        }];
        assert!(matches!(
            NominatimGeocoder::parse_places(bad),
            Err(GeocodeError::Malformed(_))
        ));
    }

    #[test]
    fn google_status_codes_map_to_matches_or_errors() {
        let ok: GoogleGeocodeResponse = serde_json::from_value(serde_json::json!({
            "status": "OK",
            "results": [{"geometry": {"location": {"lat": 37.38, "lng": -5.99}}}]
        }))
        .unwrap();
        assert_eq!(
            GoogleGeocoder::parse_response(ok).unwrap(),
            vec![GeocodeMatch { lon: -5.99, lat: 37.38 }]
        );

        let empty: GoogleGeocodeResponse =
            serde_json::from_value(serde_json::json!({"status": "ZERO_RESULTS"})).unwrap();
        assert!(GoogleGeocoder::parse_response(empty).unwrap().is_empty());

        let denied: GoogleGeocodeResponse = serde_json::from_value(serde_json::json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        }))
        .unwrap();
        assert!(matches!(
            GoogleGeocoder::parse_response(denied),
            Err(GeocodeError::Provider { .. })
        ));
    }

    #[tokio::test]
    async fn disabled_geocoder_never_matches() {
        let query = GeocodeQuery {
            text: "Plaza Mayor, Madrid".into(),
            country_code: Some("es".into()),
        };
        assert!(DisabledGeocoder.geocode(&query).await.unwrap().is_empty());
    }
}
