//! Canonical data model for the UrbanPulse client.
//!
//! The backend answers different endpoints with slightly different incident
//! shapes (flat coordinates, nested `location` objects, string-typed numbers,
//! divergent category/severity vocabularies). This module defines the single
//! canonical [`Incident`] used everywhere else and the normalization that maps
//! every recognized raw shape onto it. Records that cannot be resolved to real
//! coordinates are dropped, never given a synthetic position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One reading from the location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Estimated accuracy radius in meters, when the provider reports one.
    pub accuracy_m: Option<f64>,
    /// Compass heading in degrees, when moving.
    pub heading_deg: Option<f64>,
    /// Ground speed in m/s, when moving.
    pub speed_mps: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: None,
            heading_deg: None,
            speed_mps: None,
            timestamp: Utc::now(),
        }
    }

    pub fn coords(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

/// The fixed, closed set of incident categories, in priority order.
///
/// Unrecognized backend vocabulary maps to [`Category::Traffic`], the first
/// category in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Traffic,
    Weather,
    Infrastructure,
    Events,
    Safety,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Traffic,
        Category::Weather,
        Category::Infrastructure,
        Category::Events,
        Category::Safety,
    ];

    /// Maps a raw backend category string onto the closed set.
    ///
    /// Case-insensitive keyword matching; each endpoint has its own naming
    /// habits so we match on substrings rather than exact values. Returns
    /// the neutral default ([`Category::Traffic`]) when nothing matches.
    pub fn from_raw(raw: &str) -> Category {
        let lower = raw.to_lowercase();

        if contains_any(&lower, &["traffic", "congestion", "road", "transit", "accident"]) {
            return Category::Traffic;
        }
        if contains_any(&lower, &["weather", "rain", "flood", "storm", "heat"]) {
            return Category::Weather;
        }
        if contains_any(
            &lower,
            &["infrastructure", "power", "outage", "water", "utility", "construction"],
        ) {
            return Category::Infrastructure;
        }
        if contains_any(&lower, &["event", "gathering", "festival", "protest", "crowd"]) {
            return Category::Events;
        }
        if contains_any(&lower, &["safety", "crime", "fire", "hazard", "emergency", "police"]) {
            return Category::Safety;
        }

        Category::Traffic
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Traffic => "Traffic",
            Category::Weather => "Weather",
            Category::Infrastructure => "Infrastructure",
            Category::Events => "Events",
            Category::Safety => "Safety",
        }
    }

    /// Query-string value the backend expects for topic-filtered searches.
    pub fn as_query(&self) -> &'static str {
        match self {
            Category::Traffic => "traffic",
            Category::Weather => "weather",
            Category::Infrastructure => "infrastructure",
            Category::Events => "events",
            Category::Safety => "safety",
        }
    }
}

/// Incident severity with a fixed total order: critical > high > medium > low.
///
/// The derive order makes `Ord` agree with that ranking, so sorting by
/// severity is just sorting by the enum. Unrecognized backend values default
/// to [`Severity::Medium`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_raw(raw: &str) -> Severity {
        match raw.to_lowercase().as_str() {
            "low" | "minor" | "info" => Severity::Low,
            "medium" | "moderate" => Severity::Medium,
            "high" | "major" | "severe" => Severity::High,
            "critical" | "extreme" => Severity::Critical,
            _ => Severity::Medium,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MED",
            Severity::High => "HIGH",
            Severity::Critical => "CRIT",
        }
    }
}

/// The canonical, backend-agnostic incident used throughout the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: Severity,
    /// Distance from the current position in km.
    pub distance_km: f64,
    pub created_at: DateTime<Utc>,
    pub affected_population: Option<u64>,
    /// Backend confidence score in [0, 1].
    pub confidence: f64,
    pub subcategory: Option<String>,
}

/// Raw incident payload as any of the backend endpoints may return it.
///
/// One permissive shape covers the recognized variants: coordinates may be
/// flat (`lat`/`lng`, `latitude`/`longitude`), nested under `location` or
/// `coordinates`, or string-typed. Everything except `id` is optional here;
/// [`Incident::from_raw`] decides what is actually required.
#[derive(Debug, Clone, Deserialize)]
pub struct RawIncident {
    #[serde(alias = "event_id", alias = "incident_id")]
    pub id: String,
    #[serde(alias = "type", alias = "topic")]
    pub category: Option<String>,
    #[serde(alias = "name", alias = "headline")]
    pub title: Option<String>,
    #[serde(alias = "summary", alias = "details")]
    pub description: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: Option<serde_json::Value>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<serde_json::Value>,
    #[serde(alias = "coordinates", alias = "position")]
    pub location: Option<RawCoordinates>,
    #[serde(alias = "priority")]
    pub severity: Option<String>,
    pub distance_km: Option<f64>,
    #[serde(alias = "timestamp", alias = "reported_at")]
    pub created_at: Option<DateTime<Utc>>,
    pub affected_population: Option<u64>,
    #[serde(alias = "confidence_score")]
    pub confidence: Option<f64>,
    #[serde(alias = "sub_category", alias = "subtype")]
    pub subcategory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCoordinates {
    #[serde(alias = "lat")]
    pub latitude: Option<serde_json::Value>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<serde_json::Value>,
}

/// Parses a coordinate that may arrive as a JSON number or a string.
/// Rejects non-finite values.
fn parse_coord(value: &serde_json::Value) -> Option<f64> {
    let v = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !v.is_finite() {
        return None;
    }
    Some(v)
}

impl Incident {
    /// Normalizes one raw backend record into the canonical shape.
    ///
    /// Coordinates are resolved from the flat fields first, then from the
    /// nested location object. Records with no resolvable coordinates (or the
    /// 0,0 placeholder some backends emit for "unknown") return `None` and are
    /// dropped by the caller; a record is never given a synthetic position.
    /// Missing category/severity fall back to the documented defaults;
    /// distance is recomputed from `origin` when the backend did not include
    /// one.
    pub fn from_raw(raw: RawIncident, origin: Option<(f64, f64)>) -> Option<Incident> {
        let (latitude, longitude) = resolve_coordinates(&raw)?;

        let distance_km = raw
            .distance_km
            .or_else(|| origin.map(|(lat, lng)| haversine_km(lat, lng, latitude, longitude)));

        Some(Incident {
            category: raw
                .category
                .as_deref()
                .map(Category::from_raw)
                .unwrap_or(Category::Traffic),
            severity: raw
                .severity
                .as_deref()
                .map(Severity::from_raw)
                .unwrap_or(Severity::Medium),
            title: raw.title.unwrap_or_else(|| "Untitled incident".to_string()),
            description: raw.description.unwrap_or_default(),
            latitude,
            longitude,
            distance_km: distance_km.unwrap_or(0.0),
            created_at: raw.created_at.unwrap_or_else(Utc::now),
            affected_population: raw.affected_population,
            confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            subcategory: raw.subcategory,
            id: raw.id,
        })
    }
}

fn resolve_coordinates(raw: &RawIncident) -> Option<(f64, f64)> {
    let flat = match (&raw.latitude, &raw.longitude) {
        (Some(lat), Some(lng)) => parse_coord(lat).zip(parse_coord(lng)),
        _ => None,
    };
    let resolved = flat.or_else(|| {
        let loc = raw.location.as_ref()?;
        let lat = parse_coord(loc.latitude.as_ref()?)?;
        let lng = parse_coord(loc.longitude.as_ref()?)?;
        Some((lat, lng))
    });

    match resolved {
        Some((lat, lng)) if lat != 0.0 || lng != 0.0 => Some((lat, lng)),
        _ => {
            warn!("Dropping incident '{}': no resolvable coordinates", raw.id);
            None
        }
    }
}

/// Great-circle distance between two WGS84 points, in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// A synthesized, possibly multi-incident summary pushed from the backend.
///
/// Cards are server-authored: the client only reads them, replaces the whole
/// list on each push, and may request a one-card expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardCard {
    pub id: String,
    #[serde(alias = "type")]
    pub card_type: String,
    pub priority: Severity,
    pub title: String,
    pub summary: String,
    #[serde(alias = "action")]
    pub suggested_action: Option<String>,
    pub confidence: f64,
    pub distance_km: Option<f64>,
    pub synthesis: Option<SynthesisMeta>,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    #[serde(default)]
    pub expandable: bool,
}

/// How a multi-incident card was synthesized server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisMeta {
    pub source_count: u32,
    pub dominant_topic: Option<String>,
    pub key_insight: Option<String>,
}

/// Typed messages delivered on the dashboard push stream.
///
/// Unknown message types fail to deserialize and are dropped by the consumer
/// with a warning rather than tearing the stream down.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    DashboardUpdate {
        cards: Vec<DashboardCard>,
        #[serde(default)]
        high_priority_count: Option<u32>,
    },
    Heartbeat,
    Error {
        message: String,
    },
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_from(v: serde_json::Value) -> RawIncident {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn maps_known_categories() {
        assert_eq!(Category::from_raw("Road Accident"), Category::Traffic);
        assert_eq!(Category::from_raw("FLOOD_WARNING"), Category::Weather);
        assert_eq!(Category::from_raw("power-outage"), Category::Infrastructure);
        assert_eq!(Category::from_raw("street festival"), Category::Events);
        assert_eq!(Category::from_raw("fire hazard"), Category::Safety);
    }

    #[test]
    fn unknown_category_defaults_to_traffic() {
        assert_eq!(Category::from_raw("xyzzy"), Category::Traffic);
    }

    #[test]
    fn unknown_severity_defaults_to_medium() {
        assert_eq!(Severity::from_raw("whatever"), Severity::Medium);
        assert_eq!(Severity::from_raw("SEVERE"), Severity::High);
    }

    #[test]
    fn severity_orders_critical_highest() {
        let mut v = vec![Severity::High, Severity::Low, Severity::Critical, Severity::Medium];
        v.sort();
        assert_eq!(
            v,
            vec![Severity::Low, Severity::Medium, Severity::High, Severity::Critical]
        );
    }

    #[test]
    fn normalizes_flat_coordinates() {
        let raw = raw_from(json!({
            "id": "evt_1",
            "category": "traffic",
            "title": "Jam on ORR",
            "lat": 12.9120,
            "lng": 77.6365,
            "severity": "high"
        }));
        let inc = Incident::from_raw(raw, Some((12.9716, 77.5946))).unwrap();
        assert_eq!(inc.id, "evt_1");
        assert_eq!(inc.severity, Severity::High);
        assert!((inc.latitude - 12.9120).abs() < f64::EPSILON);
        assert!(inc.distance_km > 0.0);
    }

    #[test]
    fn normalizes_nested_string_coordinates() {
        let raw = raw_from(json!({
            "id": "evt_2",
            "location": { "lat": "12.95", "lon": "77.60" }
        }));
        let inc = Incident::from_raw(raw, None).unwrap();
        assert!((inc.latitude - 12.95).abs() < f64::EPSILON);
        assert_eq!(inc.category, Category::Traffic);
        assert_eq!(inc.severity, Severity::Medium);
    }

    #[test]
    fn drops_record_without_coordinates() {
        let raw = raw_from(json!({ "id": "evt_3", "title": "No position" }));
        assert!(Incident::from_raw(raw, None).is_none());
    }

    #[test]
    fn drops_null_island_coordinates() {
        let raw = raw_from(json!({ "id": "evt_4", "lat": 0.0, "lng": 0.0 }));
        assert!(Incident::from_raw(raw, None).is_none());
    }

    #[test]
    fn drops_unparseable_string_coordinates() {
        let raw = raw_from(json!({ "id": "evt_5", "lat": "north-ish", "lng": "77.6" }));
        assert!(Incident::from_raw(raw, None).is_none());
    }

    #[test]
    fn backend_distance_wins_over_computed() {
        let raw = raw_from(json!({
            "id": "evt_6",
            "lat": 12.9,
            "lng": 77.6,
            "distance_km": 3.5
        }));
        let inc = Incident::from_raw(raw, Some((12.9716, 77.5946))).unwrap();
        assert!((inc.distance_km - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn haversine_is_zero_for_same_point() {
        assert!(haversine_km(12.9, 77.6, 12.9, 77.6).abs() < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Bengaluru city center to Bellandur, roughly 8 km.
        let d = haversine_km(12.9716, 77.5946, 12.9120, 77.6365);
        assert!(d > 6.0 && d < 10.0, "got {d}");
    }

    #[test]
    fn parses_stream_messages() {
        let msg: StreamMessage = serde_json::from_value(json!({ "type": "heartbeat" })).unwrap();
        assert!(matches!(msg, StreamMessage::Heartbeat));

        let msg: StreamMessage = serde_json::from_value(json!({
            "type": "dashboard_update",
            "cards": [],
            "high_priority_count": 2
        }))
        .unwrap();
        match msg {
            StreamMessage::DashboardUpdate { cards, high_priority_count } => {
                assert!(cards.is_empty());
                assert_eq!(high_priority_count, Some(2));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_stream_message_is_rejected() {
        let res: Result<StreamMessage, _> = serde_json::from_value(json!({ "type": "mystery" }));
        assert!(res.is_err());
    }
}
