// Raw producer-supplied records and shared geometry types
//
// A RawRecord is the flat contract every collector hands the core: a small
// required core (source_name, name) plus an open bag of source-specific
// fields consumed only by that source's contextual block. Records are
// ephemeral; nothing here is persisted as-is past validation.

use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ============================================================================
// SOURCE TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// Place listings (the registry's primary input)
    Venues,

    /// Scraped or API-sourced event pages
    Events,

    /// Social sentiment mentions per venue
    SocialSentiment,

    /// Scores produced by the ML prediction service
    MlPredictions,

    /// Weather observations near a venue
    Weather,

    /// Road congestion / travel time
    Traffic,

    /// Foot-traffic counters
    FootTraffic,

    /// Economic indicators for the surrounding area
    Economic,

    /// Census-style demographic data
    Demographic,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Venues => "venues",
            SourceType::Events => "events",
            SourceType::SocialSentiment => "social_sentiment",
            SourceType::MlPredictions => "ml_predictions",
            SourceType::Weather => "weather",
            SourceType::Traffic => "traffic",
            SourceType::FootTraffic => "foot_traffic",
            SourceType::Economic => "economic",
            SourceType::Demographic => "demographic",
        }
    }

    pub fn parse(s: &str) -> Option<SourceType> {
        match s.trim().to_lowercase().as_str() {
            "venues" | "venue" => Some(SourceType::Venues),
            "events" | "event" => Some(SourceType::Events),
            "social_sentiment" | "social" => Some(SourceType::SocialSentiment),
            "ml_predictions" | "ml" => Some(SourceType::MlPredictions),
            "weather" => Some(SourceType::Weather),
            "traffic" => Some(SourceType::Traffic),
            "foot_traffic" => Some(SourceType::FootTraffic),
            "economic" => Some(SourceType::Economic),
            "demographic" => Some(SourceType::Demographic),
            _ => None,
        }
    }

    /// Fields a record of this source must carry to count as complete.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            SourceType::Venues => &["name", "lat", "lng"],
            SourceType::Events => &["name", "start_time"],
            SourceType::SocialSentiment => &["venue_name", "mention_count"],
            SourceType::MlPredictions => &["venue_name", "predicted_score"],
            SourceType::Weather => &["temperature"],
            SourceType::Traffic => &["congestion_score"],
            SourceType::FootTraffic => &["visit_count"],
            SourceType::Economic => &["indicator_value"],
            SourceType::Demographic => &["population"],
        }
    }

    /// Freshness window used for the recency ratio in quality scoring.
    pub fn freshness_window(&self) -> chrono::Duration {
        match self {
            SourceType::Venues => chrono::Duration::days(7),
            SourceType::Events => chrono::Duration::days(1),
            SourceType::SocialSentiment => chrono::Duration::hours(6),
            SourceType::MlPredictions => chrono::Duration::days(1),
            SourceType::Weather => chrono::Duration::hours(1),
            SourceType::Traffic => chrono::Duration::minutes(30),
            SourceType::FootTraffic => chrono::Duration::days(1),
            SourceType::Economic => chrono::Duration::days(30),
            SourceType::Demographic => chrono::Duration::days(365),
        }
    }
}

// ============================================================================
// RAW RECORD
// ============================================================================

/// One normalized record from one producer. Core fields are typed; anything
/// source-specific rides in the `extra` map and is only interpreted by that
/// source's contextual block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawRecord {
    pub source_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    /// When the producer last observed this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Source-specific payload (sentiment_score, temperature, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(source_name: &str) -> Self {
        RawRecord {
            source_name: source_name.to_string(),
            ..Default::default()
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }

    /// True when the named field carries a value, checking the typed core
    /// first and the extension map second.
    pub fn field_present(&self, field: &str) -> bool {
        match field {
            "source_name" => !self.source_name.is_empty(),
            "external_id" => self.external_id.is_some(),
            "name" => self.name.as_deref().map(|n| !n.trim().is_empty()).unwrap_or(false),
            "category" => self.category.is_some(),
            "lat" => self.lat.is_some(),
            "lng" => self.lng.is_some(),
            "address" => self.address.is_some(),
            "phone" => self.phone.is_some(),
            "website" => self.website.is_some(),
            "updated_at" => self.updated_at.is_some(),
            other => self.extra.get(other).map(|v| !v.is_null()).unwrap_or(false),
        }
    }

    /// True when every typed field and every extra value is absent.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.external_id.is_none()
            && self.category.is_none()
            && self.lat.is_none()
            && self.lng.is_none()
            && self.address.is_none()
            && self.phone.is_none()
            && self.website.is_none()
            && self.extra.values().all(|v| v.is_null())
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        match self.extra.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        match self.extra.get(key)? {
            serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn set_extra_f64(&mut self, key: &str, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.extra.insert(key.to_string(), serde_json::Value::Number(n));
        }
    }
}

// ============================================================================
// EVENT RECORD
// ============================================================================

/// An event observed by a collector, before and after venue linking.
/// `venue_id` is filled in by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventRecord {
    /// Assigned on first persistence; empty until then
    #[serde(default)]
    pub event_id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub event_score: f64,

    #[serde(default)]
    pub psychographic_relevance: f64,

    #[serde(default)]
    pub source_name: String,
}

impl EventRecord {
    /// Assign a fresh id if the record does not have one yet.
    pub fn ensure_id(&mut self) {
        if self.event_id.is_empty() {
            self.event_id = uuid::Uuid::new_v4().to_string();
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }

    /// Build an event from a raw record of an event source. The event-shaped
    /// fields ride in the record's extension map. Returns None when the
    /// record has no name.
    pub fn from_raw(record: &RawRecord) -> Option<EventRecord> {
        let name = record.name.as_deref()?.trim().to_string();
        if name.is_empty() {
            return None;
        }

        Some(EventRecord {
            event_id: record.external_id.clone().unwrap_or_default(),
            name,
            category: record.category.clone(),
            venue_id: None,
            venue_name: record.extra_str("venue_name").map(|s| s.to_string()),
            lat: record.lat,
            lng: record.lng,
            start_time: record.extra_str("start_time").and_then(parse_timestamp),
            end_time: record.extra_str("end_time").and_then(parse_timestamp),
            event_score: record.extra_f64("event_score").unwrap_or(0.0),
            psychographic_relevance: record
                .extra_f64("psychographic_relevance")
                .unwrap_or(0.0),
            source_name: record.source_name.clone(),
        })
    }
}

// ============================================================================
// BOUNDING BOX
// ============================================================================

/// Planar lat/lng bounding box used by all aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Build a box from two corners in any order.
    pub fn new(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> Self {
        BoundingBox {
            min_lat: lat1.min(lat2),
            min_lng: lng1.min(lng2),
            max_lat: lat1.max(lat2),
            max_lng: lng1.max(lng2),
        }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

// ============================================================================
// CSV INGEST
// ============================================================================

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive timestamps are taken as UTC
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn parse_extra_value(s: &str) -> serde_json::Value {
    if let Ok(n) = s.trim().parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return serde_json::Value::Number(num);
        }
    }
    serde_json::Value::String(s.to_string())
}

/// Load raw records from a CSV file. Known columns land in the typed core;
/// every other non-empty column lands in the extension map.
pub fn load_raw_records(path: &Path, source_name: &str) -> Result<Vec<RawRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let headers = rdr.headers()?.clone();

    let mut records = Vec::new();

    for row in rdr.records() {
        let row = row?;
        let mut record = RawRecord::new(source_name);

        for (header, value) in headers.iter().zip(row.iter()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match header.trim().to_lowercase().as_str() {
                "external_id" | "id" => record.external_id = Some(value.to_string()),
                "name" => record.name = Some(value.to_string()),
                "category" => record.category = Some(value.to_string()),
                "lat" | "latitude" => record.lat = value.parse().ok(),
                "lng" | "lon" | "longitude" => record.lng = value.parse().ok(),
                "address" => record.address = Some(value.to_string()),
                "phone" => record.phone = Some(value.to_string()),
                "website" => record.website = Some(value.to_string()),
                "updated_at" => record.updated_at = parse_timestamp(value),
                other => {
                    record.extra.insert(other.to_string(), parse_extra_value(value));
                }
            }
        }

        records.push(record);
    }

    Ok(records)
}

/// Load event records from a CSV file.
pub fn load_event_records(path: &Path, source_name: &str) -> Result<Vec<EventRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let headers = rdr.headers()?.clone();

    let mut events = Vec::new();

    for row in rdr.records() {
        let row = row?;
        let mut event = EventRecord {
            source_name: source_name.to_string(),
            ..Default::default()
        };

        for (header, value) in headers.iter().zip(row.iter()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match header.trim().to_lowercase().as_str() {
                "name" => event.name = value.to_string(),
                "category" => event.category = Some(value.to_string()),
                "venue_name" => event.venue_name = Some(value.to_string()),
                "lat" | "latitude" => event.lat = value.parse().ok(),
                "lng" | "lon" | "longitude" => event.lng = value.parse().ok(),
                "start_time" => event.start_time = parse_timestamp(value),
                "end_time" => event.end_time = parse_timestamp(value),
                "event_score" => event.event_score = value.parse().unwrap_or(0.0),
                "psychographic_relevance" => {
                    event.psychographic_relevance = value.parse().unwrap_or(0.0)
                }
                _ => {}
            }
        }

        if !event.name.is_empty() {
            events.push(event);
        }
    }

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bounding_box_contains() {
        let bounds = BoundingBox::new(39.2, -94.3, 39.0, -94.7);
        assert!(bounds.contains(39.1, -94.58));
        assert!(!bounds.contains(38.9, -94.58));
        assert!(!bounds.contains(39.1, -94.1));
    }

    #[test]
    fn test_field_present_core_and_extra() {
        let mut record = RawRecord::new("test_source");
        record.name = Some("Uptown Theater".to_string());
        record.extra.insert(
            "mention_count".to_string(),
            serde_json::json!(42),
        );

        assert!(record.field_present("name"));
        assert!(record.field_present("mention_count"));
        assert!(!record.field_present("lat"));
        assert!(!record.field_present("sentiment_score"));
    }

    #[test]
    fn test_extra_accessors_coerce_strings() {
        let mut record = RawRecord::new("test_source");
        record
            .extra
            .insert("temperature".to_string(), serde_json::json!("72.5"));
        record
            .extra
            .insert("visit_count".to_string(), serde_json::json!(17));

        assert_eq!(record.extra_f64("temperature"), Some(72.5));
        assert_eq!(record.extra_i64("visit_count"), Some(17));
        assert_eq!(record.extra_f64("missing"), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026-03-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-03-01T12:00:00+00:00").is_some());
        assert!(parse_timestamp("2026-03-01 12:00:00").is_some());
        assert!(parse_timestamp("not a time").is_none());
    }

    #[test]
    fn test_load_raw_records_from_csv() {
        let path = std::env::temp_dir().join(format!(
            "venue_consolidation_test_{}.csv",
            uuid::Uuid::new_v4()
        ));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "name,lat,lng,category,sentiment_score").unwrap();
            writeln!(file, "T-Mobile Center,39.1012,-94.5844,arena,0.8").unwrap();
            writeln!(file, "Joe's Pizza,,,restaurant,").unwrap();
        }

        let records = load_raw_records(&path, "place_listings").unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name.as_deref(), Some("T-Mobile Center"));
        assert_eq!(records[0].lat, Some(39.1012));
        assert_eq!(records[0].extra_f64("sentiment_score"), Some(0.8));
        assert_eq!(records[1].name.as_deref(), Some("Joe's Pizza"));
        assert!(!records[1].has_coordinates());
    }

    #[test]
    fn test_load_event_records_from_csv() {
        let path = std::env::temp_dir().join(format!(
            "venue_consolidation_events_{}.csv",
            uuid::Uuid::new_v4()
        ));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "name,venue_name,start_time,event_score").unwrap();
            writeln!(
                file,
                "Playoff Game,T-Mobile Center,2026-08-07T19:00:00Z,0.9"
            )
            .unwrap();
            writeln!(file, ",orphan row without a name,,").unwrap();
        }

        let events = load_event_records(&path, "event_pages").unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Playoff Game");
        assert_eq!(events[0].venue_name.as_deref(), Some("T-Mobile Center"));
        assert!(events[0].start_time.is_some());
        assert_eq!(events[0].event_score, 0.9);
        assert_eq!(events[0].source_name, "event_pages");
    }

    #[test]
    fn test_event_from_raw_pulls_extension_fields() {
        let mut record = RawRecord::new("event_pages");
        record.name = Some("First Friday".to_string());
        record.extra.insert(
            "venue_name".to_string(),
            serde_json::json!("Crossroads Arts District"),
        );
        record.extra.insert(
            "start_time".to_string(),
            serde_json::json!("2026-09-04T18:00:00Z"),
        );
        record.set_extra_f64("event_score", 0.8);

        let event = EventRecord::from_raw(&record).unwrap();
        assert_eq!(event.name, "First Friday");
        assert_eq!(event.venue_name.as_deref(), Some("Crossroads Arts District"));
        assert!(event.start_time.is_some());
        assert_eq!(event.event_score, 0.8);

        // A raw record with no name cannot become an event
        assert!(EventRecord::from_raw(&RawRecord::new("event_pages")).is_none());
    }

    #[test]
    fn test_event_ensure_id_stable() {
        let mut event = EventRecord {
            name: "First Friday".to_string(),
            ..Default::default()
        };
        event.ensure_id();
        let id = event.event_id.clone();
        event.ensure_id();
        assert_eq!(event.event_id, id);
    }
}
