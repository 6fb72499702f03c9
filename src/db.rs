// SQLite schema + repository functions
//
// The canonical venue table is the only exclusive-write resource in the
// system; everything else is per-source contextual data keyed by venue_id.
// All timestamps are RFC3339 TEXT in UTC.

use crate::error::Result;
use crate::records::{BoundingBox, EventRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// CANONICAL VENUE
// ============================================================================

/// The single deduplicated representation of a real-world place.
///
/// `venue_id` is immutable for the lifetime of the venue. Duplicates are
/// merged INTO an existing venue, never replace it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalVenue {
    pub venue_id: String,
    pub name: String,
    pub category: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,

    /// Source names that have contributed to this venue
    pub provenance: BTreeSet<String>,

    /// Persisted aggregate score written by the aggregator's refresh pass
    pub aggregate_score: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalVenue {
    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }
}

// ============================================================================
// CONTEXTUAL BLOCKS (one table per source)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherData {
    pub venue_id: String,
    pub temperature: Option<f64>,
    pub conditions: Option<String>,
    pub humidity: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficData {
    pub venue_id: String,
    pub congestion_score: Option<f64>,
    pub travel_time_minutes: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialSentimentData {
    pub venue_id: String,
    pub sentiment_score: Option<f64>,
    pub mention_count: Option<i64>,
    pub platform: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlPredictionData {
    pub venue_id: String,
    pub predicted_score: Option<f64>,
    pub confidence_lower: Option<f64>,
    pub confidence_upper: Option<f64>,
    pub model_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootTrafficData {
    pub venue_id: String,
    pub visit_count: Option<i64>,
    pub dwell_minutes: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicData {
    pub venue_id: String,
    pub indicator_name: Option<String>,
    pub indicator_value: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemographicData {
    pub venue_id: String,
    pub population: Option<i64>,
    pub median_income: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS venues (
            venue_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT,
            lat REAL,
            lng REAL,
            address TEXT,
            phone TEXT,
            website TEXT,
            provenance TEXT NOT NULL DEFAULT '[]',
            aggregate_score REAL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT,
            venue_id TEXT,
            venue_name TEXT,
            lat REAL,
            lng REAL,
            start_time TEXT,
            end_time TEXT,
            event_score REAL NOT NULL DEFAULT 0,
            psychographic_relevance REAL NOT NULL DEFAULT 0,
            source_name TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    // One row per venue per contextual source; upserts keep the latest
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS weather_data (
            venue_id TEXT PRIMARY KEY,
            temperature REAL,
            conditions TEXT,
            humidity REAL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS traffic_data (
            venue_id TEXT PRIMARY KEY,
            congestion_score REAL,
            travel_time_minutes REAL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS social_sentiment (
            venue_id TEXT PRIMARY KEY,
            sentiment_score REAL,
            mention_count INTEGER,
            platform TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS ml_predictions (
            venue_id TEXT PRIMARY KEY,
            predicted_score REAL,
            confidence_lower REAL,
            confidence_upper REAL,
            model_version TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS foot_traffic (
            venue_id TEXT PRIMARY KEY,
            visit_count INTEGER,
            dwell_minutes REAL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS economic_data (
            venue_id TEXT PRIMARY KEY,
            indicator_name TEXT,
            indicator_value REAL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS demographic_data (
            venue_id TEXT PRIMARY KEY,
            population INTEGER,
            median_income REAL,
            updated_at TEXT NOT NULL
        );",
    )?;

    // Audit trail of match decisions
    conn.execute(
        "CREATE TABLE IF NOT EXISTS match_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            venue_id TEXT NOT NULL,
            source_name TEXT NOT NULL,
            match_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            name_similarity REAL,
            distance_m REAL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Latest quality gate result per source
    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_quality (
            source_name TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            quality_score REAL NOT NULL,
            record_count INTEGER NOT NULL,
            validated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_venues_name ON venues(name);
        CREATE INDEX IF NOT EXISTS idx_venues_coords ON venues(lat, lng);
        CREATE INDEX IF NOT EXISTS idx_events_venue ON events(venue_id);
        CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_time);",
    )?;

    Ok(())
}

// ============================================================================
// TIMESTAMP HELPERS
// ============================================================================

fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn from_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// VENUES
// ============================================================================

const VENUE_COLUMNS: &str = "venue_id, name, category, lat, lng, address, phone, website, \
     provenance, aggregate_score, created_at, updated_at";

fn venue_from_row(row: &Row) -> rusqlite::Result<CanonicalVenue> {
    let provenance_json: String = row.get(8)?;
    let provenance: BTreeSet<String> = serde_json::from_str(&provenance_json).unwrap_or_default();
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(CanonicalVenue {
        venue_id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        lat: row.get(3)?,
        lng: row.get(4)?,
        address: row.get(5)?,
        phone: row.get(6)?,
        website: row.get(7)?,
        provenance,
        aggregate_score: row.get(9)?,
        created_at: from_ts(&created_at),
        updated_at: from_ts(&updated_at),
    })
}

pub fn insert_venue(conn: &Connection, venue: &CanonicalVenue) -> Result<()> {
    let provenance_json = serde_json::to_string(&venue.provenance)?;
    conn.execute(
        "INSERT INTO venues (
            venue_id, name, category, lat, lng, address, phone, website,
            provenance, aggregate_score, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            venue.venue_id,
            venue.name,
            venue.category,
            venue.lat,
            venue.lng,
            venue.address,
            venue.phone,
            venue.website,
            provenance_json,
            venue.aggregate_score,
            to_ts(venue.created_at),
            to_ts(venue.updated_at),
        ],
    )?;
    Ok(())
}

/// Full-row update keyed by venue_id. The id itself never changes.
pub fn update_venue(conn: &Connection, venue: &CanonicalVenue) -> Result<()> {
    let provenance_json = serde_json::to_string(&venue.provenance)?;
    conn.execute(
        "UPDATE venues SET
            name = ?2, category = ?3, lat = ?4, lng = ?5, address = ?6,
            phone = ?7, website = ?8, provenance = ?9, aggregate_score = ?10,
            updated_at = ?11
         WHERE venue_id = ?1",
        params![
            venue.venue_id,
            venue.name,
            venue.category,
            venue.lat,
            venue.lng,
            venue.address,
            venue.phone,
            venue.website,
            provenance_json,
            venue.aggregate_score,
            to_ts(venue.updated_at),
        ],
    )?;
    Ok(())
}

pub fn delete_venue(conn: &Connection, venue_id: &str) -> Result<()> {
    conn.execute("DELETE FROM venues WHERE venue_id = ?1", params![venue_id])?;
    Ok(())
}

/// All venues ordered first-seen first. The ordering matters: duplicate
/// consolidation keeps the earliest venue as master.
pub fn get_all_venues(conn: &Connection) -> Result<Vec<CanonicalVenue>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM venues ORDER BY created_at, venue_id",
        VENUE_COLUMNS
    ))?;
    let venues = stmt
        .query_map([], venue_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(venues)
}

pub fn get_venue(conn: &Connection, venue_id: &str) -> Result<Option<CanonicalVenue>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM venues WHERE venue_id = ?1",
        VENUE_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![venue_id], venue_from_row)?;
    rows.next().transpose().map_err(Into::into)
}

pub fn get_venues_in_bounds(
    conn: &Connection,
    bounds: &BoundingBox,
) -> Result<Vec<CanonicalVenue>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM venues
         WHERE lat IS NOT NULL AND lng IS NOT NULL
           AND lat BETWEEN ?1 AND ?2 AND lng BETWEEN ?3 AND ?4
         ORDER BY created_at, venue_id",
        VENUE_COLUMNS
    ))?;
    let venues = stmt
        .query_map(
            params![bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng],
            venue_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(venues)
}

pub fn count_venues(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM venues", [], |row| row.get(0))?;
    Ok(count)
}

pub fn set_venue_aggregate_score(conn: &Connection, venue_id: &str, score: f64) -> Result<()> {
    conn.execute(
        "UPDATE venues SET aggregate_score = ?2 WHERE venue_id = ?1",
        params![venue_id, score],
    )?;
    Ok(())
}

// ============================================================================
// EVENTS
// ============================================================================

const EVENT_COLUMNS: &str = "event_id, name, category, venue_id, venue_name, lat, lng, \
     start_time, end_time, event_score, psychographic_relevance, source_name";

fn event_from_row(row: &Row) -> rusqlite::Result<EventRecord> {
    let start_time: Option<String> = row.get(7)?;
    let end_time: Option<String> = row.get(8)?;

    Ok(EventRecord {
        event_id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        venue_id: row.get(3)?,
        venue_name: row.get(4)?,
        lat: row.get(5)?,
        lng: row.get(6)?,
        start_time: start_time.as_deref().map(from_ts),
        end_time: end_time.as_deref().map(from_ts),
        event_score: row.get(9)?,
        psychographic_relevance: row.get(10)?,
        source_name: row.get(11)?,
    })
}

pub fn upsert_event(conn: &Connection, event: &mut EventRecord) -> Result<()> {
    event.ensure_id();
    conn.execute(
        "INSERT OR REPLACE INTO events (
            event_id, name, category, venue_id, venue_name, lat, lng,
            start_time, end_time, event_score, psychographic_relevance, source_name
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event.event_id,
            event.name,
            event.category,
            event.venue_id,
            event.venue_name,
            event.lat,
            event.lng,
            event.start_time.map(to_ts),
            event.end_time.map(to_ts),
            event.event_score,
            event.psychographic_relevance,
            event.source_name,
        ],
    )?;
    Ok(())
}

/// Events inside the bounding box. Events without their own coordinates
/// fall back to their linked venue's location.
pub fn get_events_in_bounds(conn: &Connection, bounds: &BoundingBox) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM (
            SELECT e.event_id, e.name, e.category, e.venue_id, e.venue_name,
                   COALESCE(e.lat, v.lat) AS lat, COALESCE(e.lng, v.lng) AS lng,
                   e.start_time, e.end_time, e.event_score,
                   e.psychographic_relevance, e.source_name
            FROM events e LEFT JOIN venues v ON e.venue_id = v.venue_id
         )
         WHERE lat IS NOT NULL AND lng IS NOT NULL
           AND lat BETWEEN ?1 AND ?2 AND lng BETWEEN ?3 AND ?4",
        EVENT_COLUMNS
    ))?;
    let events = stmt
        .query_map(
            params![bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng],
            event_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

pub fn get_events_for_venue(conn: &Connection, venue_id: &str) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events WHERE venue_id = ?1",
        EVENT_COLUMNS
    ))?;
    let events = stmt
        .query_map(params![venue_id], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Re-point every event referencing `from_venue` at `to_venue`. Used when a
/// duplicate venue is merged into its master.
pub fn reassign_events(conn: &Connection, from_venue: &str, to_venue: &str) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE events SET venue_id = ?2 WHERE venue_id = ?1",
        params![from_venue, to_venue],
    )?;
    Ok(changed)
}

pub fn count_events(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// CONTEXTUAL BLOCK ACCESS
// ============================================================================

pub fn upsert_weather(conn: &Connection, data: &WeatherData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO weather_data (venue_id, temperature, conditions, humidity, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            data.venue_id,
            data.temperature,
            data.conditions,
            data.humidity,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_weather(conn: &Connection, venue_id: &str) -> Result<Option<WeatherData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, temperature, conditions, humidity, updated_at
         FROM weather_data WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(4)?;
        Ok(WeatherData {
            venue_id: row.get(0)?,
            temperature: row.get(1)?,
            conditions: row.get(2)?,
            humidity: row.get(3)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

pub fn upsert_traffic(conn: &Connection, data: &TrafficData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO traffic_data (venue_id, congestion_score, travel_time_minutes, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            data.venue_id,
            data.congestion_score,
            data.travel_time_minutes,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_traffic(conn: &Connection, venue_id: &str) -> Result<Option<TrafficData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, congestion_score, travel_time_minutes, updated_at
         FROM traffic_data WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(3)?;
        Ok(TrafficData {
            venue_id: row.get(0)?,
            congestion_score: row.get(1)?,
            travel_time_minutes: row.get(2)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

pub fn upsert_social_sentiment(conn: &Connection, data: &SocialSentimentData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO social_sentiment (venue_id, sentiment_score, mention_count, platform, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            data.venue_id,
            data.sentiment_score,
            data.mention_count,
            data.platform,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_social_sentiment(
    conn: &Connection,
    venue_id: &str,
) -> Result<Option<SocialSentimentData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, sentiment_score, mention_count, platform, updated_at
         FROM social_sentiment WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(4)?;
        Ok(SocialSentimentData {
            venue_id: row.get(0)?,
            sentiment_score: row.get(1)?,
            mention_count: row.get(2)?,
            platform: row.get(3)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

pub fn upsert_ml_prediction(conn: &Connection, data: &MlPredictionData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ml_predictions (venue_id, predicted_score, confidence_lower, confidence_upper, model_version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            data.venue_id,
            data.predicted_score,
            data.confidence_lower,
            data.confidence_upper,
            data.model_version,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_ml_prediction(conn: &Connection, venue_id: &str) -> Result<Option<MlPredictionData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, predicted_score, confidence_lower, confidence_upper, model_version, updated_at
         FROM ml_predictions WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(5)?;
        Ok(MlPredictionData {
            venue_id: row.get(0)?,
            predicted_score: row.get(1)?,
            confidence_lower: row.get(2)?,
            confidence_upper: row.get(3)?,
            model_version: row.get(4)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

pub fn upsert_foot_traffic(conn: &Connection, data: &FootTrafficData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO foot_traffic (venue_id, visit_count, dwell_minutes, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            data.venue_id,
            data.visit_count,
            data.dwell_minutes,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_foot_traffic(conn: &Connection, venue_id: &str) -> Result<Option<FootTrafficData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, visit_count, dwell_minutes, updated_at
         FROM foot_traffic WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(3)?;
        Ok(FootTrafficData {
            venue_id: row.get(0)?,
            visit_count: row.get(1)?,
            dwell_minutes: row.get(2)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

pub fn upsert_economic(conn: &Connection, data: &EconomicData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO economic_data (venue_id, indicator_name, indicator_value, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            data.venue_id,
            data.indicator_name,
            data.indicator_value,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_economic(conn: &Connection, venue_id: &str) -> Result<Option<EconomicData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, indicator_name, indicator_value, updated_at
         FROM economic_data WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(3)?;
        Ok(EconomicData {
            venue_id: row.get(0)?,
            indicator_name: row.get(1)?,
            indicator_value: row.get(2)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

pub fn upsert_demographic(conn: &Connection, data: &DemographicData) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO demographic_data (venue_id, population, median_income, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            data.venue_id,
            data.population,
            data.median_income,
            to_ts(data.updated_at)
        ],
    )?;
    Ok(())
}

pub fn get_demographic(conn: &Connection, venue_id: &str) -> Result<Option<DemographicData>> {
    let mut stmt = conn.prepare(
        "SELECT venue_id, population, median_income, updated_at
         FROM demographic_data WHERE venue_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![venue_id], |row| {
        let updated_at: String = row.get(3)?;
        Ok(DemographicData {
            venue_id: row.get(0)?,
            population: row.get(1)?,
            median_income: row.get(2)?,
            updated_at: from_ts(&updated_at),
        })
    })?;
    rows.next().transpose().map_err(Into::into)
}

// ============================================================================
// MATCH AUDIT LOG
// ============================================================================

pub fn log_match(
    conn: &Connection,
    venue_id: &str,
    source_name: &str,
    match_type: &str,
    confidence: f64,
    name_similarity: Option<f64>,
    distance_m: Option<f64>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO match_log (venue_id, source_name, match_type, confidence, name_similarity, distance_m, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            venue_id,
            source_name,
            match_type,
            confidence,
            name_similarity,
            distance_m,
            to_ts(Utc::now()),
        ],
    )?;
    Ok(())
}

pub fn count_match_log(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM match_log", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// SOURCE QUALITY + META
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceQualityRow {
    pub source_name: String,
    pub source_type: String,
    pub quality_score: f64,
    pub record_count: i64,
    pub validated_at: DateTime<Utc>,
}

pub fn upsert_source_quality(conn: &Connection, row: &SourceQualityRow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO source_quality (source_name, source_type, quality_score, record_count, validated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            row.source_name,
            row.source_type,
            row.quality_score,
            row.record_count,
            to_ts(row.validated_at),
        ],
    )?;
    Ok(())
}

pub fn get_source_quality(conn: &Connection) -> Result<Vec<SourceQualityRow>> {
    let mut stmt = conn.prepare(
        "SELECT source_name, source_type, quality_score, record_count, validated_at
         FROM source_quality ORDER BY source_name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let validated_at: String = row.get(4)?;
            Ok(SourceQualityRow {
                source_name: row.get(0)?,
                source_type: row.get(1)?,
                quality_score: row.get(2)?,
                record_count: row.get(3)?,
                validated_at: from_ts(&validated_at),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    rows.next().transpose().map_err(Into::into)
}

pub fn set_last_refresh(conn: &Connection, at: DateTime<Utc>) -> Result<()> {
    set_meta(conn, "last_refresh", &to_ts(at))
}

pub fn get_last_refresh(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    Ok(get_meta(conn, "last_refresh")?.map(|s| from_ts(&s)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) fn test_venue(name: &str, lat: Option<f64>, lng: Option<f64>) -> CanonicalVenue {
    let now = Utc::now();
    CanonicalVenue {
        venue_id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        category: Some("venue".to_string()),
        lat,
        lng,
        address: None,
        phone: None,
        website: None,
        provenance: BTreeSet::new(),
        aggregate_score: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BoundingBox;

    #[test]
    fn test_venue_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut venue = test_venue("T-Mobile Center", Some(39.1012), Some(-94.5844));
        venue.provenance.insert("place_listings".to_string());
        insert_venue(&conn, &venue).unwrap();

        let loaded = get_venue(&conn, &venue.venue_id).unwrap().unwrap();
        assert_eq!(loaded.name, "T-Mobile Center");
        assert_eq!(loaded.lat, Some(39.1012));
        assert!(loaded.provenance.contains("place_listings"));

        assert_eq!(count_venues(&conn).unwrap(), 1);
    }

    #[test]
    fn test_venues_in_bounds_excludes_outside() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        insert_venue(&conn, &test_venue("Inside", Some(39.1), Some(-94.58))).unwrap();
        insert_venue(&conn, &test_venue("Outside", Some(40.0), Some(-90.0))).unwrap();
        insert_venue(&conn, &test_venue("No coords", None, None)).unwrap();

        let bounds = BoundingBox::new(39.0, -94.7, 39.2, -94.3);
        let venues = get_venues_in_bounds(&conn, &bounds).unwrap();
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].name, "Inside");
    }

    #[test]
    fn test_event_venue_coordinate_fallback() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let venue = test_venue("The Midland", Some(39.1), Some(-94.585));
        insert_venue(&conn, &venue).unwrap();

        // Event without coordinates, linked to the venue
        let mut event = EventRecord {
            name: "Concert".to_string(),
            venue_id: Some(venue.venue_id.clone()),
            ..Default::default()
        };
        upsert_event(&conn, &mut event).unwrap();

        let bounds = BoundingBox::new(39.0, -94.7, 39.2, -94.3);
        let events = get_events_in_bounds(&conn, &bounds).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lat, Some(39.1));
    }

    #[test]
    fn test_reassign_events() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let master = test_venue("Master", Some(39.1), Some(-94.58));
        let dup = test_venue("Dup", Some(39.1001), Some(-94.5801));
        insert_venue(&conn, &master).unwrap();
        insert_venue(&conn, &dup).unwrap();

        let mut event = EventRecord {
            name: "Show".to_string(),
            venue_id: Some(dup.venue_id.clone()),
            ..Default::default()
        };
        upsert_event(&conn, &mut event).unwrap();

        let moved = reassign_events(&conn, &dup.venue_id, &master.venue_id).unwrap();
        assert_eq!(moved, 1);

        let events = get_events_for_venue(&conn, &master.venue_id).unwrap();
        assert_eq!(events.len(), 1);
        assert!(get_events_for_venue(&conn, &dup.venue_id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_contextual_upsert_keeps_latest() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let venue = test_venue("Power and Light", Some(39.0997), Some(-94.5786));
        insert_venue(&conn, &venue).unwrap();

        let first = WeatherData {
            venue_id: venue.venue_id.clone(),
            temperature: Some(60.0),
            conditions: Some("cloudy".to_string()),
            humidity: Some(0.6),
            updated_at: Utc::now(),
        };
        upsert_weather(&conn, &first).unwrap();

        let second = WeatherData {
            temperature: Some(72.5),
            ..first.clone()
        };
        upsert_weather(&conn, &second).unwrap();

        let loaded = get_weather(&conn, &venue.venue_id).unwrap().unwrap();
        assert_eq!(loaded.temperature, Some(72.5));
    }

    #[test]
    fn test_meta_last_refresh() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        assert!(get_last_refresh(&conn).unwrap().is_none());

        let now = Utc::now();
        set_last_refresh(&conn, now).unwrap();
        let loaded = get_last_refresh(&conn).unwrap().unwrap();
        assert!((loaded - now).num_seconds().abs() < 1);
    }

    #[test]
    fn test_source_quality_upsert_replaces() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut row = SourceQualityRow {
            source_name: "weather_api".to_string(),
            source_type: "weather".to_string(),
            quality_score: 0.4,
            record_count: 10,
            validated_at: Utc::now(),
        };
        upsert_source_quality(&conn, &row).unwrap();

        row.quality_score = 0.9;
        upsert_source_quality(&conn, &row).unwrap();

        let rows = get_source_quality(&conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quality_score, 0.9);
    }
}
