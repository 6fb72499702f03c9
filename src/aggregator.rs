// Data Aggregator - consolidated read views over the canonical registry
//
// Views are rebuilt on every aggregation run, never mutated in place. A
// contextual block appears in a view only when its source's primary field
// is non-null; an unreadable source simply omits its block and the
// completeness score reflects the gap.

use crate::db::{
    self, CanonicalVenue, DemographicData, EconomicData, FootTrafficData, MlPredictionData,
    SocialSentimentData, TrafficData, WeatherData,
};
use crate::error::Result;
use crate::normalize::{fold_name, haversine_m};
use crate::records::{BoundingBox, EventRecord};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Number of contextual blocks entering the completeness fraction: the seven
/// per-source tables plus the core venue fields.
pub const CONTEXT_BLOCK_COUNT: usize = 8;

/// Fixed per-block trust weights consumed downstream when signals conflict.
pub fn source_reliability(block: &str) -> f64 {
    match block {
        "core" => 1.0,
        "ml_prediction" => 0.9,
        "weather" => 0.9,
        "demographic" => 0.9,
        "economic" => 0.8,
        "social" => 0.8,
        "traffic" => 0.7,
        "foot_traffic" => 0.6,
        _ => 0.5,
    }
}

// ============================================================================
// VIEWS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_id: String,
    pub name: String,
    pub category: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub event_score: f64,
}

/// Read-only projection of one venue with everything known about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedVenueView {
    pub venue: CanonicalVenue,

    pub current_weather: Option<WeatherData>,
    pub traffic: Option<TrafficData>,
    pub social_sentiment: Option<SocialSentimentData>,
    pub ml_prediction: Option<MlPredictionData>,
    pub foot_traffic: Option<FootTrafficData>,
    pub economic: Option<EconomicData>,
    pub demographic: Option<DemographicData>,

    /// Fraction of the eight contextual blocks that are populated, in [0,1]
    pub data_completeness: f64,

    /// Persisted aggregate score when available, else the completeness
    pub comprehensive_score: f64,

    /// Trust weight per populated block
    pub source_reliability: BTreeMap<String, f64>,

    pub upcoming_events: Vec<EventSummary>,
}

/// Canonical event tied to a venue (or unresolved). The linked record shape
/// is already what consumers need, so the view reuses it.
pub type ConsolidatedEventView = EventRecord;

/// Venues + events for an area, events linked into venue summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaSnapshot {
    pub venues: Vec<ConsolidatedVenueView>,
    pub events: Vec<ConsolidatedEventView>,
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Radius for proximity-linking events to venues (meters)
    pub event_link_radius_m: f64,

    /// Weight of the ML prediction in the persisted aggregate score
    pub ml_score_weight: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            event_link_radius_m: 100.0,
            ml_score_weight: 0.4,
        }
    }
}

// ============================================================================
// DATA AGGREGATOR
// ============================================================================

pub struct DataAggregator {
    pub config: AggregatorConfig,
}

impl DataAggregator {
    pub fn new() -> Self {
        DataAggregator {
            config: AggregatorConfig::default(),
        }
    }

    pub fn with_config(config: AggregatorConfig) -> Self {
        DataAggregator { config }
    }

    /// Fresh consolidated views for every venue inside the bounding box.
    pub fn aggregate_venue_data(
        &self,
        conn: &Connection,
        bounds: &BoundingBox,
    ) -> Result<Vec<ConsolidatedVenueView>> {
        let venues = db::get_venues_in_bounds(conn, bounds)?;
        let mut views = Vec::with_capacity(venues.len());
        for venue in venues {
            views.push(self.build_view(conn, venue)?);
        }
        debug!(count = views.len(), "aggregated venue views");
        Ok(views)
    }

    fn build_view(&self, conn: &Connection, venue: CanonicalVenue) -> Result<ConsolidatedVenueView> {
        let venue_id = venue.venue_id.clone();

        // A block whose source cannot be read is omitted, not fatal
        let weather = block_or_none(db::get_weather(conn, &venue_id), "weather")
            .filter(|w: &WeatherData| w.temperature.is_some());
        let traffic = block_or_none(db::get_traffic(conn, &venue_id), "traffic")
            .filter(|t: &TrafficData| t.congestion_score.is_some());
        let social = block_or_none(db::get_social_sentiment(conn, &venue_id), "social")
            .filter(|s: &SocialSentimentData| s.mention_count.is_some());
        let ml = block_or_none(db::get_ml_prediction(conn, &venue_id), "ml_prediction")
            .filter(|m: &MlPredictionData| m.predicted_score.is_some());
        let foot = block_or_none(db::get_foot_traffic(conn, &venue_id), "foot_traffic")
            .filter(|f: &FootTrafficData| f.visit_count.is_some());
        let economic = block_or_none(db::get_economic(conn, &venue_id), "economic")
            .filter(|e: &EconomicData| e.indicator_value.is_some());
        let demographic = block_or_none(db::get_demographic(conn, &venue_id), "demographic")
            .filter(|d: &DemographicData| d.population.is_some());

        // The core block counts when the venue is geocoded
        let core_populated = venue.has_coordinates();

        let mut populated = Vec::new();
        if core_populated {
            populated.push("core");
        }
        if weather.is_some() {
            populated.push("weather");
        }
        if traffic.is_some() {
            populated.push("traffic");
        }
        if social.is_some() {
            populated.push("social");
        }
        if ml.is_some() {
            populated.push("ml_prediction");
        }
        if foot.is_some() {
            populated.push("foot_traffic");
        }
        if economic.is_some() {
            populated.push("economic");
        }
        if demographic.is_some() {
            populated.push("demographic");
        }

        let data_completeness =
            (populated.len() as f64 / CONTEXT_BLOCK_COUNT as f64).clamp(0.0, 1.0);
        let comprehensive_score = venue
            .aggregate_score
            .unwrap_or(data_completeness)
            .clamp(0.0, 1.0);

        let reliability: BTreeMap<String, f64> = populated
            .iter()
            .map(|b| (b.to_string(), source_reliability(b)))
            .collect();

        Ok(ConsolidatedVenueView {
            venue,
            current_weather: weather,
            traffic,
            social_sentiment: social,
            ml_prediction: ml,
            foot_traffic: foot,
            economic,
            demographic,
            data_completeness,
            comprehensive_score,
            source_reliability: reliability,
            upcoming_events: Vec::new(),
        })
    }

    /// Events inside the box whose start time is unknown or falls within
    /// `[now, now + window]`, ordered start ascending (nulls last) then
    /// score descending.
    pub fn aggregate_event_data(
        &self,
        conn: &Connection,
        bounds: &BoundingBox,
        window: Duration,
    ) -> Result<Vec<ConsolidatedEventView>> {
        self.aggregate_event_data_at(conn, bounds, window, Utc::now())
    }

    pub fn aggregate_event_data_at(
        &self,
        conn: &Connection,
        bounds: &BoundingBox,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsolidatedEventView>> {
        let horizon = now + window;
        let mut events: Vec<EventRecord> = db::get_events_in_bounds(conn, bounds)?
            .into_iter()
            .filter(|e| match e.start_time {
                None => true,
                Some(start) => start >= now && start <= horizon,
            })
            .collect();

        events.sort_by(|a, b| match (a.start_time, b.start_time) {
            (Some(x), Some(y)) => x
                .cmp(&y)
                .then_with(|| b.event_score.total_cmp(&a.event_score)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => b.event_score.total_cmp(&a.event_score),
        });

        Ok(events)
    }

    /// Venues plus events for an area, with events linked into each venue's
    /// upcoming-events summary. This is a read-time join; nothing beyond the
    /// registry's own assignment is persisted.
    pub fn aggregate_area_data(
        &self,
        conn: &Connection,
        bounds: &BoundingBox,
        window: Duration,
    ) -> Result<AreaSnapshot> {
        self.aggregate_area_data_at(conn, bounds, window, Utc::now())
    }

    pub fn aggregate_area_data_at(
        &self,
        conn: &Connection,
        bounds: &BoundingBox,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<AreaSnapshot> {
        let mut venues = self.aggregate_venue_data(conn, bounds)?;
        let events = self.aggregate_event_data_at(conn, bounds, window, now)?;

        for event in &events {
            if let Some(idx) = self.link_event_to_view(&venues, event) {
                venues[idx].upcoming_events.push(EventSummary {
                    event_id: event.event_id.clone(),
                    name: event.name.clone(),
                    category: event.category.clone(),
                    start_time: event.start_time,
                    event_score: event.event_score,
                });
            }
        }

        Ok(AreaSnapshot { venues, events })
    }

    /// Registry assignment first, then exact venue-name match, then nearest
    /// venue within the link radius.
    fn link_event_to_view(
        &self,
        venues: &[ConsolidatedVenueView],
        event: &EventRecord,
    ) -> Option<usize> {
        if let Some(venue_id) = event.venue_id.as_deref() {
            if let Some(idx) = venues.iter().position(|v| v.venue.venue_id == venue_id) {
                return Some(idx);
            }
        }

        if let Some(event_venue_name) = event.venue_name.as_deref() {
            let folded = fold_name(event_venue_name);
            if let Some(idx) = venues
                .iter()
                .position(|v| fold_name(&v.venue.name) == folded)
            {
                return Some(idx);
            }
        }

        if let (Some(lat), Some(lng)) = (event.lat, event.lng) {
            let mut best: Option<(usize, f64)> = None;
            for (idx, view) in venues.iter().enumerate() {
                let (vlat, vlng) = match (view.venue.lat, view.venue.lng) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };
                let distance = haversine_m(lat, lng, vlat, vlng);
                if distance <= self.config.event_link_radius_m {
                    let closer = best.map(|(_, d)| distance < d).unwrap_or(true);
                    if closer {
                        best = Some((idx, distance));
                    }
                }
            }
            return best.map(|(idx, _)| idx);
        }

        None
    }

    // ========================================================================
    // REFRESH
    // ========================================================================

    /// Recompute and persist per-venue aggregate scores and stamp the
    /// refresh time. Idempotent: with no new source data the persisted
    /// output is identical aside from timestamps.
    pub fn refresh(&self, conn: &Connection) -> Result<usize> {
        let venues = db::get_all_venues(conn)?;
        let count = venues.len();

        for venue in venues {
            let venue_id = venue.venue_id.clone();
            let view = self.build_view(conn, venue)?;
            let score = match view.ml_prediction.as_ref().and_then(|m| m.predicted_score) {
                Some(predicted) => {
                    (1.0 - self.config.ml_score_weight) * view.data_completeness
                        + self.config.ml_score_weight * predicted
                }
                None => view.data_completeness,
            }
            .clamp(0.0, 1.0);
            db::set_venue_aggregate_score(conn, &venue_id, score)?;
        }

        db::set_last_refresh(conn, Utc::now())?;
        info!(venues = count, "consolidated views refreshed");
        Ok(count)
    }
}

impl Default for DataAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn block_or_none<T>(result: Result<Option<T>>, block: &str) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(block, error = %e, "contextual source unavailable; block omitted");
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
