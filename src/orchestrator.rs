// Refresh Orchestrator - sequences the consolidation pipeline
//
//   quality gate → registry ingest → event linking → duplicate sweep →
//   view refresh → cache invalidation
//
// Per-source failures are captured in that source's report and never abort
// the cycle. If the cycle overruns its ceiling, completed phases stay
// committed and the report says partial instead of rolling anything back.

use crate::aggregator::{ConsolidatedEventView, ConsolidatedVenueView, DataAggregator};
use crate::cache::{CacheStats, ScoreCache};
use crate::db::{
    self, DemographicData, EconomicData, FootTrafficData, MlPredictionData, SocialSentimentData,
    SourceQualityRow, TrafficData, WeatherData,
};
use crate::error::Result;
use crate::quality::{QualityController, QualityReport};
use crate::records::{BoundingBox, EventRecord, RawRecord, SourceType};
use crate::registry::{ConsolidationReport, VenueRegistry};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

// ============================================================================
// SOURCE BATCH
// ============================================================================

/// One producer's worth of raw records for a refresh cycle.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source_name: String,
    pub source_type: SourceType,
    pub records: Vec<RawRecord>,
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Health turns `refresh_needed` on past this staleness bound
    pub staleness_bound: Duration,

    /// A cycle running past this ceiling reports partial success
    pub refresh_ceiling: Duration,

    /// Venues scoring at or above this count as high quality
    pub high_quality_score: f64,

    /// Weighted source health at or above this is healthy
    pub healthy_threshold: f64,

    /// Weighted source health at or above this is degraded (below: unhealthy)
    pub degraded_threshold: f64,

    /// Worker cap for the per-source quality gate
    pub validation_workers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            staleness_bound: Duration::hours(24),
            refresh_ceiling: Duration::hours(1),
            high_quality_score: 0.6,
            healthy_threshold: 0.8,
            degraded_threshold: 0.5,
            validation_workers: 4,
        }
    }
}

// ============================================================================
// HEALTH + REFRESH REPORTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall_status: HealthLevel,
    pub total_venues: i64,
    pub high_quality_venues: i64,
    pub total_events: i64,
    pub sources_healthy: usize,
    pub sources_total: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub refresh_needed: bool,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshStatus {
    Completed,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RefreshStatus,
    pub quality_reports: Vec<QualityReport>,
    pub venues_registered: usize,
    pub contextual_records: usize,
    pub events_ingested: usize,
    pub events_linked: usize,
    pub consolidation: ConsolidationReport,
    pub cache_entries_invalidated: usize,
    pub phase_errors: Vec<String>,
}

// ============================================================================
// REFRESH ORCHESTRATOR
// ============================================================================

pub struct RefreshOrchestrator {
    conn: Arc<Mutex<Connection>>,
    pub quality: QualityController,
    pub registry: VenueRegistry,
    pub aggregator: DataAggregator,
    pub cache: ScoreCache,
    pub config: OrchestratorConfig,
}

impl RefreshOrchestrator {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        RefreshOrchestrator {
            conn,
            quality: QualityController::new(),
            registry: VenueRegistry::new(),
            aggregator: DataAggregator::new(),
            cache: ScoreCache::new(),
            config: OrchestratorConfig::default(),
        }
    }

    /// Run one full refresh cycle over the given source batches.
    pub fn run_refresh(&self, batches: Vec<SourceBatch>) -> Result<RefreshReport> {
        let started_at = Utc::now();
        let mut phase_errors: Vec<String> = Vec::new();

        // Phase 1: quality gate, per source, concurrently. Every source is
        // independently gated; a dead source only hurts its own report.
        let gated = self.gate_sources(batches);
        let quality_reports: Vec<QualityReport> =
            gated.iter().map(|(_, report)| report.clone()).collect();

        let mut venues_registered = 0;
        let mut contextual_records = 0;
        let mut events_ingested = 0;
        let mut events_linked = 0;

        {
            let conn = self.conn.lock().unwrap();

            for report in &quality_reports {
                if let Err(e) = db::upsert_source_quality(
                    &conn,
                    &SourceQualityRow {
                        source_name: report.source_name.clone(),
                        source_type: report.source_type.as_str().to_string(),
                        quality_score: report.quality_score,
                        record_count: report.record_count as i64,
                        validated_at: report.validated_at,
                    },
                ) {
                    phase_errors.push(format!("quality persist ({}): {}", report.source_name, e));
                }
            }

            // Phase 2: registry + contextual ingest, in source-arrival order
            for (batch, _) in gated {
                match batch.source_type {
                    SourceType::Venues => {
                        // Records that could never register are reported, not fatal
                        let (registrable, rejected): (Vec<_>, Vec<_>) =
                            batch.records.into_iter().partition(|r| {
                                r.name.as_deref().map(|n| !n.trim().is_empty()).unwrap_or(false)
                                    || r.has_coordinates()
                            });
                        if !rejected.is_empty() {
                            phase_errors.push(format!(
                                "{}: {} record(s) had neither name nor coordinates",
                                batch.source_name,
                                rejected.len()
                            ));
                        }
                        match self.registry.register_batch(&conn, &registrable) {
                            Ok(results) => venues_registered += results.len(),
                            Err(e) => {
                                phase_errors
                                    .push(format!("registry ({}): {}", batch.source_name, e));
                            }
                        }
                    }
                    SourceType::Events => {
                        let mut events: Vec<EventRecord> = batch
                            .records
                            .iter()
                            .filter_map(EventRecord::from_raw)
                            .collect();
                        match self.registry.link_events_to_venues(&conn, &mut events) {
                            Ok(linked) => events_linked += linked,
                            Err(e) => {
                                phase_errors
                                    .push(format!("event linking ({}): {}", batch.source_name, e));
                            }
                        }
                        for event in &mut events {
                            match db::upsert_event(&conn, event) {
                                Ok(()) => events_ingested += 1,
                                Err(e) => phase_errors
                                    .push(format!("event persist ({}): {}", event.name, e)),
                            }
                        }
                    }
                    _ => {
                        contextual_records +=
                            self.ingest_contextual(&conn, &batch, &mut phase_errors);
                    }
                }
            }

            // Phase 3: duplicate sweep (each cluster transactional on its own)
            let consolidation = match self.registry.consolidate_duplicates(&conn) {
                Ok(report) => report,
                Err(e) => {
                    phase_errors.push(format!("consolidation: {}", e));
                    ConsolidationReport::default()
                }
            };

            // Phase 4: rebuild the consolidated views
            if let Err(e) = self.aggregator.refresh(&conn) {
                phase_errors.push(format!("aggregation refresh: {}", e));
            }

            // Phase 5: time-sensitive cache entries from other hour buckets
            let cache_entries_invalidated = self.cache.invalidate_time_tags(Utc::now());

            let finished_at = Utc::now();
            let overran = finished_at - started_at > self.config.refresh_ceiling;
            if overran {
                warn!("refresh cycle overran its ceiling; reporting partial success");
            }
            let status = if phase_errors.is_empty() && !overran {
                RefreshStatus::Completed
            } else {
                RefreshStatus::Partial
            };

            info!(
                venues_registered,
                contextual_records,
                events_ingested,
                duplicates = consolidation.duplicates_consolidated,
                errors = phase_errors.len(),
                "refresh cycle finished"
            );

            Ok(RefreshReport {
                started_at,
                finished_at,
                status,
                quality_reports,
                venues_registered,
                contextual_records,
                events_ingested,
                events_linked,
                consolidation,
                cache_entries_invalidated,
                phase_errors,
            })
        }
    }

    /// Gate every source batch through the quality controller, fanning out
    /// over a bounded worker pool. Output order matches input order.
    fn gate_sources(&self, batches: Vec<SourceBatch>) -> Vec<(SourceBatch, QualityReport)> {
        if batches.is_empty() {
            return Vec::new();
        }

        let workers = self.config.validation_workers.clamp(1, batches.len());
        let next = AtomicUsize::new(0);
        let inputs: Vec<Mutex<Option<SourceBatch>>> =
            batches.into_iter().map(|b| Mutex::new(Some(b))).collect();
        let outputs: Vec<Mutex<Option<(SourceBatch, QualityReport)>>> =
            (0..inputs.len()).map(|_| Mutex::new(None)).collect();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= inputs.len() {
                        break;
                    }
                    let batch = inputs[i].lock().unwrap().take().expect("batch taken once");
                    let SourceBatch {
                        source_name,
                        source_type,
                        records,
                    } = batch;
                    let (gated, report) = self.quality.process(&source_name, source_type, records);
                    *outputs[i].lock().unwrap() = Some((
                        SourceBatch {
                            source_name,
                            source_type,
                            records: gated,
                        },
                        report,
                    ));
                });
            }
        });

        outputs
            .into_iter()
            .map(|m| m.into_inner().unwrap().expect("worker filled every slot"))
            .collect()
    }

    /// Resolve each contextual record's venue and upsert its block row.
    fn ingest_contextual(
        &self,
        conn: &Connection,
        batch: &SourceBatch,
        phase_errors: &mut Vec<String>,
    ) -> usize {
        let mut stored = 0;

        for record in &batch.records {
            let venue_ref = RawRecord {
                source_name: batch.source_name.clone(),
                name: record
                    .extra_str("venue_name")
                    .map(String::from)
                    .or_else(|| record.name.clone()),
                lat: record.lat,
                lng: record.lng,
                ..Default::default()
            };

            let has_name = venue_ref
                .name
                .as_deref()
                .map(|n| !n.trim().is_empty())
                .unwrap_or(false);
            if !has_name && !venue_ref.has_coordinates() {
                warn!(
                    source = %batch.source_name,
                    "contextual record has no venue reference; skipped"
                );
                continue;
            }

            let venue_id = match self.registry.register_venue(conn, &venue_ref) {
                Ok((id, _)) => id,
                Err(e) => {
                    phase_errors.push(format!("venue resolve ({}): {}", batch.source_name, e));
                    continue;
                }
            };

            let updated_at = record.updated_at.unwrap_or_else(Utc::now);
            let result = match batch.source_type {
                SourceType::Weather => db::upsert_weather(
                    conn,
                    &WeatherData {
                        venue_id,
                        temperature: record.extra_f64("temperature"),
                        conditions: record.extra_str("conditions").map(String::from),
                        humidity: record.extra_f64("humidity"),
                        updated_at,
                    },
                ),
                SourceType::Traffic => db::upsert_traffic(
                    conn,
                    &TrafficData {
                        venue_id,
                        congestion_score: record.extra_f64("congestion_score"),
                        travel_time_minutes: record.extra_f64("travel_time_minutes"),
                        updated_at,
                    },
                ),
                SourceType::SocialSentiment => db::upsert_social_sentiment(
                    conn,
                    &SocialSentimentData {
                        venue_id,
                        sentiment_score: record.extra_f64("sentiment_score"),
                        mention_count: record.extra_i64("mention_count"),
                        platform: record.extra_str("platform").map(String::from),
                        updated_at,
                    },
                ),
                SourceType::MlPredictions => db::upsert_ml_prediction(
                    conn,
                    &MlPredictionData {
                        venue_id,
                        predicted_score: record.extra_f64("predicted_score"),
                        confidence_lower: record.extra_f64("confidence_lower"),
                        confidence_upper: record.extra_f64("confidence_upper"),
                        model_version: record.extra_str("model_version").map(String::from),
                        updated_at,
                    },
                ),
                SourceType::FootTraffic => db::upsert_foot_traffic(
                    conn,
                    &FootTrafficData {
                        venue_id,
                        visit_count: record.extra_i64("visit_count"),
                        dwell_minutes: record.extra_f64("dwell_minutes"),
                        updated_at,
                    },
                ),
                SourceType::Economic => db::upsert_economic(
                    conn,
                    &EconomicData {
                        venue_id,
                        indicator_name: record.extra_str("indicator_name").map(String::from),
                        indicator_value: record.extra_f64("indicator_value"),
                        updated_at,
                    },
                ),
                SourceType::Demographic => db::upsert_demographic(
                    conn,
                    &DemographicData {
                        venue_id,
                        population: record.extra_i64("population"),
                        median_income: record.extra_f64("median_income"),
                        updated_at,
                    },
                ),
                SourceType::Venues | SourceType::Events => Ok(()),
            };

            match result {
                Ok(()) => stored += 1,
                Err(e) => {
                    phase_errors.push(format!("contextual persist ({}): {}", batch.source_name, e));
                }
            }
        }

        stored
    }

    // ========================================================================
    // CONSUMER CONTRACT
    // ========================================================================

    /// The single entry point external applications should use instead of
    /// querying raw tables.
    pub fn get_venues_and_events(
        &self,
        bounds: BoundingBox,
        window: Duration,
    ) -> Result<(Vec<ConsolidatedVenueView>, Vec<ConsolidatedEventView>)> {
        let conn = self.conn.lock().unwrap();
        let snapshot = self.aggregator.aggregate_area_data(&conn, &bounds, window)?;
        Ok((snapshot.venues, snapshot.events))
    }

    // ========================================================================
    // HEALTH
    // ========================================================================

    pub fn get_health_status(&self) -> Result<HealthStatus> {
        self.get_health_status_at(Utc::now())
    }

    pub fn get_health_status_at(&self, now: DateTime<Utc>) -> Result<HealthStatus> {
        let conn = self.conn.lock().unwrap();

        let total_venues = db::count_venues(&conn)?;
        let total_events = db::count_events(&conn)?;

        let high_quality_venues = db::get_all_venues(&conn)?
            .iter()
            .filter(|v| v.aggregate_score.unwrap_or(0.0) >= self.config.high_quality_score)
            .count() as i64;

        let sources = db::get_source_quality(&conn)?;
        let sources_total = sources.len();
        let sources_healthy = sources
            .iter()
            .filter(|s| s.quality_score >= self.quality.config.min_quality)
            .count();

        // Weighted by record count, so a dead trickle source cannot mask a
        // failing firehose
        let overall_status = if sources.is_empty() {
            HealthLevel::Degraded
        } else {
            let weight: f64 = sources.iter().map(|s| (s.record_count.max(1)) as f64).sum();
            let weighted: f64 = sources
                .iter()
                .map(|s| s.quality_score * (s.record_count.max(1)) as f64)
                .sum();
            let health = weighted / weight;
            if health >= self.config.healthy_threshold {
                HealthLevel::Healthy
            } else if health >= self.config.degraded_threshold {
                HealthLevel::Degraded
            } else {
                HealthLevel::Unhealthy
            }
        };

        let last_refresh = db::get_last_refresh(&conn)?;
        let refresh_needed = last_refresh
            .map(|t| now - t > self.config.staleness_bound)
            .unwrap_or(true);

        Ok(HealthStatus {
            overall_status,
            total_venues,
            high_quality_venues,
            total_events,
            sources_healthy,
            sources_total,
            last_refresh,
            refresh_needed,
            cache: self.cache.stats(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn test_orchestrator() -> RefreshOrchestrator {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        RefreshOrchestrator::new(Arc::new(Mutex::new(conn)))
    }

    fn venue_record(name: &str, lat: f64, lng: f64) -> RawRecord {
        RawRecord {
            source_name: "place_listings".to_string(),
            name: Some(name.to_string()),
            lat: Some(lat),
            lng: Some(lng),
            updated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn kc_bounds() -> BoundingBox {
        BoundingBox::new(38.9, -94.8, 39.3, -94.3)
    }

    #[test]
    fn test_full_refresh_cycle() {
        let orchestrator = test_orchestrator();
        let now = Utc::now();

        let venues = SourceBatch {
            source_name: "place_listings".to_string(),
            source_type: SourceType::Venues,
            records: vec![
                venue_record("T-Mobile Center", 39.1012, -94.5844),
                venue_record("Green Lady Lounge", 39.0935, -94.5833),
            ],
        };

        let mut weather_record = RawRecord::new("weather_api");
        weather_record
            .extra
            .insert("venue_name".to_string(), serde_json::json!("T-Mobile Center"));
        weather_record.set_extra_f64("temperature", 71.0);
        weather_record.updated_at = Some(now);
        let weather = SourceBatch {
            source_name: "weather_api".to_string(),
            source_type: SourceType::Weather,
            records: vec![weather_record],
        };

        let mut event_record = RawRecord::new("event_pages");
        event_record.name = Some("Playoff Game".to_string());
        event_record
            .extra
            .insert("venue_name".to_string(), serde_json::json!("T-Mobile Center"));
        event_record.extra.insert(
            "start_time".to_string(),
            serde_json::json!((now + Duration::hours(5)).to_rfc3339()),
        );
        event_record.updated_at = Some(now);
        let events = SourceBatch {
            source_name: "event_pages".to_string(),
            source_type: SourceType::Events,
            records: vec![event_record],
        };

        let report = orchestrator
            .run_refresh(vec![venues, weather, events])
            .unwrap();

        assert_eq!(report.status, RefreshStatus::Completed);
        assert_eq!(report.venues_registered, 2);
        assert_eq!(report.contextual_records, 1);
        assert_eq!(report.events_ingested, 1);
        assert_eq!(report.events_linked, 1);
        assert_eq!(report.quality_reports.len(), 3);

        // The consumer contract sees the consolidated result
        let (views, event_views) = orchestrator
            .get_venues_and_events(kc_bounds(), Duration::days(1))
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(event_views.len(), 1);

        let arena = views
            .iter()
            .find(|v| v.venue.name == "T-Mobile Center")
            .unwrap();
        assert!(arena.current_weather.is_some());
        assert_eq!(arena.upcoming_events.len(), 1);
        assert!(arena.data_completeness > 0.0 && arena.data_completeness <= 1.0);
    }

    #[test]
    fn test_empty_source_does_not_abort_pipeline() {
        let orchestrator = test_orchestrator();

        let venues = SourceBatch {
            source_name: "place_listings".to_string(),
            source_type: SourceType::Venues,
            records: vec![venue_record("The Ship", 39.0866, -94.6090)],
        };
        let dead = SourceBatch {
            source_name: "dead_feed".to_string(),
            source_type: SourceType::Traffic,
            records: vec![],
        };

        let report = orchestrator.run_refresh(vec![dead, venues]).unwrap();

        assert_eq!(report.venues_registered, 1);
        let dead_report = report
            .quality_reports
            .iter()
            .find(|r| r.source_name == "dead_feed")
            .unwrap();
        assert_eq!(dead_report.quality_score, 0.0);
        assert!(!dead_report.data_issues.is_empty());
    }

    #[test]
    fn test_refresh_consolidates_cross_source_duplicates() {
        let orchestrator = test_orchestrator();

        let listings = SourceBatch {
            source_name: "place_listings".to_string(),
            source_type: SourceType::Venues,
            records: vec![venue_record("T-Mobile Center", 39.1012, -94.5844)],
        };
        let scraped = SourceBatch {
            source_name: "event_pages".to_string(),
            source_type: SourceType::Venues,
            records: vec![venue_record("T Mobile Center", 39.10125, -94.58442)],
        };

        let report = orchestrator.run_refresh(vec![listings, scraped]).unwrap();

        // The registry already resolved the second record onto the first
        // venue, so the duplicate sweep finds a clean registry
        assert_eq!(report.consolidation.duplicates_found, 0);

        let conn = orchestrator.conn.lock().unwrap();
        assert_eq!(db::count_venues(&conn).unwrap(), 1);
    }

    #[test]
    fn test_health_reflects_sources_and_staleness() {
        let orchestrator = test_orchestrator();
        let now = Utc::now();

        // Nothing ingested yet: no sources, refresh needed
        let health = orchestrator.get_health_status_at(now).unwrap();
        assert_eq!(health.overall_status, HealthLevel::Degraded);
        assert!(health.refresh_needed);
        assert_eq!(health.sources_total, 0);

        let venues = SourceBatch {
            source_name: "place_listings".to_string(),
            source_type: SourceType::Venues,
            records: vec![venue_record("RecordBar", 39.0866, -94.5857)],
        };
        orchestrator.run_refresh(vec![venues]).unwrap();

        let health = orchestrator.get_health_status_at(now).unwrap();
        assert_eq!(health.total_venues, 1);
        assert_eq!(health.sources_total, 1);
        assert_eq!(health.sources_healthy, 1);
        assert_eq!(health.overall_status, HealthLevel::Healthy);
        assert!(!health.refresh_needed);

        // A day later with no refresh, staleness flips the flag
        let later = now + Duration::hours(25);
        let stale = orchestrator.get_health_status_at(later).unwrap();
        assert!(stale.refresh_needed);
    }

    #[test]
    fn test_quality_gate_runs_per_source_in_parallel() {
        let orchestrator = test_orchestrator();

        let batches: Vec<SourceBatch> = (0..8)
            .map(|i| SourceBatch {
                source_name: format!("source_{}", i),
                source_type: SourceType::Venues,
                records: vec![venue_record(&format!("Venue {}", i), 39.0 + i as f64 * 0.01, -94.6)],
            })
            .collect();

        let gated = orchestrator.gate_sources(batches);
        assert_eq!(gated.len(), 8);
        // Output order matches input order
        for (i, (batch, report)) in gated.iter().enumerate() {
            assert_eq!(batch.source_name, format!("source_{}", i));
            assert_eq!(report.record_count, 1);
        }
    }
}
