// Quality Controller - gate raw data before it can pollute the registry
//
// Three operations, all per-source and independent of the registry:
//   validate    → QualityReport (completeness + recency blend, issue list)
//   clean       → source-specific numeric clamps, whitespace folding
//   deduplicate → exact-key collapse only (fuzzy dedup is the registry's job)
//
// A failing source never aborts the pipeline; it is reported and skipped.

use crate::normalize::{fold_name, round_coord};
use crate::records::{RawRecord, SourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, warn};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Weight of required-field completeness in the quality score
    pub completeness_weight: f64,

    /// Weight of the recency ratio in the quality score
    pub recency_weight: f64,

    /// Venue sources below this geocoding ratio get flagged
    pub min_geocoding_completeness: f64,

    /// Sources below this quality score count as unhealthy
    pub min_quality: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            completeness_weight: 0.7,
            recency_weight: 0.3,
            min_geocoding_completeness: 0.8,
            min_quality: 0.5,
        }
    }
}

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub source_name: String,
    pub source_type: SourceType,
    pub record_count: usize,

    /// Required-field completeness averaged over records, in [0,1]
    pub completeness: f64,

    /// Fraction of records updated inside the source's freshness window
    pub recency: f64,

    /// Weighted blend of completeness and recency, in [0,1]
    pub quality_score: f64,

    pub data_issues: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn meets_threshold(&self, min_quality: f64) -> bool {
        self.quality_score >= min_quality
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({}): {} records, quality {:.2}, {} issue(s)",
            self.source_name,
            self.source_type.as_str(),
            self.record_count,
            self.quality_score,
            self.data_issues.len()
        )
    }
}

// ============================================================================
// QUALITY CONTROLLER
// ============================================================================

pub struct QualityController {
    pub config: QualityConfig,
}

impl QualityController {
    pub fn new() -> Self {
        QualityController {
            config: QualityConfig::default(),
        }
    }

    pub fn with_config(config: QualityConfig) -> Self {
        QualityController { config }
    }

    /// Validate one source's batch and produce its quality report.
    pub fn validate(
        &self,
        source_name: &str,
        source_type: SourceType,
        records: &[RawRecord],
    ) -> QualityReport {
        self.validate_at(source_name, source_type, records, Utc::now())
    }

    /// Clock-injected variant of `validate`, used by tests and the
    /// orchestrator so recency is deterministic.
    pub fn validate_at(
        &self,
        source_name: &str,
        source_type: SourceType,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> QualityReport {
        let mut issues = Vec::new();

        if records.is_empty() {
            warn!(source = source_name, "source returned zero records");
            issues.push(format!("source '{}' returned zero records", source_name));
            return QualityReport {
                source_name: source_name.to_string(),
                source_type,
                record_count: 0,
                completeness: 0.0,
                recency: 0.0,
                quality_score: 0.0,
                data_issues: issues,
                validated_at: now,
            };
        }

        let required = source_type.required_fields();
        let completeness = records
            .iter()
            .map(|r| {
                let present = required.iter().filter(|f| r.field_present(f)).count();
                present as f64 / required.len() as f64
            })
            .sum::<f64>()
            / records.len() as f64;

        let window = source_type.freshness_window();
        let fresh = records
            .iter()
            .filter(|r| {
                r.updated_at
                    .map(|t| now - t <= window && t <= now)
                    .unwrap_or(false)
            })
            .count();
        let recency = fresh as f64 / records.len() as f64;

        let quality_score = (self.config.completeness_weight * completeness
            + self.config.recency_weight * recency)
            .clamp(0.0, 1.0);

        if source_type == SourceType::Venues {
            let geocoded = records.iter().filter(|r| r.has_coordinates()).count();
            let ratio = geocoded as f64 / records.len() as f64;
            if ratio < self.config.min_geocoding_completeness {
                issues.push(format!(
                    "geocoding completeness {:.2} below threshold {:.2}",
                    ratio, self.config.min_geocoding_completeness
                ));
            }
        }

        if completeness < 0.5 {
            issues.push(format!(
                "required-field completeness {:.2} below threshold 0.50",
                completeness
            ));
        }

        if recency < 0.5 {
            issues.push(format!(
                "only {:.0}% of records updated within the last {}",
                recency * 100.0,
                humanize(window)
            ));
        }

        debug!(
            source = source_name,
            completeness, recency, quality_score, "validated source batch"
        );

        QualityReport {
            source_name: source_name.to_string(),
            source_type,
            record_count: records.len(),
            completeness,
            recency,
            quality_score,
            data_issues: issues,
            validated_at: now,
        }
    }

    /// Source-specific cleaning. Returns the surviving records.
    pub fn clean(&self, records: Vec<RawRecord>, source_type: SourceType) -> Vec<RawRecord> {
        let before = records.len();
        let cleaned: Vec<RawRecord> = records
            .into_iter()
            .filter_map(|r| self.clean_record(r, source_type))
            .collect();

        if cleaned.len() < before {
            debug!(
                source_type = source_type.as_str(),
                dropped = before - cleaned.len(),
                "dropped unusable records during cleaning"
            );
        }
        cleaned
    }

    fn clean_record(&self, mut record: RawRecord, _source_type: SourceType) -> Option<RawRecord> {
        // Whitespace folding on the name, original casing preserved
        if let Some(name) = record.name.take() {
            let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
            if !collapsed.is_empty() {
                record.name = Some(collapsed);
            }
        }

        // Coordinates outside valid ranges are discarded, not clamped
        if let Some(lat) = record.lat {
            if !(-90.0..=90.0).contains(&lat) {
                record.lat = None;
            }
        }
        if let Some(lng) = record.lng {
            if !(-180.0..=180.0).contains(&lng) {
                record.lng = None;
            }
        }

        // Unit-interval scores are clamped into range
        for key in [
            "sentiment_score",
            "predicted_score",
            "congestion_score",
            "event_score",
            "psychographic_relevance",
        ] {
            if let Some(v) = record.extra_f64(key) {
                record.set_extra_f64(key, v.clamp(0.0, 1.0));
            }
        }

        // Inverted confidence bounds are swapped
        if let (Some(lower), Some(upper)) = (
            record.extra_f64("confidence_lower"),
            record.extra_f64("confidence_upper"),
        ) {
            if lower > upper {
                record.set_extra_f64("confidence_lower", upper);
                record.set_extra_f64("confidence_upper", lower);
            }
        }

        if record.is_empty() {
            return None;
        }
        Some(record)
    }

    /// Exact-key dedup, keeping the first occurrence of each key.
    pub fn deduplicate(&self, records: Vec<RawRecord>, source_type: SourceType) -> Vec<RawRecord> {
        let mut seen = HashSet::new();
        let before = records.len();
        let deduped: Vec<RawRecord> = records
            .into_iter()
            .filter(|r| seen.insert(dedup_key(r, source_type)))
            .collect();

        if deduped.len() < before {
            debug!(
                source_type = source_type.as_str(),
                collapsed = before - deduped.len(),
                "collapsed exact-key duplicates"
            );
        }
        deduped
    }

    /// validate → clean → deduplicate in one call, reporting on the raw
    /// input and returning the gated records.
    pub fn process(
        &self,
        source_name: &str,
        source_type: SourceType,
        records: Vec<RawRecord>,
    ) -> (Vec<RawRecord>, QualityReport) {
        let report = self.validate(source_name, source_type, &records);
        let cleaned = self.clean(records, source_type);
        let deduped = self.deduplicate(cleaned, source_type);
        (deduped, report)
    }
}

impl Default for QualityController {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// DEDUP KEYS
// ============================================================================

fn dedup_key(record: &RawRecord, source_type: SourceType) -> String {
    match source_type {
        SourceType::Venues => {
            let name = record.name.as_deref().map(fold_name).unwrap_or_default();
            match (record.lat, record.lng) {
                (Some(lat), Some(lng)) => {
                    format!("{}|{:.4}|{:.4}", name, round_coord(lat), round_coord(lng))
                }
                _ => format!("{}|none", name),
            }
        }
        SourceType::SocialSentiment => format!(
            "{}|{}|{}",
            record.extra_str("venue_name").unwrap_or(""),
            record.extra_str("platform").unwrap_or(""),
            record
                .updated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        ),
        SourceType::Events => format!(
            "{}|{}|{}",
            record.name.as_deref().map(fold_name).unwrap_or_default(),
            record.extra_str("venue_name").unwrap_or(""),
            record.extra_str("start_time").unwrap_or("")
        ),
        _ => full_tuple_hash(record),
    }
}

/// Generic fallback: SHA-256 over the canonical JSON form of the record.
/// serde_json keeps object keys sorted, so the hash is deterministic.
fn full_tuple_hash(record: &RawRecord) -> String {
    let value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
    let mut hasher = Sha256::new();
    hasher.update(value.to_string());
    format!("{:x}", hasher.finalize())
}

fn humanize(d: chrono::Duration) -> String {
    if d.num_days() >= 1 {
        format!("{} day(s)", d.num_days())
    } else if d.num_hours() >= 1 {
        format!("{} hour(s)", d.num_hours())
    } else {
        format!("{} minute(s)", d.num_minutes())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn venue_record(name: &str, lat: Option<f64>, lng: Option<f64>) -> RawRecord {
        RawRecord {
            source_name: "place_listings".to_string(),
            name: Some(name.to_string()),
            lat,
            lng,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_full_completeness() {
        let controller = QualityController::new();
        let now = Utc::now();

        let mut record = venue_record("T-Mobile Center", Some(39.1012), Some(-94.5844));
        record.updated_at = Some(now - Duration::hours(1));

        let report =
            controller.validate_at("place_listings", SourceType::Venues, &[record], now);

        assert_eq!(report.completeness, 1.0);
        assert_eq!(report.recency, 1.0);
        assert!((report.quality_score - 1.0).abs() < 1e-9);
        assert!(report.data_issues.is_empty());
    }

    #[test]
    fn test_validate_zero_records_reports_but_does_not_panic() {
        let controller = QualityController::new();
        let report = controller.validate("dead_source", SourceType::Weather, &[]);

        assert_eq!(report.quality_score, 0.0);
        assert_eq!(report.record_count, 0);
        assert!(!report.data_issues.is_empty());
    }

    #[test]
    fn test_validate_flags_poor_geocoding() {
        let controller = QualityController::new();
        let now = Utc::now();

        // 1 of 2 geocoded → ratio 0.5, below the 0.8 threshold
        let records = vec![
            venue_record("A", Some(39.1), Some(-94.58)),
            venue_record("B", None, None),
        ];
        let report = controller.validate_at("place_listings", SourceType::Venues, &records, now);

        assert!(report
            .data_issues
            .iter()
            .any(|i| i.contains("geocoding completeness")));
    }

    #[test]
    fn test_recency_respects_freshness_window() {
        let controller = QualityController::new();
        let now = Utc::now();

        // Weather window is 1 h: one fresh, one stale
        let mut fresh = RawRecord::new("weather_api");
        fresh.set_extra_f64("temperature", 70.0);
        fresh.updated_at = Some(now - Duration::minutes(10));

        let mut stale = fresh.clone();
        stale.updated_at = Some(now - Duration::hours(3));

        let report =
            controller.validate_at("weather_api", SourceType::Weather, &[fresh, stale], now);
        assert!((report.recency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clean_clamps_sentiment_and_swaps_confidence() {
        let controller = QualityController::new();

        let mut record = RawRecord::new("social_scanner");
        record.name = Some("  The   Blue Room ".to_string());
        record.set_extra_f64("sentiment_score", 1.7);
        record.set_extra_f64("confidence_lower", 0.9);
        record.set_extra_f64("confidence_upper", 0.2);

        let cleaned = controller.clean(vec![record], SourceType::SocialSentiment);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].name.as_deref(), Some("The Blue Room"));
        assert_eq!(cleaned[0].extra_f64("sentiment_score"), Some(1.0));
        assert_eq!(cleaned[0].extra_f64("confidence_lower"), Some(0.2));
        assert_eq!(cleaned[0].extra_f64("confidence_upper"), Some(0.9));
    }

    #[test]
    fn test_clean_drops_invalid_coordinates_and_empty_records() {
        let controller = QualityController::new();

        let bad_coords = venue_record("Somewhere", Some(120.0), Some(-94.58));
        let empty = RawRecord::new("place_listings");

        let cleaned = controller.clean(vec![bad_coords, empty], SourceType::Venues);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].lat, None);
        assert_eq!(cleaned[0].lng, Some(-94.58));
    }

    #[test]
    fn test_deduplicate_venues_by_name_and_rounded_coords() {
        let controller = QualityController::new();

        let records = vec![
            venue_record("T-Mobile Center", Some(39.10121), Some(-94.58441)),
            // Same rounded key: coordinates agree to 4 decimal places
            venue_record("t-mobile  center", Some(39.101222), Some(-94.584422)),
            venue_record("Joe's Pizza", Some(39.2), Some(-94.3)),
        ];

        let deduped = controller.deduplicate(records, SourceType::Venues);
        assert_eq!(deduped.len(), 2);
        // First occurrence wins
        assert_eq!(deduped[0].name.as_deref(), Some("T-Mobile Center"));
    }

    #[test]
    fn test_deduplicate_social_by_venue_platform_timestamp() {
        let controller = QualityController::new();
        let t = Utc::now();

        let mut a = RawRecord::new("social_scanner");
        a.extra
            .insert("venue_name".to_string(), serde_json::json!("The Midland"));
        a.extra
            .insert("platform".to_string(), serde_json::json!("twitter"));
        a.updated_at = Some(t);

        let b = a.clone();

        let mut c = a.clone();
        c.extra
            .insert("platform".to_string(), serde_json::json!("instagram"));

        let deduped =
            controller.deduplicate(vec![a, b, c], SourceType::SocialSentiment);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_generic_fallback_hash_is_deterministic() {
        let mut record = RawRecord::new("economic_feed");
        record.set_extra_f64("indicator_value", 104.2);
        record
            .extra
            .insert("indicator_name".to_string(), serde_json::json!("cpi"));

        let h1 = full_tuple_hash(&record);
        let h2 = full_tuple_hash(&record);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_process_pipeline_gates_and_reports() {
        let controller = QualityController::new();

        let records = vec![
            venue_record("Uptown Theater", Some(39.055), Some(-94.589)),
            venue_record("Uptown Theater", Some(39.055), Some(-94.589)),
            RawRecord::new("place_listings"),
        ];

        let (gated, report) =
            controller.process("place_listings", SourceType::Venues, records);

        assert_eq!(report.record_count, 3);
        assert_eq!(gated.len(), 1);
    }
}
