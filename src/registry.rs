// Venue Registry - owns the canonical venue identity space
//
// Matching strategies, tried in order:
//   1. Exact name (case/whitespace-insensitive)
//   2. Normalized name (abbreviation table + suffix stripping)
//   3. Location (nearest venue within the search radius)
//   4. Fuzzy name (shared significant word + edit-distance ratio)
//   5. No match → create a new canonical venue
//
// A declined merge is a decision, not an error. Matching never throws on
// missing optional fields; it degrades to the strategies that remain valid.

use crate::db::{self, CanonicalVenue};
use crate::error::{ConsolidationError, Result};
use crate::normalize::{
    address_similarity, fold_name, haversine_m, name_similarity, normalize_name,
    significant_words,
};
use crate::records::{EventRecord, RawRecord};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    ExactName,
    NormalizedName,
    Location,
    FuzzyName,
    NameAddress,
    NoMatch,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExactName => "exact_name",
            MatchType::NormalizedName => "normalized_name",
            MatchType::Location => "location",
            MatchType::FuzzyName => "fuzzy_name",
            MatchType::NameAddress => "name_address",
            MatchType::NoMatch => "none",
        }
    }
}

/// Outcome of one matching attempt. Transient; logged to the match audit
/// table for later inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_type: MatchType,
    pub confidence: f64,
    pub name_similarity: Option<f64>,
    pub distance_m: Option<f64>,
}

impl MatchResult {
    pub fn no_match() -> Self {
        MatchResult {
            match_type: MatchType::NoMatch,
            confidence: 0.0,
            name_similarity: None,
            distance_m: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.match_type != MatchType::NoMatch
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Matching thresholds. The numbers are hand-tuned rather than derived, so
/// they live in config instead of being buried at call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Radius for collecting location-match candidates (meters)
    pub location_search_radius_m: f64,

    /// Below this distance the nearest venue is accepted regardless of name
    pub location_accept_m: f64,

    /// Below this distance the nearest venue is accepted if names are similar
    pub location_name_gate_m: f64,

    /// Name similarity required for the distance-gated location match
    pub location_name_similarity: f64,

    /// Name similarity required for a fuzzy-name match
    pub fuzzy_accept_similarity: f64,

    /// Weight of the location bonus in fuzzy candidate scoring
    pub fuzzy_location_bonus_weight: f64,

    /// Range over which the location bonus decays to zero (km)
    pub fuzzy_location_bonus_range_km: f64,

    // Duplicate-sweep rules
    pub dup_name_similarity: f64,
    pub dup_name_distance_m: f64,
    pub dup_close_distance_m: f64,
    pub dup_close_name_similarity: f64,
    pub dup_addr_name_similarity: f64,
    pub dup_addr_distance_m: f64,
    pub dup_addr_similarity: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            location_search_radius_m: 100.0,
            location_accept_m: 20.0,
            location_name_gate_m: 50.0,
            location_name_similarity: 0.5,
            fuzzy_accept_similarity: 0.75,
            fuzzy_location_bonus_weight: 0.2,
            fuzzy_location_bonus_range_km: 1.0,
            dup_name_similarity: 0.95,
            dup_name_distance_m: 100.0,
            dup_close_distance_m: 20.0,
            dup_close_name_similarity: 0.6,
            dup_addr_name_similarity: 0.85,
            dup_addr_distance_m: 50.0,
            dup_addr_similarity: 0.8,
        }
    }
}

// ============================================================================
// CONSOLIDATION REPORT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub duplicates_found: usize,
    pub duplicates_consolidated: usize,
}

// ============================================================================
// VENUE REGISTRY
// ============================================================================

pub struct VenueRegistry {
    pub config: RegistryConfig,
}

impl VenueRegistry {
    pub fn new() -> Self {
        VenueRegistry {
            config: RegistryConfig::default(),
        }
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        VenueRegistry { config }
    }

    /// Resolve one record to a canonical venue, creating one only when no
    /// strategy matches. Returns the venue id and the match decision.
    pub fn register_venue(
        &self,
        conn: &Connection,
        record: &RawRecord,
    ) -> Result<(String, MatchResult)> {
        let mut venues = db::get_all_venues(conn)?;
        self.register_against(conn, &mut venues, record)
    }

    /// Batch registration sharing one in-memory venue index, so the store is
    /// not rescanned per record. Records are processed in arrival order.
    pub fn register_batch(
        &self,
        conn: &Connection,
        records: &[RawRecord],
    ) -> Result<Vec<(String, MatchResult)>> {
        let mut venues = db::get_all_venues(conn)?;
        records
            .iter()
            .map(|record| self.register_against(conn, &mut venues, record))
            .collect()
    }

    fn register_against(
        &self,
        conn: &Connection,
        venues: &mut Vec<CanonicalVenue>,
        record: &RawRecord,
    ) -> Result<(String, MatchResult)> {
        let has_name = record
            .name
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false);
        if !has_name && !record.has_coordinates() {
            return Err(ConsolidationError::Validation(
                "record has neither name nor coordinates".to_string(),
            ));
        }

        if let Some((idx, result)) = self.find_match(venues, record) {
            let venue = &mut venues[idx];
            backfill_from_record(venue, record);
            db::update_venue(conn, venue)?;
            db::log_match(
                conn,
                &venue.venue_id,
                &record.source_name,
                result.match_type.as_str(),
                result.confidence,
                result.name_similarity,
                result.distance_m,
            )?;
            debug!(
                venue_id = %venue.venue_id,
                match_type = result.match_type.as_str(),
                confidence = result.confidence,
                "resolved record to existing venue"
            );
            return Ok((venue.venue_id.clone(), result));
        }

        // No strategy matched: low confidence is a decision, not an error
        let venue = venue_from_record(record);
        db::insert_venue(conn, &venue)?;
        db::log_match(
            conn,
            &venue.venue_id,
            &record.source_name,
            MatchType::NoMatch.as_str(),
            0.0,
            None,
            None,
        )?;
        debug!(venue_id = %venue.venue_id, name = %venue.name, "created new canonical venue");

        let venue_id = venue.venue_id.clone();
        venues.push(venue);
        Ok((venue_id, MatchResult::no_match()))
    }

    /// Run the match strategies in order against the in-memory index.
    /// Returns the index of the matched venue and the decision.
    pub fn find_match(
        &self,
        venues: &[CanonicalVenue],
        record: &RawRecord,
    ) -> Option<(usize, MatchResult)> {
        let name = record.name.as_deref().map(str::trim).filter(|n| !n.is_empty());

        // Strategy 1: exact name
        if let Some(name) = name {
            let folded = fold_name(name);
            for (idx, venue) in venues.iter().enumerate() {
                if fold_name(&venue.name) == folded {
                    return Some((
                        idx,
                        MatchResult {
                            match_type: MatchType::ExactName,
                            confidence: 1.0,
                            name_similarity: Some(1.0),
                            distance_m: None,
                        },
                    ));
                }
            }

            // Strategy 2: normalized name
            let normalized = normalize_name(name);
            if !normalized.is_empty() {
                for (idx, venue) in venues.iter().enumerate() {
                    if normalize_name(&venue.name) == normalized {
                        return Some((
                            idx,
                            MatchResult {
                                match_type: MatchType::NormalizedName,
                                confidence: 0.95,
                                name_similarity: Some(name_similarity(name, &venue.name)),
                                distance_m: None,
                            },
                        ));
                    }
                }
            }
        }

        // Strategy 3: location (only when the record carries coordinates)
        if let (Some(lat), Some(lng)) = (record.lat, record.lng) {
            let mut nearby: Vec<(usize, f64)> = venues
                .iter()
                .enumerate()
                .filter_map(|(idx, venue)| {
                    let (vlat, vlng) = (venue.lat?, venue.lng?);
                    let distance = haversine_m(lat, lng, vlat, vlng);
                    (distance <= self.config.location_search_radius_m)
                        .then_some((idx, distance))
                })
                .collect();
            nearby.sort_by(|a, b| a.1.total_cmp(&b.1));

            if let Some(&(idx, distance)) = nearby.first() {
                let similarity = name
                    .map(|n| name_similarity(n, &venues[idx].name))
                    .unwrap_or(0.0);

                if distance < self.config.location_accept_m {
                    return Some((
                        idx,
                        MatchResult {
                            match_type: MatchType::Location,
                            confidence: 0.9,
                            name_similarity: Some(similarity),
                            distance_m: Some(distance),
                        },
                    ));
                }
                if distance < self.config.location_name_gate_m
                    && similarity > self.config.location_name_similarity
                {
                    return Some((
                        idx,
                        MatchResult {
                            match_type: MatchType::Location,
                            confidence: 0.8,
                            name_similarity: Some(similarity),
                            distance_m: Some(distance),
                        },
                    ));
                }
            }
        }

        // Strategy 4: fuzzy name over candidates sharing a significant word
        if let Some(name) = name {
            let words = significant_words(name);
            if !words.is_empty() {
                let mut best: Option<(usize, f64, f64, Option<f64>)> = None;

                for (idx, venue) in venues.iter().enumerate() {
                    let venue_words = significant_words(&venue.name);
                    if !words.iter().any(|w| venue_words.contains(w)) {
                        continue;
                    }

                    let similarity = name_similarity(name, &venue.name);

                    let mut distance = None;
                    let mut bonus = 0.0;
                    if let (Some(lat), Some(lng), Some(vlat), Some(vlng)) =
                        (record.lat, record.lng, venue.lat, venue.lng)
                    {
                        let d = haversine_m(lat, lng, vlat, vlng);
                        distance = Some(d);
                        let d_km = d / 1000.0;
                        if d_km <= self.config.fuzzy_location_bonus_range_km {
                            bonus = self.config.fuzzy_location_bonus_weight
                                * (1.0 - d_km / self.config.fuzzy_location_bonus_range_km);
                        }
                    }

                    let score = similarity + bonus;
                    let better = match best {
                        Some((_, best_score, _, _)) => score > best_score,
                        None => true,
                    };
                    if better {
                        best = Some((idx, score, similarity, distance));
                    }
                }

                if let Some((idx, _, similarity, distance)) = best {
                    if similarity > self.config.fuzzy_accept_similarity {
                        return Some((
                            idx,
                            MatchResult {
                                match_type: MatchType::FuzzyName,
                                confidence: similarity.min(1.0),
                                name_similarity: Some(similarity),
                                distance_m: distance,
                            },
                        ));
                    }
                }
            }
        }

        None
    }

    // ========================================================================
    // DUPLICATE CONSOLIDATION
    // ========================================================================

    /// Batch sweep over all coordinate-bearing venues. Each detected cluster
    /// merges into its first-seen master inside one transaction; a failed
    /// cluster rolls back and leaves its venues untouched for the next run.
    pub fn consolidate_duplicates(&self, conn: &Connection) -> Result<ConsolidationReport> {
        let venues: Vec<CanonicalVenue> = db::get_all_venues(conn)?
            .into_iter()
            .filter(|v| v.has_coordinates())
            .collect();

        // Union-find keyed by first-seen order: the earliest venue in any
        // connected set of duplicate pairs becomes the cluster master.
        let mut parent: Vec<usize> = (0..venues.len()).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            let p = parent[i];
            if p == i {
                return i;
            }
            let root = find(parent, p);
            parent[i] = root;
            root
        }

        let mut duplicates_found = 0;
        for i in 0..venues.len() {
            for j in (i + 1)..venues.len() {
                if find(&mut parent, i) == find(&mut parent, j) {
                    continue;
                }
                if let Some(result) = self.classify_duplicate(&venues[i], &venues[j]) {
                    duplicates_found += 1;
                    debug!(
                        master = %venues[i].venue_id,
                        duplicate = %venues[j].venue_id,
                        match_type = result.match_type.as_str(),
                        confidence = result.confidence,
                        "classified duplicate pair"
                    );
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    // Lower index = earlier created_at = master
                    let (master, dup) = if ri < rj { (ri, rj) } else { (rj, ri) };
                    parent[dup] = master;
                }
            }
        }

        let mut clusters: Vec<(usize, Vec<usize>)> = Vec::new();
        for i in 0..venues.len() {
            let root = find(&mut parent, i);
            if root == i {
                continue;
            }
            match clusters.iter_mut().find(|(r, _)| *r == root) {
                Some((_, members)) => members.push(i),
                None => clusters.push((root, vec![i])),
            }
        }

        let mut duplicates_consolidated = 0;
        for (master_idx, dup_idxs) in &clusters {
            let master = &venues[*master_idx];
            let dups: Vec<&CanonicalVenue> = dup_idxs.iter().map(|&i| &venues[i]).collect();
            match self.merge_cluster(conn, master, &dups) {
                Ok(merged) => duplicates_consolidated += merged,
                Err(e) => {
                    let conflict = ConsolidationError::ConsolidationConflict(e.to_string());
                    warn!(
                        master = %master.venue_id,
                        error = %conflict,
                        "cluster merge rolled back; duplicates remain for retry"
                    );
                }
            }
        }

        info!(
            duplicates_found,
            duplicates_consolidated, "duplicate consolidation sweep finished"
        );
        Ok(ConsolidationReport {
            duplicates_found,
            duplicates_consolidated,
        })
    }

    /// Weighted duplicate rules over name similarity, distance, and address
    /// similarity. Returns the classification, or None for distinct venues.
    pub fn classify_duplicate(
        &self,
        a: &CanonicalVenue,
        b: &CanonicalVenue,
    ) -> Option<MatchResult> {
        let (alat, alng) = (a.lat?, a.lng?);
        let (blat, blng) = (b.lat?, b.lng?);
        let distance = haversine_m(alat, alng, blat, blng);
        let similarity = name_similarity(&a.name, &b.name);

        if similarity > self.config.dup_name_similarity
            && distance < self.config.dup_name_distance_m
        {
            return Some(MatchResult {
                match_type: MatchType::FuzzyName,
                confidence: 0.95,
                name_similarity: Some(similarity),
                distance_m: Some(distance),
            });
        }

        if distance < self.config.dup_close_distance_m
            && similarity > self.config.dup_close_name_similarity
        {
            return Some(MatchResult {
                match_type: MatchType::Location,
                confidence: 0.85,
                name_similarity: Some(similarity),
                distance_m: Some(distance),
            });
        }

        if similarity > self.config.dup_addr_name_similarity
            && distance < self.config.dup_addr_distance_m
        {
            if let (Some(addr_a), Some(addr_b)) = (a.address.as_deref(), b.address.as_deref()) {
                if address_similarity(addr_a, addr_b) > self.config.dup_addr_similarity {
                    return Some(MatchResult {
                        match_type: MatchType::NameAddress,
                        confidence: 0.9,
                        name_similarity: Some(similarity),
                        distance_m: Some(distance),
                    });
                }
            }
        }

        None
    }

    /// Merge a duplicate cluster into its master within one transaction.
    /// Events are re-pointed first, then the duplicates are deleted; a
    /// failure anywhere rolls the whole cluster back.
    fn merge_cluster(
        &self,
        conn: &Connection,
        master: &CanonicalVenue,
        dups: &[&CanonicalVenue],
    ) -> Result<usize> {
        let tx = conn.unchecked_transaction()?;
        let mut merged = master.clone();

        for dup in dups {
            db::reassign_events(&tx, &dup.venue_id, &master.venue_id)?;
            backfill_from_venue(&mut merged, dup);
            merged.provenance.extend(dup.provenance.iter().cloned());
            db::delete_venue(&tx, &dup.venue_id)?;
        }

        merged.updated_at = Utc::now();
        db::update_venue(&tx, &merged)?;
        tx.commit()?;

        info!(
            master = %master.venue_id,
            merged = dups.len(),
            "merged duplicate cluster into master"
        );
        Ok(dups.len())
    }

    // ========================================================================
    // EVENT LINKING
    // ========================================================================

    /// Resolve each event's venue through the registry and attach the id.
    /// Events with neither a venue name nor coordinates stay unresolved.
    pub fn link_events_to_venues(
        &self,
        conn: &Connection,
        events: &mut [EventRecord],
    ) -> Result<usize> {
        let mut venues = db::get_all_venues(conn)?;
        let mut linked = 0;

        for event in events.iter_mut() {
            let venue_name = event
                .venue_name
                .clone()
                .unwrap_or_else(|| event.name.clone());

            if venue_name.trim().is_empty() && !event.has_coordinates() {
                continue;
            }

            let record = RawRecord {
                source_name: if event.source_name.is_empty() {
                    "events".to_string()
                } else {
                    event.source_name.clone()
                },
                name: Some(venue_name),
                category: Some("event_venue".to_string()),
                lat: event.lat,
                lng: event.lng,
                ..Default::default()
            };

            match self.register_against(conn, &mut venues, &record) {
                Ok((venue_id, _)) => {
                    event.venue_id = Some(venue_id);
                    linked += 1;
                }
                Err(e) => {
                    warn!(event = %event.name, error = %e, "event could not be linked");
                }
            }
        }

        Ok(linked)
    }
}

impl Default for VenueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// VENUE CONSTRUCTION & BACK-FILL
// ============================================================================

fn venue_from_record(record: &RawRecord) -> CanonicalVenue {
    let now = Utc::now();
    let mut provenance = BTreeSet::new();
    if !record.source_name.is_empty() {
        provenance.insert(record.source_name.clone());
    }

    CanonicalVenue {
        venue_id: uuid::Uuid::new_v4().to_string(),
        name: record.name.clone().unwrap_or_default(),
        category: record.category.clone(),
        lat: record.lat,
        lng: record.lng,
        address: record.address.clone(),
        phone: record.phone.clone(),
        website: record.website.clone(),
        provenance,
        aggregate_score: None,
        created_at: now,
        updated_at: now,
    }
}

/// Fill the venue's null fields from a newly matched record. Populated
/// fields are never overwritten.
fn backfill_from_record(venue: &mut CanonicalVenue, record: &RawRecord) {
    if venue.category.is_none() {
        venue.category = record.category.clone();
    }
    if venue.address.is_none() {
        venue.address = record.address.clone();
    }
    if venue.phone.is_none() {
        venue.phone = record.phone.clone();
    }
    if venue.website.is_none() {
        venue.website = record.website.clone();
    }
    if venue.lat.is_none() {
        venue.lat = record.lat;
    }
    if venue.lng.is_none() {
        venue.lng = record.lng;
    }
    if !record.source_name.is_empty() {
        venue.provenance.insert(record.source_name.clone());
    }
    venue.updated_at = Utc::now();
}

/// Same null-fill discipline, applied master ← duplicate during merges.
fn backfill_from_venue(master: &mut CanonicalVenue, dup: &CanonicalVenue) {
    if master.category.is_none() {
        master.category = dup.category.clone();
    }
    if master.address.is_none() {
        master.address = dup.address.clone();
    }
    if master.phone.is_none() {
        master.phone = dup.phone.clone();
    }
    if master.website.is_none() {
        master.website = dup.website.clone();
    }
}

// ============================================================================
// TESTS
// ============================================================================
