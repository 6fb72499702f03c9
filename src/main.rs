use anyhow::{bail, Context, Result};
use chrono::Duration;
use rusqlite::Connection;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use venue_consolidation::{
    load_raw_records, setup_database, BoundingBox, RefreshOrchestrator, SourceBatch, SourceType,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("ingest") => run_ingest(&args[2..]),
        Some("consolidate") => run_consolidate(),
        Some("health") => run_health(),
        Some("area") => run_area(&args[2..]),
        _ => {
            eprintln!("venue-consolidation {}", venue_consolidation::VERSION);
            eprintln!();
            eprintln!("Usage:");
            eprintln!("  venue-consolidation ingest <source_type> <source_name> <csv_path>");
            eprintln!("  venue-consolidation consolidate");
            eprintln!("  venue-consolidation health");
            eprintln!("  venue-consolidation area <min_lat> <min_lng> <max_lat> <max_lng> [hours]");
            Ok(())
        }
    }
}

fn db_path() -> PathBuf {
    env::var("VENUE_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("venues.db"))
}

fn open_orchestrator() -> Result<RefreshOrchestrator> {
    let conn = Connection::open(db_path()).context("failed to open database")?;
    setup_database(&conn)?;
    Ok(RefreshOrchestrator::new(Arc::new(Mutex::new(conn))))
}

fn run_ingest(args: &[String]) -> Result<()> {
    let [source_type, source_name, csv_path] = args else {
        bail!("usage: ingest <source_type> <source_name> <csv_path>");
    };

    let Some(source_type) = SourceType::parse(source_type) else {
        bail!("unknown source type: {}", source_type);
    };

    let records = load_raw_records(Path::new(csv_path), source_name)?;
    println!("📂 Loaded {} records from {}", records.len(), csv_path);

    let orchestrator = open_orchestrator()?;
    let report = orchestrator.run_refresh(vec![SourceBatch {
        source_name: source_name.clone(),
        source_type,
        records,
    }])?;

    for quality in &report.quality_reports {
        println!("✓ {}", quality.summary());
    }
    println!(
        "✓ Registered {} venues, {} contextual records, {} events",
        report.venues_registered, report.contextual_records, report.events_ingested
    );
    println!(
        "✓ Consolidated {} of {} duplicates",
        report.consolidation.duplicates_consolidated, report.consolidation.duplicates_found
    );
    for issue in &report.phase_errors {
        println!("⚠ {}", issue);
    }

    Ok(())
}

fn run_consolidate() -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let report = orchestrator.run_refresh(Vec::new())?;

    println!(
        "✓ Duplicates found: {}, consolidated: {}",
        report.consolidation.duplicates_found, report.consolidation.duplicates_consolidated
    );
    Ok(())
}

fn run_health() -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let health = orchestrator.get_health_status()?;

    println!("Status:          {}", health.overall_status.as_str());
    println!("Venues:          {} ({} high quality)", health.total_venues, health.high_quality_venues);
    println!("Events:          {}", health.total_events);
    println!("Sources healthy: {}/{}", health.sources_healthy, health.sources_total);
    match health.last_refresh {
        Some(at) => println!("Last refresh:    {}", at.to_rfc3339()),
        None => println!("Last refresh:    never"),
    }
    println!("Refresh needed:  {}", health.refresh_needed);
    println!(
        "Score cache:     {} entries, {} hits / {} misses",
        health.cache.entries, health.cache.hits, health.cache.misses
    );
    Ok(())
}

fn run_area(args: &[String]) -> Result<()> {
    if args.len() < 4 {
        bail!("usage: area <min_lat> <min_lng> <max_lat> <max_lng> [hours]");
    }
    let coords: Vec<f64> = args[..4]
        .iter()
        .map(|s| s.parse().context("invalid coordinate"))
        .collect::<Result<_>>()?;
    let hours: i64 = args.get(4).map(|s| s.parse()).transpose()?.unwrap_or(24);

    let bounds = BoundingBox::new(coords[0], coords[1], coords[2], coords[3]);
    let orchestrator = open_orchestrator()?;
    let (venues, events) =
        orchestrator.get_venues_and_events(bounds, Duration::hours(hours))?;

    println!("🗺  {} venues, {} events in area", venues.len(), events.len());
    for view in &venues {
        println!(
            "  {} | completeness {:.2} | score {:.2} | {} upcoming",
            view.venue.name,
            view.data_completeness,
            view.comprehensive_score,
            view.upcoming_events.len()
        );
    }
    Ok(())
}
