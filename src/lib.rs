// Venue Consolidation Engine - Core Library
// Resolves venue identities across sources and builds consolidated views
// for downstream consumers (map rendering, serving, prediction).

pub mod aggregator;
pub mod cache;
pub mod db;
pub mod error;
pub mod normalize;
pub mod orchestrator;
pub mod quality;
pub mod records;
pub mod registry;

// Re-export commonly used types
pub use aggregator::{
    AggregatorConfig, AreaSnapshot, ConsolidatedEventView, ConsolidatedVenueView, DataAggregator,
    EventSummary,
};
pub use cache::{CacheConfig, CacheStats, LayerType, ScoreCache};
pub use db::{setup_database, CanonicalVenue};
pub use error::{ConsolidationError, Result};
pub use orchestrator::{
    HealthLevel, HealthStatus, OrchestratorConfig, RefreshOrchestrator, RefreshReport,
    RefreshStatus, SourceBatch,
};
pub use quality::{QualityConfig, QualityController, QualityReport};
pub use records::{
    load_event_records, load_raw_records, BoundingBox, EventRecord, RawRecord, SourceType,
};
pub use registry::{
    ConsolidationReport, MatchResult, MatchType, RegistryConfig, VenueRegistry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
