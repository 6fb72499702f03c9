// Venue Consolidation Engine - Web Server
// Read-only REST API over the consolidated views

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::Duration;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use venue_consolidation::{
    setup_database, BoundingBox, ConsolidatedEventView, ConsolidatedVenueView,
    RefreshOrchestrator,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<RefreshOrchestrator>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

#[derive(Deserialize)]
struct AreaQuery {
    min_lat: f64,
    min_lng: f64,
    max_lat: f64,
    max_lng: f64,
    /// Event window in hours (default 24)
    hours: Option<i64>,
}

#[derive(Serialize)]
struct AreaResponse {
    venues: Vec<ConsolidatedVenueView>,
    events: Vec<ConsolidatedEventView>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Pipeline health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.get_health_status() {
        Ok(status) => (StatusCode::OK, Json(ApiResponse::ok(status))).into_response(),
        Err(e) => {
            eprintln!("Error computing health: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::ok(()))).into_response()
        }
    }
}

/// GET /api/area - Consolidated venues and events for a bounding box
async fn area(
    State(state): State<AppState>,
    Query(query): Query<AreaQuery>,
) -> impl IntoResponse {
    let bounds = BoundingBox::new(query.min_lat, query.min_lng, query.max_lat, query.max_lng);
    let window = Duration::hours(query.hours.unwrap_or(24));

    match state.orchestrator.get_venues_and_events(bounds, window) {
        Ok((venues, events)) => (
            StatusCode::OK,
            Json(ApiResponse::ok(AreaResponse { venues, events })),
        )
            .into_response(),
        Err(e) => {
            eprintln!("Error aggregating area: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::ok(()))).into_response()
        }
    }
}

// ============================================================================
// Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let db_path = std::env::var("VENUE_DB").unwrap_or_else(|_| "venues.db".to_string());
    let conn = Connection::open(&db_path)?;
    setup_database(&conn)?;

    let state = AppState {
        orchestrator: Arc::new(RefreshOrchestrator::new(Arc::new(Mutex::new(conn)))),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/area", get(area))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = std::env::var("VENUE_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    println!("🌐 venue-consolidation server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
