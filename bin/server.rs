// Registry Ingest - Web Server
// Read-only REST API over an ingested ABR database

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use registry_ingest::query::{lookup, search, table_counts, EntitySummary, TableCount};
use registry_ingest::record::{normalize_abn, NormalizedRecord};
use registry_ingest::store::setup_database;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_PATH: &str = "abn.db";
const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Response> {
        self.db.lock().map_err(|_| {
            error!("Database mutex poisoned");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Database unavailable")
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn failure(status: StatusCode, message: &str) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        data: None,
        error: Some(message.to_string()),
    };
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
}

/// Stats response
#[derive(Serialize)]
struct StatsResponse {
    total_entities: i64,
    tables: Vec<TableCount>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/search?q=... - Search by ABN or name
async fn search_entities(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Query parameter 'q' is required");
    }

    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    match search(&conn, &query, params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT)) {
        Ok(results) => (StatusCode::OK, Json(ApiResponse::<Vec<EntitySummary>>::ok(results))).into_response(),
        Err(e) => {
            error!(%query, error = %e, "Search failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Search failed")
        }
    }
}

/// GET /api/abn/:abn - Full entity details
async fn get_entity(State(state): State<AppState>, Path(abn): Path<String>) -> Response {
    if normalize_abn(&abn).is_none() {
        return failure(StatusCode::BAD_REQUEST, "ABN must be 11 digits");
    }

    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    match lookup(&conn, &abn) {
        Ok(Some(record)) => (StatusCode::OK, Json(ApiResponse::<NormalizedRecord>::ok(record))).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "ABN not found"),
        Err(e) => {
            error!(%abn, error = %e, "Lookup failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed")
        }
    }
}

/// GET /api/stats - Rows per table
async fn get_stats(State(state): State<AppState>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    match table_counts(&conn) {
        Ok(tables) => {
            let total_entities = tables
                .iter()
                .find(|t| t.table == "abn_records")
                .map(|t| t.rows)
                .unwrap_or(0);
            let stats = StatsResponse {
                total_entities,
                tables,
            };
            (StatusCode::OK, Json(ApiResponse::ok(stats))).into_response()
        }
        Err(e) => {
            error!(error = %e, "Error getting stats");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Stats unavailable")
        }
    }
}

fn app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/search", get(search_entities))
        .route("/abn/:abn", get(get_entity))
        .route("/stats", get(get_stats))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let db_path = arg_value(&args, "--db")
        .or_else(|| env::var("REGISTRY_DB").ok())
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let addr = arg_value(&args, "--addr").unwrap_or_else(|| DEFAULT_ADDR.to_string());

    println!("🌐 Registry Ingest - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !std::path::Path::new(&db_path).exists() {
        eprintln!("❌ Database not found at {}", db_path);
        eprintln!("   Run: registry-ingest import <dir> --db {}", db_path);
        eprintln!("   to ingest an extract first.");
        std::process::exit(1);
    }

    let conn = Connection::open(&db_path).with_context(|| format!("Failed to open database {}", db_path))?;
    setup_database(&conn).context("Failed to prepare schema")?;
    println!("✓ Database opened: {}", db_path);

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(%addr, "Server listening");

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/search?q=...", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app(state)).await.context("Server error")?;
    Ok(())
}
