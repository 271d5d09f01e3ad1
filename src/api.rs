//! # API Server Module
//!
//! ## Purpose
//! REST API server exposing the counter read path, the figure-edit
//! collaborator contract, and the operator-facing administrative surface.
//!
//! ## Input/Output Specification
//! - **Input**: HTTP requests for counter values, figure edits, admin actions
//! - **Output**: JSON responses; a pending counter renders as a neutral
//!   "pending" payload, never an error page
//! - **Endpoints**: Counters, figures, health, cache statistics, warming,
//!   lock and entry clearing
//!
//! Page-render paths call the cache with `allow_expensive = false` so a
//! request never stalls behind someone else's recomputation.

use crate::errors::{CounterError, Result};
use crate::invalidation::FigureChange;
use crate::utils::{MoneyUtils, Timer};
use crate::warming::WarmingOutcome;
use crate::{CounterKey, CounterOutcome, FinancialFigure, WarmMode};
use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Result as ActixResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// API server wrapper
pub struct ApiServer {
    app_state: crate::AppState,
}

/// Query parameters for counter lookups
#[derive(Debug, Deserialize)]
pub struct CounterQuery {
    /// Council scope; omitted means site-wide
    pub council: Option<String>,
    /// Year; omitted means latest
    pub year: Option<i32>,
    /// Allow a locked recomputation on miss (background/admin paths only)
    #[serde(default)]
    pub expensive: bool,
}

/// Counter lookup response
#[derive(Debug, Serialize)]
pub struct CounterResponse {
    pub key: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
    /// Last known value while a recomputation is pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_value: Option<Decimal>,
    pub query_time_ms: u64,
}

/// Figure edit request
#[derive(Debug, Deserialize)]
pub struct UpdateFigureRequest {
    pub council: String,
    pub year: i32,
    pub field: String,
    pub value: Decimal,
    /// Editing-session identifier; edits sharing it are batch-invalidated
    pub session: Option<String>,
}

/// Figure edit response
#[derive(Debug, Serialize)]
pub struct UpdateFigureResponse {
    pub stored: bool,
    pub affected_counters: usize,
    pub batched: bool,
}

/// Warming trigger request
#[derive(Debug, Deserialize)]
pub struct WarmRequest {
    pub mode: WarmMode,
    /// Clear the overlap guard before running (incident recovery)
    #[serde(default)]
    pub force: bool,
}

/// Combined statistics response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache: crate::orchestrator::CacheStats,
    pub results: crate::results::ResultStoreStats,
    pub invalidation: crate::invalidation::GateStats,
    pub storage: crate::storage::StorageStats,
    pub pending_sessions: usize,
}

/// Error payload
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub category: &'static str,
}

impl ApiServer {
    /// Create new API server
    pub async fn new(app_state: crate::AppState) -> Result<Self> {
        Ok(Self { app_state })
    }

    /// Run the API server
    pub async fn run(self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.app_state.config.server.host, self.app_state.config.server.port
        );
        let enable_cors = self.app_state.config.server.enable_cors;

        tracing::info!("Starting API server on {}", bind_addr);

        HttpServer::new(move || {
            let cors = if enable_cors {
                Cors::permissive()
            } else {
                Cors::default()
            };

            App::new()
                .wrap(cors)
                .app_data(web::Data::new(self.app_state.clone()))
                .route("/counters/{counter_id}", web::get().to(get_counter_handler))
                .route("/figures", web::put().to(update_figure_handler))
                .route("/health", web::get().to(health_handler))
                .route("/admin/cache/stats", web::get().to(stats_handler))
                .route("/admin/warm", web::post().to(warm_handler))
                .route("/admin/locks/{name}", web::delete().to(clear_lock_handler))
                .route("/admin/counters/{key}", web::delete().to(purge_handler))
                .route("/", web::get().to(index_handler))
        })
        .bind(&bind_addr)
        .map_err(|e| CounterError::Internal {
            message: format!("Failed to bind server to {}: {}", bind_addr, e),
        })?
        .run()
        .await
        .map_err(|e| CounterError::Internal {
            message: format!("Server error: {}", e),
        })?;

        Ok(())
    }
}

fn error_response(error: &CounterError) -> HttpResponse {
    let payload = ErrorResponse {
        error: error.to_string(),
        category: error.category(),
    };

    match error {
        CounterError::UnknownCounter { .. } | CounterError::CouncilNotFound { .. } => {
            HttpResponse::NotFound().json(payload)
        }
        CounterError::InvalidKey { .. } | CounterError::ValidationFailed { .. } => {
            HttpResponse::BadRequest().json(payload)
        }
        _ => HttpResponse::InternalServerError().json(payload),
    }
}

/// Counter lookup endpoint
async fn get_counter_handler(
    app_state: web::Data<crate::AppState>,
    path: web::Path<String>,
    query: web::Query<CounterQuery>,
) -> ActixResult<HttpResponse> {
    let timer = Timer::new("counter lookup");
    let counter_id = path.into_inner();

    if app_state.registry.get(&counter_id).is_none() {
        return Ok(error_response(&CounterError::UnknownCounter { counter_id }));
    }

    if let Some(council) = &query.council {
        if !CounterKey::valid_slug(council) {
            return Ok(error_response(&CounterError::ValidationFailed {
                field: "council".to_string(),
                reason: format!("'{}' is not a usable council slug", council),
            }));
        }
    }

    let key = CounterKey {
        counter_id,
        council: query.council.clone(),
        year: query.year,
    };

    match app_state.counters.get(&key, query.expensive).await {
        Ok(CounterOutcome::Ready(counter)) => Ok(HttpResponse::Ok().json(CounterResponse {
            key: key.cache_key(),
            status: "ready",
            value: Some(counter.value),
            formatted: Some(MoneyUtils::format_gbp(counter.value)),
            computed_at: Some(counter.computed_at),
            stale_value: None,
            query_time_ms: timer.stop(),
        })),
        Ok(CounterOutcome::Pending { stale_value }) => {
            // The display layer renders this as "Calculating…"
            Ok(HttpResponse::Ok().json(CounterResponse {
                key: key.cache_key(),
                status: "pending",
                value: None,
                formatted: stale_value.map(MoneyUtils::format_gbp),
                computed_at: None,
                stale_value,
                query_time_ms: timer.stop(),
            }))
        }
        Err(e) => {
            tracing::error!("Counter lookup for {} failed: {}", key, e);
            Ok(error_response(&e))
        }
    }
}

/// Figure edit endpoint.
///
/// Invalidation is signalled once per edit, and only after the figure write
/// has been durably flushed.
async fn update_figure_handler(
    app_state: web::Data<crate::AppState>,
    request: web::Json<UpdateFigureRequest>,
) -> ActixResult<HttpResponse> {
    let request = request.into_inner();

    // A council named like the site-wide scope, or a slug carrying the key
    // delimiter, would collide with other entries' cache and storage keys
    if !CounterKey::valid_slug(&request.council) {
        return Ok(error_response(&CounterError::ValidationFailed {
            field: "council".to_string(),
            reason: format!("'{}' is not a usable council slug", request.council),
        }));
    }
    if request.field.is_empty() || request.field.contains(':') {
        return Ok(error_response(&CounterError::ValidationFailed {
            field: "field".to_string(),
            reason: "field must be a non-empty slug without ':'".to_string(),
        }));
    }

    let figure = FinancialFigure {
        council: request.council.clone(),
        year: request.year,
        field: request.field.clone(),
        value: request.value,
        updated_at: Utc::now(),
    };

    if let Err(e) = app_state.storage.store_figure(&figure).await {
        tracing::error!("Failed to store figure: {}", e);
        return Ok(error_response(&e));
    }

    // Which counters consume this field
    let affected: Vec<String> = app_state
        .registry
        .all()
        .filter(|def| def.fields.contains(&request.field))
        .map(|def| def.id.clone())
        .collect();

    let batched = request.session.is_some();
    let change = FigureChange {
        council: request.council,
        year: request.year,
        counter_ids: affected.clone(),
        session: request.session,
    };

    if let Err(e) = app_state.gate.notify_changed(change).await {
        tracing::error!("Invalidation failed after figure edit: {}", e);
        return Ok(error_response(&e));
    }

    Ok(HttpResponse::Ok().json(UpdateFigureResponse {
        stored: true,
        affected_counters: affected.len(),
        batched,
    }))
}

/// Health check endpoint
async fn health_handler(app_state: web::Data<crate::AppState>) -> ActixResult<HttpResponse> {
    match app_state.storage.health_check().await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
        }))),
        Err(e) => Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "unhealthy",
            "reason": e.to_string(),
        }))),
    }
}

/// Cache statistics endpoint
async fn stats_handler(app_state: web::Data<crate::AppState>) -> ActixResult<HttpResponse> {
    let results = match app_state.counters.result_stats() {
        Ok(stats) => stats,
        Err(e) => return Ok(error_response(&e)),
    };
    let storage = match app_state.storage.get_stats().await {
        Ok(stats) => stats,
        Err(e) => return Ok(error_response(&e)),
    };

    Ok(HttpResponse::Ok().json(StatsResponse {
        cache: app_state.counters.get_stats().await,
        results,
        invalidation: app_state.gate.get_stats().await,
        storage,
        pending_sessions: app_state.gate.pending_sessions(),
    }))
}

/// Warming trigger endpoint
async fn warm_handler(
    app_state: web::Data<crate::AppState>,
    request: web::Json<WarmRequest>,
) -> ActixResult<HttpResponse> {
    let outcome = if request.force {
        app_state.warming.force_run(request.mode).await
    } else {
        app_state.warming.run(request.mode).await
    };

    match outcome {
        Ok(WarmingOutcome::Completed(report)) => Ok(HttpResponse::Ok().json(report)),
        Ok(WarmingOutcome::AlreadyRunning) => Ok(HttpResponse::Conflict().json(
            serde_json::json!({ "status": "already_running" }),
        )),
        Err(e) => {
            tracing::error!("Warming pass failed: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// Administrative lock clear endpoint
async fn clear_lock_handler(
    app_state: web::Data<crate::AppState>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let name = path.into_inner();
    match app_state.counters.clear_lock(&name).await {
        Ok(cleared) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "lock": name,
            "cleared": cleared,
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Administrative counter-entry purge endpoint
async fn purge_handler(
    app_state: web::Data<crate::AppState>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let key = match CounterKey::parse(&path.into_inner()) {
        Ok(key) => key,
        Err(e) => return Ok(error_response(&e)),
    };

    match app_state.counters.purge(&key).await {
        Ok(removed) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "key": key.cache_key(),
            "removed": removed,
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Service info endpoint
async fn index_handler() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "service": "council-counters",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /counters/{counter_id}?council=&year=&expensive=",
            "PUT /figures",
            "GET /health",
            "GET /admin/cache/stats",
            "POST /admin/warm",
            "DELETE /admin/locks/{name}",
            "DELETE /admin/counters/{key}",
        ],
    })))
}
