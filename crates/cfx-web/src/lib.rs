//! Axum JSON surface over the refresh service.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cfx_core::{CountryQuery, RefreshOutcome};
use cfx_storage::StoreError;
use cfx_sync::{RefreshError, RefreshService};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cfx-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RefreshService>,
}

impl AppState {
    pub fn new(service: Arc<RefreshService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    message: &'static str,
    #[serde(flatten)]
    outcome: RefreshOutcome,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/countries", get(list_countries_handler))
        .route("/countries/refresh", post(refresh_handler))
        .route(
            "/countries/{name}",
            get(get_country_handler).delete(delete_country_handler),
        )
        .fallback(not_found_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(service: Arc<RefreshService>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Welcome to the countries currency api",
        "instructions": "POST /countries/refresh to populate the cache",
    }))
}

async fn status_handler(State(state): State<AppState>) -> Response {
    match state.service.store_status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => refresh_error(err),
    }
}

async fn refresh_handler(State(state): State<AppState>) -> Response {
    match state.service.refresh().await {
        Ok(outcome) => Json(RefreshResponse {
            message: "Cache refreshed successfully",
            outcome,
        })
        .into_response(),
        Err(err) => refresh_error(err),
    }
}

async fn list_countries_handler(
    State(state): State<AppState>,
    query: Result<Query<CountryQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return validation_error(rejection.body_text()),
    };
    match state.service.store().list_countries(&query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_country_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.service.store().get_country(&name).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => country_not_found(),
        Err(err) => store_error(err),
    }
}

async fn delete_country_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.service.store().delete_country(&name).await {
        Ok(true) => Json(json!({ "message": format!("{name} deleted successfully") })).into_response(),
        Ok(false) => country_not_found(),
        Err(err) => store_error(err),
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route not found" }))).into_response()
}

fn refresh_error(err: RefreshError) -> Response {
    match err {
        RefreshError::Upstream(upstream) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "External data source unavailable",
                "details": format!("Could not fetch data from {}", upstream.upstream.display_name()),
            })),
        )
            .into_response(),
        RefreshError::Storage { cause } => {
            error!(%cause, "refresh failed in storage");
            internal_error()
        }
    }
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "country store failure");
    internal_error()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn validation_error(details: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Validation failed", "details": details })),
    )
        .into_response()
}

fn country_not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Country not found" }))).into_response()
}
