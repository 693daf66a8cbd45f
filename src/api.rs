//! api.rs — read-only HTTP viewer over the persisted store.
//!
//! Pure consumer of the store: the server loads a snapshot at startup and
//! never writes. Listing returns items with derived aggregates only; raw
//! eval history is exposed per-item.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::aggregate::Aggregate;
use crate::store::{Item, Store};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/items", get(list_items))
        .route("/api/items/{dedup_key}", get(get_item))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the viewer until the process is stopped.
pub async fn serve(store: Store, port: u16) -> Result<()> {
    let state = AppState {
        store: Arc::new(store),
    };
    let router = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "viewer listening");
    axum::serve(listener, router).await.context("serving viewer")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store_path: String,
    total_items: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        store_path: state.store.path().display().to_string(),
        total_items: state.store.len(),
    })
}

/// Listing entry: item metadata plus the derived aggregate, no raw evals.
#[derive(Serialize)]
struct ItemSummary {
    dedup_key: String,
    source: String,
    title: String,
    link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    creation_date: Option<DateTime<Utc>>,
    first_collected: DateTime<Utc>,
    last_collected: DateTime<Utc>,
    #[serde(flatten)]
    aggregate: Aggregate,
}

impl ItemSummary {
    fn from_item(item: &Item) -> Self {
        Self {
            dedup_key: item.dedup_key.clone(),
            source: item.source.clone(),
            title: item.title.clone(),
            link: item.link.clone(),
            creation_date: item.creation_date,
            first_collected: item.first_collected,
            last_collected: item.last_collected,
            aggregate: item.aggregate(),
        }
    }
}

async fn list_items(State(state): State<AppState>) -> Json<Vec<ItemSummary>> {
    let mut items: Vec<ItemSummary> = state.store.iter().map(ItemSummary::from_item).collect();
    // Highest score first; unscored items sink to the bottom.
    items.sort_by(|a, b| {
        b.aggregate
            .weighted_score
            .partial_cmp(&a.aggregate.weighted_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Json(items)
}

async fn get_item(
    State(state): State<AppState>,
    Path(dedup_key): Path<String>,
) -> Result<Json<Item>, StatusCode> {
    state
        .store
        .get(&dedup_key)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
struct ScoreRanges {
    high: usize,
    medium: usize,
    low: usize,
    unscored: usize,
}

#[derive(Serialize)]
struct StatsResponse {
    total_items: usize,
    sources: Vec<String>,
    score_ranges: ScoreRanges,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let sources: Vec<String> = state
        .store
        .iter()
        .map(|i| i.source.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut ranges = ScoreRanges {
        high: 0,
        medium: 0,
        low: 0,
        unscored: 0,
    };
    for item in state.store.iter() {
        match item.aggregate().weighted_score {
            Some(s) if s >= 70.0 => ranges.high += 1,
            Some(s) if s >= 30.0 => ranges.medium += 1,
            Some(_) => ranges.low += 1,
            None => ranges.unscored += 1,
        }
    }

    Json(StatsResponse {
        total_items: state.store.len(),
        sources,
        score_ranges: ranges,
    })
}
