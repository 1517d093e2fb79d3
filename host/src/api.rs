//! ==============================================================================
//! api.rs - json http api
//! ==============================================================================
//!
//! purpose:
//!     read-only view of the gateway for dashboards and scripts. every handler
//!     takes one registry snapshot and renders it, nothing here holds the
//!     registry lock across an await.
//!
//! routes:
//!     GET /sensor/data  -> {"children":[c1,c2,c3,c4]}, cN null unless node N
//!                          is ACTIVE with a structured reading
//!     GET /api/nodes    -> one object per occupied slot
//!     GET /api/status   -> gateway name, transport and liveness summary
//!
//! relationships:
//!     - reads: registry.rs, transport.rs (TransportStatus)
//!     - started by: main.rs
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::domain::{
    node_count_limit, NodeId, NodeState, Payload, RegistryEntry, RegistrySnapshot, MAX_NODES,
};
use crate::registry::NodeRegistry;
use crate::transport::TransportStatus;
use anyhow::Context;
use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub gateway_name: Arc<str>,
    pub registry: Arc<NodeRegistry>,
    pub status: TransportStatus,
    pub clock: Arc<dyn Clock>,
}

// ==============================================================================
// documents
// ==============================================================================

/// one child in the `/sensor/data` document
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChildData {
    pub valid: bool,
    pub aht_t01: i16,
    pub aht_rh01: u16,
    pub bmp_t01: i16,
    pub bmp_p01: u32,
    pub aht_ok: bool,
    pub bmp_ok: bool,
    pub seq: u32,
    pub rssi: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorDataDoc {
    pub children: [Option<ChildData>; MAX_NODES],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub state: NodeState,
    pub source: String,
    pub age_ms: u64,
    pub updates: u64,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusDoc {
    pub gateway: String,
    pub transport_ready: bool,
    pub has_any_active: bool,
    pub active_count: usize,
    pub node_capacity: usize,
    pub reopen_count: u64,
    pub uptime_ms: u64,
}

/// child 1 first, same indexing as the registry snapshot
pub fn sensor_data(snapshot: &RegistrySnapshot) -> SensorDataDoc {
    SensorDataDoc { children: std::array::from_fn(|i| snapshot[i].as_ref().and_then(child_data)) }
}

fn child_data(entry: &RegistryEntry) -> Option<ChildData> {
    if entry.state != NodeState::Active {
        return None;
    }
    let r = entry.payload.reading()?;
    Some(ChildData {
        valid: true,
        aht_t01: r.aht.t01,
        aht_rh01: r.aht.rh01,
        bmp_t01: r.bmp.t01,
        bmp_p01: r.bmp.p01,
        aht_ok: r.aht.ok,
        bmp_ok: r.bmp.ok,
        seq: r.seq,
        rssi: r.rssi,
    })
}

/// occupied slots, ordered by node id
pub fn node_views(snapshot: &RegistrySnapshot, now_ms: u64) -> Vec<NodeView> {
    snapshot
        .iter()
        .flatten()
        .map(|e| NodeView {
            node_id: e.node_id,
            state: e.state,
            source: e.source.to_string(),
            age_ms: e.age_ms(now_ms),
            updates: e.updates,
            payload: e.payload.clone(),
        })
        .collect()
}

pub fn status(state: &ApiState) -> StatusDoc {
    let snapshot = state.registry.snapshot_all();
    let active_count = snapshot.iter().flatten().filter(|e| e.is_active()).count();
    StatusDoc {
        gateway: state.gateway_name.to_string(),
        transport_ready: state.status.is_ready(),
        has_any_active: active_count > 0,
        active_count,
        node_capacity: node_count_limit(),
        reopen_count: state.status.reopen_count(),
        uptime_ms: state.clock.now_ms(),
    }
}

// ==============================================================================
// web server
// ==============================================================================

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/sensor/data", get(sensor_data_handler))
        .route("/api/nodes", get(nodes_handler))
        .route("/api/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// serve until `shutdown` flips to true
pub async fn serve(
    state: ApiState,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind api on {}", bind))?;
    info!("[API] listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("api server failed")?;
    Ok(())
}

async fn sensor_data_handler(State(state): State<ApiState>) -> Json<SensorDataDoc> {
    Json(sensor_data(&state.registry.snapshot_all()))
}

async fn nodes_handler(State(state): State<ApiState>) -> Json<Vec<NodeView>> {
    let snapshot = state.registry.snapshot_all();
    Json(node_views(&snapshot, state.clock.now_ms()))
}

async fn status_handler(State(state): State<ApiState>) -> Json<StatusDoc> {
    Json(status(&state))
}
