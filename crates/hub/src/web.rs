//! HTTP status and control surface.
//!
//! Read-only views of the ring buffer, zone store and data log, plus manual
//! zone runs. Manual runs share the command gate with the daily pass and get
//! a 409 while it is held.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ConfigSource;
use crate::datalog::DataLogger;
use crate::gate::CommandGate;
use crate::kv::KvStore;
use crate::manual::{ManualError, ManualRunner};
use crate::scheduler::parse_date;
use crate::state::SharedState;
use crate::zone::{ZoneController, ZoneState};

#[derive(Clone)]
pub struct AppState<S> {
    pub shared: SharedState,
    pub gate: CommandGate,
    pub zones: ZoneController<S>,
    pub manual: ManualRunner,
    pub datalog: DataLogger,
    pub config: ConfigSource,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn error_response(msg: String, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg),
        }),
    )
        .into_response()
}

fn internal(e: anyhow::Error) -> Response {
    error_response(format!("{e:#}"), StatusCode::INTERNAL_SERVER_ERROR)
}

fn manual_error(e: ManualError) -> Response {
    let status = match &e {
        ManualError::Busy(_) => StatusCode::CONFLICT,
        ManualError::BadZone { .. } | ManualError::BadDuration(_) => StatusCode::BAD_REQUEST,
        ManualError::Actuator(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(e.to_string(), status)
}

#[derive(Serialize)]
struct ZoneView {
    number: u32,
    name: String,
    enabled: bool,
    soil: String,
    state: ZoneState,
    vwc: f64,
    min_vwc: f64,
    max_vwc: f64,
}

#[derive(Serialize)]
struct ManualView {
    zone: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancelled: Option<bool>,
}

#[derive(Deserialize)]
struct RunQuery {
    minutes: u64,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: KvStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<S>))
        .route("/api/zones", get(list_zones::<S>))
        .route("/api/zones/{n}/run", post(run_zone::<S>))
        .route("/api/zones/{n}/stop", post(stop_zone::<S>))
        .route("/api/runtimes/{date}", get(get_runtimes::<S>))
        .route("/api/conditions/{date}", get(get_conditions::<S>))
        .with_state(state)
}

async fn api_status<S: KvStore>(State(app): State<AppState<S>>) -> Response {
    let holder = app.gate.holder();
    let st = app.shared.read().await;
    Json(st.to_status(holder)).into_response()
}

async fn list_zones<S: KvStore>(State(app): State<AppState<S>>) -> Response {
    let config = match app.config.load() {
        Ok(c) => c,
        Err(e) => return internal(e),
    };
    let mut views = Vec::with_capacity(config.zones.len());
    for (&n, zone) in &config.zones {
        let state = match app.zones.state(n).await {
            Ok(s) => s,
            Err(e) => return internal(e),
        };
        let vwc = match app.zones.vwc(n).await {
            Ok(v) => v,
            Err(e) => return internal(e),
        };
        views.push(ZoneView {
            number: n,
            name: zone.name.clone(),
            enabled: zone.enabled,
            soil: zone.soil.name.clone(),
            state,
            vwc,
            min_vwc: zone.min_vwc,
            max_vwc: zone.max_vwc,
        });
    }
    ok(views)
}

async fn run_zone<S: KvStore>(
    State(app): State<AppState<S>>,
    Path(n): Path<u32>,
    Query(q): Query<RunQuery>,
) -> Response {
    match app.manual.start(n, q.minutes).await {
        Ok(()) => ok(ManualView {
            zone: n,
            minutes: Some(q.minutes),
            cancelled: None,
        }),
        Err(e) => manual_error(e),
    }
}

async fn stop_zone<S: KvStore>(State(app): State<AppState<S>>, Path(n): Path<u32>) -> Response {
    match app.manual.stop(n).await {
        Ok(cancelled) => ok(ManualView {
            zone: n,
            minutes: None,
            cancelled: Some(cancelled),
        }),
        Err(e) => manual_error(e),
    }
}

async fn get_runtimes<S: KvStore>(
    State(app): State<AppState<S>>,
    Path(date): Path<String>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(d) => d,
        Err(e) => return error_response(format!("{e:#}"), StatusCode::BAD_REQUEST),
    };
    match app.datalog.read_runtimes(date).await {
        Ok(Some(entry)) => ok(entry),
        Ok(None) => error_response(format!("no runtimes for {date}"), StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

async fn get_conditions<S: KvStore>(
    State(app): State<AppState<S>>,
    Path(date): Path<String>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(d) => d,
        Err(e) => return error_response(format!("{e:#}"), StatusCode::BAD_REQUEST),
    };
    match app.datalog.read_conditions(date).await {
        Ok(Some(entry)) => ok(entry),
        Ok(None) => error_response(format!("no conditions for {date}"), StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<S: KvStore>(state: AppState<S>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
