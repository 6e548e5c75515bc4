//! HTTP handlers for health checks, metrics and counters

use super::AgentState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sipsieve_common::{metrics::encode_metrics, ServiceInfo};
use sipsieve_ebpf::CounterSnapshot;
use std::collections::BTreeMap;
use tower_http::trace::TraceLayer;
use tracing::warn;

const SERVICE: ServiceInfo = ServiceInfo::new("agent");

/// Create the HTTP router
pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/counters", get(counters))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health status response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    interface: String,
    xdp_attached: bool,
}

/// Main health check endpoint
async fn health_check(State(state): State<AgentState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy",
        service: SERVICE.name,
        version: SERVICE.version,
        interface: state.interface.name.clone(),
        xdp_attached: state.is_ready(),
    };

    (StatusCode::OK, Json(response))
}

/// Kubernetes liveness probe
async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Kubernetes readiness probe
async fn readiness_check(State(state): State<AgentState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY")
    }
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}

/// Summed counters
#[derive(Debug, Serialize)]
pub struct CountersResponse {
    pub timestamp: DateTime<Utc>,
    pub total: u64,
    pub counters: BTreeMap<&'static str, u64>,
}

impl CountersResponse {
    pub fn new(snapshot: &CounterSnapshot, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            total: snapshot.total(),
            counters: snapshot
                .iter()
                .map(|(counter, value)| (counter.name(), value))
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

async fn counters(State(state): State<AgentState>) -> impl IntoResponse {
    let snapshot = state.maps.read().read_counters();

    match snapshot {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(CountersResponse::new(&snapshot, Utc::now())),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read counters");
            let status = StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(ErrorResponse {
                    code: e.error_code(),
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Detailed status endpoint
#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    environment: String,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
    interface: InterfaceStatus,
    xdp_program: Option<XdpProgramStatus>,
    policy: PolicyStatus,
}

#[derive(Serialize)]
struct InterfaceStatus {
    name: String,
    index: u32,
    ipv4_addresses: Vec<String>,
    is_up: bool,
    supports_xdp: bool,
}

#[derive(Serialize)]
struct XdpProgramStatus {
    program_name: String,
    mode: &'static str,
}

#[derive(Serialize)]
struct PolicyStatus {
    blocked_ips: usize,
    allowed_ips: usize,
    strict_protocol: Option<bool>,
    authoritative: bool,
}

async fn status(State(state): State<AgentState>) -> impl IntoResponse {
    let interface = InterfaceStatus {
        name: state.interface.name.clone(),
        index: state.interface.index,
        ipv4_addresses: state
            .interface
            .ipv4_addresses
            .iter()
            .map(|ip| ip.to_string())
            .collect(),
        is_up: state.interface.is_up,
        supports_xdp: state.interface.supports_xdp(),
    };

    let xdp_program = state.loader.read().attached().map(|prog| XdpProgramStatus {
        program_name: prog.program_name.clone(),
        mode: prog.mode.as_str(),
    });

    let policy = {
        let maps = state.maps.read();
        let stats = maps.stats();
        PolicyStatus {
            blocked_ips: stats.blocked_ips,
            allowed_ips: stats.allowed_ips,
            strict_protocol: maps.read_config().ok().map(|c| c.strict_protocol()),
            authoritative: state.config.read().policy.authoritative,
        }
    };

    let response = StatusResponse {
        version: SERVICE.version,
        environment: state.config.read().environment.clone(),
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        interface,
        xdp_program,
        policy,
    };

    (StatusCode::OK, Json(response))
}
