use crate::telemetry::types::{ConnectionPhase, CurrentState};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub phase: ConnectionPhase,
    pub freshness_age_ms: Option<i64>,
}

/// `ok` while the push channel is live, `degraded` while the dashboard is
/// served from fallback pulls, `stale` until a first snapshot is accepted.
pub fn build_health_report(
    started_at: Instant,
    phase: ConnectionPhase,
    current: Option<&CurrentState>,
) -> HealthReport {
    let status = match (current, phase) {
        (None, _) => "stale",
        (Some(_), ConnectionPhase::Live) => "ok",
        (Some(_), _) => "degraded",
    };

    HealthReport {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        phase,
        freshness_age_ms: current.map(|state| state.freshness_age_ms),
    }
}
