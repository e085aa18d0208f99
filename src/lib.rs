pub mod config;
pub mod error;
pub mod health;
pub mod session;
pub mod telemetry;

pub use error::AppError;
pub use health::HealthReport;
pub use session::DashboardSession;
pub use telemetry::coordinator::DashboardEvents;
pub use telemetry::types::{
    AggregatePoint, ConnectionPhase, ConnectionState, CurrentState, DashboardEvent,
    EnergySummary, HistoryReport, Resolution, SessionConfig, StartSessionArgs, TelemetrySnapshot,
};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Connects one session from the given config file and logs every dashboard
/// event until Ctrl-C.
pub async fn run(config_path: Option<&std::path::Path>) -> Result<(), AppError> {
    let config = crate::config::load_session_config(config_path)?;
    tracing::info!(
        push_url = %config.push_url,
        api_base_url = %config.api_base_url,
        "starting dashboard session"
    );

    let session = DashboardSession::new(config)?;
    let mut events = session.subscribe();
    session.connect().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_dashboard_event(&event),
                None => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

fn log_dashboard_event(event: &DashboardEvent) {
    match event {
        DashboardEvent::CurrentState(state) => tracing::info!(
            event = event.name(),
            source = state.snapshot.source_channel.as_str(),
            production_kw = state.snapshot.production,
            consumption_kw = state.snapshot.consumption,
            grid_kw = state.snapshot.grid_flow,
            freshness_age_ms = state.freshness_age_ms,
            "current state"
        ),
        DashboardEvent::Connection(state) => tracing::info!(
            event = event.name(),
            phase = state.phase.as_str(),
            attempt = state.attempt,
            "connection state"
        ),
        DashboardEvent::Alert(alert) => tracing::warn!(
            event = event.name(),
            status = %alert.status,
            message = alert.message.as_deref().unwrap_or(""),
            "system alert"
        ),
        DashboardEvent::Diagnostic(diagnostic) => tracing::warn!(
            event = event.name(),
            kind = ?diagnostic.kind,
            reason = %diagnostic.reason,
            "diagnostic"
        ),
    }
}
