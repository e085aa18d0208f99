//! One dashboard session: a push channel, its coordinator and the fallback
//! poller. Sessions share nothing, so several can run side by side.

use crate::error::AppError;
use crate::health::{build_health_report, HealthReport};
use crate::telemetry::aggregator::{aggregate, summarize};
use crate::telemetry::client::{HttpTelemetryClient, TelemetrySource, WsConnector};
use crate::telemetry::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionManager, PushConnector,
};
use crate::telemetry::coordinator::{run_fallback, DashboardEvents, UpdateCoordinator};
use crate::telemetry::types::{
    AggregatePoint, ConnectionState, CurrentState, DashboardEvent, EnergySummary, HistoryReport,
    Resolution, SessionConfig, TelemetrySnapshot,
};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HTTP_TIMEOUT_MS: u64 = 10_000;

struct BackgroundTasks {
    cancellation_token: CancellationToken,
    pump: JoinHandle<()>,
    fallback: JoinHandle<()>,
}

pub struct DashboardSession {
    config: SessionConfig,
    started_at: Instant,
    connection: Arc<ConnectionManager>,
    coordinator: Arc<UpdateCoordinator>,
    source: Arc<dyn TelemetrySource>,
    background: tokio::sync::Mutex<Option<BackgroundTasks>>,
}

impl DashboardSession {
    /// Session backed by the real websocket and HTTP endpoints.
    pub fn new(config: SessionConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(HTTP_TIMEOUT_MS))
            .build()?;
        let source = HttpTelemetryClient::new(
            http_client,
            config.api_base_url.clone(),
            config.grid_sign,
        );
        Ok(Self::with_transports(
            config,
            Arc::new(WsConnector),
            Arc::new(source),
        ))
    }

    pub fn with_transports(
        config: SessionConfig,
        connector: Arc<dyn PushConnector>,
        source: Arc<dyn TelemetrySource>,
    ) -> Self {
        let connection = ConnectionManager::new(ConnectionConfig::from(&config), connector);
        let coordinator = UpdateCoordinator::new(config.grid_sign);

        Self {
            config,
            started_at: Instant::now(),
            connection: Arc::new(connection),
            coordinator: Arc::new(coordinator),
            source,
            background: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn connect(&self) {
        self.ensure_background().await;
        self.connection.connect().await;
    }

    /// Closes the push channel without retry. Fallback pulls keep running.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Disconnects and stops the event pump and fallback poller.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;

        let existing = {
            let mut background_slot = self.background.lock().await;
            background_slot.take()
        };
        if let Some(tasks) = existing {
            tasks.cancellation_token.cancel();
            let _ = tasks.pump.await;
            let _ = tasks.fallback.await;
        }
        tracing::info!("dashboard session shut down");
    }

    pub fn subscribe(&self) -> DashboardEvents {
        self.coordinator.subscribe()
    }

    pub fn current_state(&self) -> Option<CurrentState> {
        self.coordinator.current_state(Utc::now())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn aggregate(
        &self,
        readings: &[TelemetrySnapshot],
        resolution: Resolution,
    ) -> Vec<AggregatePoint> {
        aggregate(readings, resolution)
    }

    pub fn summarize(&self, readings: &[TelemetrySnapshot]) -> EnergySummary {
        summarize(readings)
    }

    pub async fn load_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<HistoryReport, AppError> {
        if end < start {
            return Err(AppError::InvalidArgument(
                "history range end must not precede start".to_string(),
            ));
        }

        let mut readings = self.source.fetch_readings(start, end).await?;
        readings.sort_by_key(|reading| reading.timestamp);
        tracing::debug!(
            resolution = resolution.as_str(),
            readings = readings.len(),
            "history loaded"
        );

        Ok(HistoryReport {
            resolution,
            start,
            end,
            points: aggregate(&readings, resolution),
            summary: summarize(&readings),
        })
    }

    pub fn health(&self) -> HealthReport {
        let current = self.current_state();
        build_health_report(
            self.started_at,
            self.connection.state().phase,
            current.as_ref(),
        )
    }

    async fn ensure_background(&self) {
        let mut background_slot = self.background.lock().await;
        if background_slot.is_some() {
            return;
        }

        let cancellation_token = CancellationToken::new();
        let pump = tokio::spawn(pump_connection_events(
            self.connection.subscribe(),
            Arc::clone(&self.coordinator),
            cancellation_token.clone(),
        ));
        let fallback = tokio::spawn(run_fallback(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.source),
            self.connection.phase_watch(),
            Duration::from_millis(self.config.fallback_interval_ms),
            cancellation_token.clone(),
        ));

        *background_slot = Some(BackgroundTasks {
            cancellation_token,
            pump,
            fallback,
        });
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        if let Some(tasks) = self.background.get_mut().take() {
            tasks.cancellation_token.cancel();
        }
    }
}

async fn pump_connection_events(
    mut events: ConnectionEvents,
    coordinator: Arc<UpdateCoordinator>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(ConnectionEvent::FrameReceived(payload)) => {
                coordinator.accept_push(&payload);
            }
            Some(ConnectionEvent::PhaseChanged(state)) => {
                coordinator.publish(DashboardEvent::Connection(state));
            }
            Some(ConnectionEvent::Opened) => tracing::debug!("push channel opened"),
            Some(ConnectionEvent::Closed(code)) => tracing::debug!(code, "push channel closed"),
            Some(ConnectionEvent::Error(reason)) => {
                tracing::debug!(%reason, "push channel error")
            }
            None => break,
        }
    }
}
