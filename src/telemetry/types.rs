use crate::error::AppError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PUSH_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_FALLBACK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_GRID_SIGN: GridSign = GridSign::ExportPositive;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 300_000;
pub const MIN_BASE_DELAY_MS: u64 = 100;
pub const MAX_BASE_DELAY_MS: u64 = 60_000;
pub const MIN_MAX_ATTEMPTS: u32 = 1;
pub const MAX_MAX_ATTEMPTS: u32 = 20;
pub const MIN_FALLBACK_INTERVAL_MS: u64 = 1_000;
pub const MAX_FALLBACK_INTERVAL_MS: u64 = 600_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceChannel {
    Push,
    Pull,
}

impl SourceChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// One instantaneous reading. `grid_flow` is positive while importing from
/// the grid and negative while exporting to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub production: f64,
    pub consumption: f64,
    pub grid_flow: f64,
    pub battery: Option<f64>,
    pub battery_soc: Option<f64>,
    pub source_channel: SourceChannel,
}

impl TelemetrySnapshot {
    pub fn new(
        timestamp: DateTime<Utc>,
        production: f64,
        consumption: f64,
        grid_flow: f64,
        source_channel: SourceChannel,
    ) -> Self {
        Self {
            timestamp,
            production,
            consumption,
            grid_flow,
            battery: None,
            battery_soc: None,
            source_channel,
        }
    }

    pub fn with_source(mut self, source_channel: SourceChannel) -> Self {
        self.source_channel = source_channel;
        self
    }

    pub fn freshness_age_ms(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.timestamp)
            .num_milliseconds()
            .max(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Live,
    Degraded,
    Reconnecting,
    Failed,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_delay_ms: Option<u64>,
    pub reason: Option<String>,
}

impl ConnectionState {
    pub fn idle(reason: Option<String>) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            attempt: 0,
            next_retry_at: None,
            retry_delay_ms: None,
            reason,
        }
    }
}

/// What the dashboard currently shows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub snapshot: TelemetrySnapshot,
    pub freshness_age_ms: i64,
}

impl CurrentState {
    pub fn from_snapshot(snapshot: TelemetrySnapshot, now: DateTime<Utc>) -> Self {
        let freshness_age_ms = snapshot.freshness_age_ms(now);
        Self {
            snapshot,
            freshness_age_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Hour,
    Day,
    Week,
    Month,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePoint {
    pub bucket_start: DateTime<Utc>,
    pub resolution: Resolution,
    pub sample_count: u32,
    pub mean_production: f64,
    pub mean_consumption: f64,
    pub net_export: f64,
    pub net_import: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnergySummary {
    pub sample_count: u32,
    pub total_production: f64,
    pub total_consumption: f64,
    pub total_export: f64,
    pub total_import: f64,
    pub self_consumption_rate: f64,
    pub peak_production: f64,
    pub average_production: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReport {
    pub resolution: Resolution,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub points: Vec<AggregatePoint>,
    pub summary: EnergySummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemAlert {
    pub status: String,
    pub component: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedFrame,
    UnknownFrame,
    PlaceholderReading,
    FallbackFetchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Change notifications crossing the presentation boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum DashboardEvent {
    CurrentState(CurrentState),
    Connection(ConnectionState),
    Alert(SystemAlert),
    Diagnostic(Diagnostic),
}

impl DashboardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CurrentState(_) => super::CURRENT_STATE_EVENT,
            Self::Connection(_) => super::CONNECTION_STATE_EVENT,
            Self::Alert(_) => super::SYSTEM_ALERT_EVENT,
            Self::Diagnostic(_) => super::DIAGNOSTIC_EVENT,
        }
    }
}

/// Sign convention of `grid_kw` on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GridSign {
    ExportPositive,
    ImportPositive,
}

impl GridSign {
    /// Maps a wire value onto the internal import-positive convention.
    pub fn normalize(self, grid_kw: f64) -> f64 {
        match self {
            Self::ExportPositive => -grid_kw,
            Self::ImportPositive => grid_kw,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartSessionArgs {
    pub push_url: Option<String>,
    pub api_base_url: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub base_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub fallback_interval_ms: Option<u64>,
    pub grid_sign: Option<GridSign>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub push_url: String,
    pub api_base_url: String,
    pub heartbeat_interval_ms: u64,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub fallback_interval_ms: u64,
    pub grid_sign: GridSign,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            push_url: DEFAULT_PUSH_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fallback_interval_ms: DEFAULT_FALLBACK_INTERVAL_MS,
            grid_sign: DEFAULT_GRID_SIGN,
        }
    }
}

impl StartSessionArgs {
    pub fn normalize(self) -> Result<SessionConfig, AppError> {
        let push_url = self
            .push_url
            .unwrap_or_else(|| DEFAULT_PUSH_URL.to_string())
            .trim()
            .to_string();
        if !(push_url.starts_with("ws://") || push_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "push_url must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let api_base_url = self
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "api_base_url must use the http:// or https:// scheme".to_string(),
            ));
        }

        let heartbeat_interval_ms = self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if !(MIN_HEARTBEAT_INTERVAL_MS..=MAX_HEARTBEAT_INTERVAL_MS).contains(&heartbeat_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "heartbeat_interval_ms must be between {MIN_HEARTBEAT_INTERVAL_MS} and {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }

        let base_delay_ms = self.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS);
        if !(MIN_BASE_DELAY_MS..=MAX_BASE_DELAY_MS).contains(&base_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "base_delay_ms must be between {MIN_BASE_DELAY_MS} and {MAX_BASE_DELAY_MS}"
            )));
        }

        let max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if !(MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&max_attempts) {
            return Err(AppError::InvalidArgument(format!(
                "max_attempts must be between {MIN_MAX_ATTEMPTS} and {MAX_MAX_ATTEMPTS}"
            )));
        }

        let fallback_interval_ms = self
            .fallback_interval_ms
            .unwrap_or(DEFAULT_FALLBACK_INTERVAL_MS);
        if !(MIN_FALLBACK_INTERVAL_MS..=MAX_FALLBACK_INTERVAL_MS).contains(&fallback_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "fallback_interval_ms must be between {MIN_FALLBACK_INTERVAL_MS} and {MAX_FALLBACK_INTERVAL_MS}"
            )));
        }

        Ok(SessionConfig {
            push_url,
            api_base_url,
            heartbeat_interval_ms,
            base_delay_ms,
            max_attempts,
            fallback_interval_ms,
            grid_sign: self.grid_sign.unwrap_or(DEFAULT_GRID_SIGN),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadingWire {
    pub timestamp: String,
    pub production_kw: f64,
    pub consumption_kw: f64,
    pub grid_kw: f64,
    #[serde(default)]
    pub battery_kw: Option<f64>,
    #[serde(default)]
    pub battery_soc: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ReadingWire {
    pub fn is_placeholder(&self) -> bool {
        matches!(self.status.as_deref(), Some("no_data") | Some("error"))
    }

    pub fn try_into_snapshot(
        self,
        source_channel: SourceChannel,
        grid_sign: GridSign,
    ) -> Result<TelemetrySnapshot, AppError> {
        if !self.production_kw.is_finite()
            || !self.consumption_kw.is_finite()
            || !self.grid_kw.is_finite()
        {
            return Err(AppError::InvalidArgument(
                "reading values must be finite".to_string(),
            ));
        }
        if self.production_kw < 0.0 || self.consumption_kw < 0.0 {
            return Err(AppError::InvalidArgument(
                "production and consumption must be non-negative".to_string(),
            ));
        }
        if let Some(battery_kw) = self.battery_kw {
            if !battery_kw.is_finite() {
                return Err(AppError::InvalidArgument(
                    "battery_kw must be finite".to_string(),
                ));
            }
        }
        if let Some(battery_soc) = self.battery_soc {
            if !(0.0..=100.0).contains(&battery_soc) {
                return Err(AppError::InvalidArgument(
                    "battery_soc must be between 0 and 100".to_string(),
                ));
            }
        }

        Ok(TelemetrySnapshot {
            timestamp: parse_reading_timestamp(&self.timestamp)?,
            production: self.production_kw,
            consumption: self.consumption_kw,
            grid_flow: grid_sign.normalize(self.grid_kw),
            battery: self.battery_kw,
            battery_soc: self.battery_soc,
            source_channel,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FrameEnvelopeWire {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ReadingFrameWire {
    data: ReadingWire,
}

#[derive(Debug, Deserialize)]
struct AlertWire {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlertFrameWire {
    #[serde(alias = "data")]
    alert: AlertWire,
    #[serde(default)]
    timestamp: Option<String>,
}

/// A decoded push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Reading(TelemetrySnapshot),
    Alert(SystemAlert),
    Pong,
    Placeholder(String),
    Unknown(String),
}

pub fn parse_push_frame(payload: &mut [u8], grid_sign: GridSign) -> Result<InboundFrame, AppError> {
    // simd-json parses in place, so the envelope peek works on a copy.
    let mut envelope_payload = payload.to_vec();
    let envelope: FrameEnvelopeWire = simd_json::serde::from_slice(&mut envelope_payload)?;

    match envelope.kind.as_str() {
        "solar_update" | "current_data" => {
            let frame: ReadingFrameWire = simd_json::serde::from_slice(payload)?;
            if frame.data.is_placeholder() {
                let status = frame.data.status.unwrap_or_default();
                return Ok(InboundFrame::Placeholder(status));
            }
            let snapshot = frame
                .data
                .try_into_snapshot(SourceChannel::Push, grid_sign)?;
            Ok(InboundFrame::Reading(snapshot))
        }
        "system_alert" => {
            let frame: AlertFrameWire = simd_json::serde::from_slice(payload)?;
            let timestamp = match frame.timestamp.as_deref() {
                Some(raw) => Some(parse_reading_timestamp(raw)?),
                None => None,
            };
            Ok(InboundFrame::Alert(SystemAlert {
                status: frame
                    .alert
                    .status
                    .unwrap_or_else(|| "WARNING".to_string()),
                component: frame.alert.component,
                message: frame.alert.message,
                timestamp,
            }))
        }
        "pong" => Ok(InboundFrame::Pong),
        other => Ok(InboundFrame::Unknown(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ping,
    RequestData,
}

impl OutboundMessage {
    pub fn encode(self) -> Result<String, AppError> {
        Ok(simd_json::serde::to_string(&self)?)
    }
}

/// Accepts RFC 3339 with an offset, or a naive ISO 8601 timestamp taken as UTC.
pub fn parse_reading_timestamp(raw: &str) -> Result<DateTime<Utc>, AppError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")?;
    Ok(naive.and_utc())
}
