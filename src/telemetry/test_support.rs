use crate::error::AppError;
use crate::telemetry::client::TelemetrySource;
use crate::telemetry::connection::{ChannelMessage, PushConnector, PushLink};
use crate::telemetry::types::{OutboundMessage, SourceChannel, TelemetrySnapshot};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) fn at_second(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, second).unwrap()
}

pub(crate) fn snapshot(second: u32, production: f64, source: SourceChannel) -> TelemetrySnapshot {
    TelemetrySnapshot::new(at_second(second), production, 1.0, 0.0, source)
}

pub(crate) fn push_frame(timestamp: &str, production_kw: f64) -> Vec<u8> {
    format!(
        r#"{{"type":"solar_update","data":{{"timestamp":"{timestamp}","production_kw":{production_kw},"consumption_kw":1.0,"grid_kw":0.0}}}}"#
    )
    .into_bytes()
}

/// Hands out queued links in order and refuses once the queue is empty.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    links: Mutex<VecDeque<ScriptedLink>>,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub(crate) fn push_link(&self) -> ScriptedLinkControl {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.links.lock().push_back(ScriptedLink {
            inbound: inbound_rx,
            sent: Arc::clone(&sent),
        });
        ScriptedLinkControl { inbound_tx, sent }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn PushLink>, AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.links.lock().pop_front() {
            Some(link) => Ok(Box::new(link)),
            None => Err(AppError::ChannelClosed("connection refused".to_string())),
        }
    }
}

/// Every handshake stalls forever.
#[derive(Default)]
pub(crate) struct HangingConnector {
    attempts: AtomicU32,
}

impl HangingConnector {
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for HangingConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn PushLink>, AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct ScriptedLink {
    inbound: mpsc::UnboundedReceiver<Result<ChannelMessage, AppError>>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

#[async_trait]
impl PushLink for ScriptedLink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), AppError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<ChannelMessage, AppError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), AppError> {
        self.inbound.close();
        Ok(())
    }
}

/// Test side of a scripted link. Dropping it closes the link abnormally.
pub(crate) struct ScriptedLinkControl {
    inbound_tx: mpsc::UnboundedSender<Result<ChannelMessage, AppError>>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl ScriptedLinkControl {
    pub(crate) fn deliver(&self, message: ChannelMessage) {
        let _ = self.inbound_tx.send(Ok(message));
    }

    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[derive(Default)]
pub(crate) struct FakeTelemetrySource {
    latest: Mutex<Option<TelemetrySnapshot>>,
    readings: Mutex<Vec<TelemetrySnapshot>>,
    latest_calls: AtomicU32,
}

impl FakeTelemetrySource {
    pub(crate) fn set_latest(&self, snapshot: Option<TelemetrySnapshot>) {
        *self.latest.lock() = snapshot;
    }

    pub(crate) fn set_readings(&self, readings: Vec<TelemetrySnapshot>) {
        *self.readings.lock() = readings;
    }

    pub(crate) fn latest_calls(&self) -> u32 {
        self.latest_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for FakeTelemetrySource {
    async fn fetch_latest(&self) -> Result<TelemetrySnapshot, AppError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        self.latest
            .lock()
            .clone()
            .map(|snapshot| snapshot.with_source(SourceChannel::Pull))
            .ok_or_else(|| AppError::NoData("fake source has no reading".to_string()))
    }

    async fn fetch_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySnapshot>, AppError> {
        Ok(self
            .readings
            .lock()
            .iter()
            .filter(|reading| reading.timestamp >= start && reading.timestamp <= end)
            .cloned()
            .collect())
    }
}
