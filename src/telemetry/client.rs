use crate::error::AppError;
use crate::telemetry::connection::{ChannelMessage, PushConnector, PushLink};
use crate::telemetry::types::{
    GridSign, OutboundMessage, ReadingWire, SourceChannel, TelemetrySnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const READINGS_PAGE_LIMIT: usize = 1_000;
const MAX_READINGS_PAGES: usize = 512;

pub type TelemetryWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn current_endpoint(api_base_url: &str) -> String {
    format!("{api_base_url}/api/v1/current")
}

fn readings_endpoint(
    api_base_url: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> String {
    format!("{api_base_url}/api/v1/readings")
        + &format!(
            "?start={}&end={}&limit={limit}",
            start.to_rfc3339_opts(SecondsFormat::Millis, true),
            end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
}

/// Point-in-time and range queries against the readings service.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// The single most recent reading, tagged as a pull snapshot.
    async fn fetch_latest(&self) -> Result<TelemetrySnapshot, AppError>;

    /// Readings in `[start, end]`, sorted ascending by timestamp.
    async fn fetch_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySnapshot>, AppError>;
}

#[derive(Debug, Clone)]
pub struct HttpTelemetryClient {
    client: Client,
    api_base_url: String,
    grid_sign: GridSign,
}

impl HttpTelemetryClient {
    pub fn new(client: Client, api_base_url: impl Into<String>, grid_sign: GridSign) -> Self {
        Self {
            client,
            api_base_url: api_base_url.into(),
            grid_sign,
        }
    }

    async fn fetch_readings_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySnapshot>, AppError> {
        let endpoint = readings_endpoint(&self.api_base_url, start, end, READINGS_PAGE_LIMIT);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<Vec<ReadingWire>>().await?;

        let mut readings = Vec::with_capacity(payload.len());
        for reading in payload {
            readings.push(reading.try_into_snapshot(SourceChannel::Pull, self.grid_sign)?);
        }
        Ok(readings)
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetryClient {
    async fn fetch_latest(&self) -> Result<TelemetrySnapshot, AppError> {
        let endpoint = current_endpoint(&self.api_base_url);
        let response = self.client.get(endpoint).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::NoData(
                "readings service has no current reading".to_string(),
            ));
        }
        let payload = response.error_for_status()?.json::<ReadingWire>().await?;
        if payload.is_placeholder() {
            return Err(AppError::NoData(format!(
                "readings service returned status '{}'",
                payload.status.unwrap_or_default()
            )));
        }
        payload.try_into_snapshot(SourceChannel::Pull, self.grid_sign)
    }

    async fn fetch_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySnapshot>, AppError> {
        if end < start {
            return Err(AppError::InvalidArgument(
                "history range end must not precede start".to_string(),
            ));
        }

        // The service pages newest-first, so walk the cursor backwards.
        let mut readings = Vec::new();
        let mut end_cursor = end;
        for _ in 0..MAX_READINGS_PAGES {
            let mut page = self.fetch_readings_page(start, end_cursor).await?;
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let oldest = page
                .iter()
                .map(|reading| reading.timestamp)
                .min()
                .unwrap_or(start);
            readings.append(&mut page);

            if page_len < READINGS_PAGE_LIMIT || oldest <= start {
                break;
            }
            end_cursor = oldest - Duration::milliseconds(1);
        }

        sort_and_dedup_readings(&mut readings);
        Ok(readings)
    }
}

fn sort_and_dedup_readings(readings: &mut Vec<TelemetrySnapshot>) {
    readings.sort_by_key(|reading| reading.timestamp);
    readings.dedup_by_key(|reading| reading.timestamp);
}

pub async fn connect_push_stream(url: &str) -> Result<TelemetryWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(4 << 20),
        max_frame_size: Some(1 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

/// Opens real websocket links.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushLink>, AppError> {
        let stream = connect_push_stream(url).await?;
        Ok(Box::new(WsPushLink { stream }))
    }
}

pub struct WsPushLink {
    stream: TelemetryWsStream,
}

#[async_trait]
impl PushLink for WsPushLink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), AppError> {
        self.stream.send(Message::Text(message.encode()?)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<ChannelMessage, AppError>> {
        let frame = self.stream.next().await?;
        Some(match frame {
            Ok(Message::Text(text_payload)) => Ok(ChannelMessage::Payload(text_payload.into_bytes())),
            Ok(Message::Binary(binary_payload)) => Ok(ChannelMessage::Payload(binary_payload)),
            Ok(Message::Close(close_frame)) => Ok(ChannelMessage::Closed(
                close_frame.map(|frame| u16::from(frame.code)),
            )),
            Ok(_) => Ok(ChannelMessage::Control),
            Err(error) => Err(error.into()),
        })
    }

    async fn close(&mut self) -> Result<(), AppError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
