//! Lifecycle of the single logical push channel.
//!
//! Idle -> Connecting -> Live, and from Live either Degraded (unanswered
//! heartbeat) or an abnormal close leads to Reconnecting with exponential
//! back-off. Exhausting `max_attempts` ends in Failed, which is terminal until
//! the caller invokes `connect()` again.

use crate::error::AppError;
use crate::telemetry::types::{ConnectionPhase, ConnectionState, OutboundMessage, SessionConfig};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::Stream;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const NORMAL_CLOSE_CODE: u16 = 1000;
pub const NO_STATUS_CLOSE_CODE: u16 = 1005;
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Payload(Vec<u8>),
    Closed(Option<u16>),
    Control,
}

/// One open duplex link. `next_message` must be cancel safe.
#[async_trait]
pub trait PushLink: Send {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), AppError>;
    async fn next_message(&mut self) -> Option<Result<ChannelMessage, AppError>>;
    async fn close(&mut self) -> Result<(), AppError>;
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushLink>, AppError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    FrameReceived(Vec<u8>),
    Closed(u16),
    Error(String),
    PhaseChanged(ConnectionState),
}

/// Unbounded, lazily consumed sequence of connection events.
pub struct ConnectionEvents {
    receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.receiver.recv().await
    }
}

impl Stream for ConnectionEvents {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl From<&SessionConfig> for ConnectionConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            url: config.push_url.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

/// Runs `operation`, failing with `AppError::Timeout` once `limit` elapses.
async fn bounded<T>(
    limit: Duration,
    operation: &str,
    future: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!(
            "{operation} exceeded {} ms",
            limit.as_millis()
        ))),
    }
}

/// `base_delay * 2^(attempt - 1)` for attempt >= 1.
pub fn reconnect_delay(base_delay: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base_delay.saturating_mul(1_u32 << exponent)
}

struct ConnectionShared {
    state: RwLock<ConnectionState>,
    phase_tx: watch::Sender<ConnectionPhase>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl ConnectionShared {
    fn broadcast(&self, event: ConnectionEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn transition(&self, next: ConnectionState) {
        tracing::info!(
            phase = next.phase.as_str(),
            attempt = next.attempt,
            delay_ms = next.retry_delay_ms,
            reason = next.reason.as_deref().unwrap_or(""),
            "push channel phase changed"
        );
        *self.state.write() = next.clone();
        self.phase_tx.send_replace(next.phase);
        self.broadcast(ConnectionEvent::PhaseChanged(next));
    }
}

struct ChannelHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn PushConnector>,
    shared: Arc<ConnectionShared>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn PushConnector>) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Idle);
        Self {
            config,
            connector,
            shared: Arc::new(ConnectionShared {
                state: RwLock::new(ConnectionState::idle(None)),
                phase_tx,
                subscribers: Mutex::new(Vec::new()),
            }),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> ConnectionEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(sender);
        ConnectionEvents { receiver }
    }

    pub fn phase_watch(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    /// Opens the channel. A no-op while a channel task is still cycling; after
    /// Failed or `disconnect()` it starts a fresh cycle with attempt 0.
    pub async fn connect(&self) {
        let mut channel_slot = self.channel.lock().await;
        if let Some(handle) = channel_slot.as_ref() {
            // Failed is published just before the task exits.
            let failed = self.shared.state.read().phase == ConnectionPhase::Failed;
            if !failed && !handle.join_handle.is_finished() {
                return;
            }
        }
        if let Some(finished) = channel_slot.take() {
            finished.cancellation_token.cancel();
            let _ = finished.join_handle.await;
        }

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let config = self.config.clone();
        let connector = Arc::clone(&self.connector);
        let shared = Arc::clone(&self.shared);

        let join_handle = tokio::spawn(async move {
            run_channel(config, connector, shared, task_token).await;
        });

        *channel_slot = Some(ChannelHandle {
            cancellation_token,
            join_handle,
        });
    }

    /// Closes the channel and cancels pending heartbeat and reconnect timers.
    /// Never retried automatically.
    pub async fn disconnect(&self) {
        let existing_handle = {
            let mut channel_slot = self.channel.lock().await;
            channel_slot.take()
        };

        if let Some(handle) = existing_handle {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
        }

        self.shared.transition(ConnectionState::idle(Some(
            "push channel disconnected by caller".to_string(),
        )));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.channel.get_mut().take() {
            handle.cancellation_token.cancel();
        }
    }
}

enum LiveExit {
    Cancelled,
    Degraded,
    Closed(u16),
    Faulted(AppError),
}

enum LiveStep {
    Cancelled,
    Heartbeat,
    Inbound(Option<Result<ChannelMessage, AppError>>),
}

async fn run_channel(
    config: ConnectionConfig,
    connector: Arc<dyn PushConnector>,
    shared: Arc<ConnectionShared>,
    cancel_token: CancellationToken,
) {
    let mut attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        let reason = if attempt == 0 {
            "opening push channel".to_string()
        } else {
            format!("retry attempt {attempt} of {}", config.max_attempts)
        };
        shared.transition(ConnectionState {
            phase: ConnectionPhase::Connecting,
            attempt,
            next_retry_at: None,
            retry_delay_ms: None,
            reason: Some(reason),
        });

        let connect_result = tokio::select! {
            _ = cancel_token.cancelled() => return,
            result = bounded(
                config.heartbeat_interval,
                "push channel handshake",
                connector.connect(&config.url),
            ) => result,
        };

        let failure_reason = match connect_result {
            Ok(mut link) => {
                attempt = 0;
                shared.transition(ConnectionState {
                    phase: ConnectionPhase::Live,
                    attempt,
                    next_retry_at: None,
                    retry_delay_ms: None,
                    reason: Some("push channel open".to_string()),
                });
                shared.broadcast(ConnectionEvent::Opened);

                let request = link.send(OutboundMessage::RequestData);
                if let Err(error) =
                    bounded(config.heartbeat_interval, "current state request", request).await
                {
                    tracing::warn!(%error, "failed to request current state after open");
                    shared.broadcast(ConnectionEvent::Error(error.to_string()));
                }

                match run_live(&config, link.as_mut(), &shared, &cancel_token).await {
                    LiveExit::Cancelled => {
                        close_link(&config, link.as_mut()).await;
                        shared.broadcast(ConnectionEvent::Closed(NORMAL_CLOSE_CODE));
                        return;
                    }
                    LiveExit::Degraded => {
                        shared.transition(ConnectionState {
                            phase: ConnectionPhase::Degraded,
                            attempt,
                            next_retry_at: None,
                            retry_delay_ms: None,
                            reason: Some("heartbeat unanswered".to_string()),
                        });
                        close_link(&config, link.as_mut()).await;
                        shared.broadcast(ConnectionEvent::Closed(ABNORMAL_CLOSE_CODE));
                        "heartbeat unanswered".to_string()
                    }
                    LiveExit::Closed(code) => {
                        shared.broadcast(ConnectionEvent::Closed(code));
                        format!("push channel closed with code {code}")
                    }
                    LiveExit::Faulted(error) => {
                        tracing::warn!(%error, "push channel fault");
                        shared.broadcast(ConnectionEvent::Error(error.to_string()));
                        shared.broadcast(ConnectionEvent::Closed(ABNORMAL_CLOSE_CODE));
                        format!("push channel fault: {error}")
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, attempt, "push channel connect failed");
                shared.broadcast(ConnectionEvent::Error(error.to_string()));
                format!("connect failed: {error}")
            }
        };

        attempt = attempt.saturating_add(1);
        if attempt > config.max_attempts {
            shared.transition(ConnectionState {
                phase: ConnectionPhase::Failed,
                attempt: config.max_attempts,
                next_retry_at: None,
                retry_delay_ms: None,
                reason: Some(format!(
                    "gave up after {} reconnect attempts: {failure_reason}",
                    config.max_attempts
                )),
            });
            return;
        }

        let delay = reconnect_delay(config.base_delay, attempt);
        let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        shared.transition(ConnectionState {
            phase: ConnectionPhase::Reconnecting,
            attempt,
            next_retry_at: chrono::Duration::from_std(delay)
                .ok()
                .map(|offset| Utc::now() + offset),
            retry_delay_ms: Some(delay_ms),
            reason: Some(failure_reason),
        });

        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn close_link(config: &ConnectionConfig, link: &mut dyn PushLink) {
    if let Err(error) = bounded(config.heartbeat_interval, "close handshake", link.close()).await {
        tracing::debug!(%error, "push channel close handshake failed");
    }
}

async fn run_live(
    config: &ConnectionConfig,
    link: &mut dyn PushLink,
    shared: &ConnectionShared,
    cancel_token: &CancellationToken,
) -> LiveExit {
    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_response = false;

    loop {
        let step = tokio::select! {
            _ = cancel_token.cancelled() => LiveStep::Cancelled,
            _ = heartbeat.tick() => LiveStep::Heartbeat,
            next_message = link.next_message() => LiveStep::Inbound(next_message),
        };

        match step {
            LiveStep::Cancelled => return LiveExit::Cancelled,
            LiveStep::Heartbeat => {
                if awaiting_response {
                    return LiveExit::Degraded;
                }
                let ping = link.send(OutboundMessage::Ping);
                if let Err(error) = bounded(period, "heartbeat probe", ping).await {
                    return LiveExit::Faulted(error);
                }
                awaiting_response = true;
            }
            LiveStep::Inbound(None) => return LiveExit::Closed(ABNORMAL_CLOSE_CODE),
            LiveStep::Inbound(Some(Err(error))) => return LiveExit::Faulted(error),
            LiveStep::Inbound(Some(Ok(message))) => {
                // Any inbound traffic proves the peer is alive.
                awaiting_response = false;
                match message {
                    ChannelMessage::Payload(payload) => {
                        tracing::trace!(bytes = payload.len(), "push frame received");
                        shared.broadcast(ConnectionEvent::FrameReceived(payload));
                    }
                    ChannelMessage::Closed(code) => {
                        return LiveExit::Closed(code.unwrap_or(NO_STATUS_CLOSE_CODE));
                    }
                    ChannelMessage::Control => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_support::{HangingConnector, ScriptedConnector, ScriptedLinkControl};

    fn test_config(max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://solar.test/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            base_delay: Duration::from_millis(1_000),
            max_attempts,
        }
    }

    async fn next_phase(events: &mut ConnectionEvents) -> ConnectionState {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::PhaseChanged(state)) => return state,
                Some(_) => continue,
                None => panic!("connection event stream ended"),
            }
        }
    }

    #[test]
    fn reconnect_delay_doubles_per_attempt() {
        let base = Duration::from_millis(1_000);
        let delays: Vec<u128> = (1..=5)
            .map(|attempt| reconnect_delay(base, attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    }

    #[test]
    fn reconnect_delay_saturates_instead_of_overflowing() {
        let delay = reconnect_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(delay, Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_failed_then_stops() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = ConnectionManager::new(test_config(3), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;

        let mut retry_delays = Vec::new();
        loop {
            let state = next_phase(&mut events).await;
            match state.phase {
                ConnectionPhase::Reconnecting => {
                    retry_delays.push(state.retry_delay_ms.expect("retry delay should be set"));
                }
                ConnectionPhase::Failed => break,
                ConnectionPhase::Connecting => {}
                other => panic!("unexpected phase {other:?}"),
            }
        }

        assert_eq!(retry_delays, vec![1_000, 2_000, 4_000]);
        assert_eq!(connector.attempts(), 4);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(connector.attempts(), 4);
        assert_eq!(manager.state().phase, ConnectionPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_heartbeat_degrades_and_reconnects() {
        let connector = Arc::new(ScriptedConnector::default());
        let control: ScriptedLinkControl = connector.push_link();
        let manager = ConnectionManager::new(test_config(2), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;

        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Connecting);
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Live);
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Degraded);
        let reconnecting = next_phase(&mut events).await;
        assert_eq!(reconnecting.phase, ConnectionPhase::Reconnecting);
        assert_eq!(reconnecting.attempt, 1);

        assert_eq!(
            control.sent(),
            vec![OutboundMessage::RequestData, OutboundMessage::Ping]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_keeps_channel_live() {
        let connector = Arc::new(ScriptedConnector::default());
        let control = connector.push_link();
        let manager = ConnectionManager::new(test_config(2), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Connecting);
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Live);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            control.deliver(ChannelMessage::Control);
        }

        assert_eq!(manager.state().phase, ConnectionPhase::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_frames_and_resets_attempts_after_live() {
        let connector = Arc::new(ScriptedConnector::default());
        let control = connector.push_link();
        let manager = ConnectionManager::new(test_config(2), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;
        control.deliver(ChannelMessage::Payload(b"{\"type\":\"pong\"}".to_vec()));
        control.deliver(ChannelMessage::Closed(Some(1011)));

        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream should stay open");
            let done = matches!(
                &event,
                ConnectionEvent::PhaseChanged(state) if state.phase == ConnectionPhase::Reconnecting
            );
            seen.push(event);
            if done {
                break;
            }
        }

        assert!(seen.contains(&ConnectionEvent::Opened));
        assert!(seen.contains(&ConnectionEvent::FrameReceived(
            b"{\"type\":\"pong\"}".to_vec()
        )));
        assert!(seen.contains(&ConnectionEvent::Closed(1011)));
        let Some(ConnectionEvent::PhaseChanged(last)) = seen.last() else {
            panic!("last event should be a phase change");
        };
        assert_eq!(last.attempt, 1);
        assert_eq!(last.retry_delay_ms, Some(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = ConnectionManager::new(test_config(5), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;
        loop {
            if next_phase(&mut events).await.phase == ConnectionPhase::Reconnecting {
                break;
            }
        }

        manager.disconnect().await;
        let attempts = connector.attempts();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(connector.attempts(), attempts);
        assert_eq!(manager.state().phase, ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_failed_starts_new_cycle() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = ConnectionManager::new(test_config(1), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;
        loop {
            if next_phase(&mut events).await.phase == ConnectionPhase::Failed {
                break;
            }
        }

        let control = connector.push_link();
        manager.connect().await;

        let connecting = next_phase(&mut events).await;
        assert_eq!(connecting.phase, ConnectionPhase::Connecting);
        assert_eq!(connecting.attempt, 0);
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Live);
        drop(control);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_live_stops_heartbeat() {
        let connector = Arc::new(ScriptedConnector::default());
        let control = connector.push_link();
        let manager = ConnectionManager::new(test_config(2), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Connecting);
        assert_eq!(next_phase(&mut events).await.phase, ConnectionPhase::Live);
        manager.disconnect().await;

        let mut after_disconnect = Vec::new();
        loop {
            let event = events.recv().await.expect("event stream should stay open");
            let idle = matches!(
                &event,
                ConnectionEvent::PhaseChanged(state) if state.phase == ConnectionPhase::Idle
            );
            after_disconnect.push(event);
            if idle {
                break;
            }
        }
        assert!(after_disconnect.contains(&ConnectionEvent::Closed(NORMAL_CLOSE_CODE)));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(control.sent(), vec![OutboundMessage::RequestData]);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state().phase, ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out_and_backs_off() {
        let connector = Arc::new(HangingConnector::default());
        let manager = ConnectionManager::new(test_config(2), connector.clone());
        let mut events = manager.subscribe();

        manager.connect().await;

        let mut phases = Vec::new();
        loop {
            let state = next_phase(&mut events).await;
            if state.phase == ConnectionPhase::Reconnecting {
                let reason = state.reason.unwrap_or_default();
                assert!(reason.contains("push channel handshake"), "{reason}");
            }
            phases.push(state.phase);
            if state.phase == ConnectionPhase::Failed {
                break;
            }
        }

        assert_eq!(
            phases,
            vec![
                ConnectionPhase::Connecting,
                ConnectionPhase::Reconnecting,
                ConnectionPhase::Connecting,
                ConnectionPhase::Reconnecting,
                ConnectionPhase::Connecting,
                ConnectionPhase::Failed,
            ]
        );
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connect_issued_on_failed_event_restarts_channel() {
        for _ in 0..50 {
            let connector = Arc::new(ScriptedConnector::default());
            let config = ConnectionConfig {
                base_delay: Duration::from_millis(1),
                ..test_config(1)
            };
            let manager = ConnectionManager::new(config, connector.clone());
            let mut events = manager.subscribe();

            manager.connect().await;
            loop {
                if next_phase(&mut events).await.phase == ConnectionPhase::Failed {
                    break;
                }
            }
            manager.connect().await;

            let restarted = tokio::time::timeout(Duration::from_secs(5), next_phase(&mut events))
                .await
                .expect("connect after Failed should start a new cycle");
            assert_eq!(restarted.phase, ConnectionPhase::Connecting);
            assert_eq!(restarted.attempt, 0);

            manager.disconnect().await;
        }
    }
}
