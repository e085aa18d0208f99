use crate::error::AppError;
use crate::telemetry::client::TelemetrySource;
use crate::telemetry::types::{
    parse_push_frame, ConnectionPhase, CurrentState, DashboardEvent, Diagnostic, DiagnosticKind,
    GridSign, InboundFrame, SourceChannel, TelemetrySnapshot,
};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const DIAGNOSTIC_THROTTLE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Accepted,
    Stale {
        current: DateTime<Utc>,
        candidate: DateTime<Utc>,
    },
    Duplicate,
}

/// Result of handing one raw push frame to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Snapshot(MergeOutcome),
    Alert,
    Pong,
    Discarded(DiagnosticKind),
}

/// A candidate replaces `current` iff it is strictly newer, or it is a push
/// at the same timestamp as a pull.
pub fn merge_snapshot(
    current: Option<&TelemetrySnapshot>,
    candidate: &TelemetrySnapshot,
) -> MergeOutcome {
    let Some(current) = current else {
        return MergeOutcome::Accepted;
    };

    if candidate.timestamp > current.timestamp {
        return MergeOutcome::Accepted;
    }
    if candidate.timestamp < current.timestamp {
        return MergeOutcome::Stale {
            current: current.timestamp,
            candidate: candidate.timestamp,
        };
    }
    if candidate.source_channel == SourceChannel::Push
        && current.source_channel == SourceChannel::Pull
    {
        return MergeOutcome::Accepted;
    }
    MergeOutcome::Duplicate
}

/// Unbounded stream of dashboard notifications for one subscriber.
pub struct DashboardEvents {
    receiver: mpsc::UnboundedReceiver<DashboardEvent>,
}

impl DashboardEvents {
    pub async fn recv(&mut self) -> Option<DashboardEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DashboardEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for DashboardEvents {
    type Item = DashboardEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Default)]
struct DiagnosticThrottle {
    last_kind: Option<DiagnosticKind>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl DiagnosticThrottle {
    fn allow(&mut self, kind: DiagnosticKind, reason: &str) -> bool {
        let now = Instant::now();
        if self.last_kind == Some(kind)
            && self.last_reason.as_deref() == Some(reason)
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(DIAGNOSTIC_THROTTLE_MS)
                })
                .unwrap_or(false)
        {
            return false;
        }

        self.last_kind = Some(kind);
        self.last_reason = Some(reason.to_string());
        self.last_emit = Some(now);
        true
    }
}

/// Owns the current state and serializes every mutation through one merge.
pub struct UpdateCoordinator {
    grid_sign: GridSign,
    current: Mutex<Option<TelemetrySnapshot>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DashboardEvent>>>,
    diagnostic_throttle: Mutex<DiagnosticThrottle>,
}

impl UpdateCoordinator {
    pub fn new(grid_sign: GridSign) -> Self {
        Self {
            grid_sign,
            current: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            diagnostic_throttle: Mutex::new(DiagnosticThrottle::default()),
        }
    }

    pub fn subscribe(&self) -> DashboardEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        DashboardEvents { receiver }
    }

    pub(crate) fn publish(&self, event: DashboardEvent) {
        tracing::trace!(event = event.name(), "publishing dashboard event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn current_state(&self, now: DateTime<Utc>) -> Option<CurrentState> {
        self.current
            .lock()
            .clone()
            .map(|snapshot| CurrentState::from_snapshot(snapshot, now))
    }

    /// Decodes one push payload and routes it. Undecodable payloads are
    /// dropped with a diagnostic.
    pub fn accept_push(&self, payload: &[u8]) -> FrameOutcome {
        let mut payload = payload.to_vec();
        match parse_push_frame(&mut payload, self.grid_sign) {
            Ok(InboundFrame::Reading(snapshot)) => FrameOutcome::Snapshot(self.apply(snapshot)),
            Ok(InboundFrame::Alert(alert)) => {
                tracing::info!(
                    status = %alert.status,
                    component = alert.component.as_deref().unwrap_or(""),
                    "system alert received"
                );
                self.publish(DashboardEvent::Alert(alert));
                FrameOutcome::Alert
            }
            Ok(InboundFrame::Pong) => FrameOutcome::Pong,
            Ok(InboundFrame::Placeholder(status)) => {
                self.report(
                    DiagnosticKind::PlaceholderReading,
                    format!("push frame carried no reading (status '{status}')"),
                );
                FrameOutcome::Discarded(DiagnosticKind::PlaceholderReading)
            }
            Ok(InboundFrame::Unknown(kind)) => {
                self.report(
                    DiagnosticKind::UnknownFrame,
                    format!("unrecognized push frame type '{kind}'"),
                );
                FrameOutcome::Discarded(DiagnosticKind::UnknownFrame)
            }
            Err(error) => {
                self.report(
                    DiagnosticKind::MalformedFrame,
                    format!("undecodable push frame: {error}"),
                );
                FrameOutcome::Discarded(DiagnosticKind::MalformedFrame)
            }
        }
    }

    pub fn accept_pull(&self, snapshot: TelemetrySnapshot) -> MergeOutcome {
        self.apply(snapshot.with_source(SourceChannel::Pull))
    }

    pub fn report_fetch_failure(&self, error: &AppError) {
        self.report(
            DiagnosticKind::FallbackFetchFailed,
            format!("fallback fetch failed: {error}"),
        );
    }

    fn apply(&self, candidate: TelemetrySnapshot) -> MergeOutcome {
        let mut current = self.current.lock();
        let outcome = merge_snapshot(current.as_ref(), &candidate);
        match outcome {
            MergeOutcome::Accepted => {
                let state = CurrentState::from_snapshot(candidate.clone(), Utc::now());
                *current = Some(candidate);
                // Published under the lock so notification order matches state order.
                self.publish(DashboardEvent::CurrentState(state));
            }
            MergeOutcome::Stale {
                current: current_at,
                candidate: candidate_at,
            } => {
                tracing::debug!(
                    source = candidate.source_channel.as_str(),
                    %current_at,
                    %candidate_at,
                    "discarding stale snapshot"
                );
            }
            MergeOutcome::Duplicate => {}
        }
        outcome
    }

    fn report(&self, kind: DiagnosticKind, reason: String) {
        if !self.diagnostic_throttle.lock().allow(kind, &reason) {
            return;
        }
        tracing::warn!(?kind, %reason, "telemetry diagnostic");
        self.publish(DashboardEvent::Diagnostic(Diagnostic {
            kind,
            reason,
            at: Utc::now(),
        }));
    }
}

/// Periodically pulls the latest reading while the push channel is not Live.
pub async fn run_fallback(
    coordinator: Arc<UpdateCoordinator>,
    source: Arc<dyn TelemetrySource>,
    phase_rx: watch::Receiver<ConnectionPhase>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let phase = *phase_rx.borrow();
        if phase.is_live() {
            tracing::trace!("push channel live; fallback pull suppressed");
            continue;
        }

        let fetch_result = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = source.fetch_latest() => result,
        };

        match fetch_result {
            Ok(snapshot) => {
                let outcome = coordinator.accept_pull(snapshot);
                tracing::debug!(phase = phase.as_str(), ?outcome, "fallback pull merged");
            }
            Err(error) => coordinator.report_fetch_failure(&error),
        }
    }
}
