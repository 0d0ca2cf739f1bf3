//! Realtime dashboard push consumer.
//!
//! Maintains the server-push (SSE) connection that delivers dashboard card
//! snapshots. Connection lifecycle is an explicit state machine
//! ([`StreamMachine`]) with a single authoritative pending-reconnect slot: a
//! stream error schedules exactly one reconnect attempt after a fixed delay,
//! and further errors while one is pending schedule nothing. Card updates
//! fully replace the previous card list; heartbeats only refresh liveness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::BackendClient;
use crate::events::Event;
use crate::models::StreamMessage;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Heartbeats further apart than this mark the connection indicator stale.
pub const LIVENESS_TTL: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connecting => "connecting",
            StreamState::Connected => "connected",
            StreamState::ReconnectPending => "reconnecting",
        };
        write!(f, "{label}")
    }
}

/// Connection lifecycle state machine.
///
/// Transitions: Disconnected → Connecting (start/retry), Connecting →
/// Connected (open), Connected → ReconnectPending (error, schedules one
/// attempt), ReconnectPending → Connecting (delay elapsed), any →
/// Disconnected (teardown, clears the pending slot).
#[derive(Debug)]
pub struct StreamMachine {
    state: StreamState,
    reconnect_delay: Duration,
    /// The one pending-reconnect deadline. Errors arriving while this is
    /// occupied must not replace or duplicate it.
    pending_until: Option<Instant>,
    last_heartbeat: Option<Instant>,
}

impl StreamMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: StreamState::Disconnected,
            reconnect_delay,
            pending_until: None,
            last_heartbeat: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn connect_started(&mut self) {
        self.state = StreamState::Connecting;
    }

    /// Successful open; clears any pending reconnect.
    pub fn connected(&mut self, now: Instant) {
        self.state = StreamState::Connected;
        self.pending_until = None;
        self.last_heartbeat = Some(now);
    }

    /// Stream error. Returns the reconnect deadline if this error scheduled
    /// one; `None` when an attempt is already pending (never stack timers).
    pub fn on_error(&mut self, now: Instant) -> Option<Instant> {
        if self.pending_until.is_some() {
            return None;
        }
        let deadline = now + self.reconnect_delay;
        self.state = StreamState::ReconnectPending;
        self.pending_until = Some(deadline);
        Some(deadline)
    }

    /// True once the pending delay has elapsed; consumes the slot and moves
    /// to Connecting.
    pub fn reconnect_due(&mut self, now: Instant) -> bool {
        match self.pending_until {
            Some(deadline) if now >= deadline => {
                self.pending_until = None;
                self.state = StreamState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Explicit teardown from any state: close and clear the pending slot.
    pub fn teardown(&mut self) {
        self.state = StreamState::Disconnected;
        self.pending_until = None;
    }

    pub fn heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = Some(now);
    }

    pub fn is_live(&self, now: Instant) -> bool {
        self.state == StreamState::Connected
            && self
                .last_heartbeat
                .is_some_and(|at| now.duration_since(at) < LIVENESS_TTL)
    }
}

/// Incremental SSE frame parser.
///
/// Feed it raw body chunks; it yields the `data` payload of each complete
/// event (multi-line `data:` fields joined with newlines, per the SSE spec).
/// Comment lines and non-data fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    partial_line: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        let mut events = Vec::new();
        for ch in chunk.chars() {
            if ch != '\n' {
                self.partial_line.push(ch);
                continue;
            }
            let line = std::mem::take(&mut self.partial_line);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                // Blank line terminates the event.
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Comments (":...") and other fields (event:, id:, retry:) are
            // not used by the dashboard stream.
        }
        events
    }
}

/// Runs the dashboard stream until `shutdown` fires.
///
/// Status transitions, replacement card lists, and heartbeats are forwarded
/// to the main loop as events. The reconnect sleep lives in this single
/// loop, so there is never more than one timer outstanding.
pub async fn run_dashboard_stream(
    client: Arc<BackendClient>,
    user_id: String,
    position: (f64, f64),
    events: mpsc::UnboundedSender<Event>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut machine = StreamMachine::new(RECONNECT_DELAY);

    loop {
        machine.connect_started();
        let _ = events.send(Event::StreamStatus(machine.state()));

        match client
            .open_dashboard_stream(&user_id, position.0, position.1)
            .await
        {
            Ok(response) => {
                machine.connected(Instant::now());
                let _ = events.send(Event::StreamStatus(machine.state()));
                info!("Dashboard stream connected");

                consume_stream(response, &mut machine, &events, &mut shutdown).await;
                if machine.state() == StreamState::Disconnected {
                    // Teardown requested while consuming.
                    let _ = events.send(Event::StreamStatus(machine.state()));
                    return;
                }
            }
            Err(e) => {
                warn!("Dashboard stream open failed: {e:#}");
            }
        }

        // One reconnect attempt after a fixed delay. on_error is a no-op if
        // the consume loop already scheduled it.
        machine.on_error(Instant::now());
        let _ = events.send(Event::StreamStatus(machine.state()));

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {
                machine.reconnect_due(Instant::now());
            }
            _ = shutdown.recv() => {
                machine.teardown();
                let _ = events.send(Event::StreamStatus(machine.state()));
                return;
            }
        }
    }
}

/// Consumes one open stream until error, end-of-stream, or shutdown.
/// On shutdown the machine is left Disconnected; otherwise the caller
/// schedules the reconnect.
async fn consume_stream(
    response: reqwest::Response,
    machine: &mut StreamMachine,
    events: &mpsc::UnboundedSender<Event>,
    shutdown: &mut mpsc::Receiver<()>,
) {
    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();

    loop {
        tokio::select! {
            chunk = body.next() => {
                let chunk = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!("Dashboard stream error: {e}");
                        return;
                    }
                    None => {
                        warn!("Dashboard stream ended by server");
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for payload in parser.feed(&text) {
                    dispatch_payload(&payload, machine, events);
                }
            }
            _ = shutdown.recv() => {
                machine.teardown();
                return;
            }
        }
    }
}

fn dispatch_payload(
    payload: &str,
    machine: &mut StreamMachine,
    events: &mpsc::UnboundedSender<Event>,
) {
    match serde_json::from_str::<StreamMessage>(payload) {
        Ok(StreamMessage::DashboardUpdate {
            cards,
            high_priority_count,
        }) => {
            // Full replacement snapshot; the card channel is trusted to be
            // complete, only the feed reconciler de-duplicates.
            let _ = events.send(Event::DashboardUpdate {
                cards,
                high_priority_count,
            });
        }
        Ok(StreamMessage::Heartbeat) => {
            machine.heartbeat(Instant::now());
            let _ = events.send(Event::Heartbeat);
        }
        Ok(StreamMessage::Error { message }) => {
            warn!("Dashboard stream reported error: {message}");
        }
        Err(e) => {
            warn!("Dropping unrecognized stream message: {e}");
        }
    }
}
