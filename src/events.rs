//! Event types and the event-loop plumbing for the UrbanPulse TUI.
//!
//! This module defines the [`Event`] enum (keyboard input, ticks, position
//! fixes, feed snapshots, dashboard pushes) and the [`EventHandler`], which
//! runs a background task polling crossterm for key events and emitting
//! periodic [`Event::Tick`]s. Background workers (location tracker, feed
//! worker, stream consumer) send their updates through clones of
//! [`EventHandler::tx`]; the main loop drains everything with
//! [`EventHandler::next`].

use crossterm::event::{self, Event as CrosstermEvent, KeyEvent};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::feed::FeedSnapshot;
use crate::models::{DashboardCard, PositionSample};
use crate::stream::StreamState;

/// Events processed by the application event loop.
#[derive(Debug)]
pub enum Event {
    /// Periodic tick used to drive debounce/throttle polling and UI refresh.
    Tick,
    /// User key press from the terminal.
    Input(KeyEvent),
    /// An accepted position fix from the location tracker.
    PositionUpdate(PositionSample),
    /// Non-fatal location notice (e.g. fell back to the default location).
    LocationAdvisory(String),
    /// Location failure surfaced to the UI.
    LocationError(crate::location::LocationError),
    /// Result of a one-card expansion request (detail text, or a contained
    /// failure message).
    CardDetail(String),
    /// Outcome of a fire-and-forget action (event report, logout), shown in
    /// the status bar.
    Notice(String),
    /// Startup health check result.
    BackendHealth(bool),
    /// A completed reconciliation pass; replaces the feed wholesale.
    FeedUpdate(FeedSnapshot),
    /// Replacement card list pushed on the dashboard stream.
    DashboardUpdate {
        cards: Vec<DashboardCard>,
        high_priority_count: Option<u32>,
    },
    /// One-shot card fill fetched while the stream connects; applied only if
    /// no push has landed yet.
    DashboardSeed {
        cards: Vec<DashboardCard>,
        high_priority_count: Option<u32>,
    },
    /// Push-connection state change.
    StreamStatus(StreamState),
    /// Stream liveness ping; refreshes the connected indicator only.
    Heartbeat,
}

/// Multiplexes terminal input, ticks, and worker updates into one stream.
///
/// The sender can be cloned and handed to background tasks; the receiver is
/// consumed by the main loop. A background task polls crossterm with a
/// timeout and emits `Input` on key press and `Tick` at the configured
/// interval.
pub struct EventHandler {
    /// Sender for posting events from background workers.
    pub tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
    /// Creates the handler and spawns the input/tick task.
    pub fn new(tick_rate_ms: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let event_tx = tx.clone();

        tokio::spawn(async move {
            let tick_rate = Duration::from_millis(tick_rate_ms);
            let mut last_tick = Instant::now();
            loop {
                let timeout = tick_rate
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::from_secs(0));
                let has_input = tokio::task::block_in_place(|| event::poll(timeout));
                if let Ok(true) = has_input {
                    if let Ok(CrosstermEvent::Key(key)) = event::read() {
                        if event_tx.send(Event::Input(key)).is_err() {
                            break;
                        }
                    }
                }
                if last_tick.elapsed() >= tick_rate {
                    if event_tx.send(Event::Tick).is_err() {
                        break;
                    }
                    last_tick = Instant::now();
                }
            }
        });

        Self { tx, rx }
    }

    /// Receives the next event; `None` once every sender has been dropped.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}
