//! Application state and input handling.
//!
//! [`App`] owns everything the UI renders and routes user intents through the
//! scheduling policies: manual refresh and radius changes go through a
//! throttle (rapid presses collapse to one), filter changes go through a
//! debounce (only the last selection in a burst fires), and position-driven
//! refreshes pass a movement gate plus a debounce. The main loop calls
//! [`App::handle_key`] / [`App::on_position`] as events arrive and drains
//! [`App::on_tick`] for actions that became due.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent};

use crate::config::Config;
use crate::feed::{FeedIntent, FeedSnapshot, FeedStatus};
use crate::models::{Category, DashboardCard, PositionSample};
use crate::schedule::{Debouncer, MovementGate, Throttle};
use crate::stream::StreamState;

/// Side effects the main loop executes on the app's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reconcile(FeedIntent),
    /// Force a fresh location fix, bypassing the movement gate.
    RequestLocation,
    /// Submit a user-authored incident report with this title.
    ReportEvent(String),
    /// Clear the persisted session; takes effect on next start.
    Logout,
    PopulateDemo,
    ExpandCard(String),
}

#[derive(Debug, PartialEq, Clone, Copy, Default)]
pub enum ViewMode {
    #[default]
    Dashboard,
    Feed,
    Settings,
}

/// One-line text entry overlay state (search, incident report).
#[derive(Debug, Default)]
pub struct TextInput {
    pub active: bool,
    pub buffer: String,
}

impl TextInput {
    fn open(&mut self) {
        self.active = true;
        self.buffer.clear();
    }

    fn close(&mut self) -> String {
        self.active = false;
        std::mem::take(&mut self.buffer)
    }
}

pub struct App {
    pub view_mode: ViewMode,
    pub should_quit: bool,

    // Location state
    pub position: Option<PositionSample>,
    pub location_loading: bool,
    pub location_error: Option<String>,
    pub location_advisory: Option<String>,

    // Feed state
    pub feed: FeedSnapshot,
    pub feed_loading: bool,
    pub selected_index: usize,
    pub active_filter: Option<Category>,
    pub radius_km: f64,
    pub search: TextInput,
    pub report: TextInput,

    // Dashboard state
    pub cards: Vec<DashboardCard>,
    pub selected_card: usize,
    pub high_priority_count: Option<u32>,
    pub card_detail: Option<String>,
    pub stream_state: StreamState,
    pub last_heartbeat: Option<Instant>,

    // Ambient status
    pub notice: Option<String>,
    pub backend_healthy: Option<bool>,

    // Scheduling policies
    filter_debounce: Debouncer<Option<Category>>,
    position_debounce: Debouncer<(f64, f64)>,
    action_throttle: Throttle,
    movement_gate: MovementGate,
    queued: Vec<Action>,
}

impl App {
    pub fn new(config: &Config) -> Self {
        Self {
            view_mode: ViewMode::default(),
            should_quit: false,
            position: None,
            location_loading: true,
            location_error: None,
            location_advisory: None,
            feed: FeedSnapshot {
                incidents: Vec::new(),
                total: 0,
                last_updated: None,
                status: FeedStatus::LocationRequired,
            },
            feed_loading: false,
            selected_index: 0,
            active_filter: None,
            radius_km: config.feed.radius_km,
            search: TextInput::default(),
            report: TextInput::default(),
            cards: Vec::new(),
            selected_card: 0,
            high_priority_count: None,
            card_detail: None,
            stream_state: StreamState::Disconnected,
            last_heartbeat: None,
            notice: None,
            backend_healthy: None,
            filter_debounce: Debouncer::new(Duration::from_millis(config.feed.filter_debounce_ms)),
            position_debounce: Debouncer::new(Duration::from_millis(
                config.feed.position_debounce_ms,
            )),
            action_throttle: Throttle::new(Duration::from_millis(config.feed.refresh_throttle_ms)),
            movement_gate: MovementGate::new(config.feed.movement_gate_m),
            queued: Vec::new(),
        }
    }

    /// The intent a reconciliation pass should use given the current filter.
    fn current_intent(&self) -> FeedIntent {
        match self.active_filter {
            Some(category) => FeedIntent::Category(category),
            None => FeedIntent::Refresh,
        }
    }

    /// An accepted position fix landed. The movement gate decides whether it
    /// is significant; significant fixes are debounced before firing a
    /// refresh so a burst of fixes costs one pass.
    pub fn on_position(&mut self, sample: PositionSample, now: Instant) {
        self.position = Some(sample);
        self.location_loading = false;
        self.location_error = None;

        if self.movement_gate.should_fire(sample.coords()) {
            self.position_debounce.submit(sample.coords(), now);
        }
    }

    pub fn on_feed_update(&mut self, snapshot: FeedSnapshot) {
        self.feed_loading = false;
        if self.selected_index >= snapshot.incidents.len() {
            self.selected_index = 0;
        }
        self.feed = snapshot;
    }

    pub fn on_dashboard_update(
        &mut self,
        cards: Vec<DashboardCard>,
        high_priority_count: Option<u32>,
    ) {
        // Full replacement per push cycle; never merged.
        if self.selected_card >= cards.len() {
            self.selected_card = 0;
        }
        self.cards = cards;
        self.high_priority_count = high_priority_count;
        self.card_detail = None;
    }

    /// Applies the one-shot snapshot fetched while the stream connects, but
    /// never over cards a push has already delivered.
    pub fn on_dashboard_seed(
        &mut self,
        cards: Vec<DashboardCard>,
        high_priority_count: Option<u32>,
    ) {
        if self.cards.is_empty() {
            self.on_dashboard_update(cards, high_priority_count);
        }
    }

    /// Drains policy timers; call once per tick. Returns actions that
    /// became due.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = std::mem::take(&mut self.queued);

        if let Some(filter) = self.filter_debounce.poll(now) {
            self.active_filter = filter;
            self.feed_loading = true;
            actions.push(Action::Reconcile(self.current_intent()));
        }

        if self.position_debounce.poll(now).is_some() {
            self.feed_loading = true;
            actions.push(Action::Reconcile(self.current_intent()));
        }

        actions
    }

    pub fn handle_key(&mut self, key: KeyEvent, now: Instant) {
        if self.search.active {
            self.handle_search_key(key, now);
            return;
        }
        if self.report.active {
            self.handle_report_key(key, now);
            return;
        }

        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Tab => self.cycle_view(),
            KeyCode::Down | KeyCode::Char('j') => self.select_next(),
            KeyCode::Up | KeyCode::Char('k') => self.select_prev(),
            KeyCode::Char('r') => {
                // Throttled: mashing refresh collapses to one pass.
                if self.action_throttle.allow(now) {
                    self.feed_loading = true;
                    self.queued.push(Action::Reconcile(self.current_intent()));
                }
            }
            KeyCode::Char('+') | KeyCode::Char('=') => self.adjust_radius(5.0, now),
            KeyCode::Char('-') => self.adjust_radius(-5.0, now),
            KeyCode::Char('0') => self.submit_filter(None, now),
            KeyCode::Char('1') => self.submit_filter(Some(Category::Traffic), now),
            KeyCode::Char('2') => self.submit_filter(Some(Category::Weather), now),
            KeyCode::Char('3') => self.submit_filter(Some(Category::Infrastructure), now),
            KeyCode::Char('4') => self.submit_filter(Some(Category::Events), now),
            KeyCode::Char('5') => self.submit_filter(Some(Category::Safety), now),
            KeyCode::Char('/') => self.search.open(),
            KeyCode::Char('n') => self.report.open(),
            KeyCode::Char('x') => self.queued.push(Action::Logout),
            KeyCode::Char('g') => {
                if self.action_throttle.allow(now) {
                    self.queued.push(Action::RequestLocation);
                }
            }
            KeyCode::Char('p') => {
                if self.action_throttle.allow(now) {
                    self.queued.push(Action::PopulateDemo);
                }
            }
            KeyCode::Enter => {
                if self.view_mode == ViewMode::Dashboard {
                    if let Some(card) = self.cards.get(self.selected_card) {
                        if card.expandable {
                            self.queued.push(Action::ExpandCard(card.id.clone()));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_search_key(&mut self, key: KeyEvent, now: Instant) {
        match key.code {
            KeyCode::Esc => {
                self.search.close();
            }
            KeyCode::Enter => {
                let query = self.search.close().trim().to_string();
                if !query.is_empty() && self.action_throttle.allow(now) {
                    self.feed_loading = true;
                    self.queued.push(Action::Reconcile(FeedIntent::Search(query)));
                }
            }
            KeyCode::Backspace => {
                self.search.buffer.pop();
            }
            KeyCode::Char(c) => self.search.buffer.push(c),
            _ => {}
        }
    }

    fn handle_report_key(&mut self, key: KeyEvent, now: Instant) {
        match key.code {
            KeyCode::Esc => {
                self.report.close();
            }
            KeyCode::Enter => {
                let title = self.report.close().trim().to_string();
                if !title.is_empty() && self.action_throttle.allow(now) {
                    self.queued.push(Action::ReportEvent(title));
                }
            }
            KeyCode::Backspace => {
                self.report.buffer.pop();
            }
            KeyCode::Char(c) => self.report.buffer.push(c),
            _ => {}
        }
    }

    fn submit_filter(&mut self, filter: Option<Category>, now: Instant) {
        // Debounced: five rapid filter changes fire one pass with the last.
        self.filter_debounce.submit(filter, now);
    }

    fn adjust_radius(&mut self, delta_km: f64, now: Instant) {
        if self.action_throttle.allow(now) {
            self.radius_km = (self.radius_km + delta_km).clamp(1.0, 100.0);
            self.feed_loading = true;
            self.queued.push(Action::Reconcile(self.current_intent()));
        }
    }

    fn cycle_view(&mut self) {
        self.view_mode = match self.view_mode {
            ViewMode::Dashboard => ViewMode::Feed,
            ViewMode::Feed => ViewMode::Settings,
            ViewMode::Settings => ViewMode::Dashboard,
        };
    }

    fn select_next(&mut self) {
        match self.view_mode {
            ViewMode::Feed if !self.feed.incidents.is_empty() => {
                self.selected_index = (self.selected_index + 1) % self.feed.incidents.len();
            }
            ViewMode::Dashboard if !self.cards.is_empty() => {
                self.selected_card = (self.selected_card + 1) % self.cards.len();
            }
            _ => {}
        }
    }

    fn select_prev(&mut self) {
        match self.view_mode {
            ViewMode::Feed if !self.feed.incidents.is_empty() => {
                self.selected_index = self
                    .selected_index
                    .checked_sub(1)
                    .unwrap_or(self.feed.incidents.len() - 1);
            }
            ViewMode::Dashboard if !self.cards.is_empty() => {
                self.selected_card = self
                    .selected_card
                    .checked_sub(1)
                    .unwrap_or(self.cards.len() - 1);
            }
            _ => {}
        }
    }
}
