use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io;
use tokio::sync::mpsc;
use tracing::{info, warn};
use urbanpulse_tui::{
    api::{BackendClient, NewEventReport},
    app::{Action, App},
    config::Config,
    events::{Event, EventHandler},
    feed::{FeedCommand, FeedIntent, FeedQuery, FeedReconciler},
    location::{
        IpPositionSource, LocationError, LocationTracker, Permission, TrackerConfig,
    },
    logging,
    models::Category,
    schedule::MovementGate,
    session::SessionStore,
    stream::run_dashboard_stream,
    ui,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Instrumentation and safety
    let _log_guard = logging::initialize_logging();
    install_panic_hook();
    color_eyre::install()?;

    let config = Config::load();

    // Restore the persisted session (auth token, identity). A token supplied
    // through the environment is persisted for subsequent runs.
    let session_store = SessionStore::open("session.db")?;
    let mut session = session_store.load()?;
    if let Ok(token) = std::env::var("URBANPULSE_TOKEN") {
        if !token.is_empty() {
            session.auth_token = Some(token);
            session.authenticated = true;
            session_store.save(&session)?;
            info!("Session token taken from URBANPULSE_TOKEN and persisted");
        }
    }
    let user_id = session
        .user_id
        .clone()
        .unwrap_or_else(|| config.backend.user_id.clone());

    let client = Arc::new(BackendClient::new(
        &config.backend.base_url,
        session.auth_token.clone(),
    )?);

    // Ready terminal and state
    let mut terminal = setup_terminal()?;
    let mut app = App::new(&config);
    let mut events = EventHandler::new(150);

    // One-shot backend health check; the result lands in the status bar.
    {
        let checker = client.clone();
        let tx = events.tx.clone();
        tokio::spawn(async move {
            let healthy = checker.health().await.unwrap_or(false);
            let _ = tx.send(Event::BackendHealth(healthy));
        });
    }

    // Location tracker: continuous watch + watchdog poll. A terminal has no
    // permission prompt to wait on, so access starts granted.
    let source = Arc::new(IpPositionSource::new(
        config.location.ip_hint.clone(),
        Duration::from_secs(config.location.poll_interval_seconds),
    ));
    let tracker_config = TrackerConfig {
        min_update_interval: Duration::from_millis(config.location.min_update_interval_ms),
        min_distance_m: config.location.min_distance_m,
        poll_interval: Duration::from_secs(config.location.poll_interval_seconds),
        ..TrackerConfig::default()
    };
    let mut tracker = LocationTracker::new(source, tracker_config, events.tx.clone());
    tracker.set_permission(Permission::Granted);

    // Feed worker: reconciliation passes run sequentially off this channel.
    let (feed_tx, feed_rx) = mpsc::unbounded_channel();
    let feed_worker = tokio::spawn(urbanpulse_tui::feed::run_feed_worker(
        FeedReconciler::new(client.clone()),
        feed_rx,
        events.tx.clone(),
    ));

    // The dashboard stream is armed on the first position fix and re-armed
    // whenever the fix drifts far enough that the old scope is stale.
    let mut stream_shutdown: Option<mpsc::Sender<()>> = None;
    let mut stream_gate = MovementGate::new(config.feed.movement_gate_m);

    // Auto-refresh deadline; armed only while a position is available.
    let auto_refresh = Duration::from_secs(config.feed.auto_refresh_seconds);
    let mut next_auto_refresh: Option<Instant> = None;

    while !app.should_quit {
        terminal.draw(|f| ui::render(f, &app))?;

        let Some(event) = events.next().await else {
            break;
        };
        let now = Instant::now();

        match event {
            Event::Tick => {
                for action in app.on_tick(now) {
                    run_action(
                        action,
                        &app,
                        &config,
                        &tracker,
                        &feed_tx,
                        &client,
                        &session_store,
                        &events.tx,
                    );
                }
                if let Some(deadline) = next_auto_refresh {
                    if now >= deadline && app.position.is_some() {
                        feed_tx
                            .send(FeedCommand::Reconcile(feed_query(
                                &app,
                                config.feed.max_results,
                                current_intent(&app),
                            )))
                            .ok();
                        next_auto_refresh = Some(now + auto_refresh);
                    }
                }
            }
            Event::Input(key) => app.handle_key(key, now),
            Event::PositionUpdate(sample) => {
                app.on_position(sample, now);
                if next_auto_refresh.is_none() {
                    next_auto_refresh = Some(now + auto_refresh);
                }
                if stream_gate.should_fire(sample.coords()) {
                    match stream_shutdown.take() {
                        // Significant move: tear the old scope down first.
                        Some(shutdown) => {
                            let _ = shutdown.send(()).await;
                        }
                        // First fix: seed the cards while the stream connects.
                        None => {
                            let seed = client.clone();
                            let tx = events.tx.clone();
                            let uid = user_id.clone();
                            let (lat, lng) = sample.coords();
                            tokio::spawn(async move {
                                match seed.dashboard_snapshot(&uid, lat, lng).await {
                                    Ok(snap) => {
                                        let _ = tx.send(Event::DashboardSeed {
                                            cards: snap.cards,
                                            high_priority_count: snap.high_priority_count,
                                        });
                                    }
                                    Err(e) => warn!("Dashboard snapshot failed: {e:#}"),
                                }
                            });
                        }
                    }
                    let (tx, rx) = mpsc::channel(1);
                    stream_shutdown = Some(tx);
                    tokio::spawn(run_dashboard_stream(
                        client.clone(),
                        user_id.clone(),
                        sample.coords(),
                        events.tx.clone(),
                        rx,
                    ));
                }
            }
            Event::LocationAdvisory(msg) => {
                app.location_advisory = Some(msg);
            }
            Event::LocationError(err) => {
                app.location_loading = false;
                app.location_error = Some(err.to_string());
                if err == LocationError::Denied {
                    tracker.set_permission(Permission::Denied);
                    // No position source: stop the auto-refresh timer too.
                    next_auto_refresh = None;
                }
            }
            Event::Notice(msg) => app.notice = Some(msg),
            Event::BackendHealth(healthy) => {
                if !healthy {
                    warn!("Backend health check failed");
                }
                app.backend_healthy = Some(healthy);
            }
            Event::FeedUpdate(snapshot) => app.on_feed_update(snapshot),
            Event::DashboardUpdate {
                cards,
                high_priority_count,
            } => app.on_dashboard_update(cards, high_priority_count),
            Event::DashboardSeed {
                cards,
                high_priority_count,
            } => app.on_dashboard_seed(cards, high_priority_count),
            Event::StreamStatus(state) => app.stream_state = state,
            Event::Heartbeat => app.last_heartbeat = Some(now),
            Event::CardDetail(detail) => app.card_detail = Some(detail),
        }
    }

    // Teardown: close the push stream, stop tracking, drain the feed worker.
    if let Some(shutdown) = stream_shutdown {
        let _ = shutdown.send(()).await;
    }
    tracker.stop_tracking();
    let _ = feed_tx.send(FeedCommand::Shutdown);
    let _ = feed_worker.await;

    restore_terminal(terminal)?;
    Ok(())
}

fn current_intent(app: &App) -> FeedIntent {
    match app.active_filter {
        Some(category) => FeedIntent::Category(category),
        None => FeedIntent::Refresh,
    }
}

fn feed_query(app: &App, max_results: u32, intent: FeedIntent) -> FeedQuery {
    FeedQuery {
        position: app.position.map(|p| p.coords()),
        radius_km: app.radius_km,
        max_results,
        intent,
    }
}

/// Executes one app action: reconcile requests go to the feed worker; the
/// one-shot backend calls run on their own tasks so the UI never blocks.
fn run_action(
    action: Action,
    app: &App,
    config: &Config,
    tracker: &LocationTracker,
    feed_tx: &mpsc::UnboundedSender<FeedCommand>,
    client: &Arc<BackendClient>,
    session_store: &SessionStore,
    events: &mpsc::UnboundedSender<Event>,
) {
    match action {
        Action::Reconcile(intent) => {
            feed_tx
                .send(FeedCommand::Reconcile(feed_query(
                    app,
                    config.feed.max_results,
                    intent,
                )))
                .ok();
        }
        Action::RequestLocation => tracker.request_location(),
        Action::ReportEvent(title) => {
            let Some((latitude, longitude)) = app.position.map(|p| p.coords()) else {
                let _ = events.send(Event::Notice("Report not sent: no position".into()));
                return;
            };
            let report = NewEventReport {
                title,
                description: String::new(),
                category: app.active_filter.unwrap_or(Category::Traffic),
                latitude,
                longitude,
            };
            let client = client.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let notice = match client.create_event(&report).await {
                    Ok(()) => "Report submitted".to_string(),
                    Err(e) => format!("Report failed: {e:#}"),
                };
                let _ = events.send(Event::Notice(notice));
            });
        }
        Action::Logout => {
            let notice = match session_store.clear() {
                Ok(()) => "Session cleared; next start is signed out".to_string(),
                Err(e) => format!("Logout failed: {e:#}"),
            };
            let _ = events.send(Event::Notice(notice));
        }
        Action::PopulateDemo => {
            let Some(pos) = app.position.map(|p| p.coords()) else {
                warn!("Demo population skipped: no position");
                return;
            };
            let client = client.clone();
            tokio::spawn(async move {
                match client.populate_demo_data(pos.0, pos.1).await {
                    Ok(()) => info!("Demo data populated"),
                    Err(e) => warn!("Demo population failed: {e:#}"),
                }
            });
        }
        Action::ExpandCard(card_id) => {
            let client = client.clone();
            let events = events.clone();
            tokio::spawn(async move {
                // A failed expansion is contained to the detail panel.
                let detail = match client.expand_card(&card_id).await {
                    Ok(expansion) => expansion.detail,
                    Err(e) => format!("Expansion failed: {e:#}"),
                };
                let _ = events.send(Event::CardDetail(detail));
            });
        }
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(
        stdout,
        crossterm::terminal::EnterAlternateScreen,
        crossterm::cursor::Hide
    )?;
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen,
        crossterm::cursor::Show
    )?;
    Ok(())
}

fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Force terminal cleanup!
        crossterm::terminal::disable_raw_mode().ok();
        crossterm::execute!(
            std::io::stdout(),
            crossterm::terminal::LeaveAlternateScreen,
            crossterm::cursor::Show
        )
        .ok();
        original_hook(panic_info);
    }));
}
