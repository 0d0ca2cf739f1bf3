//! Continuous location tracking for the UrbanPulse client.
//!
//! A [`LocationTracker`] owns a [`PositionSource`] (IP geolocation in
//! production, scripted sources in tests), arms a continuous watch
//! subscription, and forwards accepted samples to the main event loop. Raw
//! fixes pass through a [`SampleGate`] that enforces freshness, a minimum
//! wall-clock interval between accepted samples, and a minimum movement
//! distance so GPS-style jitter while stationary is suppressed.
//!
//! A watchdog timer independently requests a one-shot fix whenever the watch
//! has gone quiet for a full poll interval, guarding against sources that
//! silently stop delivering. When the source fails outright, a chain of IP
//! geolocation services is tried in order; if all of them fail the tracker
//! settles on the documented default location (Bengaluru) with a city-scale
//! accuracy radius and an advisory message rather than a hard error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use ipgeolocate::{Locator, Service};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::Event;
use crate::models::{haversine_km, PositionSample};

/// Default location when every provider fails: Bengaluru city center,
/// with a 25 km accuracy radius.
pub const DEFAULT_LAT: f64 = 12.9716;
pub const DEFAULT_LNG: f64 = 77.5946;
pub const DEFAULT_ACCURACY_M: f64 = 25_000.0;

/// Platform permission state for location access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    Prompt,
    Unknown,
}

/// Errors a position source can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    /// Terminal until permission is re-granted; tracking stops.
    Denied,
    /// Transient; tracking stays armed.
    Unavailable(String),
    /// Retried once before being surfaced.
    Timeout,
}

impl std::fmt::Display for LocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationError::Denied => write!(f, "location permission denied"),
            LocationError::Unavailable(msg) => write!(f, "position unavailable: {msg}"),
            LocationError::Timeout => write!(f, "location request timed out"),
        }
    }
}

/// A cancellable continuous-watch registration.
///
/// Cancelling (or dropping) the handle deterministically stops delivery from
/// the underlying task; the tracker always cancels the old handle before
/// arming a new one so two watches never run concurrently.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Something that can produce position fixes.
///
/// `watch` arms a continuous subscription delivering fixes on `tx` until the
/// returned handle is cancelled; `current_fix` performs a single fresh
/// request, bypassing any provider-side cache.
pub trait PositionSource: Send + Sync {
    fn watch(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<Result<PositionSample, LocationError>>,
    ) -> WatchHandle;

    fn current_fix(&self) -> BoxFuture<'_, Result<PositionSample, LocationError>>;
}

/// IP-geolocation-backed position source.
///
/// Terminals have no GPS, so the continuous watch is an internal poll of the
/// one-shot fix at `watch_interval`. Services are tried in the configured
/// order until one answers with usable coordinates.
pub struct IpPositionSource {
    /// IP the geolocation services resolve. A public resolver address gives
    /// a stable city-level answer when the host's own address is private.
    ip_hint: String,
    watch_interval: Duration,
}

impl IpPositionSource {
    pub fn new(ip_hint: String, watch_interval: Duration) -> Self {
        Self {
            ip_hint,
            watch_interval,
        }
    }

    /// The provider chain, tried in order until one answers.
    fn provider_chain() -> [(&'static str, Service); 3] {
        [
            ("ip-api.com", Service::IpApi),
            ("ipapi.co", Service::IpApiCo),
            ("freegeoip", Service::FreeGeoIp),
        ]
    }

    async fn query_service(&self, service: Service) -> Result<PositionSample, LocationError> {
        match Locator::get(&self.ip_hint, service).await {
            Ok(loc) => {
                let lat = loc
                    .latitude
                    .parse::<f64>()
                    .map_err(|e| LocationError::Unavailable(e.to_string()))?;
                let lng = loc
                    .longitude
                    .parse::<f64>()
                    .map_err(|e| LocationError::Unavailable(e.to_string()))?;
                let mut sample = PositionSample::new(lat, lng);
                // IP geolocation is city-accurate at best.
                sample.accuracy_m = Some(5_000.0);
                Ok(sample)
            }
            Err(e) => Err(LocationError::Unavailable(e.to_string())),
        }
    }
}

impl PositionSource for IpPositionSource {
    fn watch(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<Result<PositionSample, LocationError>>,
    ) -> WatchHandle {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.watch_interval);
            loop {
                interval.tick().await;
                if tx.send(self.current_fix().await).is_err() {
                    // Receiver gone; the handle was dropped without cancel.
                    break;
                }
            }
        });
        WatchHandle::new(task)
    }

    fn current_fix(&self) -> BoxFuture<'_, Result<PositionSample, LocationError>> {
        Box::pin(async move {
            let mut last_err = LocationError::Unavailable("no services configured".into());
            for (name, service) in Self::provider_chain() {
                match self.query_service(service).await {
                    Ok(sample) => return Ok(sample),
                    Err(e) => {
                        warn!("Geolocation service {} failed: {}", name, e);
                        last_err = e;
                    }
                }
            }
            Err(last_err)
        })
    }
}

/// Acceptance gate applied to every incoming fix.
///
/// A sample is accepted only if it is newer than the last accepted sample,
/// at least `min_update_interval` has elapsed since the last acceptance, and
/// (in continuous mode) the device has moved more than `min_distance_m` or
/// the last accepted sample is older than one poll interval. Forced fixes
/// skip the movement check but never the rate limit.
#[derive(Debug)]
pub struct SampleGate {
    min_update_interval: Duration,
    min_distance_m: f64,
    stale_after: Duration,
    last_accepted: Option<PositionSample>,
    last_accepted_at: Option<Instant>,
}

impl SampleGate {
    pub fn new(min_update_interval: Duration, min_distance_m: f64, stale_after: Duration) -> Self {
        Self {
            min_update_interval,
            min_distance_m,
            stale_after,
            last_accepted: None,
            last_accepted_at: None,
        }
    }

    pub fn last_accepted(&self) -> Option<&PositionSample> {
        self.last_accepted.as_ref()
    }

    /// Instant of the last acceptance, used by the watchdog to decide
    /// whether the watch has gone quiet.
    pub fn last_accepted_at(&self) -> Option<Instant> {
        self.last_accepted_at
    }

    pub fn accept(&mut self, sample: PositionSample, now: Instant) -> bool {
        self.accept_inner(sample, now, false)
    }

    /// Acceptance for a user-forced fresh fix: the movement gate is skipped
    /// so "where am I right now" always answers, but the rate limit still
    /// protects downstream consumers.
    pub fn accept_forced(&mut self, sample: PositionSample, now: Instant) -> bool {
        self.accept_inner(sample, now, true)
    }

    fn accept_inner(&mut self, sample: PositionSample, now: Instant, forced: bool) -> bool {
        if let Some(prev) = &self.last_accepted {
            // Reject stale or replayed fixes.
            if sample.timestamp <= prev.timestamp {
                return false;
            }
        }

        if let Some(at) = self.last_accepted_at {
            if now.duration_since(at) < self.min_update_interval {
                return false;
            }

            if !forced {
                if let Some(prev) = &self.last_accepted {
                    let moved_m = haversine_km(
                        prev.latitude,
                        prev.longitude,
                        sample.latitude,
                        sample.longitude,
                    ) * 1000.0;
                    let stale = now.duration_since(at) > self.stale_after;
                    if moved_m <= self.min_distance_m && !stale {
                        return false;
                    }
                }
            }
        }

        self.last_accepted = Some(sample);
        self.last_accepted_at = Some(now);
        true
    }
}

/// Tracker timing knobs; defaults match the config file defaults.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub min_update_interval: Duration,
    pub min_distance_m: f64,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub fix_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_update_interval: Duration::from_secs(1),
            min_distance_m: 25.0,
            poll_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(2),
            fix_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns the watch subscription and the watchdog poll; forwards accepted
/// samples and advisory/error states to the main event loop.
pub struct LocationTracker {
    source: Arc<dyn PositionSource>,
    config: TrackerConfig,
    events: mpsc::UnboundedSender<Event>,
    permission: Permission,
    watch: Option<WatchHandle>,
    worker: Option<JoinHandle<()>>,
    /// Sender for forced-fix requests into the running worker.
    force_tx: Option<mpsc::UnboundedSender<()>>,
}

impl LocationTracker {
    pub fn new(
        source: Arc<dyn PositionSource>,
        config: TrackerConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            source,
            config,
            events,
            permission: Permission::Unknown,
            watch: None,
            worker: None,
            force_tx: None,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.watch.is_some()
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Applies a permission-state change: a transition to granted (re)starts
    /// tracking, a transition to denied stops it and clears the watch.
    pub fn set_permission(&mut self, permission: Permission) {
        let prev = self.permission;
        self.permission = permission;
        match permission {
            Permission::Granted if prev != Permission::Granted => {
                info!("Location permission granted; starting tracking");
                self.start_tracking();
            }
            Permission::Denied if prev != Permission::Denied => {
                warn!("Location permission denied; tracking stopped");
                self.stop_tracking();
                let _ = self.events.send(Event::LocationError(LocationError::Denied));
            }
            _ => {}
        }
    }

    /// Forces a fresh one-shot fix, bypassing the movement gate.
    /// No-op unless tracking is active.
    pub fn request_location(&self) {
        if let Some(tx) = &self.force_tx {
            let _ = tx.send(());
        }
    }

    /// Arms the watch subscription and the watchdog poll. Any previous watch
    /// is cancelled first so two subscriptions never deliver concurrently;
    /// call this again after changing [`TrackerConfig`] to re-arm.
    pub fn start_tracking(&mut self) {
        if self.permission == Permission::Denied {
            return;
        }
        self.stop_tracking();

        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (force_tx, force_rx) = mpsc::unbounded_channel();
        self.watch = Some(Arc::clone(&self.source).watch(sample_tx));
        self.force_tx = Some(force_tx);

        let worker = TrackerWorker {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            events: self.events.clone(),
            gate: SampleGate::new(
                self.config.min_update_interval,
                self.config.min_distance_m,
                self.config.poll_interval,
            ),
        };
        self.worker = Some(tokio::spawn(worker.run(sample_rx, force_rx)));
    }

    /// Cancels the watch, the watchdog, and any pending forced fix.
    pub fn stop_tracking(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.cancel();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        self.force_tx = None;
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        self.stop_tracking();
    }
}

struct TrackerWorker {
    source: Arc<dyn PositionSource>,
    config: TrackerConfig,
    events: mpsc::UnboundedSender<Event>,
    gate: SampleGate,
}

impl TrackerWorker {
    async fn run(
        mut self,
        mut samples: mpsc::UnboundedReceiver<Result<PositionSample, LocationError>>,
        mut forced: mpsc::UnboundedReceiver<()>,
    ) {
        let mut watchdog = tokio::time::interval(self.config.poll_interval);
        // The first tick fires immediately; use it as the initial fix.
        loop {
            tokio::select! {
                Some(result) = samples.recv() => {
                    self.handle_watch_result(result);
                }
                Some(()) = forced.recv() => {
                    let result = self.one_shot_with_retry().await;
                    self.publish_fix(result, true);
                }
                _ = watchdog.tick() => {
                    if self.watch_is_quiet() {
                        let result = self.one_shot_with_retry().await;
                        self.publish_fix(result, false);
                    }
                }
            }
        }
    }

    fn watch_is_quiet(&self) -> bool {
        match self.gate.last_accepted_at() {
            Some(at) => at.elapsed() >= self.config.poll_interval,
            None => true,
        }
    }

    fn handle_watch_result(&mut self, result: Result<PositionSample, LocationError>) {
        match result {
            Ok(sample) => {
                if self.gate.accept(sample, Instant::now()) {
                    let _ = self.events.send(Event::PositionUpdate(sample));
                }
            }
            Err(LocationError::Denied) => {
                // Surfaced to the app, which flips permission and tears
                // the watch down through the tracker.
                let _ = self.events.send(Event::LocationError(LocationError::Denied));
            }
            Err(e) => {
                warn!("Watch fix failed: {}", e);
                let _ = self.events.send(Event::LocationError(e));
            }
        }
    }

    /// One-shot fix with a single bounded retry on timeout, then the IP
    /// fallback chain, then the documented default. Never a hard failure.
    async fn one_shot_with_retry(&self) -> PositionSample {
        match self.timed_fix().await {
            Ok(sample) => return sample,
            Err(LocationError::Timeout) => {
                tokio::time::sleep(self.config.retry_delay).await;
                if let Ok(sample) = self.timed_fix().await {
                    return sample;
                }
                warn!("Location fix timed out twice; falling back");
            }
            Err(e) => warn!("Location fix failed: {}; falling back", e),
        }

        error!(
            "All geolocation providers failed; using default location \
             ({DEFAULT_LAT}, {DEFAULT_LNG})"
        );
        let _ = self.events.send(Event::LocationAdvisory(
            "Could not determine location; showing Bengaluru city center".to_string(),
        ));
        let mut sample = PositionSample::new(DEFAULT_LAT, DEFAULT_LNG);
        sample.accuracy_m = Some(DEFAULT_ACCURACY_M);
        sample
    }

    async fn timed_fix(&self) -> Result<PositionSample, LocationError> {
        match tokio::time::timeout(self.config.fix_timeout, self.source.current_fix()).await {
            Ok(result) => result,
            Err(_) => Err(LocationError::Timeout),
        }
    }

    fn publish_fix(&mut self, sample: PositionSample, forced: bool) {
        let now = Instant::now();
        let accepted = if forced {
            self.gate.accept_forced(sample, now)
        } else {
            self.gate.accept(sample, now)
        };
        if accepted {
            let _ = self.events.send(Event::PositionUpdate(sample));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};

    fn sample_at(lat: f64, lng: f64, offset_ms: i64) -> PositionSample {
        let mut s = PositionSample::new(lat, lng);
        s.timestamp = Utc::now() + TimeDelta::milliseconds(offset_ms);
        s
    }

    fn gate() -> SampleGate {
        SampleGate::new(Duration::from_secs(1), 25.0, Duration::from_secs(30))
    }

    #[test]
    fn first_sample_is_accepted() {
        let mut g = gate();
        assert!(g.accept(sample_at(12.97, 77.59, 0), Instant::now()));
    }

    #[test]
    fn rate_limit_holds_for_rapid_samples() {
        let t0 = Instant::now();
        let mut g = gate();
        assert!(g.accept(sample_at(12.97, 77.59, 0), t0));
        // 400ms later, well past the jitter gate distance, still dropped.
        assert!(!g.accept(sample_at(13.00, 77.70, 400), t0 + Duration::from_millis(400)));
        assert!(g.accept(sample_at(13.00, 77.70, 1200), t0 + Duration::from_millis(1200)));
    }

    #[test]
    fn rejects_older_timestamps() {
        let t0 = Instant::now();
        let mut g = gate();
        assert!(g.accept(sample_at(12.97, 77.59, 0), t0));
        assert!(!g.accept(sample_at(13.00, 77.70, -500), t0 + Duration::from_secs(2)));
    }

    #[test]
    fn suppresses_stationary_jitter() {
        let t0 = Instant::now();
        let mut g = gate();
        assert!(g.accept(sample_at(12.9716, 77.5946, 0), t0));
        // ~11 m drift after 2s: rate limit passes, movement gate rejects.
        assert!(!g.accept(sample_at(12.9717, 77.5946, 2000), t0 + Duration::from_secs(2)));
        // ~1.1 km: real movement.
        assert!(g.accept(sample_at(12.9816, 77.5946, 4000), t0 + Duration::from_secs(4)));
    }

    #[test]
    fn stale_position_refreshes_despite_no_movement() {
        let t0 = Instant::now();
        let mut g = gate();
        assert!(g.accept(sample_at(12.9716, 77.5946, 0), t0));
        // Same spot 31s later: older than one poll interval, accepted to
        // keep the timestamp current.
        assert!(g.accept(sample_at(12.9716, 77.5946, 31_000), t0 + Duration::from_secs(31)));
    }

    #[test]
    fn forced_fix_skips_movement_gate_but_not_rate_limit() {
        let t0 = Instant::now();
        let mut g = gate();
        assert!(g.accept(sample_at(12.9716, 77.5946, 0), t0));
        // Forced fix at the same spot after 2s is accepted.
        assert!(g.accept_forced(sample_at(12.9716, 77.5946, 2000), t0 + Duration::from_secs(2)));
        // But a forced fix 200ms after an acceptance is still rate-limited.
        assert!(!g.accept_forced(
            sample_at(12.9716, 77.5946, 2200),
            t0 + Duration::from_millis(2200)
        ));
    }

    struct ScriptedSource {
        fixes: std::sync::Mutex<Vec<Result<PositionSample, LocationError>>>,
    }

    impl ScriptedSource {
        fn new(fixes: Vec<Result<PositionSample, LocationError>>) -> Self {
            Self {
                fixes: std::sync::Mutex::new(fixes),
            }
        }
    }

    impl PositionSource for ScriptedSource {
        fn watch(
            self: Arc<Self>,
            _tx: mpsc::UnboundedSender<Result<PositionSample, LocationError>>,
        ) -> WatchHandle {
            WatchHandle::new(tokio::spawn(async {}))
        }

        fn current_fix(&self) -> BoxFuture<'_, Result<PositionSample, LocationError>> {
            Box::pin(async move {
                let mut fixes = self.fixes.lock().unwrap();
                if fixes.is_empty() {
                    Err(LocationError::Unavailable("script exhausted".into()))
                } else {
                    fixes.remove(0)
                }
            })
        }
    }

    #[tokio::test]
    async fn exhausted_source_falls_back_to_default() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = TrackerWorker {
            source: Arc::new(ScriptedSource::new(vec![Err(LocationError::Unavailable(
                "down".into(),
            ))])),
            config: TrackerConfig {
                retry_delay: Duration::from_millis(1),
                fix_timeout: Duration::from_millis(50),
                ..TrackerConfig::default()
            },
            events: tx,
            gate: SampleGate::new(Duration::from_secs(1), 25.0, Duration::from_secs(30)),
        };

        let sample = worker.one_shot_with_retry().await;
        assert!((sample.latitude - DEFAULT_LAT).abs() < f64::EPSILON);
        assert_eq!(sample.accuracy_m, Some(DEFAULT_ACCURACY_M));
        // The fallback is advisory, not an error.
        match rx.recv().await {
            Some(Event::LocationAdvisory(_)) => {}
            other => panic!("expected advisory, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_retries_once_then_succeeds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let good = sample_at(12.9, 77.6, 0);
        let worker = TrackerWorker {
            source: Arc::new(ScriptedSource::new(vec![
                Err(LocationError::Timeout),
                Ok(good),
            ])),
            config: TrackerConfig {
                retry_delay: Duration::from_millis(1),
                ..TrackerConfig::default()
            },
            events: tx,
            gate: SampleGate::new(Duration::from_secs(1), 25.0, Duration::from_secs(30)),
        };

        let sample = worker.one_shot_with_retry().await;
        assert!((sample.latitude - 12.9).abs() < f64::EPSILON);
    }
}
