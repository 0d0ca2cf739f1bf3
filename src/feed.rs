//! The live incident feed reconciliation pass.
//!
//! One pass queries the backend (nearby first, a generic text search as a
//! fallback when nearby comes up empty, plus a topic query when a category
//! filter is active), normalizes every record into the canonical
//! [`Incident`], de-duplicates by id with first occurrence winning, and
//! publishes the whole list as one atomic [`FeedSnapshot`]. A failed pass
//! clears the list and surfaces the error; it never leaves a stale list
//! standing or substitutes fabricated data.
//!
//! Passes run on a single worker task fed by a request channel, so two
//! passes can never interleave partial results: whichever pass finishes
//! last owns the published snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::IncidentQueries;
use crate::events::Event;
use crate::models::{Category, Incident, RawIncident};

/// Generic multi-category query used for the zero-result fallback search.
/// Covers backends whose nearest-neighbor index is sparser than their text
/// index.
const FALLBACK_SEARCH_QUERY: &str = "traffic weather infrastructure events safety";

/// What triggered a reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedIntent {
    /// Plain refresh: nearby query with the fallback search.
    Refresh,
    /// Category filter active: topic query merged ahead of the general one.
    Category(Category),
    /// Free-text search replaces the nearby primary.
    Search(String),
}

/// Input to one reconciliation pass.
#[derive(Debug, Clone)]
pub struct FeedQuery {
    pub position: Option<(f64, f64)>,
    pub radius_km: f64,
    pub max_results: u32,
    pub intent: FeedIntent,
}

/// Health of the published feed. An empty healthy result is not an error,
/// and a missing location is neither.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedStatus {
    Ok,
    /// Backend healthy, zero incidents in range.
    Empty,
    /// No position available; no network call was made.
    LocationRequired,
    /// Network/parse failure; retry is caller-driven.
    Error(String),
}

/// The atomically published result of one pass.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub incidents: Vec<Incident>,
    pub total: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub status: FeedStatus,
}

impl FeedSnapshot {
    fn location_required() -> Self {
        Self {
            incidents: Vec::new(),
            total: 0,
            last_updated: None,
            status: FeedStatus::LocationRequired,
        }
    }

    fn failed(detail: String) -> Self {
        Self {
            incidents: Vec::new(),
            total: 0,
            last_updated: Some(Utc::now()),
            status: FeedStatus::Error(detail),
        }
    }

    fn published(incidents: Vec<Incident>) -> Self {
        let status = if incidents.is_empty() {
            FeedStatus::Empty
        } else {
            FeedStatus::Ok
        };
        Self {
            total: incidents.len(),
            last_updated: Some(Utc::now()),
            incidents,
            status,
        }
    }
}

pub struct FeedReconciler {
    backend: Arc<dyn IncidentQueries>,
}

impl FeedReconciler {
    pub fn new(backend: Arc<dyn IncidentQueries>) -> Self {
        Self { backend }
    }

    /// Runs one complete reconciliation pass.
    pub async fn reconcile(&self, query: &FeedQuery) -> FeedSnapshot {
        let Some((lat, lng)) = query.position else {
            debug!("Reconcile skipped: no position available");
            return FeedSnapshot::location_required();
        };

        match self.gather(query, lat, lng).await {
            Ok(raw) => {
                let incidents = normalize_and_dedup(raw, (lat, lng));
                debug!("Reconcile pass published {} incidents", incidents.len());
                FeedSnapshot::published(incidents)
            }
            Err(e) => {
                warn!("Reconcile pass failed: {e:#}");
                FeedSnapshot::failed(format!("{e:#}"))
            }
        }
    }

    /// Issues the pass's queries in order and concatenates their raw
    /// results. Any individual query failure fails the whole pass.
    async fn gather(
        &self,
        query: &FeedQuery,
        lat: f64,
        lng: f64,
    ) -> color_eyre::Result<Vec<RawIncident>> {
        let max = query.max_results;

        if let FeedIntent::Search(text) = &query.intent {
            return self.backend.search(text, lat, lng, max).await;
        }

        let mut records = self.backend.nearby(lat, lng, query.radius_km, max).await?;

        if records.is_empty() {
            debug!("Nearby query empty; trying fallback text search");
            records = self
                .backend
                .search(FALLBACK_SEARCH_QUERY, lat, lng, max)
                .await?;
        }

        if let FeedIntent::Category(category) = query.intent {
            let filtered = self
                .backend
                .topic(category, lat, lng, query.radius_km, max)
                .await?;
            // Topic results lead so they win the first-seen de-dup for
            // their ids; general results are narrowed to the filter.
            let general = records;
            records = filtered;
            records.extend(general);
        }

        Ok(records)
    }
}

/// Normalizes raw records and drops duplicates, first occurrence winning.
/// Records without resolvable coordinates are dropped during normalization.
fn normalize_and_dedup(raw: Vec<RawIncident>, origin: (f64, f64)) -> Vec<Incident> {
    let mut seen: HashSet<String> = HashSet::new();
    raw.into_iter()
        .filter_map(|record| Incident::from_raw(record, Some(origin)))
        .filter(|incident| seen.insert(incident.id.clone()))
        .collect()
}

/// Narrows a merged list to one category after a filtered pass.
pub fn retain_category(incidents: &mut Vec<Incident>, category: Category) {
    incidents.retain(|i| i.category == category);
}

/// Requests handled by the feed worker task.
pub enum FeedCommand {
    Reconcile(FeedQuery),
    Shutdown,
}

/// Runs reconciliation passes sequentially off a command channel and
/// publishes each snapshot to the main event loop.
///
/// Serializing passes through one worker is what makes snapshot publication
/// last-writer-wins at the publish step: a later request's snapshot always
/// lands after an earlier one's.
pub async fn run_feed_worker(
    reconciler: FeedReconciler,
    mut commands: mpsc::UnboundedReceiver<FeedCommand>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            FeedCommand::Reconcile(query) => {
                let mut snapshot = reconciler.reconcile(&query).await;
                if let FeedIntent::Category(category) = query.intent {
                    retain_category(&mut snapshot.incidents, category);
                    snapshot.total = snapshot.incidents.len();
                    if snapshot.status == FeedStatus::Ok && snapshot.incidents.is_empty() {
                        snapshot.status = FeedStatus::Empty;
                    }
                }
                if events.send(Event::FeedUpdate(snapshot)).is_err() {
                    break;
                }
            }
            FeedCommand::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(id: &str, lat: f64, lng: f64, category: &str) -> RawIncident {
        serde_json::from_value(json!({
            "id": id, "lat": lat, "lng": lng, "category": category
        }))
        .unwrap()
    }

    /// Scripted backend that counts calls and returns canned results.
    #[derive(Default)]
    struct FakeBackend {
        nearby_results: Vec<RawIncident>,
        search_results: Vec<RawIncident>,
        topic_results: Vec<RawIncident>,
        fail_nearby: bool,
        nearby_calls: AtomicUsize,
        search_calls: AtomicUsize,
        topic_calls: AtomicUsize,
    }

    impl IncidentQueries for FakeBackend {
        fn nearby(
            &self,
            _lat: f64,
            _lng: f64,
            _radius_km: f64,
            _max: u32,
        ) -> BoxFuture<'_, color_eyre::Result<Vec<RawIncident>>> {
            self.nearby_calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_nearby;
            let results = self.nearby_results.clone();
            Box::pin(async move {
                if fail {
                    Err(eyre!("connection refused"))
                } else {
                    Ok(results)
                }
            })
        }

        fn search(
            &self,
            _query: &str,
            _lat: f64,
            _lng: f64,
            _max: u32,
        ) -> BoxFuture<'_, color_eyre::Result<Vec<RawIncident>>> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            let results = self.search_results.clone();
            Box::pin(async move { Ok(results) })
        }

        fn topic(
            &self,
            _category: Category,
            _lat: f64,
            _lng: f64,
            _radius_km: f64,
            _max: u32,
        ) -> BoxFuture<'_, color_eyre::Result<Vec<RawIncident>>> {
            self.topic_calls.fetch_add(1, Ordering::SeqCst);
            let results = self.topic_results.clone();
            Box::pin(async move { Ok(results) })
        }
    }

    fn query_at(position: Option<(f64, f64)>, intent: FeedIntent) -> FeedQuery {
        FeedQuery {
            position,
            radius_km: 15.0,
            max_results: 50,
            intent,
        }
    }

    #[tokio::test]
    async fn no_position_short_circuits_without_network() {
        let backend = Arc::new(FakeBackend::default());
        let reconciler = FeedReconciler::new(backend.clone());

        let snap = reconciler
            .reconcile(&query_at(None, FeedIntent::Refresh))
            .await;

        assert_eq!(snap.status, FeedStatus::LocationRequired);
        assert_eq!(snap.total, 0);
        assert_eq!(backend.nearby_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_nearby_triggers_fallback_search() {
        let backend = Arc::new(FakeBackend::default());
        let reconciler = FeedReconciler::new(backend.clone());

        let snap = reconciler
            .reconcile(&query_at(Some((12.9120, 77.6365)), FeedIntent::Refresh))
            .await;

        assert_eq!(backend.nearby_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 1);
        // Both empty: an explicit empty state, not an error.
        assert_eq!(snap.status, FeedStatus::Empty);
        assert_eq!(snap.total, 0);
    }

    #[tokio::test]
    async fn nonempty_nearby_skips_fallback() {
        let backend = Arc::new(FakeBackend {
            nearby_results: vec![raw("evt_1", 12.9, 77.6, "traffic")],
            ..FakeBackend::default()
        });
        let reconciler = FeedReconciler::new(backend.clone());

        let snap = reconciler
            .reconcile(&query_at(Some((12.9, 77.6)), FeedIntent::Refresh))
            .await;

        assert_eq!(snap.status, FeedStatus::Ok);
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_ids_across_queries_collapse_to_one() {
        // nearby comes back empty so the fallback search runs, and the same
        // entity appears in both the topic and the search results.
        let backend = Arc::new(FakeBackend {
            search_results: vec![
                raw("evt_42", 12.9, 77.6, "traffic"),
                raw("evt_7", 12.8, 77.5, "traffic"),
            ],
            topic_results: vec![raw("evt_42", 12.9, 77.6, "traffic")],
            ..FakeBackend::default()
        });
        let reconciler = FeedReconciler::new(backend);

        let snap = reconciler
            .reconcile(&query_at(
                Some((12.9, 77.6)),
                FeedIntent::Category(Category::Traffic),
            ))
            .await;

        let ids: Vec<&str> = snap.incidents.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids.iter().filter(|id| **id == "evt_42").count(), 1);
        assert_eq!(ids, vec!["evt_42", "evt_7"]);
    }

    #[tokio::test]
    async fn records_without_coordinates_are_dropped() {
        let no_coords: RawIncident =
            serde_json::from_value(json!({ "id": "evt_bad", "category": "traffic" })).unwrap();
        let backend = Arc::new(FakeBackend {
            nearby_results: vec![no_coords, raw("evt_ok", 12.9, 77.6, "traffic")],
            ..FakeBackend::default()
        });
        let reconciler = FeedReconciler::new(backend);

        let snap = reconciler
            .reconcile(&query_at(Some((12.9, 77.6)), FeedIntent::Refresh))
            .await;

        assert_eq!(snap.total, 1);
        assert_eq!(snap.incidents[0].id, "evt_ok");
    }

    #[tokio::test]
    async fn network_failure_clears_list_with_error_status() {
        let backend = Arc::new(FakeBackend {
            fail_nearby: true,
            nearby_results: vec![raw("evt_1", 12.9, 77.6, "traffic")],
            ..FakeBackend::default()
        });
        let reconciler = FeedReconciler::new(backend);

        let snap = reconciler
            .reconcile(&query_at(Some((12.9, 77.6)), FeedIntent::Refresh))
            .await;

        assert!(matches!(snap.status, FeedStatus::Error(_)));
        assert!(snap.incidents.is_empty());
        assert_eq!(snap.total, 0);
    }

    #[tokio::test]
    async fn search_intent_uses_text_search_only() {
        let backend = Arc::new(FakeBackend {
            search_results: vec![raw("evt_9", 12.9, 77.6, "weather")],
            ..FakeBackend::default()
        });
        let reconciler = FeedReconciler::new(backend.clone());

        let snap = reconciler
            .reconcile(&query_at(
                Some((12.9, 77.6)),
                FeedIntent::Search("waterlogging".into()),
            ))
            .await;

        assert_eq!(snap.total, 1);
        assert_eq!(backend.nearby_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn category_filter_narrows_general_results() {
        let backend = Arc::new(FakeBackend {
            nearby_results: vec![
                raw("evt_w", 12.9, 77.6, "weather"),
                raw("evt_t", 12.8, 77.5, "traffic"),
            ],
            topic_results: vec![raw("evt_w2", 12.7, 77.4, "weather")],
            ..FakeBackend::default()
        });
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_feed_worker(
            FeedReconciler::new(backend),
            cmd_rx,
            events_tx,
        ));

        cmd_tx
            .send(FeedCommand::Reconcile(query_at(
                Some((12.9, 77.6)),
                FeedIntent::Category(Category::Weather),
            )))
            .unwrap();
        cmd_tx.send(FeedCommand::Shutdown).unwrap();

        let Some(Event::FeedUpdate(snap)) = events_rx.recv().await else {
            panic!("expected a feed update");
        };
        let ids: Vec<&str> = snap.incidents.iter().map(|i| i.id.as_str()).collect();
        // Topic results lead, traffic record is filtered out.
        assert_eq!(ids, vec!["evt_w2", "evt_w"]);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_publishes_passes_in_request_order() {
        let backend = Arc::new(FakeBackend {
            nearby_results: vec![raw("evt_1", 12.9, 77.6, "traffic")],
            ..FakeBackend::default()
        });
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_feed_worker(
            FeedReconciler::new(backend),
            cmd_rx,
            events_tx,
        ));

        cmd_tx
            .send(FeedCommand::Reconcile(query_at(None, FeedIntent::Refresh)))
            .unwrap();
        cmd_tx
            .send(FeedCommand::Reconcile(query_at(
                Some((12.9, 77.6)),
                FeedIntent::Refresh,
            )))
            .unwrap();
        cmd_tx.send(FeedCommand::Shutdown).unwrap();

        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        let (Event::FeedUpdate(s1), Event::FeedUpdate(s2)) = (first, second) else {
            panic!("expected two feed updates");
        };
        // The later pass's snapshot is the last one published.
        assert_eq!(s1.status, FeedStatus::LocationRequired);
        assert_eq!(s2.status, FeedStatus::Ok);
        worker.await.unwrap();
    }
}
