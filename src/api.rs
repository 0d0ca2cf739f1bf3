//! HTTP client for the UrbanPulse backend.
//!
//! All payloads are JSON; the backend owns their semantics. Incident list
//! endpoints answer with slightly different envelopes, so responses are
//! decoded permissively here and normalized in [`crate::models`]. Non-2xx
//! responses become retryable errors; the caller decides when to try again.

use color_eyre::eyre::{eyre, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::{Category, DashboardCard, RawIncident};

/// Queries the feed reconciler issues during a reconciliation pass.
///
/// Split out as a trait so the reconciler can be driven by scripted
/// responses in tests; [`BackendClient`] is the production implementation.
pub trait IncidentQueries: Send + Sync {
    fn nearby(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        max: u32,
    ) -> BoxFuture<'_, Result<Vec<RawIncident>>>;

    fn search(
        &self,
        query: &str,
        lat: f64,
        lng: f64,
        max: u32,
    ) -> BoxFuture<'_, Result<Vec<RawIncident>>>;

    fn topic(
        &self,
        category: Category,
        lat: f64,
        lng: f64,
        radius_km: f64,
        max: u32,
    ) -> BoxFuture<'_, Result<Vec<RawIncident>>>;
}

/// Incident list endpoints wrap their records differently depending on which
/// service answered; accept the known envelopes and a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum IncidentEnvelope {
    Wrapped {
        #[serde(alias = "results", alias = "events")]
        incidents: Vec<RawIncident>,
    },
    Bare(Vec<RawIncident>),
}

impl IncidentEnvelope {
    fn into_records(self) -> Vec<RawIncident> {
        match self {
            IncidentEnvelope::Wrapped { incidents } => incidents,
            IncidentEnvelope::Bare(records) => records,
        }
    }
}

/// A user-submitted event report.
#[derive(Debug, Clone, Serialize)]
pub struct NewEventReport {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardSnapshot {
    #[serde(default)]
    pub cards: Vec<DashboardCard>,
    #[serde(default)]
    pub high_priority_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardExpansion {
    pub card_id: String,
    pub detail: String,
    #[serde(default)]
    pub related_incident_ids: Vec<String>,
}

/// Client for the UrbanPulse backend.
///
/// Explicitly constructed and passed by reference (no global singleton) so
/// tests and teardown own its lifecycle.
pub struct BackendClient {
    client: Client,
    /// Separate client for the push stream: `ClientBuilder::timeout` caps the
    /// whole response body read, which would kill a healthy long-lived stream,
    /// so this one carries only a connect timeout.
    stream_client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl BackendClient {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()?,
            stream_client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch_incidents(&self, req: reqwest::RequestBuilder) -> Result<Vec<RawIncident>> {
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(eyre!("backend returned {}", res.status()));
        }
        let envelope = res.json::<IncidentEnvelope>().await?;
        Ok(envelope.into_records())
    }

    pub async fn create_event(&self, report: &NewEventReport) -> Result<()> {
        let res = self.post("/api/events").json(report).send().await?;
        if !res.status().is_success() {
            return Err(eyre!("event creation failed: {}", res.status()));
        }
        Ok(())
    }

    pub async fn dashboard_snapshot(
        &self,
        user_id: &str,
        lat: f64,
        lng: f64,
    ) -> Result<DashboardSnapshot> {
        let res = self
            .get("/api/dashboard")
            .query(&[("user_id", user_id)])
            .query(&[("lat", lat), ("lng", lng)])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(eyre!("dashboard snapshot failed: {}", res.status()));
        }
        Ok(res.json().await?)
    }

    pub async fn expand_card(&self, card_id: &str) -> Result<CardExpansion> {
        let res = self
            .get(&format!("/api/dashboard/cards/{card_id}/expand"))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(eyre!("card expansion failed: {}", res.status()));
        }
        Ok(res.json().await?)
    }

    pub async fn health(&self) -> Result<bool> {
        let res = self.get("/api/health").send().await?;
        Ok(res.status().is_success())
    }

    pub async fn populate_demo_data(&self, lat: f64, lng: f64) -> Result<()> {
        let res = self
            .post("/api/demo/populate")
            .query(&[("lat", lat), ("lng", lng)])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(eyre!("demo population failed: {}", res.status()));
        }
        Ok(())
    }

    /// Opens the dashboard push stream; the raw response is consumed by
    /// [`crate::stream`]. Goes through the timeout-free stream client so the
    /// connection can outlive the JSON request timeout.
    pub async fn open_dashboard_stream(
        &self,
        user_id: &str,
        lat: f64,
        lng: f64,
    ) -> Result<reqwest::Response> {
        let req = self
            .stream_client
            .get(format!("{}/api/stream/dashboard", self.base_url));
        let req = match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let res = req
            .query(&[("user_id", user_id)])
            .query(&[("lat", lat), ("lng", lng)])
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(eyre!("stream open failed: {}", res.status()));
        }
        Ok(res)
    }
}

impl IncidentQueries for BackendClient {
    fn nearby(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        max: u32,
    ) -> BoxFuture<'_, Result<Vec<RawIncident>>> {
        let req = self
            .get("/api/incidents/nearby")
            .query(&[("lat", lat), ("lng", lng), ("radius_km", radius_km)])
            .query(&[("max_results", max)]);
        Box::pin(self.fetch_incidents(req))
    }

    fn search(
        &self,
        query: &str,
        lat: f64,
        lng: f64,
        max: u32,
    ) -> BoxFuture<'_, Result<Vec<RawIncident>>> {
        let req = self
            .get("/api/incidents/search")
            .query(&[("q", query)])
            .query(&[("lat", lat), ("lng", lng)])
            .query(&[("max_results", max)]);
        Box::pin(self.fetch_incidents(req))
    }

    fn topic(
        &self,
        category: Category,
        lat: f64,
        lng: f64,
        radius_km: f64,
        max: u32,
    ) -> BoxFuture<'_, Result<Vec<RawIncident>>> {
        let req = self
            .get("/api/incidents/topic")
            .query(&[("topic", category.as_query())])
            .query(&[("lat", lat), ("lng", lng), ("radius_km", radius_km)])
            .query(&[("max_results", max)]);
        Box::pin(self.fetch_incidents(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal SSE endpoint: answers one request with a chunked
    /// `text/event-stream` body, one heartbeat per `interval`, then closes.
    async fn spawn_sse_server(heartbeats: usize, interval: Duration) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: text/event-stream\r\n\
                      Transfer-Encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            let body = "data: {\"type\":\"heartbeat\"}\n\n";
            let frame = format!("{:x}\r\n{body}\r\n", body.len());
            for _ in 0..heartbeats {
                if socket.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn dashboard_stream_outlives_the_json_request_timeout() {
        // 12 heartbeats a second apart: the connection must stay healthy well
        // past the 10 s timeout the JSON endpoints use.
        let base = spawn_sse_server(12, Duration::from_secs(1)).await;
        let client = BackendClient::new(&base, None).unwrap();

        let res = client.open_dashboard_stream("u_1", 12.9, 77.6).await.unwrap();
        let started = Instant::now();
        let mut body = res.bytes_stream();
        let mut received = 0usize;
        while let Some(chunk) = body.next().await {
            // A client-enforced body deadline would surface here as Err.
            chunk.unwrap();
            received += 1;
        }

        assert!(started.elapsed() > Duration::from_secs(10));
        assert!(received >= 10, "got {received} chunks");
    }

    #[test]
    fn decodes_wrapped_envelope() {
        let env: IncidentEnvelope = serde_json::from_value(json!({
            "incidents": [{ "id": "evt_1", "lat": 12.9, "lng": 77.6 }]
        }))
        .unwrap();
        assert_eq!(env.into_records().len(), 1);
    }

    #[test]
    fn decodes_aliased_envelope() {
        let env: IncidentEnvelope = serde_json::from_value(json!({
            "results": [{ "id": "evt_1", "lat": 12.9, "lng": 77.6 }]
        }))
        .unwrap();
        assert_eq!(env.into_records().len(), 1);
    }

    #[test]
    fn decodes_bare_array() {
        let env: IncidentEnvelope = serde_json::from_value(json!([
            { "id": "evt_1", "lat": 12.9, "lng": 77.6 },
            { "id": "evt_2", "lat": 12.8, "lng": 77.5 }
        ]))
        .unwrap();
        assert_eq!(env.into_records().len(), 2);
    }
}
