//! HTTP distance provider
//!
//! JSON API:
//!
//! | Endpoint | Body | Response |
//! |----------|------|----------|
//! | `POST /matrix` | `{origins, destinations}` | `{distances_m, durations_s}` (rows of nullable numbers) |
//! | `POST /trip` | `{waypoints}` | `{order, polyline?, warnings}`; 404 when unsupported |
//!
//! Transient failures are retried with exponential backoff. When every
//! attempt fails the matrix is answered with straight-line estimates flagged
//! low-confidence, so a planning run never stalls on the provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::models::GeoPoint;

use super::distance::{
    Confidence, DistanceProvider, EstimateRows, ProviderError, StraightLineProvider,
    TravelEstimate, TripPlan,
};

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 5_000;

#[derive(Debug, Serialize)]
struct MatrixRequest<'a> {
    origins: &'a [GeoPoint],
    destinations: &'a [GeoPoint],
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    distances_m: Vec<Vec<Option<f64>>>,
    durations_s: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Serialize)]
struct TripRequest<'a> {
    waypoints: &'a [GeoPoint],
}

/// reqwest-backed provider
#[derive(Debug, Clone)]
pub struct HttpDistanceProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_attempts: u32,
    backoff_base_ms: u64,
    fallback: StraightLineProvider,
}

impl HttpDistanceProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        max_attempts: u32,
        fallback_speed_kmh: f64,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            max_attempts: max_attempts.max(1),
            backoff_base_ms: BACKOFF_BASE_MS,
            fallback: StraightLineProvider::fallback(fallback_speed_kmh),
        })
    }

    /// Override the first retry delay
    pub fn with_backoff_base(mut self, base_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    async fn request_matrix(
        &self,
        origins: &[GeoPoint],
        destinations: &[GeoPoint],
    ) -> Result<EstimateRows, ProviderError> {
        let response = self
            .post("/matrix")
            .json(&MatrixRequest {
                origins,
                destinations,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::BadResponse(format!("HTTP {status}")));
        }

        let body: MatrixResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        into_rows(body, origins.len(), destinations.len())
    }
}

fn into_rows(body: MatrixResponse, rows: usize, cols: usize) -> Result<EstimateRows, ProviderError> {
    let shape_ok = body.distances_m.len() == rows
        && body.durations_s.len() == rows
        && body.distances_m.iter().all(|r| r.len() == cols)
        && body.durations_s.iter().all(|r| r.len() == cols);
    if !shape_ok {
        return Err(ProviderError::BadResponse(format!(
            "matrix shape does not match {rows}x{cols}"
        )));
    }

    Ok(body
        .distances_m
        .into_iter()
        .zip(body.durations_s)
        .map(|(distances, durations)| {
            distances
                .into_iter()
                .zip(durations)
                .map(|(distance, duration)| match (distance, duration) {
                    (Some(distance_m), Some(duration_s)) if distance_m >= 0.0 && duration_s >= 0.0 => {
                        Some(TravelEstimate {
                            distance_m,
                            duration_s,
                            confidence: Confidence::High,
                        })
                    }
                    _ => None,
                })
                .collect()
        })
        .collect())
}

#[async_trait]
impl DistanceProvider for HttpDistanceProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn matrix(
        &self,
        origins: &[GeoPoint],
        destinations: &[GeoPoint],
    ) -> Result<EstimateRows, ProviderError> {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match self.request_matrix(origins, destinations).await {
                Ok(rows) => return Ok(rows),
                Err(ProviderError::BadResponse(msg)) => {
                    tracing::warn!(error = %msg, "Distance provider returned unusable matrix");
                    last_error = Some(msg);
                    break;
                }
                Err(ProviderError::Unavailable(msg)) => {
                    let delay =
                        shared::util::backoff_delay_ms(self.backoff_base_ms, attempt, BACKOFF_MAX_MS);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        retry_in_ms = delay,
                        error = %msg,
                        "Distance provider unavailable"
                    );
                    last_error = Some(msg);
                    if attempt + 1 < self.max_attempts {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        tracing::warn!(
            error = last_error.as_deref().unwrap_or("unknown"),
            "Falling back to straight-line estimates"
        );
        Ok(self.fallback.rows(origins, destinations))
    }

    async fn optimize_trip(&self, waypoints: &[GeoPoint]) -> Result<Option<TripPlan>, ProviderError> {
        let response = self
            .post("/trip")
            .json(&TripRequest { waypoints })
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => Ok(None),
            status if status.is_success() => {
                let plan: TripPlan = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
                if plan.order.len() != waypoints.len() {
                    return Err(ProviderError::BadResponse(format!(
                        "trip order has {} entries for {} waypoints",
                        plan.order.len(),
                        waypoints.len()
                    )));
                }
                Ok(Some(plan))
            }
            status => Err(ProviderError::Unavailable(format!("HTTP {status}"))),
        }
    }
}
