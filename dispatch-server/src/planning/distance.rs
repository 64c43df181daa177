//! Distance provider adapter
//!
//! The route builder never talks to a routing service directly. It works on
//! a [`DistanceMatrix`] built once per planning batch from a
//! [`DistanceProvider`], so the builder stays deterministic and testable
//! without network access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::models::GeoPoint;
use thiserror::Error;

/// Road distance is longer than the great circle
const ROAD_DETOUR_FACTOR: f64 = 1.3;

/// How much an estimate can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    High,
    /// Straight-line fallback after the provider failed
    Low,
}

/// Travel between two points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TravelEstimate {
    pub distance_m: f64,
    pub duration_s: f64,
    pub confidence: Confidence,
}

impl TravelEstimate {
    pub const ZERO: TravelEstimate = TravelEstimate {
        distance_m: 0.0,
        duration_s: 0.0,
        confidence: Confidence::High,
    };
}

/// Optimized visiting order returned by providers that support it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripPlan {
    /// Indices into the submitted waypoints
    pub order: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polyline: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Provider failure
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Distance provider unavailable: {0}")]
    Unavailable(String),

    #[error("Distance provider returned a bad response: {0}")]
    BadResponse(String),
}

impl From<ProviderError> for shared::error::AppError {
    fn from(err: ProviderError) -> Self {
        use shared::error::{AppError, ErrorCode};
        match err {
            ProviderError::Unavailable(msg) => {
                AppError::with_message(ErrorCode::ProviderUnavailable, msg)
            }
            ProviderError::BadResponse(msg) => {
                AppError::with_message(ErrorCode::ProviderBadResponse, msg)
            }
        }
    }
}

/// Rows follow `origins`, columns follow `destinations`; `None` = no estimate
pub type EstimateRows = Vec<Vec<Option<TravelEstimate>>>;

/// Third-party distance/ETA service
#[async_trait]
pub trait DistanceProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pairwise estimates
    async fn matrix(
        &self,
        origins: &[GeoPoint],
        destinations: &[GeoPoint],
    ) -> Result<EstimateRows, ProviderError>;

    /// Provider-side trip optimization, `None` when unsupported
    async fn optimize_trip(&self, _waypoints: &[GeoPoint]) -> Result<Option<TripPlan>, ProviderError> {
        Ok(None)
    }
}

/// Haversine distance at a constant average speed
#[derive(Debug, Clone)]
pub struct StraightLineProvider {
    speed_mps: f64,
    confidence: Confidence,
}

impl StraightLineProvider {
    pub fn new(speed_kmh: f64) -> Self {
        Self {
            speed_mps: (speed_kmh.max(1.0)) / 3.6,
            confidence: Confidence::High,
        }
    }

    /// Estimates used when the real provider cannot answer
    pub fn fallback(speed_kmh: f64) -> Self {
        Self {
            confidence: Confidence::Low,
            ..Self::new(speed_kmh)
        }
    }

    pub fn estimate(&self, from: &GeoPoint, to: &GeoPoint) -> TravelEstimate {
        let distance_m = from.haversine_m(to) * ROAD_DETOUR_FACTOR;
        TravelEstimate {
            distance_m,
            duration_s: distance_m / self.speed_mps,
            confidence: self.confidence,
        }
    }

    pub fn rows(&self, origins: &[GeoPoint], destinations: &[GeoPoint]) -> EstimateRows {
        origins
            .iter()
            .map(|o| destinations.iter().map(|d| Some(self.estimate(o, d))).collect())
            .collect()
    }
}

#[async_trait]
impl DistanceProvider for StraightLineProvider {
    fn name(&self) -> &'static str {
        "straight_line"
    }

    async fn matrix(
        &self,
        origins: &[GeoPoint],
        destinations: &[GeoPoint],
    ) -> Result<EstimateRows, ProviderError> {
        Ok(self.rows(origins, destinations))
    }
}

/// Square travel matrix over one planning batch
///
/// Points are addressed by index. Built once, then shared read-only by every
/// builder invocation of the batch.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    points: Vec<GeoPoint>,
    cells: Vec<TravelEstimate>,
    low_confidence: bool,
}

impl DistanceMatrix {
    /// Ask the provider for all pairs; gaps are filled with straight-line
    /// estimates flagged low-confidence
    pub async fn build(
        provider: &dyn DistanceProvider,
        points: Vec<GeoPoint>,
        fallback_speed_kmh: f64,
    ) -> Result<Self, ProviderError> {
        let rows = provider.matrix(&points, &points).await?;
        if rows.len() != points.len() || rows.iter().any(|r| r.len() != points.len()) {
            return Err(ProviderError::BadResponse(format!(
                "expected {n}x{n} matrix from {}",
                provider.name(),
                n = points.len()
            )));
        }
        let fallback = StraightLineProvider::fallback(fallback_speed_kmh);
        Ok(Self::from_rows(points, rows, &fallback))
    }

    /// Straight-line matrix, no provider involved
    pub fn straight_line(points: Vec<GeoPoint>, speed_kmh: f64) -> Self {
        let provider = StraightLineProvider::new(speed_kmh);
        let rows = provider.rows(&points, &points);
        Self::from_rows(points, rows, &provider)
    }

    fn from_rows(points: Vec<GeoPoint>, rows: EstimateRows, fallback: &StraightLineProvider) -> Self {
        let n = points.len();
        let mut cells = Vec::with_capacity(n * n);
        let mut low_confidence = false;
        for (i, row) in rows.into_iter().enumerate() {
            for (j, cell) in row.into_iter().enumerate() {
                let estimate = match cell {
                    _ if i == j => TravelEstimate::ZERO,
                    Some(estimate) => estimate,
                    None => fallback.estimate(&points[i], &points[j]),
                };
                low_confidence |= estimate.confidence == Confidence::Low;
                cells.push(estimate);
            }
        }
        Self {
            points,
            cells,
            low_confidence,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> GeoPoint {
        self.points[index]
    }

    pub fn get(&self, from: usize, to: usize) -> TravelEstimate {
        self.cells[from * self.points.len() + to]
    }

    pub fn duration_s(&self, from: usize, to: usize) -> f64 {
        self.get(from, to).duration_s
    }

    pub fn distance_m(&self, from: usize, to: usize) -> f64 {
        self.get(from, to).distance_m
    }

    /// Any cell came from the fallback
    pub fn is_low_confidence(&self) -> bool {
        self.low_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PartialProvider;

    #[async_trait]
    impl DistanceProvider for PartialProvider {
        fn name(&self) -> &'static str {
            "partial"
        }

        async fn matrix(
            &self,
            origins: &[GeoPoint],
            destinations: &[GeoPoint],
        ) -> Result<EstimateRows, ProviderError> {
            Ok(origins
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    destinations
                        .iter()
                        .enumerate()
                        .map(|(j, _)| {
                            (i + j != 1).then_some(TravelEstimate {
                                distance_m: 100.0,
                                duration_s: 10.0,
                                confidence: Confidence::High,
                            })
                        })
                        .collect()
                })
                .collect())
        }
    }

    fn points() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(40.0, -3.0),
            GeoPoint::new(40.01, -3.0),
            GeoPoint::new(40.02, -3.01),
        ]
    }

    #[tokio::test]
    async fn test_missing_cells_fall_back_low_confidence() {
        let matrix = DistanceMatrix::build(&PartialProvider, points(), 36.0)
            .await
            .unwrap();
        assert!(matrix.is_low_confidence());
        assert_eq!(matrix.get(0, 1).confidence, Confidence::Low);
        assert_eq!(matrix.get(0, 2).duration_s, 10.0);
        assert_eq!(matrix.duration_s(1, 1), 0.0);
    }

    #[test]
    fn test_straight_line_speed() {
        let provider = StraightLineProvider::new(36.0);
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.01);
        let estimate = provider.estimate(&a, &b);
        // 36 km/h = 10 m/s
        assert!((estimate.duration_s - estimate.distance_m / 10.0).abs() < 1e-9);
        assert_eq!(estimate.confidence, Confidence::High);
    }

    #[test]
    fn test_straight_line_matrix_is_high_confidence() {
        let matrix = DistanceMatrix::straight_line(points(), 30.0);
        assert!(!matrix.is_low_confidence());
        assert_eq!(matrix.len(), 3);
        assert!(matrix.distance_m(0, 2) > matrix.distance_m(0, 1));
    }
}
