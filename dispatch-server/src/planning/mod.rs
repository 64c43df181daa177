//! Route planning
//!
//! - **distance**: provider interface and the per-batch travel matrix
//! - **provider_http**: reqwest-backed provider with retry and fallback
//! - **cluster**: geographic grouping of a day's orders, one group per vehicle
//! - **schedule**: timing of a stop sequence against windows and shift
//! - **builder**: greedy insertion plus local search, and partial re-planning
//! - **planner**: full planning run for a date, feeding the state machine
//! - **reoptimizer**: urgent insertion and failed-stop refresh on live routes
//! - **refresh**: worker re-timing routes as stops fail
//!
//! # Data Flow
//!
//! ```text
//! Repository ──► cluster_orders ──► DistanceMatrix ──► RouteBuilder ──► DispatchCommand
//!                                        ▲
//!                                 DistanceProvider
//! ```

pub mod builder;
pub mod cluster;
pub mod distance;
pub mod error;
pub mod planner;
pub mod provider_http;
pub mod refresh;
pub mod reoptimizer;
pub mod schedule;

pub use builder::{BuildOutcome, Budget, RouteBuilder};
pub use cluster::{Cluster, ClusterResult, ClusterSettings, cluster_orders};
pub use distance::{
    Confidence, DistanceMatrix, DistanceProvider, ProviderError, StraightLineProvider,
    TravelEstimate, TripPlan,
};
pub use error::{PlanningError, Unassignable, UnassignableReason};
pub use planner::{PlanReport, PlannedRoute, Planner};
pub use provider_http::HttpDistanceProvider;
pub use refresh::RefreshWorker;
pub use reoptimizer::{RefreshOutcome, Reoptimizer, UrgentPlacement};
pub use schedule::{Evaluation, RouteContext, Visit};

/// Route builder tuning
#[derive(Debug, Clone, Copy)]
pub struct BuilderSettings {
    /// Time spent at each stop
    pub service_time_s: f64,
    /// Swap/2-opt passes after the greedy build
    pub max_local_search_passes: u32,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            service_time_s: 300.0,
            max_local_search_passes: 4,
        }
    }
}

/// Everything a planning run needs besides its inputs
#[derive(Debug, Clone, Copy)]
pub struct PlanningSettings {
    pub cluster: ClusterSettings,
    pub builder: BuilderSettings,
    /// Speed for straight-line estimates
    pub fallback_speed_kmh: f64,
}

impl Default for PlanningSettings {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings::default(),
            builder: BuilderSettings::default(),
            fallback_speed_kmh: 35.0,
        }
    }
}
