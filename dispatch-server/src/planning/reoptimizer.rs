//! Partial re-optimization of live routes
//!
//! Two triggers:
//!
//! - an urgent order arrives after planning: every live route of its day is
//!   tried, the stop goes where it adds the least travel time, and only the
//!   pending tail of that route may change
//! - a stop fails: the rest of the route is re-timed from the vehicle's
//!   position and stops that can no longer meet their window are reported
//!
//! Requests on the same route follow last-request-wins. Starting a new run
//! cancels the token of the one in flight; the older run returns
//! `Superseded` and commits nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shared::models::{GeoPoint, Order, Vehicle};
use shared::route::{
    CommandPayload, DispatchCommand, EventOrigin, PlannedArrival, PlannedStop, RouteSnapshot,
    RouteStatus, StopInsertion,
};
use shared::util::now_millis;
use tokio_util::sync::CancellationToken;

use super::builder::{BuildOutcome, Budget, RouteBuilder};
use super::distance::{DistanceMatrix, DistanceProvider};
use super::error::{PlanningError, Unassignable, UnassignableReason};
use super::schedule::{Evaluation, RouteContext, Visit};
use super::PlanningSettings;
use crate::dispatch::{DispatchManager, Repository};

const REOPTIMIZER_ACTOR: &str = "reoptimizer";

/// Result of an urgent insertion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UrgentPlacement {
    Inserted {
        route_id: String,
        /// Index of the new stop in the route
        position: u32,
        /// Travel time the detour adds to the route
        added_duration_s: f64,
        /// Budget ran out; the placement is the best found so far
        timed_out: bool,
    },
    /// No live route can take the order; nothing was changed
    Unassignable(Unassignable),
}

/// Result of re-timing a route after a failed stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub route_id: String,
    /// Pending stops that can no longer be reached inside their window
    pub infeasible: Vec<String>,
    /// New ETAs were written to the route
    pub sequence_refreshed: bool,
}

/// Timing inputs for the remaining part of one route
struct Tail {
    /// Vehicle position, then the route's non-terminal stops
    points: Vec<GeoPoint>,
    /// Non-terminal stops the driver has already touched
    fixed: Vec<Visit>,
    /// Pending stops after the locked prefix
    seed: Vec<Visit>,
    start_time_ms: i64,
    shift_end_ms: i64,
    capacity: u32,
    /// Demand of stops already settled
    base_load: u32,
}

impl Tail {
    fn of(route: &RouteSnapshot, vehicle: Option<&Vehicle>, now: i64) -> Self {
        let start = route
            .last_location
            .or_else(|| vehicle.map(Vehicle::start_location))
            .or_else(|| route.stops.first().map(|s| s.location))
            .unwrap_or(GeoPoint::new(0.0, 0.0));
        let start_time_ms = match (route.status, vehicle) {
            (RouteStatus::InProgress, _) | (_, None) => now,
            (_, Some(v)) => now.max(v.shift.start),
        };

        let locked = route.locked_prefix_len();
        let mut tail = Self {
            points: vec![start],
            fixed: vec![],
            seed: vec![],
            start_time_ms,
            shift_end_ms: vehicle.map(|v| v.shift.end).unwrap_or(i64::MAX),
            capacity: route.capacity,
            base_load: 0,
        };
        for (i, stop) in route.stops.iter().enumerate() {
            if stop.is_terminal() {
                tail.base_load += stop.demand;
                continue;
            }
            tail.points.push(stop.location);
            let visit = Visit {
                order_id: stop.order_id.clone(),
                node: tail.points.len() - 1,
                demand: stop.demand,
                priority: stop.priority,
                window: stop.time_window,
            };
            if i < locked {
                tail.fixed.push(visit);
            } else {
                tail.seed.push(visit);
            }
        }
        tail
    }

    fn context<'a>(&self, matrix: &'a DistanceMatrix, service_time_s: f64) -> RouteContext<'a> {
        RouteContext {
            matrix,
            start_node: 0,
            start_time_ms: self.start_time_ms,
            shift_end_ms: self.shift_end_ms,
            capacity: self.capacity,
            base_load: self.base_load,
            service_time_s,
        }
    }
}

/// Evaluation of one candidate route
enum Attempt {
    Placed {
        route: RouteSnapshot,
        outcome: BuildOutcome,
        fixed_len: usize,
        added_duration_s: f64,
    },
    Rejected(String, UnassignableReason),
    Superseded(String),
}

/// Registration of one in-flight evaluation
struct Run {
    route_id: String,
    generation: u64,
    token: CancellationToken,
}

struct Inner {
    manager: DispatchManager,
    repo: Arc<dyn Repository>,
    provider: Arc<dyn DistanceProvider>,
    settings: PlanningSettings,
    budget: Duration,
    /// Route id -> (generation, token) of the run in flight
    inflight: DashMap<String, (u64, CancellationToken)>,
    generation: AtomicU64,
}

/// Live-route re-optimizer (cheap to clone)
#[derive(Clone)]
pub struct Reoptimizer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Reoptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reoptimizer")
            .field("budget", &self.inner.budget)
            .field("inflight", &self.inner.inflight.len())
            .finish()
    }
}

impl Reoptimizer {
    pub fn new(
        manager: DispatchManager,
        repo: Arc<dyn Repository>,
        provider: Arc<dyn DistanceProvider>,
        settings: PlanningSettings,
        budget: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                repo,
                provider,
                settings,
                budget,
                inflight: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register a run on `route_id`, cancelling the one in flight
    fn begin(&self, route_id: &str) -> (u64, CancellationToken) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        if let Some((_, (old, previous))) = self.inner.inflight.remove(route_id) {
            tracing::debug!(route_id = %route_id, superseded = old, generation, "Superseding re-optimization");
            previous.cancel();
        }
        self.inner
            .inflight
            .insert(route_id.to_string(), (generation, token.clone()));
        (generation, token)
    }

    /// Drop the registration unless a newer run replaced it
    fn finish(&self, route_id: &str, generation: u64) {
        self.inner
            .inflight
            .remove_if(route_id, |_, (current, _)| *current == generation);
    }

    /// Place an urgent order into the live route where it costs the least
    ///
    /// When no route can take it the order is reported unassignable and no
    /// route changes.
    pub async fn insert_urgent(&self, order_id: &str) -> Result<UrgentPlacement, PlanningError> {
        let inner = &self.inner;
        let order = inner
            .repo
            .find_order(order_id)?
            .ok_or_else(|| PlanningError::OrderNotFound(order_id.to_string()))?;
        if inner.manager.storage().route_for_order(order_id)?.is_some() {
            return Err(PlanningError::AlreadyRouted(order_id.to_string()));
        }
        if let Err(reason) = order.validate() {
            return Ok(UrgentPlacement::Unassignable(
                Unassignable::new(order_id, UnassignableReason::InvalidOrder).with_detail(reason),
            ));
        }

        let candidates: Vec<RouteSnapshot> = inner
            .manager
            .get_active_routes()?
            .into_iter()
            .filter(|r| r.planning_date == order.planning_date)
            .collect();
        if candidates.is_empty() {
            return Ok(UrgentPlacement::Unassignable(Unassignable::new(
                order_id,
                UnassignableReason::NoActiveRoute,
            )));
        }

        let (runs, attempts) = self.evaluate_candidates(&order, candidates).await;
        let result = self.settle(&order, attempts, &runs);
        self.release(&runs);
        result
    }

    /// Register a run on every candidate and evaluate them side by side
    async fn evaluate_candidates(
        &self,
        order: &Order,
        candidates: Vec<RouteSnapshot>,
    ) -> (Vec<Run>, Vec<Attempt>) {
        let deadline = Instant::now() + self.inner.budget;
        let runs: Vec<Run> = candidates
            .iter()
            .map(|r| {
                let (generation, token) = self.begin(&r.route_id);
                Run {
                    route_id: r.route_id.clone(),
                    generation,
                    token,
                }
            })
            .collect();

        let attempts = join_all(candidates.into_iter().zip(&runs).map(|(route, run)| {
            let budget = Budget::new(deadline, run.token.clone());
            self.attempt(route, order, budget)
        }))
        .await;
        (runs, attempts)
    }

    fn release(&self, runs: &[Run]) {
        for run in runs {
            self.finish(&run.route_id, run.generation);
        }
    }

    /// Run the builder for one candidate route
    async fn attempt(&self, route: RouteSnapshot, order: &Order, budget: Budget) -> Attempt {
        let route_id = route.route_id.clone();
        let vehicle = match self.inner.repo.find_vehicle(&route.vehicle_id) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(route_id = %route_id, error = %e, "Vehicle lookup failed");
                None
            }
        };
        let mut tail = Tail::of(&route, vehicle.as_ref(), now_millis());
        tail.points.push(order.location);
        let delta = vec![Visit {
            order_id: order.id.clone(),
            node: tail.points.len() - 1,
            demand: order.demand,
            priority: order.priority,
            window: order.time_window,
        }];

        let matrix = self.matrix(std::mem::take(&mut tail.points)).await;
        let settings = self.inner.settings.builder;
        let task = tokio::task::spawn_blocking(move || {
            let builder = RouteBuilder::new(tail.context(&matrix, settings.service_time_s), settings);
            let mut current = tail.fixed.clone();
            current.extend(tail.seed.iter().cloned());
            let baseline: Evaluation = builder.evaluate(&current);
            let fixed_len = tail.fixed.len();
            let outcome = builder.reoptimize(tail.fixed, tail.seed, delta, &budget);
            (outcome, baseline, fixed_len)
        });

        let (outcome, baseline, fixed_len) = match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(route_id = %route_id, error = %e, "Re-optimization task failed");
                return Attempt::Rejected(route_id, UnassignableReason::NoFeasibleSlot);
            }
        };

        if outcome.cancelled {
            return Attempt::Superseded(route_id);
        }
        if !outcome.placed(&order.id) {
            let reason = outcome
                .unassignable
                .first()
                .map(|u| u.reason)
                .unwrap_or(UnassignableReason::NoFeasibleSlot);
            return Attempt::Rejected(route_id, reason);
        }
        Attempt::Placed {
            added_duration_s: outcome.evaluation.duration_s - baseline.duration_s,
            route,
            outcome,
            fixed_len,
        }
    }

    /// Pick the cheapest placement and commit it
    fn settle(
        &self,
        order: &Order,
        attempts: Vec<Attempt>,
        runs: &[Run],
    ) -> Result<UrgentPlacement, PlanningError> {
        let mut best: Option<(RouteSnapshot, BuildOutcome, usize, f64)> = None;
        let mut rejections: Vec<(String, UnassignableReason)> = Vec::new();
        let mut superseded: Vec<String> = Vec::new();

        for attempt in attempts {
            match attempt {
                Attempt::Placed {
                    route,
                    outcome,
                    fixed_len,
                    added_duration_s,
                } => {
                    let better = best.as_ref().is_none_or(|(b, _, _, cost)| {
                        added_duration_s < *cost
                            || (added_duration_s == *cost && route.route_id < b.route_id)
                    });
                    if better {
                        best = Some((route, outcome, fixed_len, added_duration_s));
                    }
                }
                Attempt::Rejected(route_id, reason) => rejections.push((route_id, reason)),
                Attempt::Superseded(route_id) => superseded.push(route_id),
            }
        }

        let Some((route, outcome, fixed_len, added_duration_s)) = best else {
            // A superseded route was never fully evaluated
            if let Some(route_id) = superseded.into_iter().next() {
                return Err(PlanningError::Superseded(route_id));
            }
            let unassignable = rejection(&order.id, &rejections);
            tracing::info!(
                order_id = %order.id,
                reason = ?unassignable.reason,
                "Urgent order could not be placed"
            );
            return Ok(UrgentPlacement::Unassignable(unassignable));
        };

        // A newer request took this route while we were evaluating
        if runs
            .iter()
            .any(|r| r.route_id == route.route_id && r.token.is_cancelled())
        {
            return Err(PlanningError::Superseded(route.route_id));
        }

        let placed_at = outcome
            .sequence
            .iter()
            .position(|v| v.order_id == order.id)
            .unwrap_or(outcome.sequence.len());
        let locked = route.locked_prefix_len();
        let position = locked + placed_at.saturating_sub(fixed_len);

        let arrivals: HashMap<&str, i64> = outcome
            .sequence
            .iter()
            .zip(&outcome.evaluation.arrivals)
            .map(|(v, at)| (v.order_id.as_str(), *at))
            .collect();
        let mut order_ids: Vec<&str> = route.stops.iter().map(|s| s.order_id.as_str()).collect();
        order_ids.insert(position.min(order_ids.len()), order.id.as_str());
        let planned_arrivals: Vec<PlannedArrival> = order_ids
            .iter()
            .map(|id| PlannedArrival {
                order_id: id.to_string(),
                planned_arrival: arrivals
                    .get(id)
                    .copied()
                    .or_else(|| route.stop(id).and_then(|s| s.planned_arrival)),
            })
            .collect();

        let stop = PlannedStop {
            order_id: order.id.clone(),
            location: order.location,
            demand: order.demand,
            priority: order.priority,
            time_window: order.time_window,
            planned_arrival: arrivals.get(order.id.as_str()).copied(),
        };
        let cmd = DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::InsertStops {
                route_id: route.route_id.clone(),
                insertions: vec![StopInsertion {
                    stop,
                    position: position as u32,
                }],
                planned_arrivals,
            },
        )
        .with_actor(REOPTIMIZER_ACTOR)
        .with_observed_sequence(route.last_sequence);
        let resp = self.inner.manager.execute_command(cmd);
        if let Some(err) = resp.error {
            return Err(PlanningError::Dispatch(err));
        }

        tracing::info!(
            order_id = %order.id,
            route_id = %route.route_id,
            position,
            added_duration_s,
            timed_out = outcome.timed_out,
            "Urgent order inserted"
        );
        Ok(UrgentPlacement::Inserted {
            route_id: route.route_id,
            position: position as u32,
            added_duration_s,
            timed_out: outcome.timed_out,
        })
    }

    /// Re-time the rest of a route after a stop failed
    ///
    /// Pending stops keep their order; their ETAs are recomputed from where
    /// the vehicle is now.
    pub async fn refresh_after_failure(&self, route_id: &str) -> Result<RefreshOutcome, PlanningError> {
        let inner = &self.inner;
        let mut result = RefreshOutcome {
            route_id: route_id.to_string(),
            infeasible: vec![],
            sequence_refreshed: false,
        };
        let Some(route) = inner.manager.get_snapshot(route_id)? else {
            return Ok(result);
        };
        if !route.is_active() || route.pending_count() == 0 {
            return Ok(result);
        }

        let vehicle = inner.repo.find_vehicle(&route.vehicle_id)?;
        let mut tail = Tail::of(&route, vehicle.as_ref(), now_millis());
        let matrix = self.matrix(std::mem::take(&mut tail.points)).await;
        let mut visits = std::mem::take(&mut tail.fixed);
        visits.append(&mut tail.seed);
        let evaluation = RouteBuilder::new(
            tail.context(&matrix, inner.settings.builder.service_time_s),
            inner.settings.builder,
        )
        .evaluate(&visits);

        result.infeasible = evaluation
            .late
            .iter()
            .filter_map(|node| visits.iter().find(|v| v.node == *node))
            .map(|v| v.order_id.clone())
            .collect();

        let arrivals: HashMap<&str, i64> = visits
            .iter()
            .zip(&evaluation.arrivals)
            .map(|(v, at)| (v.order_id.as_str(), *at))
            .collect();
        let sequence: Vec<PlannedArrival> = route
            .stops
            .iter()
            .map(|s| PlannedArrival {
                order_id: s.order_id.clone(),
                planned_arrival: arrivals
                    .get(s.order_id.as_str())
                    .copied()
                    .or(s.planned_arrival),
            })
            .collect();

        let cmd = DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::ResequenceStops {
                route_id: route_id.to_string(),
                sequence,
                estimated_distance_m: evaluation.distance_m,
                estimated_duration_s: evaluation.duration_s,
            },
        )
        .with_actor(REOPTIMIZER_ACTOR)
        .with_observed_sequence(route.last_sequence);
        let resp = inner.manager.execute_command(cmd);
        match resp.error {
            None => result.sequence_refreshed = true,
            // The route moved on meanwhile; the next failure refreshes again
            Some(err) => {
                tracing::warn!(route_id = %route_id, error = %err.message, "ETA refresh rejected");
            }
        }

        if !result.infeasible.is_empty() {
            tracing::warn!(
                route_id = %route_id,
                infeasible = ?result.infeasible,
                "Stops can no longer meet their window"
            );
        }
        Ok(result)
    }

    async fn matrix(&self, points: Vec<GeoPoint>) -> DistanceMatrix {
        let speed = self.inner.settings.fallback_speed_kmh;
        match DistanceMatrix::build(self.inner.provider.as_ref(), points.clone(), speed).await {
            Ok(matrix) => matrix,
            Err(e) => {
                tracing::warn!(error = %e, "Provider unavailable, using straight-line estimates");
                DistanceMatrix::straight_line(points, speed)
            }
        }
    }
}

/// Collapse per-route rejections into one reason
fn rejection(order_id: &str, rejections: &[(String, UnassignableReason)]) -> Unassignable {
    let reasons = || rejections.iter().map(|(_, r)| *r);
    let reason = if reasons().any(|r| r == UnassignableReason::TimedOut) {
        UnassignableReason::TimedOut
    } else if reasons().all(|r| r == UnassignableReason::NoCapacityLeft) {
        UnassignableReason::NoCapacityLeft
    } else {
        UnassignableReason::NoFeasibleSlot
    };
    let detail = rejections
        .iter()
        .map(|(route_id, r)| format!("{route_id}: {r:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    Unassignable::new(order_id, reason).with_detail(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchStorage;
    use crate::planning::StraightLineProvider;
    use chrono::NaiveDate;
    use shared::models::{OrderStatus, PriorityTier, ShiftWindow, TimeWindow};
    use shared::error::ErrorCode;
    use shared::route::StopStatus;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn order(id: &str, lat: f64, demand: u32) -> Order {
        Order {
            id: id.to_string(),
            location: GeoPoint::new(lat, -3.7),
            demand,
            priority: PriorityTier::Urgent,
            time_window: None,
            status: OrderStatus::Unassigned,
            planning_date: date(),
            created_at: 0,
        }
    }

    fn stop(id: &str, lat: f64) -> PlannedStop {
        PlannedStop {
            order_id: id.to_string(),
            location: GeoPoint::new(lat, -3.7),
            demand: 2,
            priority: PriorityTier::Normal,
            time_window: None,
            planned_arrival: None,
        }
    }

    struct Fixture {
        storage: DispatchStorage,
        manager: DispatchManager,
        reoptimizer: Reoptimizer,
    }

    fn fixture() -> Fixture {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let manager = DispatchManager::with_storage(storage.clone());
        let reoptimizer = Reoptimizer::new(
            manager.clone(),
            Arc::new(storage.clone()),
            Arc::new(StraightLineProvider::new(35.0)),
            PlanningSettings::default(),
            Duration::from_secs(2),
        );
        Fixture {
            storage,
            manager,
            reoptimizer,
        }
    }

    impl Fixture {
        /// Live route at latitude `lat` whose three stops carry 2 units each
        fn route(&self, route_id: &str, lat: f64, capacity: u32) {
            let vehicle_id = format!("v-{route_id}");
            self.storage
                .save_vehicle(&Vehicle {
                    id: vehicle_id.clone(),
                    capacity,
                    shift: ShiftWindow::new(0, i64::MAX / 4),
                    depot: GeoPoint::new(lat, -3.7),
                    current_location: None,
                    location_updated_at: None,
                    available: true,
                })
                .unwrap();
            let stops = (0..3)
                .map(|i| stop(&format!("{route_id}-{i}"), lat + 0.01 * (i + 1) as f64))
                .collect();
            let resp = self.manager.execute_command(DispatchCommand::new(
                EventOrigin::System,
                CommandPayload::CreateRoute {
                    route_id: route_id.to_string(),
                    vehicle_id,
                    planning_date: date(),
                    capacity,
                    stops,
                    estimated_distance_m: 0.0,
                    estimated_duration_s: 0.0,
                },
            ));
            assert!(resp.success, "{:?}", resp.error);
            let resp = self.manager.execute_command(DispatchCommand::new(
                EventOrigin::Dispatcher,
                CommandPayload::AssignVehicle {
                    route_id: route_id.to_string(),
                    vehicle_id: format!("v-{route_id}"),
                    capacity,
                },
            ));
            assert!(resp.success, "{:?}", resp.error);
        }

        fn update(&self, route_id: &str, order_id: &str, status: StopStatus) {
            let resp = self.manager.execute_command(DispatchCommand::new(
                EventOrigin::Driver,
                CommandPayload::UpdateStopStatus {
                    route_id: route_id.to_string(),
                    order_id: order_id.to_string(),
                    status,
                    occurred_at: None,
                    evidence_ref: None,
                    failure_reason: None,
                },
            ));
            assert!(resp.success, "{:?}", resp.error);
        }

        fn snapshot(&self, route_id: &str) -> RouteSnapshot {
            self.manager.get_snapshot(route_id).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_urgent_order_goes_to_nearest_route() {
        let f = fixture();
        f.route("north", 41.0, 10);
        f.route("south", 39.0, 10);
        f.storage.save_order(&order("urgent", 41.015, 1)).unwrap();

        let placement = f.reoptimizer.insert_urgent("urgent").await.unwrap();
        let UrgentPlacement::Inserted { route_id, position, timed_out, .. } = placement else {
            panic!("expected an insertion, got {placement:?}");
        };
        assert_eq!(route_id, "north");
        assert!(!timed_out);

        let snapshot = f.snapshot("north");
        assert_eq!(snapshot.stops.len(), 4);
        assert_eq!(snapshot.stops[position as usize].order_id, "urgent");
        assert!(snapshot.has_contiguous_indices());
        assert!(snapshot.stops.iter().all(|s| s.planned_arrival.is_some()));
        assert_eq!(f.snapshot("south").stops.len(), 3);
        assert_eq!(
            f.storage.get_order("urgent").unwrap().unwrap().status,
            OrderStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_no_capacity_leaves_routes_untouched() {
        let f = fixture();
        f.route("r-1", 41.0, 6);
        f.route("r-2", 39.0, 6);
        f.storage.save_order(&order("urgent", 40.0, 1)).unwrap();
        let before: Vec<u64> = ["r-1", "r-2"]
            .iter()
            .map(|r| f.manager.route_sequence(r).unwrap())
            .collect();

        let placement = f.reoptimizer.insert_urgent("urgent").await.unwrap();
        let UrgentPlacement::Unassignable(unassignable) = placement else {
            panic!("expected unassignable, got {placement:?}");
        };
        assert_eq!(unassignable.reason, UnassignableReason::NoCapacityLeft);

        let after: Vec<u64> = ["r-1", "r-2"]
            .iter()
            .map(|r| f.manager.route_sequence(r).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(
            f.storage.get_order("urgent").unwrap().unwrap().status,
            OrderStatus::Unassigned
        );
    }

    #[tokio::test]
    async fn test_insertion_never_lands_before_worked_stops() {
        let f = fixture();
        f.route("r-1", 41.0, 10);
        f.update("r-1", "r-1-0", StopStatus::Completed);
        f.update("r-1", "r-1-1", StopStatus::Arrived);
        // Closest to the depot, so the cheapest slot would be first
        f.storage.save_order(&order("urgent", 41.0, 1)).unwrap();

        let placement = f.reoptimizer.insert_urgent("urgent").await.unwrap();
        let UrgentPlacement::Inserted { position, .. } = placement else {
            panic!("expected an insertion, got {placement:?}");
        };
        assert!(position >= 2);
        let snapshot = f.snapshot("r-1");
        assert_eq!(snapshot.stops[0].order_id, "r-1-0");
        assert_eq!(snapshot.stops[1].order_id, "r-1-1");
    }

    #[tokio::test]
    async fn test_routed_or_missing_orders_are_rejected() {
        let f = fixture();
        f.route("r-1", 41.0, 10);

        let err = f.reoptimizer.insert_urgent("r-1-0").await.unwrap_err();
        assert!(matches!(err, PlanningError::OrderNotFound(_)));

        f.storage.save_order(&order("urgent", 41.0, 1)).unwrap();
        f.reoptimizer.insert_urgent("urgent").await.unwrap();
        let err = f.reoptimizer.insert_urgent("urgent").await.unwrap_err();
        assert!(matches!(err, PlanningError::AlreadyRouted(_)));
    }

    #[tokio::test]
    async fn test_no_live_route() {
        let f = fixture();
        f.storage.save_order(&order("urgent", 41.0, 1)).unwrap();
        let placement = f.reoptimizer.insert_urgent("urgent").await.unwrap();
        assert_eq!(
            placement,
            UrgentPlacement::Unassignable(Unassignable::new(
                "urgent",
                UnassignableReason::NoActiveRoute
            ))
        );
    }

    #[test]
    fn test_newer_run_cancels_older() {
        let f = fixture();
        let (first, old_token) = f.reoptimizer.begin("r-1");
        let (second, new_token) = f.reoptimizer.begin("r-1");
        assert!(old_token.is_cancelled());
        assert!(!new_token.is_cancelled());

        // The stale run must not drop the newer registration
        f.reoptimizer.finish("r-1", first);
        assert!(f.reoptimizer.inner.inflight.contains_key("r-1"));
        f.reoptimizer.finish("r-1", second);
        assert!(!f.reoptimizer.inner.inflight.contains_key("r-1"));
    }

    #[tokio::test]
    async fn test_superseded_run_commits_nothing() {
        let f = fixture();
        f.route("north", 41.0, 10);
        f.storage.save_order(&order("first", 41.015, 1)).unwrap();
        f.storage.save_order(&order("second", 41.025, 1)).unwrap();
        let before = f.snapshot("north").last_sequence;

        let first = f.storage.get_order("first").unwrap().unwrap();
        let candidates = f.manager.get_active_routes().unwrap();
        let (runs, attempts) = f.reoptimizer.evaluate_candidates(&first, candidates).await;
        assert!(matches!(attempts[0], Attempt::Placed { .. }));

        // A newer request takes the route before the first one commits
        let (newer, _token) = f.reoptimizer.begin("north");
        let err = f.reoptimizer.settle(&first, attempts, &runs).unwrap_err();
        assert!(matches!(err, PlanningError::Superseded(ref r) if r == "north"));
        f.reoptimizer.release(&runs);
        assert!(f.reoptimizer.inner.inflight.contains_key("north"));
        f.reoptimizer.finish("north", newer);
        assert_eq!(f.snapshot("north").last_sequence, before);

        let placement = f.reoptimizer.insert_urgent("second").await.unwrap();
        assert!(matches!(placement, UrgentPlacement::Inserted { ref route_id, .. } if route_id == "north"));

        let snapshot = f.snapshot("north");
        assert_eq!(snapshot.last_sequence, before + 1);
        assert!(snapshot.stop("second").is_some());
        assert!(snapshot.stop("first").is_none());
        assert_eq!(
            f.storage.get_order("first").unwrap().unwrap().status,
            OrderStatus::Unassigned
        );
    }

    #[test]
    fn test_superseded_candidate_is_not_reported_unassignable() {
        let f = fixture();
        let urgent = order("urgent", 41.0, 1);
        let attempts = vec![
            Attempt::Rejected("south".to_string(), UnassignableReason::NoCapacityLeft),
            Attempt::Superseded("north".to_string()),
        ];

        let err = f.reoptimizer.settle(&urgent, attempts, &[]).unwrap_err();
        assert!(matches!(err, PlanningError::Superseded(ref r) if r == "north"));
    }

    #[tokio::test]
    async fn test_insertion_planned_on_moved_route_is_refused() {
        let f = fixture();
        f.route("north", 41.0, 10);
        f.storage.save_order(&order("urgent", 41.035, 1)).unwrap();
        let urgent = f.storage.get_order("urgent").unwrap().unwrap();

        let candidates = f.manager.get_active_routes().unwrap();
        let (runs, attempts) = f.reoptimizer.evaluate_candidates(&urgent, candidates).await;
        // The driver reports progress while the placement is being computed
        f.update("north", "north-0", StopStatus::Arrived);
        let moved = f.snapshot("north").last_sequence;

        let err = f.reoptimizer.settle(&urgent, attempts, &runs).unwrap_err();
        f.reoptimizer.release(&runs);
        match err {
            PlanningError::Dispatch(e) => assert_eq!(e.code, ErrorCode::SyncConflict),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.snapshot("north").last_sequence, moved);
        assert!(f.snapshot("north").stop("urgent").is_none());
    }

    #[tokio::test]
    async fn test_refresh_after_failure_retimes_pending_stops() {
        let f = fixture();
        f.route("r-1", 41.0, 10);
        f.update("r-1", "r-1-0", StopStatus::Failed);
        let before = f.snapshot("r-1");

        let outcome = f.reoptimizer.refresh_after_failure("r-1").await.unwrap();
        assert!(outcome.sequence_refreshed);
        assert!(outcome.infeasible.is_empty());

        let after = f.snapshot("r-1");
        assert_eq!(after.last_sequence, before.last_sequence + 1);
        let ids: Vec<&str> = after.stops.iter().map(|s| s.order_id.as_str()).collect();
        assert_eq!(ids, ["r-1-0", "r-1-1", "r-1-2"]);
        assert!(after.stops[1].planned_arrival.is_some());
        assert!(after.stops[2].planned_arrival >= after.stops[1].planned_arrival);
    }

    #[tokio::test]
    async fn test_refresh_reports_missed_windows() {
        let f = fixture();
        f.route("r-1", 41.0, 10);
        let resp = f.manager.execute_command(DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::InsertStops {
                route_id: "r-1".to_string(),
                insertions: vec![StopInsertion {
                    stop: PlannedStop {
                        time_window: Some(TimeWindow {
                            earliest: 0,
                            latest: 1_000,
                        }),
                        ..stop("expired", 41.05)
                    },
                    position: 3,
                }],
                planned_arrivals: vec![],
            },
        ));
        assert!(resp.success, "{:?}", resp.error);
        f.update("r-1", "r-1-0", StopStatus::Failed);

        let outcome = f.reoptimizer.refresh_after_failure("r-1").await.unwrap();
        assert_eq!(outcome.infeasible, ["expired"]);
        assert!(outcome.sequence_refreshed);
    }
}
