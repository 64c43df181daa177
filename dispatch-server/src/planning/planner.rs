//! Planning run for one date
//!
//! Reads the day's unassigned orders and the available vehicles through the
//! [`Repository`], clusters them, builds one route per cluster on a shared
//! travel matrix and hands each route to the state machine (`CreateRoute`
//! then `AssignVehicle`). Order status follows from the resulting events.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shared::models::{GeoPoint, Order, Vehicle};
use shared::route::{CommandPayload, DispatchCommand, EventOrigin, PlannedStop};

use super::builder::{BuildOutcome, Budget, RouteBuilder};
use super::cluster::{Cluster, cluster_orders};
use super::distance::{DistanceMatrix, DistanceProvider, StraightLineProvider};
use super::error::{PlanningError, Unassignable, UnassignableReason};
use super::schedule::{RouteContext, Visit};
use super::{BuilderSettings, PlanningSettings};
use crate::dispatch::{DispatchManager, OrderFilter, Repository};

const PLANNER_ACTOR: &str = "planner";

/// One route created by a planning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedRoute {
    pub route_id: String,
    pub vehicle_id: String,
    pub order_ids: Vec<String>,
    pub estimated_distance_m: f64,
    pub estimated_duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polyline: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Result of a planning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub planning_date: NaiveDate,
    pub routes: Vec<PlannedRoute>,
    pub unassignable: Vec<Unassignable>,
    /// Some travel estimates came from the straight-line fallback
    pub low_confidence: bool,
}

impl PlanReport {
    fn empty(planning_date: NaiveDate) -> Self {
        Self {
            planning_date,
            routes: vec![],
            unassignable: vec![],
            low_confidence: false,
        }
    }
}

/// Builder input for one cluster, owned so it can move to a blocking task
struct Job {
    vehicle: Vehicle,
    start_node: usize,
    visits: Vec<Visit>,
    orders: Vec<Order>,
}

impl Job {
    fn context<'a>(&self, matrix: &'a DistanceMatrix, service_time_s: f64) -> RouteContext<'a> {
        RouteContext {
            matrix,
            start_node: self.start_node,
            start_time_ms: self.vehicle.shift.start,
            shift_end_ms: self.vehicle.shift.end,
            capacity: self.vehicle.capacity,
            base_load: 0,
            service_time_s,
        }
    }
}

/// Planning run entry point
#[derive(Clone)]
pub struct Planner {
    manager: DispatchManager,
    repo: Arc<dyn Repository>,
    provider: Arc<dyn DistanceProvider>,
    settings: PlanningSettings,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("provider", &self.provider.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Planner {
    pub fn new(
        manager: DispatchManager,
        repo: Arc<dyn Repository>,
        provider: Arc<dyn DistanceProvider>,
        settings: PlanningSettings,
    ) -> Self {
        Self {
            manager,
            repo,
            provider,
            settings,
        }
    }

    /// Plan every unassigned order of `date`
    ///
    /// Vehicles already driving a live route of that date are left out.
    /// Without any vehicle the run fails with a configuration error and no
    /// route is created.
    pub async fn plan(&self, date: NaiveDate) -> Result<PlanReport, PlanningError> {
        let orders = self.repo.find_orders(OrderFilter::unassigned_on(date))?;
        if orders.is_empty() {
            tracing::info!(%date, "Nothing to plan");
            return Ok(PlanReport::empty(date));
        }

        let busy: HashSet<String> = self
            .repo
            .find_routes(Some(date))?
            .into_iter()
            .filter(|r| r.is_active())
            .map(|r| r.vehicle_id)
            .collect();
        let vehicles: Vec<Vehicle> = self
            .repo
            .find_vehicles()?
            .into_iter()
            .filter(|v| v.available && !busy.contains(&v.id))
            .collect();

        tracing::info!(
            %date,
            orders = orders.len(),
            vehicles = vehicles.len(),
            "Planning run started"
        );

        let clustered = cluster_orders(&orders, &vehicles, &self.settings.cluster)?;
        let mut report = PlanReport::empty(date);
        report.unassignable = clustered.unassignable;
        if clustered.clusters.is_empty() {
            return Ok(report);
        }

        // Matrix over all vehicle starts, then all clustered orders
        let (points, jobs) = layout(clustered.clusters);
        let matrix = Arc::new(self.matrix(points).await?);
        report.low_confidence = matrix.is_low_confidence();

        let handles = jobs.into_iter().map(|job| {
            let matrix = matrix.clone();
            let settings = self.settings.builder;
            tokio::task::spawn_blocking(move || {
                let outcome =
                    RouteBuilder::new(job.context(&matrix, settings.service_time_s), settings)
                        .build(job.visits.clone());
                (job, outcome)
            })
        });
        let mut built = Vec::new();
        for result in join_all(handles).await {
            built.push(result?);
        }
        let matrix_ref = matrix.clone();
        let settings = self.settings.builder;
        let built = tokio::task::spawn_blocking(move || {
            redistribute(&mut built, &matrix_ref, settings);
            built
        })
        .await?;

        for (job, outcome) in built {
            report.unassignable.extend(outcome.unassignable.iter().cloned());
            if outcome.sequence.is_empty() {
                continue;
            }
            match self.commit_route(date, &job, &outcome, &matrix) {
                Ok(route) => report.routes.push(route),
                Err(err) => {
                    tracing::warn!(vehicle_id = %job.vehicle.id, error = %err, "Route rejected by dispatch");
                    let detail = err.to_string();
                    report.unassignable.extend(outcome.sequence.iter().map(|v| {
                        Unassignable::new(&v.order_id, UnassignableReason::NoFeasibleSlot)
                            .with_detail(detail.clone())
                    }));
                }
            }
        }

        for route in &mut report.routes {
            self.attach_trip(route, &matrix).await;
        }

        report.routes.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        tracing::info!(
            %date,
            routes = report.routes.len(),
            unassignable = report.unassignable.len(),
            low_confidence = report.low_confidence,
            "Planning run finished"
        );
        Ok(report)
    }

    async fn matrix(&self, points: Vec<GeoPoint>) -> Result<DistanceMatrix, PlanningError> {
        let speed = self.settings.fallback_speed_kmh;
        match DistanceMatrix::build(self.provider.as_ref(), points.clone(), speed).await {
            Ok(matrix) => Ok(matrix),
            Err(e) => {
                tracing::warn!(provider = self.provider.name(), error = %e, "Falling back to straight-line matrix");
                let fallback = StraightLineProvider::fallback(speed);
                Ok(DistanceMatrix::build(&fallback, points, speed).await?)
            }
        }
    }

    /// Create and assign one route through the state machine
    fn commit_route(
        &self,
        date: NaiveDate,
        job: &Job,
        outcome: &BuildOutcome,
        matrix: &DistanceMatrix,
    ) -> Result<PlannedRoute, PlanningError> {
        let route_id = format!(
            "route-{}-{}-{}",
            date.format("%Y%m%d"),
            job.vehicle.id,
            &shared::util::new_id()[..8]
        );

        let stops: Vec<PlannedStop> = outcome
            .sequence
            .iter()
            .zip(&outcome.evaluation.arrivals)
            .filter_map(|(visit, arrival)| {
                let order = job.orders.iter().find(|o| o.id == visit.order_id)?;
                Some(PlannedStop {
                    order_id: order.id.clone(),
                    location: matrix.point(visit.node),
                    demand: order.demand,
                    priority: order.priority,
                    time_window: order.time_window,
                    planned_arrival: Some(*arrival),
                })
            })
            .collect();

        let create = DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::CreateRoute {
                route_id: route_id.clone(),
                vehicle_id: job.vehicle.id.clone(),
                planning_date: date,
                capacity: job.vehicle.capacity,
                stops: stops.clone(),
                estimated_distance_m: outcome.evaluation.distance_m,
                estimated_duration_s: outcome.evaluation.duration_s,
            },
        )
        .with_actor(PLANNER_ACTOR);
        let resp = self.manager.execute_command(create);
        if let Some(err) = resp.error {
            return Err(PlanningError::Dispatch(err));
        }

        let assign = DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::AssignVehicle {
                route_id: route_id.clone(),
                vehicle_id: job.vehicle.id.clone(),
                capacity: job.vehicle.capacity,
            },
        )
        .with_actor(PLANNER_ACTOR);
        let resp = self.manager.execute_command(assign);
        if let Some(err) = resp.error {
            // The route exists; leave it planned for the dispatcher
            tracing::warn!(route_id = %route_id, error = %err.message, "Vehicle assignment failed");
        }

        Ok(PlannedRoute {
            route_id,
            vehicle_id: job.vehicle.id.clone(),
            order_ids: stops.into_iter().map(|s| s.order_id).collect(),
            estimated_distance_m: outcome.evaluation.distance_m,
            estimated_duration_s: outcome.evaluation.duration_s,
            polyline: None,
            warnings: vec![],
        })
    }

    /// Best-effort provider trip: polyline and warnings only, the sequence
    /// stays the builder's
    async fn attach_trip(&self, route: &mut PlannedRoute, matrix: &DistanceMatrix) {
        let Ok(Some(snapshot)) = self.manager.get_snapshot(&route.route_id) else {
            return;
        };
        let mut waypoints = Vec::with_capacity(snapshot.stops.len() + 1);
        if let Ok(Some(vehicle)) = self.repo.find_vehicle(&route.vehicle_id) {
            waypoints.push(vehicle.start_location());
        }
        waypoints.extend(snapshot.stops.iter().map(|s| s.location));

        match self.provider.optimize_trip(&waypoints).await {
            Ok(Some(trip)) => {
                route.polyline = trip.polyline;
                route.warnings = trip.warnings;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(route_id = %route.route_id, error = %e, "Trip optimization unavailable");
                route.warnings.push(format!("trip optimization unavailable: {e}"));
            }
        }
        if matrix.is_low_confidence() {
            route.warnings.push("travel estimates are straight-line fallbacks".to_string());
        }
    }
}

/// Offer orders a cluster's builder refused to the other routes of the run
///
/// Each goes where it adds the least travel time; only orders no route can
/// take stay unassignable.
fn redistribute(
    built: &mut [(Job, BuildOutcome)],
    matrix: &DistanceMatrix,
    settings: BuilderSettings,
) {
    for from in 0..built.len() {
        let rejected = std::mem::take(&mut built[from].1.unassignable);
        let mut kept = Vec::with_capacity(rejected.len());

        for rejection in rejected {
            let movable = matches!(
                rejection.reason,
                UnassignableReason::NoFeasibleSlot | UnassignableReason::NoCapacityLeft
            );
            let visit = built[from]
                .0
                .visits
                .iter()
                .find(|v| v.order_id == rejection.order_id)
                .cloned();
            let (true, Some(visit)) = (movable, visit) else {
                kept.push(rejection);
                continue;
            };

            let mut best: Option<(usize, BuildOutcome, f64)> = None;
            for (to, (job, outcome)) in built.iter().enumerate() {
                if to == from {
                    continue;
                }
                let trial = RouteBuilder::new(job.context(matrix, settings.service_time_s), settings)
                    .reoptimize(
                        Vec::new(),
                        outcome.sequence.clone(),
                        vec![visit.clone()],
                        &Budget::unbounded(),
                    );
                if !trial.placed(&visit.order_id) {
                    continue;
                }
                let added_s = trial.evaluation.duration_s - outcome.evaluation.duration_s;
                if best.as_ref().is_none_or(|(_, _, cost)| added_s < *cost) {
                    best = Some((to, trial, added_s));
                }
            }

            let Some((to, trial, added_s)) = best else {
                kept.push(rejection);
                continue;
            };
            tracing::debug!(
                order_id = %visit.order_id,
                from = %built[from].0.vehicle.id,
                to = %built[to].0.vehicle.id,
                added_s,
                "Order moved to another route"
            );
            let order = built[from]
                .0
                .orders
                .iter()
                .find(|o| o.id == visit.order_id)
                .cloned();
            let (job, outcome) = &mut built[to];
            job.visits.push(visit);
            job.orders.extend(order);
            outcome.sequence = trial.sequence;
            outcome.evaluation = trial.evaluation;
        }
        built[from].1.unassignable = kept;
    }
}

/// Assign matrix nodes: vehicle starts first, then each cluster's orders
fn layout(clusters: Vec<Cluster>) -> (Vec<GeoPoint>, Vec<Job>) {
    let mut points: Vec<GeoPoint> = clusters.iter().map(|c| c.vehicle.start_location()).collect();
    let mut jobs = Vec::with_capacity(clusters.len());

    for (start_node, cluster) in clusters.into_iter().enumerate() {
        let visits = cluster
            .orders
            .iter()
            .map(|order| {
                points.push(order.location);
                Visit {
                    order_id: order.id.clone(),
                    node: points.len() - 1,
                    demand: order.demand,
                    priority: order.priority,
                    window: order.time_window,
                }
            })
            .collect();
        jobs.push(Job {
            vehicle: cluster.vehicle,
            start_node,
            visits,
            orders: cluster.orders,
        });
    }
    (points, jobs)
}
