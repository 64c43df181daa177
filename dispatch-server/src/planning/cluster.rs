//! Clustering stage
//!
//! Partitions the unassigned orders of one planning date into at most
//! `vehicle_count` geographic groups, one per vehicle, each within that
//! vehicle's capacity.
//!
//! 1. k-means over coordinates, deterministic farthest-point seeding,
//!    ties broken by order id
//! 2. groups matched to vehicles, largest demand to largest capacity
//! 3. overweight groups are split by priority, then window start, then id;
//!    the remainder moves to the nearest group with room under the reserve
//!    margin, then under hard capacity, or is flagged unassignable

use std::cmp::Ordering;

use shared::models::{GeoPoint, Order, Vehicle};

use super::error::{PlanningError, Unassignable, UnassignableReason};

const MAX_KMEANS_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ClusterSettings {
    /// Share of each vehicle's capacity kept free when possible
    pub reserve_ratio: f64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self { reserve_ratio: 0.1 }
    }
}

/// Orders grouped for one vehicle
#[derive(Debug, Clone)]
pub struct Cluster {
    pub vehicle: Vehicle,
    pub orders: Vec<Order>,
}

impl Cluster {
    pub fn demand(&self) -> u32 {
        self.orders.iter().map(|o| o.demand).sum()
    }

    pub fn order_ids(&self) -> Vec<&str> {
        self.orders.iter().map(|o| o.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterResult {
    /// Non-empty groups only
    pub clusters: Vec<Cluster>,
    pub unassignable: Vec<Unassignable>,
}

/// Planning priority: urgent, scheduled, normal; then window start; then id
pub fn priority_cmp(a: &Order, b: &Order) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.window_start().cmp(&b.window_start()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Run the clustering stage
///
/// Returns `PlanningError::Configuration` listing every order when there is
/// no vehicle to plan for.
pub fn cluster_orders(
    orders: &[Order],
    vehicles: &[Vehicle],
    settings: &ClusterSettings,
) -> Result<ClusterResult, PlanningError> {
    if vehicles.is_empty() {
        return Err(PlanningError::no_vehicles(orders.iter().map(|o| o.id.clone())));
    }

    let mut vehicles: Vec<Vehicle> = vehicles.to_vec();
    vehicles.sort_by(|a, b| b.capacity.cmp(&a.capacity).then_with(|| a.id.cmp(&b.id)));
    let max_capacity = vehicles[0].capacity;

    let mut orders: Vec<Order> = orders.to_vec();
    orders.sort_by(|a, b| a.id.cmp(&b.id));

    let mut result = ClusterResult::default();
    let mut plannable = Vec::with_capacity(orders.len());
    for order in orders {
        if let Err(reason) = order.validate() {
            result
                .unassignable
                .push(Unassignable::new(&order.id, UnassignableReason::InvalidOrder).with_detail(reason));
        } else if order.demand > max_capacity {
            result.unassignable.push(
                Unassignable::new(&order.id, UnassignableReason::ExceedsVehicleCapacity)
                    .with_detail(format!("demand {} > max capacity {}", order.demand, max_capacity)),
            );
        } else {
            plannable.push(order);
        }
    }

    if plannable.is_empty() {
        return Ok(result);
    }

    let k = vehicles.len().min(plannable.len());
    let points: Vec<GeoPoint> = plannable.iter().map(|o| o.location).collect();
    let labels = kmeans(&points, k);

    let mut groups: Vec<Vec<Order>> = vec![Vec::new(); k];
    for (order, label) in plannable.into_iter().zip(labels) {
        groups[label].push(order);
    }

    // Largest demand first; stable on group index
    let mut ranked: Vec<(usize, u32)> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| (i, g.iter().map(|o| o.demand).sum()))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut slots: Vec<Slot> = Vec::with_capacity(k);
    let mut overflow: Vec<Order> = Vec::new();
    for (vehicle, (group_idx, _)) in vehicles.into_iter().zip(ranked) {
        let mut members = std::mem::take(&mut groups[group_idx]);
        let centroid = centroid(&members.iter().map(|o| o.location).collect::<Vec<_>>())
            .unwrap_or(vehicle.depot);
        let soft_limit = soft_limit(vehicle.capacity, settings.reserve_ratio);

        members.sort_by(priority_cmp);
        let mut kept = Vec::new();
        let mut load = 0u32;
        for order in members {
            if load + order.demand <= soft_limit {
                load += order.demand;
                kept.push(order);
            } else {
                overflow.push(order);
            }
        }
        slots.push(Slot {
            vehicle,
            centroid,
            soft_limit,
            load,
            orders: kept,
        });
    }

    overflow.sort_by(priority_cmp);
    for order in overflow {
        if let Some(slot) = nearest_slot(&mut slots, &order, |s| s.soft_limit) {
            slot.load += order.demand;
            slot.orders.push(order);
        } else if let Some(slot) = nearest_slot(&mut slots, &order, |s| s.vehicle.capacity) {
            slot.load += order.demand;
            slot.orders.push(order);
        } else {
            result.unassignable.push(
                Unassignable::new(&order.id, UnassignableReason::NoCapacityLeft)
                    .with_detail(format!("demand {}", order.demand)),
            );
        }
    }

    result.clusters = slots
        .into_iter()
        .filter(|s| !s.orders.is_empty())
        .map(|mut s| {
            s.orders.sort_by(priority_cmp);
            Cluster {
                vehicle: s.vehicle,
                orders: s.orders,
            }
        })
        .collect();

    tracing::debug!(
        clusters = result.clusters.len(),
        unassignable = result.unassignable.len(),
        "Clustering finished"
    );
    Ok(result)
}

struct Slot {
    vehicle: Vehicle,
    centroid: GeoPoint,
    soft_limit: u32,
    load: u32,
    orders: Vec<Order>,
}

fn soft_limit(capacity: u32, reserve_ratio: f64) -> u32 {
    let ratio = reserve_ratio.clamp(0.0, 1.0);
    ((capacity as f64) * (1.0 - ratio)).floor() as u32
}

/// Closest slot whose `limit` still fits the order; ties by vehicle id
fn nearest_slot<'a>(
    slots: &'a mut [Slot],
    order: &Order,
    limit: impl Fn(&Slot) -> u32,
) -> Option<&'a mut Slot> {
    slots
        .iter_mut()
        .filter(|s| s.load + order.demand <= limit(s))
        .min_by(|a, b| {
            a.centroid
                .planar_dist2(&order.location)
                .total_cmp(&b.centroid.planar_dist2(&order.location))
                .then_with(|| a.vehicle.id.cmp(&b.vehicle.id))
        })
}

fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.lat).sum::<f64>() / n;
    let lng = points.iter().map(|p| p.lng).sum::<f64>() / n;
    Some(GeoPoint::new(lat, lng))
}

/// Deterministic farthest-point seeding
///
/// First seed: the point farthest from the overall centroid. Next seeds: the
/// point maximizing its distance to the nearest chosen seed. Ties go to the
/// lower index, and points arrive sorted by order id.
fn seed(points: &[GeoPoint], k: usize) -> Vec<GeoPoint> {
    let Some(center) = centroid(points) else {
        return Vec::new();
    };
    let mut seeds = Vec::with_capacity(k);
    let mut chosen = vec![false; points.len()];

    let first = argmax(points.iter().map(|p| p.planar_dist2(&center)));
    chosen[first] = true;
    seeds.push(points[first]);

    while seeds.len() < k {
        let next = argmax(points.iter().enumerate().map(|(i, p)| {
            if chosen[i] {
                f64::NEG_INFINITY
            } else {
                seeds
                    .iter()
                    .map(|s| p.planar_dist2(s))
                    .fold(f64::INFINITY, f64::min)
            }
        }));
        chosen[next] = true;
        seeds.push(points[next]);
    }
    seeds
}

/// Index of the first maximum
fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

fn nearest(point: &GeoPoint, centroids: &[GeoPoint]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = point.planar_dist2(c);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Lloyd iterations; returns a cluster label per point
fn kmeans(points: &[GeoPoint], k: usize) -> Vec<usize> {
    let mut centroids = seed(points, k);
    let mut labels: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();

    for _ in 0..MAX_KMEANS_ITERATIONS {
        for (c, centroid_slot) in centroids.iter_mut().enumerate() {
            let members: Vec<GeoPoint> = points
                .iter()
                .zip(&labels)
                .filter(|(_, l)| **l == c)
                .map(|(p, _)| *p)
                .collect();
            // Empty clusters keep their previous centroid
            if let Some(c) = centroid(&members) {
                *centroid_slot = c;
            }
        }

        let next: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
        if next == labels {
            break;
        }
        labels = next;
    }
    labels
}
