//! Timing of a stop sequence
//!
//! Walks a sequence from the vehicle's start point, accumulating travel from
//! the batch matrix, waiting for window openings and adding the fixed service
//! time at each stop. The result tells the builder whether a sequence honors
//! capacity, every window and the shift end, and what it costs.

use std::collections::HashSet;

use shared::models::{PriorityTier, TimeWindow};

use super::distance::DistanceMatrix;

/// One stop as the builder sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub order_id: String,
    /// Index into the batch matrix
    pub node: usize,
    pub demand: u32,
    pub priority: PriorityTier,
    pub window: Option<TimeWindow>,
}

impl Visit {
    pub fn window_start(&self) -> i64 {
        self.window.map(|w| w.earliest).unwrap_or(i64::MAX)
    }

    pub fn is_urgent(&self) -> bool {
        self.priority.is_urgent()
    }
}

/// Vehicle-side inputs of an evaluation
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub matrix: &'a DistanceMatrix,
    /// Matrix index the vehicle leaves from
    pub start_node: usize,
    pub start_time_ms: i64,
    pub shift_end_ms: i64,
    pub capacity: u32,
    /// Demand already on the route outside the evaluated sequence
    pub base_load: u32,
    pub service_time_s: f64,
}

/// Result of timing one sequence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Arrival per position, unix millis
    pub arrivals: Vec<i64>,
    pub distance_m: f64,
    /// Travel time only, the builder's objective
    pub duration_s: f64,
    pub load: u32,
    /// Urgent stops served after their window midpoint
    pub urgent_misses: u32,
    /// Matrix nodes whose service starts after the window closes
    pub late: Vec<usize>,
    /// Departure from the last stop
    pub finish_ms: i64,
    pub over_capacity: bool,
    pub over_shift: bool,
}

impl Evaluation {
    pub fn is_feasible(&self) -> bool {
        !self.over_capacity && !self.over_shift && self.late.is_empty()
    }

    /// Hard constraints hold, tolerating stops that were already late in
    /// `baseline`
    pub fn admits_against(&self, baseline: &Evaluation) -> bool {
        if self.over_capacity || self.over_shift {
            return false;
        }
        if self.late.is_empty() {
            return true;
        }
        let known: HashSet<usize> = baseline.late.iter().copied().collect();
        self.late.iter().all(|n| known.contains(n))
    }
}

fn secs_to_ms(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

/// Time `visits` in order
pub fn evaluate(ctx: &RouteContext<'_>, visits: &[Visit]) -> Evaluation {
    let mut eval = Evaluation {
        arrivals: Vec::with_capacity(visits.len()),
        load: ctx.base_load,
        finish_ms: ctx.start_time_ms,
        ..Default::default()
    };

    let service_ms = secs_to_ms(ctx.service_time_s);
    let mut node = ctx.start_node;
    let mut clock = ctx.start_time_ms;

    for visit in visits {
        let leg = ctx.matrix.get(node, visit.node);
        eval.distance_m += leg.distance_m;
        eval.duration_s += leg.duration_s;

        let arrival = clock + secs_to_ms(leg.duration_s);
        eval.arrivals.push(arrival);

        let mut service_start = arrival;
        if let Some(window) = visit.window {
            service_start = service_start.max(window.earliest);
            if service_start > window.latest {
                eval.late.push(visit.node);
            }
            if visit.is_urgent() && service_start > window.midpoint() {
                eval.urgent_misses += 1;
            }
        }

        eval.load += visit.demand;
        clock = service_start + service_ms;
        node = visit.node;
    }

    eval.finish_ms = clock;
    eval.over_capacity = eval.load > ctx.capacity;
    eval.over_shift = !visits.is_empty() && clock > ctx.shift_end_ms;
    eval
}
