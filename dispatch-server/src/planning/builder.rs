//! Route builder
//!
//! Turns one cluster into an ordered stop sequence for one vehicle.
//!
//! - **Full build**: cheapest feasible insertion, urgent orders first, then
//!   scheduled, then normal, followed by swap and 2-opt local search passes.
//! - **Partial re-optimization**: the existing sequence is the seed. Worked
//!   stops stay where they are, only the delta is inserted, and the run is
//!   bounded by a deadline and a cancellation token.
//!
//! A move is accepted only when every hard constraint still holds (capacity,
//! windows, shift end), the number of urgent stops missing their window
//! midpoint does not grow, and total travel time strictly drops.

use std::cmp::Ordering;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::BuilderSettings;
use super::error::{Unassignable, UnassignableReason};
use super::schedule::{Evaluation, RouteContext, Visit, evaluate};

const IMPROVEMENT_EPS_S: f64 = 1e-6;

/// Builder output for one route
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    /// Fixed stops first, then the optimized tail
    pub sequence: Vec<Visit>,
    pub evaluation: Evaluation,
    pub unassignable: Vec<Unassignable>,
    /// Deadline hit or cancelled; `sequence` is the best partial result
    pub timed_out: bool,
    pub cancelled: bool,
}

impl BuildOutcome {
    pub fn placed(&self, order_id: &str) -> bool {
        self.sequence.iter().any(|v| v.order_id == order_id)
    }
}

/// Stop condition for one builder invocation
#[derive(Debug, Clone, Default)]
pub struct Budget {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl Budget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: Some(cancel),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Stateless builder bound to one vehicle's context
pub struct RouteBuilder<'a> {
    ctx: RouteContext<'a>,
    settings: BuilderSettings,
}

struct Candidate {
    idx: usize,
    position: usize,
    evaluation: Evaluation,
    added_s: f64,
}

impl<'a> RouteBuilder<'a> {
    pub fn new(ctx: RouteContext<'a>, settings: BuilderSettings) -> Self {
        Self { ctx, settings }
    }

    pub fn evaluate(&self, visits: &[Visit]) -> Evaluation {
        evaluate(&self.ctx, visits)
    }

    /// Build a route from scratch
    pub fn build(&self, visits: Vec<Visit>) -> BuildOutcome {
        self.run(Vec::new(), Vec::new(), visits, &Budget::unbounded(), true)
    }

    /// Insert `delta` into an existing route
    ///
    /// `fixed` are stops the driver has already worked and must keep their
    /// positions; `seed` is the remaining pending sequence, kept in its
    /// current relative order.
    pub fn reoptimize(
        &self,
        fixed: Vec<Visit>,
        seed: Vec<Visit>,
        delta: Vec<Visit>,
        budget: &Budget,
    ) -> BuildOutcome {
        self.run(fixed, seed, delta, budget, false)
    }

    fn run(
        &self,
        fixed: Vec<Visit>,
        seed: Vec<Visit>,
        mut delta: Vec<Visit>,
        budget: &Budget,
        local_search: bool,
    ) -> BuildOutcome {
        let locked = fixed.len();
        let mut sequence = fixed;
        sequence.extend(seed);
        let mut current = self.evaluate(&sequence);
        let mut outcome = BuildOutcome::default();

        delta.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.window_start().cmp(&b.window_start()))
                .then_with(|| a.order_id.cmp(&b.order_id))
        });

        // Insert tier by tier so urgent orders claim the best slots
        let mut remaining = delta;
        while !remaining.is_empty() {
            if self.interrupted(budget, &mut outcome) {
                break;
            }
            let tier = remaining[0].priority.rank();
            let tier_len = remaining
                .iter()
                .take_while(|v| v.priority.rank() == tier)
                .count();

            match self.cheapest_insertion(&sequence, &current, &remaining[..tier_len], locked) {
                Some(best) => {
                    let visit = remaining.remove(best.idx);
                    sequence.insert(best.position, visit);
                    current = best.evaluation;
                }
                None => {
                    // Nothing in this tier fits anywhere
                    for visit in remaining.drain(..tier_len) {
                        outcome.unassignable.push(self.rejection(&visit, &current));
                    }
                }
            }
        }

        if outcome.timed_out || outcome.cancelled {
            for visit in remaining {
                outcome.unassignable.push(
                    Unassignable::new(visit.order_id, UnassignableReason::TimedOut)
                        .with_detail("re-optimization budget exhausted"),
                );
            }
        } else if local_search {
            self.local_search(&mut sequence, &mut current, locked, budget, &mut outcome);
        }

        outcome.sequence = sequence;
        outcome.evaluation = current;
        outcome
    }

    fn interrupted(&self, budget: &Budget, outcome: &mut BuildOutcome) -> bool {
        if budget.is_cancelled() {
            outcome.cancelled = true;
            return true;
        }
        if budget.is_expired() {
            outcome.timed_out = true;
            return true;
        }
        false
    }

    fn rejection(&self, visit: &Visit, current: &Evaluation) -> Unassignable {
        let reason = if current.load + visit.demand > self.ctx.capacity {
            UnassignableReason::NoCapacityLeft
        } else {
            UnassignableReason::NoFeasibleSlot
        };
        Unassignable::new(visit.order_id.clone(), reason)
    }

    /// Best (visit, position) among `candidates`, never before `locked`
    fn cheapest_insertion(
        &self,
        sequence: &[Visit],
        current: &Evaluation,
        candidates: &[Visit],
        locked: usize,
    ) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        let mut trial: Vec<Visit> = Vec::with_capacity(sequence.len() + 1);

        for (idx, visit) in candidates.iter().enumerate() {
            if current.load + visit.demand > self.ctx.capacity {
                continue;
            }
            for position in locked..=sequence.len() {
                trial.clear();
                trial.extend_from_slice(&sequence[..position]);
                trial.push(visit.clone());
                trial.extend_from_slice(&sequence[position..]);

                let evaluation = self.evaluate(&trial);
                if !evaluation.admits_against(current) {
                    continue;
                }
                let candidate = Candidate {
                    idx,
                    position,
                    added_s: evaluation.duration_s - current.duration_s,
                    evaluation,
                };
                let better = match &best {
                    None => true,
                    Some(b) => {
                        compare(&candidate, b, &candidates[candidate.idx], &candidates[b.idx])
                            == Ordering::Less
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn local_search(
        &self,
        sequence: &mut Vec<Visit>,
        current: &mut Evaluation,
        locked: usize,
        budget: &Budget,
        outcome: &mut BuildOutcome,
    ) {
        let n = sequence.len();
        if n < locked + 2 {
            return;
        }

        for pass in 0..self.settings.max_local_search_passes {
            let mut improved = false;

            for i in locked..n {
                for j in (i + 1)..n {
                    if self.interrupted(budget, outcome) {
                        return;
                    }
                    sequence.swap(i, j);
                    if self.try_accept(sequence, current) {
                        improved = true;
                    } else {
                        sequence.swap(i, j);
                    }
                }
            }

            for i in locked..n {
                for j in (i + 2)..n {
                    if self.interrupted(budget, outcome) {
                        return;
                    }
                    sequence[i..=j].reverse();
                    if self.try_accept(sequence, current) {
                        improved = true;
                    } else {
                        sequence[i..=j].reverse();
                    }
                }
            }

            tracing::trace!(pass, improved, duration_s = current.duration_s, "Local search pass");
            if !improved {
                break;
            }
        }
    }

    fn try_accept(&self, sequence: &[Visit], current: &mut Evaluation) -> bool {
        let evaluation = self.evaluate(sequence);
        let accept = evaluation.admits_against(current)
            && evaluation.urgent_misses <= current.urgent_misses
            && evaluation.duration_s + IMPROVEMENT_EPS_S < current.duration_s;
        if accept {
            *current = evaluation;
        }
        accept
    }
}

/// Urgent misses, added travel, window start, order id, position
fn compare(a: &Candidate, b: &Candidate, va: &Visit, vb: &Visit) -> Ordering {
    a.evaluation
        .urgent_misses
        .cmp(&b.evaluation.urgent_misses)
        .then_with(|| a.added_s.total_cmp(&b.added_s))
        .then_with(|| va.window_start().cmp(&vb.window_start()))
        .then_with(|| va.order_id.cmp(&vb.order_id))
        .then_with(|| a.position.cmp(&b.position))
}
