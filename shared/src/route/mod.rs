//! Route and stop lifecycle types shared by server and clients
//!
//! - `command`: requests that may change route state
//! - `event`: sequenced facts produced by the dispatch state machine
//! - `snapshot`: route state computed from the event stream
//! - `applier`: reducers folding events into snapshots

pub mod applier;
pub mod command;
pub mod event;
pub mod snapshot;

pub use applier::{EventAction, EventApplier, apply_event};
pub use command::*;
pub use event::*;
pub use snapshot::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Route lifecycle
///
/// `planned -> assigned -> in_progress -> completed | cancelled`.
/// Cancellation is allowed from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    #[default]
    Planned,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl RouteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Position in the lifecycle, terminal states share the last rank
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Planned => 0,
            Self::Assigned => 1,
            Self::InProgress => 2,
            Self::Completed | Self::Cancelled => 3,
        }
    }

    /// Transition table
    pub fn can_transition_to(&self, next: RouteStatus) -> bool {
        use RouteStatus::*;
        matches!(
            (self, next),
            (Planned, Assigned)
                | (Assigned, InProgress)
                | (InProgress, Completed)
                | (Planned | Assigned | InProgress, Cancelled)
        )
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Stop lifecycle
///
/// `pending -> en_route -> arrived -> completed | failed`. Drivers may skip
/// the en-route tap (`pending -> arrived`) and a stop may fail from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    #[default]
    Pending,
    EnRoute,
    Arrived,
    Completed,
    Failed,
}

impl StopStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::EnRoute => 1,
            Self::Arrived => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Transition table
    pub fn can_transition_to(&self, next: StopStatus) -> bool {
        use StopStatus::*;
        matches!(
            (self, next),
            (Pending, EnRoute)
                | (Pending, Arrived)
                | (EnRoute, Arrived)
                | (Arrived, Completed)
                | (Pending | EnRoute | Arrived, Failed)
        )
    }
}

impl fmt::Display for StopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::EnRoute => "en_route",
            Self::Arrived => "arrived",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_STATES: [RouteStatus; 5] = [
        RouteStatus::Planned,
        RouteStatus::Assigned,
        RouteStatus::InProgress,
        RouteStatus::Completed,
        RouteStatus::Cancelled,
    ];

    const STOP_STATES: [StopStatus; 5] = [
        StopStatus::Pending,
        StopStatus::EnRoute,
        StopStatus::Arrived,
        StopStatus::Completed,
        StopStatus::Failed,
    ];

    #[test]
    fn test_route_transitions_never_go_backward() {
        for from in ROUTE_STATES {
            for to in ROUTE_STATES {
                if from.can_transition_to(to) {
                    assert!(to.rank() > from.rank(), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn test_stop_transitions_never_go_backward() {
        for from in STOP_STATES {
            for to in STOP_STATES {
                if from.can_transition_to(to) {
                    assert!(to.rank() > from.rank(), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for to in ROUTE_STATES {
            assert!(!RouteStatus::Completed.can_transition_to(to));
            assert!(!RouteStatus::Cancelled.can_transition_to(to));
        }
        for to in STOP_STATES {
            assert!(!StopStatus::Completed.can_transition_to(to));
            assert!(!StopStatus::Failed.can_transition_to(to));
        }
    }

    #[test]
    fn test_completion_requires_arrival() {
        assert!(!StopStatus::Pending.can_transition_to(StopStatus::Completed));
        assert!(!StopStatus::EnRoute.can_transition_to(StopStatus::Completed));
        assert!(StopStatus::Arrived.can_transition_to(StopStatus::Completed));
    }

    #[test]
    fn test_route_must_be_assigned_before_start() {
        assert!(!RouteStatus::Planned.can_transition_to(RouteStatus::InProgress));
        assert!(RouteStatus::Assigned.can_transition_to(RouteStatus::InProgress));
    }

    #[test]
    fn test_status_display_matches_serde() {
        for s in STOP_STATES {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
        for s in ROUTE_STATES {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
    }
}
