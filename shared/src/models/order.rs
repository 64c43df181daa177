//! Delivery order as seen by the dispatch core
//!
//! Orders are owned by order intake. Routes and stops reference them by id
//! and copy only the fields needed for planning.

use super::geo::GeoPoint;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    #[default]
    Normal,
    Urgent,
    Scheduled,
}

impl PriorityTier {
    /// Rank used when splitting or ordering by priority (lower first)
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Urgent => 0,
            Self::Scheduled => 1,
            Self::Normal => 2,
        }
    }

    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Urgent)
    }
}

/// Acceptable delivery interval, unix millis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub earliest: i64,
    pub latest: i64,
}

impl TimeWindow {
    pub const fn new(earliest: i64, latest: i64) -> Self {
        Self { earliest, latest }
    }

    pub fn is_valid(&self) -> bool {
        self.earliest <= self.latest
    }

    pub fn midpoint(&self) -> i64 {
        self.earliest + (self.latest - self.earliest) / 2
    }

    pub fn contains(&self, at: i64) -> bool {
        (self.earliest..=self.latest).contains(&at)
    }
}

/// Order lifecycle as tracked by intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Unassigned,
    Assigned,
    Delivered,
    Failed,
    Cancelled,
}

/// Delivery order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub location: GeoPoint,
    /// Demand in vehicle capacity units (cylinders)
    pub demand: u32,
    #[serde(default)]
    pub priority: PriorityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub status: OrderStatus,
    pub planning_date: NaiveDate,
    #[serde(default)]
    pub created_at: i64,
}

impl Order {
    /// Window start used for tie-breaking; orders without a window sort last
    pub fn window_start(&self) -> i64 {
        self.time_window.map(|w| w.earliest).unwrap_or(i64::MAX)
    }

    /// Validate fields an order must carry before it can be planned
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("order id is empty".into());
        }
        if !self.location.is_valid() {
            return Err(format!("order {} has invalid coordinates", self.id));
        }
        if self.demand == 0 {
            return Err(format!("order {} has zero demand", self.id));
        }
        if let Some(w) = self.time_window
            && !w.is_valid()
        {
            return Err(format!("order {} has an inverted time window", self.id));
        }
        Ok(())
    }
}
