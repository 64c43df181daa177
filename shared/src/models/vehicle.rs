//! Delivery vehicle

use super::geo::GeoPoint;
use serde::{Deserialize, Serialize};

/// Driver shift, unix millis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub start: i64,
    pub end: i64,
}

impl ShiftWindow {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    /// Capacity units
    pub capacity: u32,
    pub shift: ShiftWindow,
    /// Where the vehicle loads and starts the day
    pub depot: GeoPoint,
    /// Last reported position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_updated_at: Option<i64>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl Vehicle {
    /// Position to plan from: last report if any, otherwise the depot
    pub fn start_location(&self) -> GeoPoint {
        self.current_location.unwrap_or(self.depot)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err(format!("vehicle {} has zero capacity", self.id));
        }
        if self.shift.end <= self.shift.start {
            return Err(format!("vehicle {} has an empty shift", self.id));
        }
        if !self.depot.is_valid() {
            return Err(format!("vehicle {} has an invalid depot", self.id));
        }
        Ok(())
    }
}
