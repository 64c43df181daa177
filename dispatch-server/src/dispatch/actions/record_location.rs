//! RecordLocation command handler

use crate::dispatch::actions::ensure_active;
use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::models::GeoPoint;
use shared::route::{EventPayload, SyncEvent};

/// RecordLocation action
///
/// Out-of-order pings still produce an event so every queued item is
/// acknowledged; the applier keeps the newest position.
#[derive(Debug, Clone)]
pub struct RecordLocationAction {
    pub route_id: String,
    pub location: GeoPoint,
    pub recorded_at: i64,
}

impl CommandHandler for RecordLocationAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        let snapshot = ctx.load_snapshot(&self.route_id)?;
        ensure_active(&snapshot, "record location")?;

        if !self.location.is_valid() {
            return Err(DispatchError::InvalidOperation(format!(
                "invalid coordinates ({}, {})",
                self.location.lat, self.location.lng
            )));
        }

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::LocationUpdate {
                location: self.location,
                recorded_at: self.recorded_at,
            },
        )?;

        Ok(vec![event])
    }
}
