//! Submission processor
//!
//! Turns a driver submission into a dispatch command and the command
//! response into an acknowledgement. The idempotency key of the offline
//! queue item becomes the command id, so a replayed item is recognised as a
//! duplicate by the manager and never applied twice.

use shared::error::AppError;
use shared::message::{AckPayload, ClientRole, DriverAction, Envelope, SubmitPayload};
use shared::route::{CommandPayload, CommandResponse, DispatchCommand, EventOrigin};

use crate::dispatch::DispatchManager;

/// Who sent a submission
#[derive(Debug, Clone)]
pub struct Submitter {
    pub client_id: String,
    pub role: ClientRole,
}

impl Submitter {
    fn origin(&self) -> EventOrigin {
        match self.role {
            ClientRole::Driver => EventOrigin::Driver,
            ClientRole::Dispatcher => EventOrigin::Dispatcher,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitProcessor {
    manager: DispatchManager,
}

impl SubmitProcessor {
    pub fn new(manager: DispatchManager) -> Self {
        Self { manager }
    }

    /// Build the command for a submission envelope
    pub fn to_command(
        submitter: &Submitter,
        envelope: &Envelope,
    ) -> Result<DispatchCommand, AppError> {
        let key = envelope
            .idempotency_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::invalid_request("submission without idempotency key"))?;
        let submit: SubmitPayload = envelope
            .parse()
            .map_err(|e| AppError::invalid_request(format!("invalid submission: {e}")))?;

        let route_id = envelope.route_id.clone();
        let payload = match submit.action {
            DriverAction::StopStatus {
                order_id,
                status,
                occurred_at,
                evidence_ref,
                failure_reason,
            } => CommandPayload::UpdateStopStatus {
                route_id,
                order_id,
                status,
                occurred_at: Some(occurred_at),
                evidence_ref,
                failure_reason,
            },
            DriverAction::Location {
                location,
                recorded_at,
            } => CommandPayload::RecordLocation {
                route_id,
                location,
                recorded_at,
            },
        };

        let mut cmd = DispatchCommand::new(submitter.origin(), payload)
            .with_command_id(key)
            .with_actor(submitter.client_id.clone());
        if let Some(observed) = submit.observed_sequence {
            cmd = cmd.with_observed_sequence(observed);
        }
        Ok(cmd)
    }

    /// Apply a submission and acknowledge it
    ///
    /// Storage work runs on the blocking pool.
    pub async fn process(&self, submitter: &Submitter, envelope: &Envelope) -> AckPayload {
        let key = envelope.idempotency_key.clone().unwrap_or_default();
        let cmd = match Self::to_command(submitter, envelope) {
            Ok(cmd) => cmd,
            Err(e) => return AckPayload::rejected(key, e),
        };

        let route_id = envelope.route_id.clone();
        let manager = self.manager.clone();
        let resp = match tokio::task::spawn_blocking(move || manager.execute_command(cmd)).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "Submission task failed");
                return AckPayload::rejected(key, AppError::internal(e.to_string()));
            }
        };
        Self::ack(key, &route_id, resp)
    }

    fn ack(key: String, route_id: &str, resp: CommandResponse) -> AckPayload {
        if resp.duplicate {
            return AckPayload::duplicate(key);
        }
        match resp.error {
            None => {
                let sequence = resp
                    .sequences
                    .iter()
                    .filter(|s| s.route_id == route_id)
                    .map(|s| s.sequence)
                    .max();
                AckPayload::applied(key, sequence)
            }
            Some(err) => {
                tracing::debug!(key = %key, route_id = %route_id, code = ?err.code, "Submission rejected");
                AckPayload::rejected(key, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchStorage;
    use chrono::NaiveDate;
    use shared::error::ErrorCode;
    use shared::message::AckStatus;
    use shared::models::{GeoPoint, PriorityTier};
    use shared::route::{PlannedStop, StopStatus};

    fn setup() -> (DispatchManager, SubmitProcessor) {
        let manager = DispatchManager::with_storage(DispatchStorage::open_in_memory().unwrap());
        let stops = ["a", "b"]
            .iter()
            .map(|id| PlannedStop {
                order_id: id.to_string(),
                location: GeoPoint::new(40.0, -3.0),
                demand: 1,
                priority: PriorityTier::Normal,
                time_window: None,
                planned_arrival: None,
            })
            .collect();
        let resp = manager.execute_command(DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::CreateRoute {
                route_id: "r-1".to_string(),
                vehicle_id: "v-1".to_string(),
                planning_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                capacity: 4,
                stops,
                estimated_distance_m: 0.0,
                estimated_duration_s: 0.0,
            },
        ));
        assert!(resp.success);
        let resp = manager.execute_command(DispatchCommand::new(
            EventOrigin::Dispatcher,
            CommandPayload::AssignVehicle {
                route_id: "r-1".to_string(),
                vehicle_id: "v-1".to_string(),
                capacity: 4,
            },
        ));
        assert!(resp.success);
        (manager.clone(), SubmitProcessor::new(manager))
    }

    fn driver() -> Submitter {
        Submitter {
            client_id: "device-1".to_string(),
            role: ClientRole::Driver,
        }
    }

    fn completion(key: &str, order_id: &str) -> Envelope {
        let submit = SubmitPayload {
            action: DriverAction::StopStatus {
                order_id: order_id.to_string(),
                status: StopStatus::Completed,
                occurred_at: 1_000,
                evidence_ref: Some("sig-1".to_string()),
                failure_reason: None,
            },
            observed_sequence: None,
            created_at: 1_000,
        };
        Envelope::submission("r-1".to_string(), key.to_string(), &submit).unwrap()
    }

    #[tokio::test]
    async fn test_applied_then_duplicate() {
        let (manager, processor) = setup();

        let ack = processor.process(&driver(), &completion("k-1", "a")).await;
        assert_eq!(ack.status, AckStatus::Applied);
        let seq = manager.route_sequence("r-1").unwrap();
        assert_eq!(ack.sequence_number, Some(seq));

        let ack = processor.process(&driver(), &completion("k-1", "a")).await;
        assert_eq!(ack.status, AckStatus::Duplicate);
        assert_eq!(manager.route_sequence("r-1").unwrap(), seq);
    }

    #[tokio::test]
    async fn test_rejections_carry_the_dispatch_code() {
        let (_, processor) = setup();

        let ack = processor.process(&driver(), &completion("k-1", "ghost")).await;
        assert_eq!(ack.status, AckStatus::Rejected);
        assert_eq!(ack.error.as_ref().unwrap().code, ErrorCode::StopNotFound);
        assert!(!ack.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let (_, processor) = setup();
        let mut envelope = completion("k-1", "a");
        envelope.idempotency_key = None;

        let ack = processor.process(&driver(), &envelope).await;
        assert_eq!(ack.status, AckStatus::Rejected);
        assert_eq!(ack.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_command_uses_key_and_device() {
        let cmd = SubmitProcessor::to_command(&driver(), &completion("local-a", "a")).unwrap();
        assert_eq!(cmd.command_id, "local-a");
        assert_eq!(cmd.origin, EventOrigin::Driver);
        assert_eq!(cmd.actor.as_deref(), Some("device-1"));
    }
}
