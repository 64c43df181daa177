//! Client configuration

use std::time::Duration;

use rand::Rng;

use crate::message::MessageClientConfig;

/// Offline replay policy
///
/// Delay before attempt `n` is `base_delay * 2^(n-1)`, capped at `max_delay`.
/// With jitter the actual wait is drawn from the upper half of that window.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts before an item is marked `failed_to_sync`
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Wait before retrying after `attempt` failures
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = Duration::from_millis(shared::util::backoff_delay_ms(
            self.base_delay.as_millis() as u64,
            attempt.saturating_sub(1),
            self.max_delay.as_millis() as u64,
        ));
        if !self.jitter {
            return delay;
        }
        let half = delay / 2;
        let spread = half.as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Everything a driver device needs to talk to the hub
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Stable device id
    pub client_id: String,
    /// Vehicle whose routes the device follows
    pub vehicle_id: Option<String>,
    /// Extra routes to follow by id
    pub routes: Vec<String>,
    pub message: MessageClientConfig,
    pub queue: QueueConfig,
}

impl DriverConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            vehicle_id: None,
            routes: Vec::new(),
            message: MessageClientConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    pub fn with_vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    pub fn with_route(mut self, route_id: impl Into<String>) -> Self {
        self.routes.push(route_id.into());
        self
    }

    pub fn with_message_config(mut self, config: MessageClientConfig) -> Self {
        self.message = config;
        self
    }

    pub fn with_queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let config = QueueConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);
        let delays: Vec<_> = (1..=5).map(|n| config.backoff_delay(n).as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let config = QueueConfig::new()
            .with_base_delay(Duration::from_millis(400))
            .with_max_delay(Duration::from_secs(10));
        for _ in 0..50 {
            let delay = config.backoff_delay(2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_driver_config_builder() {
        let config = DriverConfig::new("tablet-7")
            .with_vehicle("v-1")
            .with_route("r-9")
            .with_queue_config(QueueConfig::new().with_max_attempts(0));
        assert_eq!(config.vehicle_id.as_deref(), Some("v-1"));
        assert_eq!(config.routes, ["r-9"]);
        assert_eq!(config.queue.max_attempts, 1);
    }
}
