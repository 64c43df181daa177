/// Current UTC timestamp in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// New random identifier (UUID v4, hyphenated)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Exponential backoff `base * 2^attempt`, capped at `max`
///
/// `attempt` counts from 0.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_delay_ms(500, 0, 10_000), 500);
        assert_eq!(backoff_delay_ms(500, 1, 10_000), 1_000);
        assert_eq!(backoff_delay_ms(500, 4, 10_000), 8_000);
        assert_eq!(backoff_delay_ms(500, 5, 10_000), 10_000);
        assert_eq!(backoff_delay_ms(500, 63, 10_000), 10_000);
    }
}
