use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-call executor options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Attempts per call, including the first. `0` still runs once.
    pub max_retries: u32,
    /// Flat delay before each retry.
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    pub use_idempotency: bool,
    pub idempotency_ttl_hours: u64,
    /// Deadline for a single attempt. A timed-out attempt is rolled back and
    /// counts as a retryable failure.
    #[serde(with = "opt_millis")]
    pub timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            use_idempotency: true,
            idempotency_ttl_hours: 24,
            timeout: None,
        }
    }
}

impl ExecutorOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_idempotency(mut self, enabled: bool) -> Self {
        self.use_idempotency = enabled;
        self
    }

    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.idempotency_ttl_hours = hours;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_hours.saturating_mul(3600))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = ExecutorOptions::default();
        assert_eq!(o.max_attempts(), 3);
        assert_eq!(o.retry_delay, Duration::from_secs(1));
        assert!(o.use_idempotency);
        assert_eq!(o.idempotency_ttl(), Duration::from_secs(24 * 3600));
        assert!(o.timeout.is_none());
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        assert_eq!(ExecutorOptions::default().with_max_retries(0).max_attempts(), 1);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let o: ExecutorOptions =
            serde_json::from_str(r#"{"max_retries": 5, "retry_delay": 10, "timeout": 250}"#).unwrap();
        assert_eq!(o.max_retries, 5);
        assert_eq!(o.retry_delay, Duration::from_millis(10));
        assert_eq!(o.timeout, Some(Duration::from_millis(250)));
        assert_eq!(o.idempotency_ttl_hours, 24);
    }
}
