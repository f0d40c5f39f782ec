use std::time::{Duration, Instant};

use wms_core::CorrelationId;

/// Per-call execution state: correlation id, retry budget and timing.
///
/// Lives for one top-level executor call, retries included.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    correlation_id: CorrelationId,
    operation: String,
    max_attempts: u32,
    attempt: u32,
    started: Instant,
}

impl TransactionContext {
    pub fn new(operation: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            operation: operation.into(),
            max_attempts: max_attempts.max(1),
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Count a new attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Whether another attempt fits in the budget.
    pub fn has_budget(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
