//! Infrastructure layer: storage, idempotency, transactional execution.

pub mod config;
pub mod event_processing;
pub mod idempotency;
pub mod storage;
pub mod transactional;


pub use config::{ConfigError, IdempotencyConfig, InfraConfig, SweeperConfig};
pub use event_processing::{EventProcessor, ProcessedEvent};
