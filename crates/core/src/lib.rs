//! `wms-core`: shared building blocks for warehouse operations.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod payload;

pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, EventId};
pub use payload::{Payload, PayloadValue};
