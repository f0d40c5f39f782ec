//! Idempotency guard: at-most-once execution per logical operation.
//!
//! ## Components
//!
//! - `KeyGenerator`: deterministic keys from `(operation, source, payload)`
//! - `IdempotencyStore`: record persistence with an atomic claim step
//!   (in-memory or Postgres)
//! - `IdempotencyGuard`: claim, run, record the outcome, replay duplicates
//! - `IdempotencySweeper`: background cleanup of expired records
//!
//! ## Record lifecycle
//!
//! `pending → processing → completed | failed`, then deleted once past
//! `expires_at`. `pending` only exists inside the claim step.

pub mod guard;
pub mod key;
pub mod postgres;
pub mod record;
pub mod store;
pub mod sweeper;

pub use guard::{IdempotencyGuard, IdempotentOutcome};
pub use key::{KeyGenerator, DEFAULT_VOLATILE_FIELDS};
pub use postgres::PostgresIdempotencyStore;
pub use record::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, MAX_KEY_LEN};
pub use store::{ClaimOutcome, IdempotencyStore, IdempotencyStoreError, InMemoryIdempotencyStore};
pub use sweeper::{IdempotencySweeper, SweeperHandle, SweeperStats};
