//! Delivery of cached content to north targets
//!
//! Drives cache entries through the tier state machine: successful
//! deliveries are archived (or deleted), failures are retried until the
//! retry budget is spent, then moved to the error tier. Archive and error
//! content is swept once its retention elapses.

mod engine;
mod error;
mod retention;
mod retry;

pub use engine::{DeliveryEngine, DeliverySettings, DeliveryTarget, RunReport};
pub use error::DeliveryError;
pub use retention::{sweep, RetentionPolicy, SweepReport};
pub use retry::{next_transition, RetryPolicy, RetryState, RetryTracker, Transition};
