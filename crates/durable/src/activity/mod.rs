//! Activity abstractions
//!
//! Activities are units of side-effecting work invoked by workflows. They:
//! - May fail and be retried according to their retry policy
//! - Can send heartbeats to indicate liveness
//! - Support cancellation via tokens

mod context;
mod definition;
mod executor;

pub use context::{ActivityContext, HeartbeatError, HeartbeatPayload};
pub use definition::{error_types, Activity, ActivityError, AnyActivity, ErrorClass};
pub use executor::{ActivityExecutor, AttemptOutcome, AttemptRequest};
