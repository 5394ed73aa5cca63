#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and pure logic for the location tracking pipeline.
//!
//! Nothing in this crate performs I/O. The agent crate wires these types to
//! storage, HTTP and the platform location provider.

pub mod backoff;
pub mod geo;
pub mod model;
pub mod retry;
pub mod time;
pub mod validation;

mod util;

pub use backoff::exponential_delay_ms;
pub use geo::distance_m;
pub use model::{
    LocationPayload, LocationSample, Position, QueuedLocationSample, TrackingSessionState,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use time::{now_ms, Clock, EpochMs, ManualClock, SystemClock};
pub use util::new_entry_id;
pub use validation::{validate_sample, FieldError, ValidationOutcome};
