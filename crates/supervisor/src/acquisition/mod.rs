//! Bounded-retry device acquisition
//!
//! One attempt walks `Searching → Binding → Verifying → Active`, dropping to
//! `Failed` at the first step that does not succeed. The controller repeats
//! attempts with a growing backoff until one reaches `Active` or the attempt
//! budget runs out.

pub mod controller;
pub mod retry;
pub mod state;

pub use controller::{
    AcquisitionController, AcquisitionError, AttemptFailure, AttemptReport, VerificationFailure,
};
pub use retry::RetryPolicy;
pub use state::{AcquisitionState, AttemptTracker, InvalidTransition};
