//! Workflow state machine: transition table, retry bookkeeping, backoff and
//! the controller that ties them to the store and the workers.

pub mod backoff;
pub mod controller;
pub mod retry;
pub mod transition;

pub use backoff::BackoffPolicy;
pub use controller::{ControllerSettings, PhaseController, RunOutcome, StepOutcome};
pub use retry::RetryManager;
pub use transition::{NextStep, Target};
