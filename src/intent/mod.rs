pub mod fees;
pub mod state_machine;

pub use fees::FeeBreakdown;
pub use state_machine::{DisputeResolution, IntentStateMachine, NewIntent};
