//! Lifecycle state machines.

pub mod session_sm;

pub use session_sm::{SessionController, StateChange, VmState};
