//! dockhand: supervises a single Linux guest VM that runs a containerized
//! workload, and makes the workload's TCP ports reachable on the host.

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod state_machine;
pub mod vm;
