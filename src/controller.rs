//! Coordinator wiring: builds every component from the configuration and runs
//! them until shutdown.

pub mod controller_handler;

pub use controller_handler::{Controller, RunningCoordinator};
