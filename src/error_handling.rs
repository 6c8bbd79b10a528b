//! Error types shared across the coordinator and node agent.

pub mod types;
