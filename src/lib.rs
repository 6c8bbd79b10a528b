pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod node_agent;
pub mod roster;
pub mod session_management;
pub mod status_bus;
pub mod storage;
pub mod upload_receiver;
pub mod web_interface;
