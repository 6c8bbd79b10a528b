//! Node agent: the capture state machine running once per camera node.
//!
//! ```text
//! idle ─trigger─▶ capturing ─frame─▶ persisting ─▶ uploading ─┬─ 200 ──▶ reported_ok ───┐
//!                     │                                        └─ error ▶ reported_failed ┤
//!                     └─ sensor error ─────────────────────────────────▶ reported_failed ┤
//!   ▲                                                                                    │
//!   └────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Network triggers and local button presses feed one command loop, so the
//! sensor never serves two acquisitions at once.

pub mod agent;
pub mod backoff;
pub mod camera;
pub mod uploader;

pub use agent::{AgentState, LocalTrigger, NodeAgent, NodeSettings};
pub use backoff::Backoff;
pub use camera::{Camera, CapturedFrame, SyntheticCamera};
pub use uploader::{HttpUploader, Uploader};
