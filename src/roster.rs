//! Roster of known capture nodes.
//!
//! Holds the last liveness state of every node as explicit, queryable state:
//! the bus only delivers announcements, it does not remember them.

pub mod registry;

pub use registry::{Node, RosterRegistry};
