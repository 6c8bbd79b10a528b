//! Upload receiver: the data path from the nodes.
//!
//! Validates and stores inbound images, then tells the session assembler that
//! an image arrived. It never decides anything about session completeness.

pub mod receiver;

pub use receiver::{UploadReceipt, UploadReceiver, UploadRequest, ATTEMPT_HEADER, NODE_ID_HEADER};
