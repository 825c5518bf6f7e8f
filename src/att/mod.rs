//! Attribute Protocol client.
//!
//! `protocol` holds the PDU layout and the fixed attribute handles,
//! `session` runs requests and notifications over an L2CAP link.

pub mod protocol;
pub mod session;
