//! Bluetooth transport for the ATT channel.
//!
//! This module provides the L2CAP socket actors and the `Connector` seam
//! used to open them.

pub mod l2cap;
