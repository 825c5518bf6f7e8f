//! Hearing-aid settings: the 104-byte codec, the balance transform and the
//! service that keeps them in sync with the accessory.

pub mod balance;
pub mod service;
pub mod settings;
