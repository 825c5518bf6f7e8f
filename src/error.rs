//! Error types for the hearing-aid service.
//!
//! This module defines all error types that can occur while talking to the
//! accessory over ATT, encoding settings, serving D-Bus or loading config.

use std::io;

use thiserror::Error;

/// Main error type for the hearing-aid service.
#[derive(Error, Debug)]
pub enum HearingAidError {
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] io::Error),

   #[error("Connection failed: {0}")]
   Connection(#[source] io::Error),

   #[error("Device not connected")]
   NotConnected,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Settings buffer too short: expected at least {expected} bytes, got {actual}")]
   ShortBuffer { expected: usize, actual: usize },

   #[error("No settings buffer has been read from the device yet")]
   NoBaseBuffer,

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl HearingAidError {
   /// Whether this is a connect failure refused by the peer.
   ///
   /// The accessory refuses the ATT channel when it is stuck and needs to be
   /// reconnected from the host's Bluetooth settings.
   pub fn is_connection_refused(&self) -> bool {
      matches!(self, Self::Connection(e) if e.kind() == io::ErrorKind::ConnectionRefused)
   }
}

/// Convenience type alias for Results with `HearingAidError`.
pub type Result<T> = std::result::Result<T, HearingAidError>;
