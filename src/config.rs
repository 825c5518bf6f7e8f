//! Configuration management for the hearing-aid service.
//!
//! This module handles loading and saving configuration from disk,
//! including the accessory address and ATT timing parameters.

use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use bluer::Address;
use serde::{Deserialize, Serialize};

use crate::{
   att::{protocol::PSM_ATT, session::SessionConfig},
   error::{HearingAidError, Result},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Accessory address, `AA:BB:CC:DD:EE:FF`.
   #[serde(default)]
   pub device: Option<String>,

   #[serde(default = "default_psm")]
   pub psm: u16,

   #[serde(default = "default_request_timeout")]
   pub request_timeout_ms: u64,

   #[serde(default = "default_receive_poll")]
   pub receive_poll_ms: u64,

   #[serde(default = "default_shutdown_timeout")]
   pub shutdown_timeout_ms: u64,
}

const fn default_psm() -> u16 {
   PSM_ATT
}

const fn default_request_timeout() -> u64 {
   2000
}

const fn default_receive_poll() -> u64 {
   100
}

const fn default_shutdown_timeout() -> u64 {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device: None,
         psm: default_psm(),
         request_timeout_ms: default_request_timeout(),
         receive_poll_ms: default_receive_poll(),
         shutdown_timeout_ms: default_shutdown_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HEARING_AID_HOME") {
         PathBuf::from(home)
      } else {
         dirs::config_dir().ok_or(HearingAidError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("hearing-aid").join("config.toml"))
   }

   /// Resolves the accessory address, preferring `override_addr`.
   pub fn device_address(&self, override_addr: Option<&str>) -> Result<Address> {
      let raw = override_addr
         .or(self.device.as_deref())
         .ok_or_else(|| HearingAidError::InvalidAddress("no device configured".into()))?;
      Address::from_str(raw).map_err(|_| HearingAidError::InvalidAddress(raw.into()))
   }

   pub fn session_config(&self) -> SessionConfig {
      SessionConfig {
         request_timeout: Duration::from_millis(self.request_timeout_ms),
         receive_poll: Duration::from_millis(self.receive_poll_ms),
         shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
      }
   }
}
