use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::hearing_aid::{
   service::SettingsService,
   settings::{Controls, HearingAidSettings},
};

pub struct AdjustmentsService {
   service: SettingsService,
}

impl AdjustmentsService {
   pub const fn new(service: SettingsService) -> Self {
      Self { service }
   }
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.hearingaid.Adjustments")]
impl AdjustmentsService {
   async fn get_settings(&self) -> zbus::fdo::Result<String> {
      let settings = self
         .service
         .current()
         .ok_or_else(|| failed("No settings have been read from the device"))?;
      Ok(settings.to_json().to_string())
   }

   async fn set_settings(&self, settings: String) -> zbus::fdo::Result<bool> {
      let settings: HearingAidSettings = serde_json::from_str(&settings)
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self.service.submit(settings);
      info!("Submitted settings");
      Ok(true)
   }

   async fn set_controls(&self, controls: String) -> zbus::fdo::Result<bool> {
      let controls: Controls = serde_json::from_str(&controls)
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self.service.submit_controls(&controls).map_err(failed)?;
      info!(
         "Submitted controls: amp={} balance={}",
         controls.amplification, controls.balance
      );
      Ok(true)
   }

   async fn reset(&self) -> zbus::fdo::Result<bool> {
      self.service.reset().map_err(failed)?;
      Ok(true)
   }

   async fn refresh(&self) -> zbus::fdo::Result<bool> {
      let settings = self.service.refresh().await.map_err(failed)?;
      Ok(settings.is_some())
   }

   async fn reconnect(&self) -> zbus::fdo::Result<bool> {
      self.service.start().await.map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn settings_changed(emitter: &SignalEmitter<'_>, settings: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_changed(emitter: &SignalEmitter<'_>, connected: bool)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn reconnect_failed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(property)]
   async fn connected(&self) -> bool {
      self.service.session().is_connected()
   }
}
