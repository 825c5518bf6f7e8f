//! Hearing-aid adjustment D-Bus service
//!
//! This service opens an ATT channel to a hearing-capable accessory and
//! exposes its amplification, balance, tone, noise reduction and EQ
//! settings over D-Bus.

use std::{env, sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use att::session::AttSession;
use bluetooth::l2cap::L2CapConnector;
use dbus::AdjustmentsService;
use event::{EventBus, HearingAidEvent};
use hearing_aid::service::SettingsService;

mod att;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod hearing_aid;

use crate::{dbus::AdjustmentsServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/hearingaid/device";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting hearing-aid D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   let override_addr = env::args().nth(1);
   let address = config.device_address(override_addr.as_deref())?;
   info!("Using device {address} on PSM {}", config.psm);

   // Create event channel
   let event_bus = EventProcessor::new();

   let connector = Arc::new(L2CapConnector {
      address,
      psm: config.psm,
   });
   let session = AttSession::new(connector, config.session_config(), event_bus.clone());
   let settings = SettingsService::new(session, event_bus.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.hearingaid")?
      .serve_at(OBJECT_PATH, AdjustmentsService::new(settings.clone()))?
      .build()
      .await?;

   info!("Hearing-aid D-Bus service started at org.hearingaid");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   startup_outcome(settings.start().await)?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down hearing-aid service...");
   settings.stop().await;

   Ok(())
}

/// Only a refused connection is fatal; anything else leaves the service up
/// so `Reconnect` can be used later.
fn startup_outcome(result: Result<()>) -> Result<()> {
   match result {
      Ok(()) => Ok(()),
      Err(e) if e.is_connection_refused() => {
         error!("Connection refused. Try reconnecting your AirPods.");
         Err(e)
      },
      Err(e) => {
         error!("Connection failed: {e}");
         Ok(())
      },
   }
}

struct EventProcessor {
   queue: SegQueue<HearingAidEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<HearingAidEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<AdjustmentsService>,
      event: HearingAidEvent,
   ) -> Result<()> {
      match event {
         HearingAidEvent::Connected => {
            iface.connection_changed(true).await?;
            iface.get().await.connected_changed(iface.signal_emitter()).await?;
         },
         HearingAidEvent::Disconnected => {
            iface.connection_changed(false).await?;
            iface.get().await.connected_changed(iface.signal_emitter()).await?;
         },
         HearingAidEvent::ReconnectFailed => {
            iface.reconnect_failed().await?;
         },
         HearingAidEvent::SettingsChanged(settings) => {
            iface
               .settings_changed(&settings.to_json().to_string())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, AdjustmentsService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: HearingAidEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
