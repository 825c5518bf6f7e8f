//! Hearing-aid settings service.
//!
//! Ties the ATT session to the settings codec: loads the settings once
//! connected, follows notifications from the accessory, and turns edited
//! records into patch writes against the last buffer read from the device.

use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{sync, task::JoinHandle};

use crate::{
   att::{
      protocol::AttributeHandle,
      session::{AttSession, Listener},
   },
   error::{HearingAidError, Result},
   event::{EventSender, HearingAidEvent},
   hearing_aid::settings::{Controls, HearingAidSettings},
};

const SETTINGS_HANDLE: AttributeHandle = AttributeHandle::HearingAid;

struct ServiceInner {
   session: AttSession,
   events: EventSender,
   /// Last buffer read from the device, base for the next write.
   raw: Mutex<Option<Vec<u8>>>,
   current: Mutex<Option<HearingAidSettings>>,
   listener: Mutex<Option<Listener>>,
   /// Keeps read-patch-write sequences from interleaving.
   write_lock: sync::Mutex<()>,
}

/// Settings service for one accessory. Cheaply cloneable.
#[derive(Clone)]
pub struct SettingsService(Arc<ServiceInner>);

impl SettingsService {
   pub fn new(session: AttSession, events: EventSender) -> Self {
      Self(Arc::new(ServiceInner {
         session,
         events,
         raw: Mutex::new(None),
         current: Mutex::new(None),
         listener: Mutex::new(None),
         write_lock: sync::Mutex::new(()),
      }))
   }

   pub fn session(&self) -> &AttSession {
      &self.0.session
   }

   /// Last settings read from or pushed by the accessory.
   pub fn current(&self) -> Option<HearingAidSettings> {
      *self.0.current.lock()
   }

   /// Connects, subscribes to settings notifications and loads the settings.
   pub async fn start(&self) -> Result<()> {
      self.0.session.connect().await?;
      self.0.session.enable_notifications(SETTINGS_HANDLE).await?;
      self.subscribe();
      if self.refresh().await?.is_some() {
         info!("Initial settings loaded");
      }
      Ok(())
   }

   /// Unsubscribes and closes the link.
   pub async fn stop(&self) {
      if let Some(listener) = self.0.listener.lock().take() {
         self.0.session.unregister_listener(SETTINGS_HANDLE, &listener);
      }
      self.0.session.disconnect().await;
   }

   /// Reads the settings and publishes them if they decode.
   pub async fn refresh(&self) -> Result<Option<HearingAidSettings>> {
      let data = self.0.session.read(SETTINGS_HANDLE).await?;
      Ok(self.accept(&data))
   }

   /// Writes `settings` to the accessory.
   ///
   /// The characteristic is read again first and the write is built by
   /// patching that buffer. If the read fails, the last buffer seen is used.
   pub async fn apply(&self, settings: &HearingAidSettings) -> Result<()> {
      let _guard = self.0.write_lock.lock().await;
      info!("Sending hearing aid settings");

      let base = match self.0.session.read(SETTINGS_HANDLE).await {
         Ok(data) => data,
         Err(e) => {
            warn!("Could not re-read settings before writing ({e}), using last known buffer");
            self.0.raw.lock().clone().ok_or(HearingAidError::NoBaseBuffer)?
         },
      };
      let buf = settings.encode(&base)?;
      self.0.session.write(SETTINGS_HANDLE, &buf).await?;

      *self.0.raw.lock() = Some(buf);
      *self.0.current.lock() = Some(*settings);
      info!("Hearing aid settings sent");
      Ok(())
   }

   /// Writes `settings` in the background. Failures are logged.
   pub fn submit(&self, settings: HearingAidSettings) -> JoinHandle<()> {
      let this = self.clone();
      tokio::spawn(async move {
         if let Err(e) = this.apply(&settings).await {
            error!("Failed to send hearing aid settings: {e}");
         }
      })
   }

   /// Applies aggregate controls to the current settings and submits them.
   pub fn submit_controls(&self, controls: &Controls) -> Result<JoinHandle<()>> {
      let current = self.current().ok_or(HearingAidError::NoBaseBuffer)?;
      debug!("Applying controls: {controls:?}");
      Ok(self.submit(current.with_controls(controls)))
   }

   /// Submits the default controls, keeping the EQ.
   pub fn reset(&self) -> Result<JoinHandle<()>> {
      debug!("Resetting settings to defaults");
      self.submit_controls(&Controls::default())
   }

   fn subscribe(&self) {
      let mut slot = self.0.listener.lock();
      if slot.is_some() {
         return;
      }
      let weak: Weak<ServiceInner> = Arc::downgrade(&self.0);
      let listener: Listener = Arc::new(move |value: &[u8]| {
         if let Some(inner) = weak.upgrade() {
            debug!("Settings notification received");
            SettingsService(inner).accept(value);
         }
      });
      self
         .0
         .session
         .register_listener(SETTINGS_HANDLE, listener.clone());
      *slot = Some(listener);
   }

   /// Decodes a buffer from the device, retaining and publishing it if valid.
   fn accept(&self, data: &[u8]) -> Option<HearingAidSettings> {
      let settings = HearingAidSettings::decode(data)?;
      *self.0.raw.lock() = Some(data.to_vec());
      *self.0.current.lock() = Some(settings);
      self.0.events.emit(HearingAidEvent::SettingsChanged(settings));
      Some(settings)
   }
}

#[cfg(test)]
mod tests {
   use std::{
      sync::atomic::{AtomicBool, Ordering},
      time::Duration,
   };

   use tokio::{sync::mpsc, time};

   use super::*;
   use crate::{
      att::{
         protocol::{OP_ERROR_RSP, OP_READ_REQ, OP_READ_RSP, OP_WRITE_REQ, OP_WRITE_RSP},
         session::SessionConfig,
      },
      bluetooth::l2cap::mock::{MockConnector, Peer},
      event::testing::RecordingBus,
      hearing_aid::settings::{EarSettings, SETTINGS_LEN},
   };

   /// Minimal accessory: one settings characteristic and its CCCD.
   struct FakeAccessory {
      state: Arc<Mutex<Vec<u8>>>,
      cccd: Arc<Mutex<Vec<u8>>>,
      mute_reads: Arc<AtomicBool>,
      notify: mpsc::UnboundedSender<Vec<u8>>,
   }

   impl FakeAccessory {
      fn spawn(mut peer: Peer, initial: Vec<u8>) -> Self {
         let state = Arc::new(Mutex::new(initial));
         let cccd = Arc::new(Mutex::new(Vec::new()));
         let mute_reads = Arc::new(AtomicBool::new(false));
         let (notify, mut notify_rx) = mpsc::unbounded_channel::<Vec<u8>>();

         let (st, cc, mute) = (state.clone(), cccd.clone(), mute_reads.clone());
         tokio::spawn(async move {
            loop {
               tokio::select! {
                  pdu = peer.recv() => {
                     let Some(pdu) = pdu else { break };
                     let handle = u16::from_le_bytes([pdu[1], pdu[2]]);
                     match (pdu[0], handle) {
                        (OP_READ_REQ, 0x2A) => {
                           if mute.load(Ordering::SeqCst) {
                              continue;
                           }
                           let mut rsp = vec![OP_READ_RSP];
                           rsp.extend_from_slice(&st.lock());
                           peer.send(&rsp).await;
                        },
                        (OP_WRITE_REQ, 0x2A) => {
                           *st.lock() = pdu[3..].to_vec();
                           peer.send(&[OP_WRITE_RSP]).await;
                        },
                        (OP_WRITE_REQ, 0x2B) => {
                           *cc.lock() = pdu[3..].to_vec();
                           peer.send(&[OP_WRITE_RSP]).await;
                        },
                        _ => peer.send(&[OP_ERROR_RSP, pdu[0], pdu[1], pdu[2], 0x0A]).await,
                     }
                  },
                  Some(value) = notify_rx.recv() => {
                     let mut ntf = vec![0x1B, 0x2A, 0x00];
                     ntf.extend_from_slice(&value);
                     peer.send(&ntf).await;
                  },
               }
            }
         });

         Self {
            state,
            cccd,
            mute_reads,
            notify,
         }
      }

      fn state(&self) -> Vec<u8> {
         self.state.lock().clone()
      }
   }

   fn sample_settings() -> HearingAidSettings {
      let ear = |base: f32, amp: f32| EarSettings {
         eq: std::array::from_fn(|i| base + i as f32),
         amplification: amp,
         tone: 0.1,
         conversation_boost: false,
         ambient_noise_reduction: 0.2,
      };
      HearingAidSettings {
         left: ear(10.0, 0.2),
         right: ear(30.0, 0.4),
         own_voice_amplification: 0.5,
      }
   }

   /// A device buffer with a non-trivial header and trailing bytes.
   fn device_buffer(settings: &HearingAidSettings) -> Vec<u8> {
      let mut buf: Vec<u8> = (0..SETTINGS_LEN + 8).map(|i| i as u8).collect();
      buf[..4].copy_from_slice(&[0x01, 0x02, 0x00, 0x04]);
      settings.encode_into(&mut buf).unwrap();
      buf[2] = 0x00;
      buf
   }

   fn service(connector: &Arc<MockConnector>) -> (SettingsService, Arc<RecordingBus>) {
      let bus = Arc::new(RecordingBus::default());
      let config = SessionConfig {
         request_timeout: Duration::from_millis(200),
         receive_poll: Duration::from_millis(10),
         shutdown_timeout: Duration::from_millis(500),
      };
      let session = AttSession::new(connector.clone(), config, bus.clone());
      (SettingsService::new(session, bus.clone()), bus)
   }

   async fn wait_for(what: &str, cond: impl Fn() -> bool) {
      for _ in 0..200 {
         if cond() {
            return;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      panic!("timed out waiting for {what}");
   }

   #[tokio::test]
   async fn start_enables_notifications_and_publishes_settings() {
      let connector = Arc::new(MockConnector::default());
      let settings = sample_settings();
      let device = FakeAccessory::spawn(connector.push_link(), device_buffer(&settings));
      let (service, bus) = service(&connector);

      service.start().await.unwrap();

      assert_eq!(*device.cccd.lock(), vec![0x01, 0x00]);
      assert_eq!(bus.settings(), vec![settings]);
      assert_eq!(service.current(), Some(settings));
   }

   #[tokio::test]
   async fn notifications_update_settings_and_short_ones_are_dropped() {
      let connector = Arc::new(MockConnector::default());
      let settings = sample_settings();
      let device = FakeAccessory::spawn(connector.push_link(), device_buffer(&settings));
      let (service, bus) = service(&connector);
      service.start().await.unwrap();

      let pushed = settings.with_amplification(0.8, 0.0);
      device.notify.send(device_buffer(&pushed)).unwrap();
      wait_for("notification", || bus.settings().len() == 2).await;
      assert_eq!(bus.settings()[1], pushed);
      assert_eq!(service.current(), Some(pushed));

      device.notify.send(vec![0u8; 50]).unwrap();
      time::sleep(Duration::from_millis(50)).await;
      assert_eq!(bus.settings().len(), 2);
      assert_eq!(service.current(), Some(pushed));
   }

   #[tokio::test]
   async fn submit_patches_a_fresh_read() {
      let connector = Arc::new(MockConnector::default());
      let settings = sample_settings();
      let original = device_buffer(&settings);
      let device = FakeAccessory::spawn(connector.push_link(), original.clone());
      let (service, _) = service(&connector);
      service.start().await.unwrap();

      let edited = settings.with_controls(&Controls {
         amplification: 0.4,
         balance: -1.0,
         tone: -0.3,
         ambient_noise_reduction: 0.7,
         conversation_boost: true,
         own_voice_amplification: 0.9,
      });
      service.submit(edited).await.unwrap();

      let written = device.state();
      assert_eq!(written.len(), original.len());
      assert_eq!(&written[..2], &original[..2]);
      assert_eq!(written[2], 0x64);
      assert_eq!(written[3], original[3]);
      assert_eq!(&written[SETTINGS_LEN..], &original[SETTINGS_LEN..]);

      let decoded = HearingAidSettings::decode(&written).unwrap();
      assert_eq!(decoded, edited);
      assert!((decoded.left.amplification - 1.6).abs() < 1e-5);
      assert_eq!(decoded.left.eq, settings.left.eq);
      assert_eq!(service.current(), Some(edited));
   }

   #[tokio::test]
   async fn apply_falls_back_to_last_buffer_when_read_fails() {
      let connector = Arc::new(MockConnector::default());
      let settings = sample_settings();
      let original = device_buffer(&settings);
      let device = FakeAccessory::spawn(connector.push_link(), original.clone());
      let (service, _) = service(&connector);
      service.start().await.unwrap();

      device.mute_reads.store(true, Ordering::SeqCst);
      let edited = settings.with_amplification(0.1, 0.0);
      service.apply(&edited).await.unwrap();

      let written = device.state();
      assert_eq!(&written[SETTINGS_LEN..], &original[SETTINGS_LEN..]);
      assert_eq!(HearingAidSettings::decode(&written), Some(edited));
   }

   #[tokio::test]
   async fn short_buffer_is_never_written() {
      let connector = Arc::new(MockConnector::default());
      let short = vec![0xEE; SETTINGS_LEN - 1];
      let device = FakeAccessory::spawn(connector.push_link(), short.clone());
      let (service, bus) = service(&connector);

      service.start().await.unwrap();
      assert!(bus.settings().is_empty());
      assert_eq!(service.current(), None);
      assert!(matches!(
         service.reset(),
         Err(HearingAidError::NoBaseBuffer)
      ));

      let err = service.apply(&sample_settings()).await.unwrap_err();
      assert!(matches!(err, HearingAidError::ShortBuffer { actual: 103, .. }));
      assert_eq!(device.state(), short);
   }

   #[tokio::test]
   async fn reset_keeps_eq() {
      let connector = Arc::new(MockConnector::default());
      let settings = sample_settings();
      let device = FakeAccessory::spawn(connector.push_link(), device_buffer(&settings));
      let (service, _) = service(&connector);
      service.start().await.unwrap();

      service.reset().unwrap().await.unwrap();

      let decoded = HearingAidSettings::decode(&device.state()).unwrap();
      assert_eq!(decoded.left.eq, settings.left.eq);
      assert_eq!(decoded.right.eq, settings.right.eq);
      assert_eq!(decoded.controls(), Controls::default());
   }

   #[tokio::test]
   async fn stop_unsubscribes_and_disconnects() {
      let connector = Arc::new(MockConnector::default());
      let settings = sample_settings();
      let device = FakeAccessory::spawn(connector.push_link(), device_buffer(&settings));
      let (service, bus) = service(&connector);
      service.start().await.unwrap();

      service.stop().await;
      assert!(!service.session().is_connected());
      assert!(bus.events().contains(&HearingAidEvent::Disconnected));

      let _ = device.notify.send(device_buffer(&settings.reset()));
      time::sleep(Duration::from_millis(50)).await;
      assert_eq!(bus.settings().len(), 1);
      assert_eq!(connector.attempts(), 1);
   }
}
