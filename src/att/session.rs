//! ATT client session over a single L2CAP link.
//!
//! The session allows one outstanding request at a time. A background receive
//! loop owns the inbound side of the link: notifications are dispatched to
//! listeners inline, everything else is handed to the waiting requester
//! through a single-slot channel. If the loop dies while the session is meant
//! to be open, one reconnect is attempted; if that fails the session stays
//! disconnected until the caller connects again.

use std::{
   collections::HashMap,
   fmt,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
   },
   time::Duration,
};

use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::{
   sync::{self, mpsc},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   att::protocol::{self, AttributeHandle, CCCD_NOTIFY, Inbound, OP_ERROR_RSP, Opcode},
   bluetooth::l2cap::{Connector, L2CapReceiver, L2CapSender, Packet},
   error::{HearingAidError, Result},
   event::{EventSender, HearingAidEvent},
};

/// Callback for notifications on one attribute. Runs on the receive loop, so
/// it must not block.
pub type Listener = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
   Disconnected,
   Connecting,
   Connected,
}

/// Timing knobs for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
   /// How long a request waits for its response.
   pub request_timeout: Duration,
   /// Receive poll interval; bounds how fast the loop notices a shutdown.
   pub receive_poll: Duration,
   /// How long `disconnect` waits for the receive loop to finish.
   pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
   fn default() -> Self {
      Self {
         request_timeout: Duration::from_secs(2),
         receive_poll: Duration::from_millis(100),
         shutdown_timeout: Duration::from_secs(1),
      }
   }
}

/// Internal state for an active link.
struct ConnectionState {
   sender: L2CapSender,
   receive_loop: Option<JoinHandle<()>>,
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

struct SessionInner {
   connector: Arc<dyn Connector>,
   config: SessionConfig,
   events: EventSender,
   state: AtomicCell<SessionState>,
   /// Whether the caller wants the link up.
   running: AtomicBool,
   /// Bumped on every new link so a stale receive loop cannot recover.
   generation: AtomicU64,
   reconnect_attempts: AtomicU32,
   conn: Mutex<Option<ConnectionState>>,
   responses_tx: mpsc::Sender<Packet>,
   /// Holding this lock is holding the single request slot.
   responses: sync::Mutex<mpsc::Receiver<Packet>>,
   listeners: RwLock<HashMap<AttributeHandle, SmallVec<[Listener; 2]>>>,
}

/// Handle to an ATT session. Cheaply cloneable.
#[derive(Clone)]
pub struct AttSession(Arc<SessionInner>);

#[derive(Clone)]
struct WeakSession(Weak<SessionInner>);

impl WeakSession {
   fn upgrade(&self) -> Option<AttSession> {
      self.0.upgrade().map(AttSession)
   }
}

impl fmt::Debug for AttSession {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AttSession")
         .field("state", &self.state())
         .field("running", &self.0.running.load(Ordering::Relaxed))
         .finish_non_exhaustive()
   }
}

impl AttSession {
   pub fn new(connector: Arc<dyn Connector>, config: SessionConfig, events: EventSender) -> Self {
      let (responses_tx, responses_rx) = mpsc::channel(1);
      Self(Arc::new(SessionInner {
         connector,
         config,
         events,
         state: AtomicCell::new(SessionState::Disconnected),
         running: AtomicBool::new(false),
         generation: AtomicU64::new(0),
         reconnect_attempts: AtomicU32::new(0),
         conn: Mutex::new(None),
         responses_tx,
         responses: sync::Mutex::new(responses_rx),
         listeners: RwLock::new(HashMap::new()),
      }))
   }

   pub fn state(&self) -> SessionState {
      self.0.state.load()
   }

   pub fn is_connected(&self) -> bool {
      self.state() == SessionState::Connected
   }

   /// Number of automatic reconnects attempted so far.
   pub fn reconnect_attempts(&self) -> u32 {
      self.0.reconnect_attempts.load(Ordering::SeqCst)
   }

   /// Opens the link and starts the receive loop.
   ///
   /// An existing link is torn down first.
   pub async fn connect(&self) -> Result<()> {
      self.0.running.store(true, Ordering::SeqCst);
      if let Err(e) = self.establish().await {
         self.0.running.store(false, Ordering::SeqCst);
         return Err(e);
      }
      Ok(())
   }

   /// Stops the receive loop and closes the link. Idempotent.
   pub async fn disconnect(&self) {
      info!("Disconnecting ATT channel");
      self.0.running.store(false, Ordering::SeqCst);
      let conn = self.0.conn.lock().take();
      self.0.state.store(SessionState::Disconnected);

      let Some(mut conn) = conn else {
         debug!("ATT channel already closed");
         return;
      };
      let receive_loop = conn.receive_loop.take();
      drop(conn);
      if let Some(handle) = receive_loop
         && time::timeout(self.0.config.shutdown_timeout, handle)
            .await
            .is_err()
      {
         warn!("Receive loop did not stop within {:?}", self.0.config.shutdown_timeout);
      }
      self.0.events.emit(HearingAidEvent::Disconnected);
      info!("Disconnected from ATT channel");
   }

   /// Reads the value of `handle`.
   pub async fn read(&self, handle: AttributeHandle) -> Result<Vec<u8>> {
      let pdu = protocol::read_request(handle.value());
      debug!("Sending read request for {handle}: {}", hex::encode(&pdu));
      let rsp = self.transact(&pdu).await.inspect_err(|e| {
         error!("Read of {handle} failed: {e}");
      })?;
      let payload = rsp.get(1..).unwrap_or_default().to_vec();
      debug!("Read response for {handle}: {}", hex::encode(&payload));
      Ok(payload)
   }

   /// Writes `value` to `handle`. A missing response is logged, not returned.
   pub async fn write(&self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
      debug!("Sending write request for {handle}");
      self.write_handle(handle.value(), value).await
   }

   /// Writes `value` to the configuration descriptor of `handle`.
   pub async fn write_cccd(&self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
      debug!("Sending CCCD write request for {handle}");
      self.write_handle(handle.cccd(), value).await
   }

   pub async fn enable_notifications(&self, handle: AttributeHandle) -> Result<()> {
      self.write_cccd(handle, &CCCD_NOTIFY).await?;
      info!("Enabled notifications for {handle}");
      Ok(())
   }

   /// Adds a listener for notifications on `handle`. Listeners fire in
   /// registration order.
   pub fn register_listener(&self, handle: AttributeHandle, listener: Listener) {
      self
         .0
         .listeners
         .write()
         .entry(handle)
         .or_default()
         .push(listener);
      debug!("Registered listener for {handle}");
   }

   /// Removes a listener previously registered for `handle`.
   ///
   /// Returns `false` if it was not registered.
   pub fn unregister_listener(&self, handle: AttributeHandle, listener: &Listener) -> bool {
      let mut listeners = self.0.listeners.write();
      let Some(list) = listeners.get_mut(&handle) else {
         return false;
      };
      let Some(pos) = list.iter().position(|l| Arc::ptr_eq(l, listener)) else {
         return false;
      };
      list.remove(pos);
      if list.is_empty() {
         listeners.remove(&handle);
      }
      debug!("Unregistered listener for {handle}");
      true
   }

   fn downgrade(&self) -> WeakSession {
      WeakSession(Arc::downgrade(&self.0))
   }

   fn sender(&self) -> Result<L2CapSender> {
      self
         .0
         .conn
         .lock()
         .as_ref()
         .map(|c| c.sender.clone())
         .ok_or(HearingAidError::NotConnected)
   }

   async fn establish(&self) -> Result<()> {
      info!("Connecting ATT channel");
      let previous = {
         let mut conn = self.0.conn.lock();
         // The old receive loop must be retired before its link is dropped.
         self.0.generation.fetch_add(1, Ordering::SeqCst);
         conn.take()
      };
      drop(previous);
      self.0.state.store(SessionState::Connecting);

      let mut jset = JoinSet::new();
      let (receiver, sender) = match self.0.connector.connect(&mut jset).await {
         Ok(link) => link,
         Err(e) => {
            self.0.state.store(SessionState::Disconnected);
            return Err(e);
         },
      };

      let mut conn = self.0.conn.lock();
      if !self.0.running.load(Ordering::SeqCst) {
         // Disconnected while the link was coming up.
         self.0.state.store(SessionState::Disconnected);
         return Err(HearingAidError::NotConnected);
      }
      let generation = self.0.generation.fetch_add(1, Ordering::SeqCst) + 1;
      self.0.state.store(SessionState::Connected);
      self.0.events.emit(HearingAidEvent::Connected);
      let receive_loop = spawn_receive_loop(
         self.downgrade(),
         receiver,
         self.0.responses_tx.clone(),
         self.0.config.receive_poll,
         generation,
      );
      *conn = Some(ConnectionState {
         sender,
         receive_loop: Some(receive_loop),
         jset,
      });
      drop(conn);

      info!("ATT channel connected");
      Ok(())
   }

   /// Sends `pdu` and waits for the next response.
   async fn transact(&self, pdu: &[u8]) -> Result<Packet> {
      let mut responses = self.0.responses.lock().await;
      while let Ok(stale) = responses.try_recv() {
         debug!("Discarding stale response: {}", hex::encode(&stale));
      }

      self.sender()?.send(pdu).await?;

      match time::timeout(self.0.config.request_timeout, responses.recv()).await {
         Ok(Some(rsp)) => Ok(rsp),
         Ok(None) => Err(HearingAidError::ConnectionClosed),
         Err(_) => Err(HearingAidError::RequestTimeout),
      }
   }

   async fn write_handle(&self, raw: u16, value: &[u8]) -> Result<()> {
      let pdu = protocol::write_request(raw, value);
      match self.transact(&pdu).await {
         Ok(rsp) => {
            if let Some(&op) = rsp.first() {
               debug!("Write response for handle 0x{raw:04x}: {}", Opcode(op));
            }
            Ok(())
         },
         Err(HearingAidError::RequestTimeout) => {
            warn!("No write response received for handle 0x{raw:04x}");
            Ok(())
         },
         Err(e) => Err(e),
      }
   }

   fn dispatch(&self, pdu: &[u8], responses: &mpsc::Sender<Packet>) {
      match Inbound::classify(pdu) {
         Inbound::Notification { handle, value } => {
            debug!("Notification for handle 0x{handle:04x}: {}", hex::encode(value));
            let Some(attr) = AttributeHandle::from_value(handle) else {
               debug!("No listeners for unknown handle 0x{handle:04x}");
               return;
            };
            // Cloned so listeners may (un)register without deadlocking.
            let listeners = self.0.listeners.read().get(&attr).cloned();
            for listener in listeners.iter().flatten() {
               listener(value);
            }
         },
         Inbound::Malformed => {
            warn!("Dropping truncated notification: {}", hex::encode(pdu));
         },
         Inbound::Response(rsp) => {
            if rsp.first() == Some(&OP_ERROR_RSP) {
               debug!("Error response: {}", hex::encode(rsp));
            }
            if responses.try_send(Packet::from_slice(rsp)).is_err() {
               warn!("Dropping unsolicited response: {}", hex::encode(rsp));
            }
         },
      }
   }

   /// Replaces a dead link, once.
   async fn recover(&self, generation: u64) {
      {
         let mut conn = self.0.conn.lock();
         if self.0.generation.load(Ordering::SeqCst) != generation
            || !self.0.running.load(Ordering::SeqCst)
         {
            return;
         }
         let _ = conn.take();
         self.0.state.store(SessionState::Disconnected);
      }
      self.0.events.emit(HearingAidEvent::Disconnected);

      self.0.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
      info!("Receive loop stopped, trying to reconnect");
      match self.establish().await {
         Ok(()) => info!("Reconnected ATT channel"),
         Err(_) if !self.0.running.load(Ordering::SeqCst) => {
            debug!("Reconnect abandoned, session was closed");
         },
         Err(e) => {
            error!("Reconnection failed: {e}");
            self.0.running.store(false, Ordering::SeqCst);
            self.0.state.store(SessionState::Disconnected);
            self.0.events.emit(HearingAidEvent::ReconnectFailed);
         },
      }
   }
}

fn spawn_receive_loop(
   weak: WeakSession,
   rx: L2CapReceiver,
   responses: mpsc::Sender<Packet>,
   poll: Duration,
   generation: u64,
) -> JoinHandle<()> {
   tokio::spawn(receive_loop(weak, rx, responses, poll, generation))
}

async fn receive_loop(
   weak: WeakSession,
   mut rx: L2CapReceiver,
   responses: mpsc::Sender<Packet>,
   poll: Duration,
   generation: u64,
) {
   debug!("Receive loop started");
   let cause = loop {
      let current = weak.0.upgrade().is_some_and(|inner| {
         inner.running.load(Ordering::SeqCst)
            && inner.generation.load(Ordering::SeqCst) == generation
      });
      if !current {
         debug!("Receive loop stopped");
         return;
      }
      match time::timeout(poll, rx.recv()).await {
         Err(_) => continue,
         Ok(Err(e)) => break e,
         Ok(Ok(pdu)) => {
            let Some(this) = weak.upgrade() else {
               return;
            };
            this.dispatch(&pdu, &responses);
         },
      }
   };

   let Some(this) = weak.upgrade() else {
      return;
   };
   if !this.0.running.load(Ordering::SeqCst) {
      debug!("Receive loop stopped: {cause}");
      return;
   }
   warn!("Receive loop terminated: {cause}");
   this.recover(generation).await;
}
