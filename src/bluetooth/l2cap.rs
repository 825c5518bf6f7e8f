//! L2CAP socket implementation for the accessory's ATT channel.
//!
//! This module provides async L2CAP socket handling with separate
//! sender and receiver channels, and the [`Connector`] seam the ATT session
//! opens links through.

use std::{io, sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use futures::future::BoxFuture;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   att::protocol::ATT_MAX_PDU,
   error::{HearingAidError, Result},
};

/// A single PDU. Settings records fit inline.
pub type Packet = SmallVec<[u8; 128]>;

/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(HearingAidError::ConnectionClosed)?
   }
}

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(HearingAidError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| HearingAidError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| HearingAidError::RequestTimeout)?
         .map_err(|_| HearingAidError::ConnectionClosed)?
   }
}

/// Opens links for the ATT session.
///
/// Socket tasks backing the link are spawned into `jset` so the caller can
/// tear them down by dropping it.
pub trait Connector: Send + Sync + 'static {
   fn connect<'a>(
      &'a self,
      jset: &'a mut JoinSet<()>,
   ) -> BoxFuture<'a, Result<(L2CapReceiver, L2CapSender)>>;
}

/// Connects to a fixed peer over a BR/EDR L2CAP SeqPacket channel.
#[derive(Debug, Clone, Copy)]
pub struct L2CapConnector {
   pub address: Address,
   pub psm: u16,
}

impl Connector for L2CapConnector {
   fn connect<'a>(
      &'a self,
      jset: &'a mut JoinSet<()>,
   ) -> BoxFuture<'a, Result<(L2CapReceiver, L2CapSender)>> {
      Box::pin(connect(jset, self.address, self.psm))
   }
}

pub async fn connect(
   jset: &mut JoinSet<()>,
   address: Address,
   psm: u16,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet().map_err(HearingAidError::Connection)?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| HearingAidError::Connection(io::ErrorKind::TimedOut.into()))?
      .map_err(HearingAidError::Connection)?;

   let (cmd_tx, cmd_rx) = mpsc::channel(16);
   let (in_tx, in_rx) = mpsc::channel(16);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_thread(address, in_tx, seq_packet.clone()));
   jset.spawn(send_thread(address, cmd_rx, seq_packet));

   Ok((L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx }))
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Result<Packet>>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; ATT_MAX_PDU];
   loop {
      let n = match sp.recv(&mut stack).await {
         Ok(n) => n,
         Err(e) => {
            warn!("Receive failed: {e}");
            let _ = tx.send(Err(HearingAidError::Io(e))).await;
            return;
         },
      };
      if n == 0 {
         warn!("Connection lost");
         let _ = tx.send(Err(HearingAidError::ConnectionLost)).await;
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      if let Err(e) = tx.send(Ok(Packet::from_slice(recvd))).await {
         warn!("Failed to send data: {e:?}");
         return;
      }
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(HearingAidError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: sender closed");
}
