//! ATT protocol definitions.
//!
//! Only the handful of opcodes the accessory needs are modelled. Attribute
//! handles are fixed by the firmware and never discovered.

use std::fmt;

use crate::bluetooth::l2cap::Packet;

/// PSM the accessory listens on for ATT.
pub const PSM_ATT: u16 = 31;
/// Largest PDU the accessory sends.
pub const ATT_MAX_PDU: usize = 512;

pub const OP_ERROR_RSP: u8 = 0x01;
pub const OP_READ_REQ: u8 = 0x0A;
pub const OP_READ_RSP: u8 = 0x0B;
pub const OP_WRITE_REQ: u8 = 0x12;
pub const OP_WRITE_RSP: u8 = 0x13;
pub const OP_HANDLE_VALUE_NTF: u8 = 0x1B;

/// Value written to a CCCD to enable notifications.
pub const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];

/// Characteristics exposed by the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum AttributeHandle {
   Transparency,
   LoudSoundReduction,
   HearingAid,
}

impl AttributeHandle {
   /// Value handle of the characteristic.
   pub const fn value(self) -> u16 {
      match self {
         Self::Transparency => 0x18,
         Self::LoudSoundReduction => 0x1B,
         Self::HearingAid => 0x2A,
      }
   }

   /// Client characteristic configuration handle, adjacent to the value.
   pub const fn cccd(self) -> u16 {
      self.value() + 1
   }

   pub fn from_value(handle: u16) -> Option<Self> {
      <Self as strum::IntoEnumIterator>::iter().find(|h| h.value() == handle)
   }
}

/// Builds a Read Request for `handle`.
pub fn read_request(handle: u16) -> Packet {
   [OP_READ_REQ].into_iter().chain(handle.to_le_bytes()).collect()
}

/// Builds a Write Request carrying `value`.
pub fn write_request(handle: u16, value: &[u8]) -> Packet {
   [OP_WRITE_REQ]
      .into_iter()
      .chain(handle.to_le_bytes())
      .chain(value.iter().copied())
      .collect()
}

/// An inbound PDU, split by how the session routes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
   /// Unsolicited value update, goes to listeners.
   Notification { handle: u16, value: &'a [u8] },
   /// Anything else answers the outstanding request.
   Response(&'a [u8]),
   /// A notification too short to carry a handle.
   Malformed,
}

impl<'a> Inbound<'a> {
   pub fn classify(pdu: &'a [u8]) -> Self {
      match pdu {
         [OP_HANDLE_VALUE_NTF, lsb, msb, value @ ..] => Self::Notification {
            handle: u16::from_le_bytes([*lsb, *msb]),
            value,
         },
         [OP_HANDLE_VALUE_NTF, ..] => Self::Malformed,
         _ => Self::Response(pdu),
      }
   }
}

/// Human-readable opcode name for logs.
pub struct Opcode(pub u8);

impl fmt::Display for Opcode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self.0 {
         OP_ERROR_RSP => "error-rsp",
         OP_READ_REQ => "read-req",
         OP_READ_RSP => "read-rsp",
         OP_WRITE_REQ => "write-req",
         OP_WRITE_RSP => "write-rsp",
         OP_HANDLE_VALUE_NTF => "notify",
         other => return write!(f, "0x{other:02x}"),
      };
      f.write_str(name)
   }
}
