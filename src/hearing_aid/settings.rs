//! Hearing-aid settings record and its binary codec.
//!
//! The accessory exposes its settings as one characteristic holding a
//! fixed-offset little-endian record. The first four bytes are an opaque
//! header, followed by a 48-byte block per ear and the own-voice gain:
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0..4   | header (byte 2 is the write marker)     |
//! | 4..52  | left ear block                          |
//! | 52..100| right ear block                         |
//! | 100    | own voice amplification                 |
//!
//! Each ear block is eight EQ gains (dBHL, one per audiogram band) followed by
//! amplification, tone, conversation boost (as a float) and ambient noise
//! reduction. All values are `f32`.
//!
//! Encoding is a patch: a write is built from a buffer previously read from the
//! device, so bytes this codec does not understand go back unchanged.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
   error::{HearingAidError, Result},
   hearing_aid::balance::{join_amplification, split_amplification},
};

/// Minimum size of a settings buffer.
pub const SETTINGS_LEN: usize = 104;
/// Number of audiogram bands per ear.
pub const EQ_BANDS: usize = 8;
/// Audiogram band labels, in wire order.
pub const EQ_BAND_LABELS: [&str; EQ_BANDS] =
   ["250Hz", "500Hz", "1kHz", "2kHz", "3kHz", "4kHz", "6kHz", "8kHz"];

/// Header byte overwritten on every write.
const MARKER_OFFSET: usize = 2;
/// Value the accessory expects at [`MARKER_OFFSET`]. Semantics unknown.
const WRITE_MARKER: u8 = 0x64;

const LEFT_OFFSET: usize = 4;
const RIGHT_OFFSET: usize = 52;
const OWN_VOICE_OFFSET: usize = 100;

// Offsets within an ear block
const EAR_AMPLIFICATION: usize = 32;
const EAR_TONE: usize = 36;
const EAR_CONVERSATION_BOOST: usize = 40;
const EAR_NOISE_REDUCTION: usize = 44;

/// Settings for a single ear.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EarSettings {
   /// Hearing loss per band, in dBHL.
   pub eq: [f32; EQ_BANDS],
   /// Nominally `[-1, 1]`, never clamped.
   pub amplification: f32,
   pub tone: f32,
   pub conversation_boost: bool,
   pub ambient_noise_reduction: f32,
}

impl EarSettings {
   fn read(buf: &[u8], base: usize) -> Self {
      let mut eq = [0f32; EQ_BANDS];
      for (i, band) in eq.iter_mut().enumerate() {
         *band = read_f32(buf, base + i * 4);
      }
      Self {
         eq,
         amplification: read_f32(buf, base + EAR_AMPLIFICATION),
         tone: read_f32(buf, base + EAR_TONE),
         conversation_boost: read_f32(buf, base + EAR_CONVERSATION_BOOST) > 0.5,
         ambient_noise_reduction: read_f32(buf, base + EAR_NOISE_REDUCTION),
      }
   }

   fn write(&self, buf: &mut [u8], base: usize) {
      for (i, band) in self.eq.iter().enumerate() {
         write_f32(buf, base + i * 4, *band);
      }
      write_f32(buf, base + EAR_AMPLIFICATION, self.amplification);
      write_f32(buf, base + EAR_TONE, self.tone);
      let boost = if self.conversation_boost { 1.0 } else { 0.0 };
      write_f32(buf, base + EAR_CONVERSATION_BOOST, boost);
      write_f32(buf, base + EAR_NOISE_REDUCTION, self.ambient_noise_reduction);
   }
}

/// Aggregate controls as presented to the user.
///
/// Tone, noise reduction and conversation boost apply to both ears; the
/// amplification is split per ear through the balance transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Controls {
   pub amplification: f32,
   pub balance: f32,
   pub tone: f32,
   pub ambient_noise_reduction: f32,
   pub conversation_boost: bool,
   pub own_voice_amplification: f32,
}

impl Default for Controls {
   /// The values the "reset" action restores.
   fn default() -> Self {
      Self {
         amplification: 0.0,
         balance: 0.0,
         tone: 0.0,
         ambient_noise_reduction: 0.5,
         conversation_boost: false,
         own_voice_amplification: 0.5,
      }
   }
}

/// Decoded hearing-aid settings.
///
/// A record is never mutated in place; the `with_*` methods return a new one.
/// Net amplification and balance are derived from the per-ear values and are
/// never stored or sent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HearingAidSettings {
   pub left: EarSettings,
   pub right: EarSettings,
   pub own_voice_amplification: f32,
}

impl HearingAidSettings {
   /// Decodes settings from a buffer read from the device.
   ///
   /// Returns `None` if the buffer is shorter than [`SETTINGS_LEN`]. Bytes past
   /// that length are ignored.
   pub fn decode(data: &[u8]) -> Option<Self> {
      if data.len() < SETTINGS_LEN {
         warn!(
            "Settings buffer too short: expected at least {SETTINGS_LEN} bytes, got {}",
            data.len()
         );
         return None;
      }
      debug!("Decoding settings: {}", hex::encode(data));

      let settings = Self {
         left: EarSettings::read(data, LEFT_OFFSET),
         right: EarSettings::read(data, RIGHT_OFFSET),
         own_voice_amplification: read_f32(data, OWN_VOICE_OFFSET),
      };
      debug!(
         "Decoded settings: amp={}, balance={}",
         settings.net_amplification(),
         settings.balance()
      );
      Some(settings)
   }

   /// Builds a write buffer by patching `prior`, a buffer read from the device.
   ///
   /// Everything outside the known fields is preserved, except the marker
   /// byte which is always set. `prior` is never modified.
   pub fn encode(&self, prior: &[u8]) -> Result<Vec<u8>> {
      let mut buf = prior.to_vec();
      self.encode_into(&mut buf)?;
      Ok(buf)
   }

   /// In-place variant of [`encode`](Self::encode).
   ///
   /// A buffer shorter than [`SETTINGS_LEN`] is left untouched.
   pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
      if buf.len() < SETTINGS_LEN {
         return Err(HearingAidError::ShortBuffer {
            expected: SETTINGS_LEN,
            actual: buf.len(),
         });
      }
      buf[MARKER_OFFSET] = WRITE_MARKER;
      self.left.write(buf, LEFT_OFFSET);
      self.right.write(buf, RIGHT_OFFSET);
      write_f32(buf, OWN_VOICE_OFFSET, self.own_voice_amplification);
      Ok(())
   }

   /// Average of both ears' amplification, clamped to `[-1, 1]`.
   pub fn net_amplification(&self) -> f32 {
      join_amplification(self.left.amplification, self.right.amplification).0
   }

   /// Right minus left amplification, clamped to `[-1, 1]`.
   pub fn balance(&self) -> f32 {
      join_amplification(self.left.amplification, self.right.amplification).1
   }

   /// The aggregate view of these settings, read off the left ear.
   pub fn controls(&self) -> Controls {
      Controls {
         amplification: self.net_amplification(),
         balance: self.balance(),
         tone: self.left.tone,
         ambient_noise_reduction: self.left.ambient_noise_reduction,
         conversation_boost: self.left.conversation_boost,
         own_voice_amplification: self.own_voice_amplification,
      }
   }

   /// Returns a copy with per-ear amplification derived from an aggregate
   /// amplification and balance.
   pub fn with_amplification(&self, amplification: f32, balance: f32) -> Self {
      let (left, right) = split_amplification(amplification, balance);
      let mut next = *self;
      next.left.amplification = left;
      next.right.amplification = right;
      next
   }

   /// Returns a copy with `controls` applied to both ears. EQ is kept.
   pub fn with_controls(&self, controls: &Controls) -> Self {
      let mut next = self.with_amplification(controls.amplification, controls.balance);
      for ear in [&mut next.left, &mut next.right] {
         ear.tone = controls.tone;
         ear.ambient_noise_reduction = controls.ambient_noise_reduction;
         ear.conversation_boost = controls.conversation_boost;
      }
      next.own_voice_amplification = controls.own_voice_amplification;
      next
   }

   /// Returns a copy with the reset defaults applied. EQ is kept.
   pub fn reset(&self) -> Self {
      self.with_controls(&Controls::default())
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "left": self.left,
          "right": self.right,
          "eq_bands": EQ_BAND_LABELS,
          "own_voice_amplification": self.own_voice_amplification,
          "net_amplification": self.net_amplification(),
          "balance": self.balance(),
      })
   }
}

fn read_f32(buf: &[u8], offset: usize) -> f32 {
   let mut raw = [0u8; 4];
   raw.copy_from_slice(&buf[offset..offset + 4]);
   f32::from_le_bytes(raw)
}

fn write_f32(buf: &mut [u8], offset: usize, value: f32) {
   buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
