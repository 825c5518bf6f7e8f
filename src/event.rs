//! Event handling system for hearing-aid status updates.
//!
//! The ATT session reports link changes and the settings service reports
//! decoded settings through an [`EventBus`], which the D-Bus layer turns into
//! signals.

use std::sync::Arc;

use crate::hearing_aid::settings::HearingAidSettings;

/// Events that can be emitted by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum HearingAidEvent {
   Connected,
   Disconnected,
   /// The one-shot reconnect after a link loss failed.
   ReconnectFailed,
   /// Settings were read or pushed by the accessory.
   SettingsChanged(HearingAidSettings),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: HearingAidEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

#[cfg(test)]
pub mod testing {
   use parking_lot::Mutex;

   use super::*;

   /// Records events for inspection.
   #[derive(Default)]
   pub struct RecordingBus {
      events: Mutex<Vec<HearingAidEvent>>,
   }

   impl RecordingBus {
      pub fn events(&self) -> Vec<HearingAidEvent> {
         self.events.lock().clone()
      }

      pub fn settings(&self) -> Vec<HearingAidSettings> {
         self
            .events()
            .into_iter()
            .filter_map(|e| match e {
               HearingAidEvent::SettingsChanged(s) => Some(s),
               _ => None,
            })
            .collect()
      }
   }

   impl EventBus for RecordingBus {
      fn emit(&self, event: HearingAidEvent) {
         self.events.lock().push(event);
      }
   }
}
