//! Listener registration types

use std::fmt;

use crate::device::{DeviceEvent, DeviceId};
use crate::protocol::{MidiEvent, MidiMessage};

/// Decoded message tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    /// Device that produced the message
    pub device_id: DeviceId,
    /// USB cable / MIDI 2.0 group, 0 for transports without groups
    pub group: u8,
    /// Logical timestamp; always 0
    pub timestamp: u64,
    /// Structured event
    pub event: MidiEvent,
    /// Wire message the event was decoded from
    pub message: MidiMessage,
}

/// Receives MIDI and device events on the dispatch thread.
///
/// Callbacks run one at a time on a single thread, in receive order per
/// device. They must not block for long and must not call
/// [`MidiContext::flush`](crate::MidiContext::flush) or
/// [`MidiContext::terminate`](crate::MidiContext::terminate).
pub trait MidiListener: Send + Sync {
    /// A message whose type is in the subscription mask arrived
    fn on_midi_event(&self, event: &ReceivedEvent);

    /// A device was attached or detached (only with [`EventMask::DEVICES`](crate::EventMask::DEVICES))
    fn on_device_event(&self, _event: &DeviceEvent) {}
}

impl<F> MidiListener for F
where
    F: Fn(&ReceivedEvent) + Send + Sync,
{
    fn on_midi_event(&self, event: &ReceivedEvent) {
        self(event);
    }
}

/// Handle returned by subscribe, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
