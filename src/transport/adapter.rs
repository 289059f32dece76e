//! Contract between transports and the MIDI core

use std::fmt;
use std::sync::{Arc, Weak};

use crate::device::{DeviceId, Role};
use crate::dispatch::DispatchHub;
use crate::protocol::{MidiMessage, Result};

/// Family of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// USB-MIDI class devices
    Usb,
    /// Bluetooth LE MIDI
    Ble,
    /// Platform MIDI driver (MME, Core MIDI, ALSA)
    Native,
    /// RTP-MIDI / AppleMIDI network sessions
    RtpMidi,
    /// In-process virtual ports
    Virtual,
}

impl TransportKind {
    /// Short lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Ble => "ble",
            Self::Native => "native",
            Self::RtpMidi => "rtpmidi",
            Self::Virtual => "virtual",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One MIDI transport (USB, BLE, platform driver, network, virtual).
///
/// Implementations push inbound traffic through the [`AdapterSink`] handed to
/// [`start`](Self::start) and accept outbound bytes through
/// [`send`](Self::send). Sends are best effort: an `Err` is logged by the
/// caller and never surfaced to the application.
pub trait TransportAdapter: Send + Sync {
    /// Transport family
    fn kind(&self) -> TransportKind;

    /// Begin delivering traffic.
    ///
    /// Returns [`Error::TransportUnavailable`](crate::Error::TransportUnavailable)
    /// when the platform lacks the feature.
    fn start(&self, sink: AdapterSink) -> Result<()>;

    /// Stop delivering traffic and detach every device this transport attached
    fn stop(&self);

    /// Send one encoded message to a device. `group` is the USB cable or
    /// MIDI 2.0 group; transports without groups ignore it.
    fn send(&self, device_id: &DeviceId, group: u8, bytes: &[u8]) -> Result<()>;

    /// Display name of a device, if the transport can tell
    fn query_name(&self, device_id: &DeviceId) -> Option<String>;
}

/// Inbound half of the transport contract, handed to each adapter on start.
///
/// Cheap to clone. The sink refers back to its adapter weakly, so an adapter
/// may store its own sink without creating a cycle.
#[derive(Clone)]
pub struct AdapterSink {
    hub: Arc<DispatchHub>,
    transport: Weak<dyn TransportAdapter>,
}

impl AdapterSink {
    /// Bind `transport` to the dispatch hub
    #[must_use]
    pub fn new(hub: Arc<DispatchHub>, transport: &Arc<dyn TransportAdapter>) -> Self {
        Self {
            hub,
            transport: Arc::downgrade(transport),
        }
    }

    /// Report a new endpoint
    pub fn notify_attached(&self, device_id: &DeviceId, role: Role) {
        if let Some(transport) = self.transport.upgrade() {
            self.hub.attach(device_id, role, &transport);
        }
    }

    /// Report a vanished endpoint
    pub fn notify_detached(&self, device_id: &DeviceId, role: Role) {
        self.hub.detach(device_id, role);
    }

    /// Deliver raw bytes holding one or more complete messages
    pub fn deliver_bytes(&self, device_id: &DeviceId, group: u8, bytes: &[u8]) {
        self.hub.on_receive(device_id, group, bytes);
    }

    /// Deliver a message the transport already decoded
    pub fn deliver_message(&self, device_id: &DeviceId, group: u8, message: MidiMessage) {
        self.hub.on_message(device_id, group, message);
    }
}

impl fmt::Debug for AdapterSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSink")
            .field("transport_alive", &(self.transport.strong_count() > 0))
            .finish()
    }
}
