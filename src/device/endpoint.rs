//! Transmitter and receiver endpoints

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::protocol::MidiMessage;
use crate::transport::TransportAdapter;

use super::DeviceId;

/// Sink accepting MIDI messages (an output endpoint or an in-process consumer).
///
/// `send` is fire-and-forget; failures are logged by the implementation.
pub trait Receiver: Send + Sync {
    /// Deliver a message. `timestamp` is in microseconds, or -1 when unknown.
    fn send(&self, message: &MidiMessage, timestamp: i64);

    /// Release the receiver; later sends are ignored
    fn close(&self);
}

/// Input endpoint forwarding everything it produces to an attached receiver.
///
/// The transmitter does not own its receiver: it keeps a weak reference so
/// whoever attached the receiver controls its lifetime.
#[derive(Default)]
pub struct Transmitter {
    receiver: RwLock<Option<Weak<dyn Receiver>>>,
}

impl Transmitter {
    /// Create a transmitter with no receiver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or replace) the receiver
    pub fn set_receiver(&self, receiver: &Arc<dyn Receiver>) {
        *self.receiver.write() = Some(Arc::downgrade(receiver));
    }

    /// Detach the receiver without closing it
    pub fn clear_receiver(&self) {
        *self.receiver.write() = None;
    }

    /// Currently attached receiver, if still alive
    #[must_use]
    pub fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        self.receiver.read().as_ref().and_then(Weak::upgrade)
    }

    /// Forward a message to the attached receiver
    pub fn transmit(&self, message: &MidiMessage, timestamp: i64) {
        if let Some(receiver) = self.receiver() {
            receiver.send(message, timestamp);
        }
    }

    /// Close the attached receiver and detach it
    pub fn close(&self) {
        if let Some(receiver) = self.receiver.write().take().and_then(|weak| weak.upgrade()) {
            receiver.close();
        }
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("has_receiver", &self.receiver().is_some())
            .finish()
    }
}

/// Output endpoint that encodes messages and hands them to a transport.
pub struct DeviceReceiver {
    device_id: DeviceId,
    transport: Arc<dyn TransportAdapter>,
    closed: AtomicBool,
}

impl DeviceReceiver {
    /// Create a receiver sending through `transport`
    #[must_use]
    pub fn new(device_id: DeviceId, transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            device_id,
            transport,
            closed: AtomicBool::new(false),
        }
    }

    /// Device this receiver writes to
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Transport this receiver writes through
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        &self.transport
    }

    /// Check whether the receiver was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encode and send a message on a specific group (USB cable).
    ///
    /// Returns `true` if the transport accepted the bytes.
    pub fn send_in_group(&self, message: &MidiMessage, group: u8) -> bool {
        if self.is_closed() {
            trace!(device = %self.device_id, "send on closed receiver ignored");
            return false;
        }
        if message.is_meta() {
            trace!(device = %self.device_id, "meta message not sent to live transport");
            return false;
        }
        let bytes = message.encode();
        match self.transport.send(&self.device_id, group, &bytes) {
            Ok(()) => true,
            Err(err) => {
                debug!(device = %self.device_id, error = %err, "transport send failed");
                false
            }
        }
    }
}

impl Receiver for DeviceReceiver {
    fn send(&self, message: &MidiMessage, _timestamp: i64) {
        self.send_in_group(message, 0);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for DeviceReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReceiver")
            .field("device_id", &self.device_id)
            .field("transport", &self.transport.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ShortMessage;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MidiMessage>>,
        closed: AtomicBool,
    }

    impl Receiver for Recorder {
        fn send(&self, message: &MidiMessage, _timestamp: i64) {
            self.seen.lock().push(message.clone());
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn transmitter_forwards_to_receiver() {
        let recorder = Arc::new(Recorder::default());
        let receiver: Arc<dyn Receiver> = recorder.clone();
        let transmitter = Transmitter::new();
        transmitter.set_receiver(&receiver);

        let msg = MidiMessage::from(ShortMessage::note_on(0, 60, 1).unwrap());
        transmitter.transmit(&msg, -1);
        assert_eq!(recorder.seen.lock().as_slice(), &[msg]);
    }

    #[test]
    fn transmitter_does_not_keep_receiver_alive() {
        let transmitter = Transmitter::new();
        {
            let receiver: Arc<dyn Receiver> = Arc::new(Recorder::default());
            transmitter.set_receiver(&receiver);
            assert!(transmitter.receiver().is_some());
        }
        assert!(transmitter.receiver().is_none());
    }

    #[test]
    fn transmitter_close_closes_receiver() {
        let recorder = Arc::new(Recorder::default());
        let receiver: Arc<dyn Receiver> = recorder.clone();
        let transmitter = Transmitter::new();
        transmitter.set_receiver(&receiver);
        transmitter.close();
        assert!(recorder.closed.load(Ordering::SeqCst));
        assert!(transmitter.receiver().is_none());
    }
}
