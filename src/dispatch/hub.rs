//! Event dispatch hub
//!
//! Transport threads decode on their own thread and enqueue; one dispatch
//! thread drains the queue, fans each event out to listeners whose mask
//! matches, and loops the message back to every transmitter's receiver.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, trace, warn};

use crate::config::DispatchConfig;
use crate::device::{DeviceEvent, DeviceId, DeviceRegistry, Role};
use crate::metrics::Metrics;
use crate::protocol::{Decoder, Error, EventMask, MidiEvent, MidiMessage, Result};
use crate::transport::TransportAdapter;

use super::{ListenerId, MidiListener, ReceivedEvent};

#[derive(Clone)]
struct Subscription {
    id: ListenerId,
    mask: EventMask,
    listener: Arc<dyn MidiListener>,
}

enum Envelope {
    Midi {
        device_id: DeviceId,
        group: u8,
        message: MidiMessage,
        queued_at: Instant,
    },
    Device(DeviceEvent),
    Flush(Sender<()>),
    Shutdown,
}

struct Shared {
    registry: Arc<DeviceRegistry>,
    subscriptions: ArcSwap<Vec<Subscription>>,
    metrics: Arc<Metrics>,
}

/// Routes inbound messages to listeners and outbound messages to transports.
pub struct DispatchHub {
    shared: Arc<Shared>,
    sender: Sender<Envelope>,
    running: AtomicBool,
    next_listener: AtomicU64,
    routes: RwLock<HashMap<u16, Arc<dyn TransportAdapter>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchHub {
    /// Spawn the dispatch thread
    #[instrument(level = "debug", skip(registry, metrics))]
    pub fn start(
        config: &DispatchConfig,
        registry: Arc<DeviceRegistry>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be at least 1".into()));
        }

        let (sender, receiver) = crossbeam_channel::bounded(config.queue_capacity);
        let shared = Arc::new(Shared {
            registry,
            subscriptions: ArcSwap::from_pointee(Vec::new()),
            metrics,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || dispatch_loop(&worker_shared, &receiver))?;

        Ok(Self {
            shared,
            sender,
            running: AtomicBool::new(true),
            next_listener: AtomicU64::new(1),
            routes: RwLock::new(HashMap::new()),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Device registry this hub updates
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Check whether the dispatch thread accepts work
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a listener for the event types in `mask`
    pub fn subscribe(&self, listener: Arc<dyn MidiListener>, mask: EventMask) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.subscriptions.rcu(|current| {
            let mut next = (**current).clone();
            next.push(Subscription {
                id,
                mask,
                listener: Arc::clone(&listener),
            });
            next
        });
        debug!(listener = %id, %mask, "listener subscribed");
        id
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let previous = self.shared.subscriptions.rcu(|current| {
            current
                .iter()
                .filter(|sub| sub.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        let removed = previous.iter().any(|sub| sub.id == id);
        if removed {
            debug!(listener = %id, "listener unsubscribed");
        }
        removed
    }

    /// Number of subscribed listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.subscriptions.load().len()
    }

    /// Attach an endpoint and notify device listeners on change
    pub fn attach(&self, device_id: &DeviceId, role: Role, transport: &Arc<dyn TransportAdapter>) {
        if self.shared.registry.attach(device_id, role, transport) {
            self.enqueue(Envelope::Device(DeviceEvent::attached(device_id.clone(), role)));
        }
    }

    /// Detach an endpoint and notify device listeners on change
    pub fn detach(&self, device_id: &DeviceId, role: Role) {
        if self.shared.registry.detach(device_id, role) {
            self.enqueue(Envelope::Device(DeviceEvent::detached(device_id.clone(), role)));
        }
    }

    /// Decode raw bytes from a transport and queue every message for dispatch.
    ///
    /// Malformed bytes are logged and dropped.
    pub fn on_receive(&self, device_id: &DeviceId, group: u8, bytes: &[u8]) {
        for decoded in Decoder::new(bytes) {
            match decoded {
                Ok(message) => self.on_message(device_id, group, message),
                Err(err) => {
                    self.shared.metrics.record_decode_error();
                    debug!(device = %device_id, group, error = %err, "dropping undecodable bytes");
                }
            }
        }
    }

    /// Queue an already decoded message for dispatch
    pub fn on_message(&self, device_id: &DeviceId, group: u8, message: MidiMessage) {
        if message.is_meta() {
            trace!(device = %device_id, "meta message ignored on live input");
            return;
        }
        self.enqueue(Envelope::Midi {
            device_id: device_id.clone(),
            group,
            message,
            queued_at: Instant::now(),
        });
    }

    fn enqueue(&self, envelope: Envelope) {
        if !self.is_running() {
            self.shared.metrics.record_dropped();
            trace!("dispatch stopped; event dropped");
            return;
        }
        match self.sender.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.metrics.record_queue_overflow();
                warn!("dispatch queue full; event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.metrics.record_dropped();
                trace!("dispatch thread gone; event dropped");
            }
        }
    }

    /// Route outbound traffic for an RTP-MIDI session port
    pub fn register_route(&self, port: u16, transport: Arc<dyn TransportAdapter>) {
        self.routes.write().insert(port, transport);
    }

    /// Forget the route for an RTP-MIDI session port
    pub fn remove_route(&self, port: u16) {
        self.routes.write().remove(&port);
    }

    /// Send a message to a device.
    ///
    /// Resolves the device's output endpoint, falling back to the RTP-MIDI
    /// session whose port is embedded in the device id. Unknown devices are a
    /// silent no-op since devices can detach at any time.
    pub fn send(&self, device_id: &DeviceId, group: u8, message: &MidiMessage) {
        if message.is_meta() {
            trace!(device = %device_id, "meta message not sent to live transport");
            return;
        }

        if let Some(receiver) = self.shared.registry.receiver(device_id) {
            if receiver.send_in_group(message, group) {
                self.shared.metrics.record_sent();
            } else {
                self.shared.metrics.record_dropped();
            }
            return;
        }

        let route = device_id
            .rtp_midi_port()
            .and_then(|port| self.routes.read().get(&port).cloned());

        match route {
            Some(transport) => match transport.send(device_id, group, &message.encode()) {
                Ok(()) => self.shared.metrics.record_sent(),
                Err(err) => {
                    self.shared.metrics.record_dropped();
                    debug!(device = %device_id, error = %err, "RTP-MIDI send failed");
                }
            },
            None => {
                self.shared.metrics.record_dropped();
                debug!(device = %device_id, "send to unknown device ignored");
            }
        }
    }

    /// Block until everything queued before this call has been delivered.
    ///
    /// Must not be called from a listener callback.
    pub fn flush(&self) {
        if !self.is_running() {
            return;
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.sender.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Stop the dispatch thread.
    ///
    /// Events queued before the call are still delivered; none are delivered
    /// after it returns. Idempotent.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.routes.write().clear();
        let _ = self.sender.send(Envelope::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
        debug!("dispatch hub stopped");
    }
}

impl Drop for DispatchHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DispatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHub")
            .field("running", &self.is_running())
            .field("listeners", &self.listener_count())
            .field("queued", &self.sender.len())
            .finish()
    }
}

fn dispatch_loop(shared: &Shared, receiver: &Receiver<Envelope>) {
    while let Ok(envelope) = receiver.recv() {
        match envelope {
            Envelope::Midi {
                device_id,
                group,
                message,
                queued_at,
            } => {
                shared.metrics.record_received();
                shared.metrics.record_dispatch_latency(queued_at.elapsed());
                deliver_midi(shared, device_id, group, message);
            }
            Envelope::Device(event) => deliver_device(shared, &event),
            Envelope::Flush(done) => {
                let _ = done.send(());
            }
            Envelope::Shutdown => break,
        }
    }
    trace!("dispatch loop exited");
}

fn deliver_midi(shared: &Shared, device_id: DeviceId, group: u8, message: MidiMessage) {
    let Some(event) = MidiEvent::from_message(&message) else {
        return;
    };
    let event_type = event.event_type();

    let received = ReceivedEvent {
        device_id,
        group,
        timestamp: 0,
        event,
        message,
    };

    let subscriptions = shared.subscriptions.load();
    for sub in subscriptions.iter().filter(|sub| sub.mask.contains(event_type)) {
        sub.listener.on_midi_event(&received);
    }

    for transmitter in shared.registry.transmitters() {
        transmitter.transmit(&received.message, -1);
    }
}

fn deliver_device(shared: &Shared, event: &DeviceEvent) {
    let subscriptions = shared.subscriptions.load();
    for sub in subscriptions.iter().filter(|sub| sub.mask.wants_devices()) {
        sub.listener.on_device_event(event);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::device::Receiver as EndpointReceiver;
    use crate::protocol::{EventType, ShortMessage};
    use crate::transport::VirtualTransport;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ReceivedEvent>>,
        devices: Mutex<Vec<DeviceEvent>>,
    }

    impl MidiListener for Recorder {
        fn on_midi_event(&self, event: &ReceivedEvent) {
            self.events.lock().push(event.clone());
        }

        fn on_device_event(&self, event: &DeviceEvent) {
            self.devices.lock().push(event.clone());
        }
    }

    fn hub() -> DispatchHub {
        DispatchHub::start(
            &DispatchConfig::default(),
            Arc::new(DeviceRegistry::new()),
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_capability_filtering() {
        let hub = hub();
        let recorder = Arc::new(Recorder::default());
        hub.subscribe(recorder.clone(), EventMask::of(EventType::NoteOn));

        let id = DeviceId::from("dev1");
        hub.on_receive(&id, 0, &[0xB0, 7, 100]);
        hub.flush();
        assert!(recorder.events.lock().is_empty());

        hub.on_receive(&id, 0, &[0x90, 60, 100]);
        hub.flush();
        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100
            }
        );
        assert_eq!(events[0].device_id, id);
        assert_eq!(events[0].timestamp, 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = hub();
        let recorder = Arc::new(Recorder::default());
        let id = hub.subscribe(recorder.clone(), EventMask::ALL);
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));

        hub.on_receive(&DeviceId::from("dev1"), 0, &[0xF8]);
        hub.flush();
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_device_events_need_device_bit() {
        let hub = hub();
        let midi_only = Arc::new(Recorder::default());
        let with_devices = Arc::new(Recorder::default());
        hub.subscribe(midi_only.clone(), EventMask::ALL_EVENTS);
        hub.subscribe(with_devices.clone(), EventMask::DEVICES);

        let transport: Arc<dyn TransportAdapter> = Arc::new(VirtualTransport::new());
        let id = DeviceId::from("dev1");
        hub.attach(&id, Role::Input, &transport);
        hub.attach(&id, Role::Input, &transport);
        hub.detach(&id, Role::Input);
        hub.detach(&id, Role::Input);
        hub.flush();

        assert!(midi_only.devices.lock().is_empty());
        assert_eq!(
            *with_devices.devices.lock(),
            vec![DeviceEvent::InputAttached(id.clone()), DeviceEvent::InputDetached(id)]
        );
    }

    #[test]
    fn test_malformed_bytes_counted_not_delivered() {
        let metrics = Arc::new(Metrics::new());
        let hub = DispatchHub::start(
            &DispatchConfig::default(),
            Arc::new(DeviceRegistry::new()),
            Arc::clone(&metrics),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        hub.subscribe(recorder.clone(), EventMask::ALL);

        hub.on_receive(&DeviceId::from("dev1"), 0, &[0x90, 60]);
        hub.flush();
        assert!(recorder.events.lock().is_empty());
        assert_eq!(metrics.snapshot().decode_errors, 1);
    }

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<(MidiMessage, i64)>>,
    }

    impl EndpointReceiver for Sink {
        fn send(&self, message: &MidiMessage, timestamp: i64) {
            self.sent.lock().push((message.clone(), timestamp));
        }

        fn close(&self) {}
    }

    #[test]
    fn test_received_messages_loop_back_to_every_transmitter() {
        let hub = hub();
        let transport: Arc<dyn TransportAdapter> = Arc::new(VirtualTransport::new());
        let keys = DeviceId::from("keys");
        let pads = DeviceId::from("pads");
        hub.attach(&keys, Role::Input, &transport);
        hub.attach(&pads, Role::Input, &transport);

        let keys_sink = Arc::new(Sink::default());
        let pads_sink = Arc::new(Sink::default());
        let as_receiver = |sink: &Arc<Sink>| -> Arc<dyn EndpointReceiver> { sink.clone() };
        let keys_receiver = as_receiver(&keys_sink);
        let pads_receiver = as_receiver(&pads_sink);
        hub.registry().transmitter(&keys).unwrap().set_receiver(&keys_receiver);
        hub.registry().transmitter(&pads).unwrap().set_receiver(&pads_receiver);

        // No listener is needed for the loopback path
        hub.on_receive(&keys, 0, &[0x90, 60, 100]);
        hub.flush();

        let expected = vec![(
            MidiMessage::Short(ShortMessage::note_on(0, 60, 100).unwrap()),
            -1,
        )];
        assert_eq!(*keys_sink.sent.lock(), expected);
        assert_eq!(*pads_sink.sent.lock(), expected);

        hub.detach(&pads, Role::Input);
        hub.on_receive(&keys, 0, &[0xF8]);
        hub.flush();
        assert_eq!(keys_sink.sent.lock().len(), 2);
        assert_eq!(pads_sink.sent.lock().len(), 1);
    }

    #[derive(Default)]
    struct Exclusive {
        in_callback: AtomicBool,
        events: Mutex<Vec<ReceivedEvent>>,
    }

    impl MidiListener for Exclusive {
        fn on_midi_event(&self, event: &ReceivedEvent) {
            assert!(
                !self.in_callback.swap(true, Ordering::SeqCst),
                "listener entered twice at once"
            );
            self.events.lock().push(event.clone());
            thread::yield_now();
            self.in_callback.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_concurrent_producers_keep_per_device_order() {
        const DEVICES: usize = 4;
        const PER_DEVICE: u8 = 120;

        let hub = DispatchHub::start(
            &DispatchConfig {
                queue_capacity: 8192,
                ..DispatchConfig::default()
            },
            Arc::new(DeviceRegistry::new()),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        let listener = Arc::new(Exclusive::default());
        hub.subscribe(listener.clone(), EventMask::ALL_EVENTS);

        let devices: Vec<DeviceId> = (0..DEVICES)
            .map(|n| DeviceId::from(format!("dev{n}")))
            .collect();
        thread::scope(|scope| {
            for device in &devices {
                let hub = &hub;
                scope.spawn(move || {
                    for note in 0..PER_DEVICE {
                        hub.on_receive(device, 0, &[0x90, note, 100]);
                    }
                });
            }
        });
        hub.flush();

        let events = listener.events.lock();
        assert_eq!(events.len(), DEVICES * usize::from(PER_DEVICE));
        for device in &devices {
            let notes: Vec<u8> = events
                .iter()
                .filter(|e| &e.device_id == device)
                .map(|e| match e.event {
                    MidiEvent::NoteOn { note, .. } => note,
                    ref other => panic!("unexpected event {other:?}"),
                })
                .collect();
            assert_eq!(notes, (0..PER_DEVICE).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_no_delivery_after_shutdown() {
        let hub = hub();
        let recorder = Arc::new(Recorder::default());
        hub.subscribe(recorder.clone(), EventMask::ALL);
        hub.shutdown();
        hub.on_receive(&DeviceId::from("dev1"), 0, &[0xFA]);
        hub.flush();
        assert!(recorder.events.lock().is_empty());
        assert!(!hub.is_running());
    }

    #[test]
    fn test_send_to_unknown_device_is_noop() {
        let hub = hub();
        let message = MidiMessage::decode(&[0x90, 60, 100]).unwrap();
        hub.send(&DeviceId::from("nobody"), 0, &message);
        hub.send(&DeviceId::from("rtpmidi:5999:127.0.0.1:6000"), 0, &message);
    }
}
