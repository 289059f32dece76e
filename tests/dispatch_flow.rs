use std::sync::Arc;

use parking_lot::Mutex;
use unimidi::{
    DeviceEvent, DeviceId, EventMask, EventType, MidiContext, MidiEvent, MidiListener, MidiMessage,
    ReceivedEvent, Role, ShortMessage, VirtualTransport,
};

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

fn context_with_port(name: &str) -> (MidiContext, Arc<VirtualTransport>, DeviceId) {
    let context = MidiContext::with_defaults().unwrap();
    let transport = Arc::new(VirtualTransport::new());
    let device = DeviceId::from("dev1");
    transport.add_port(&device, name, Role::Input);
    transport.add_port(&device, name, Role::Output);
    context.register_transport(transport.clone()).unwrap();
    (context, transport, device)
}

#[test]
fn injected_note_reaches_subscriber() {
    let (context, transport, device) = context_with_port("Keys");
    let recorder = Arc::new(Recorder::default());
    context.subscribe(recorder.clone(), EventMask::of(EventType::NoteOn));

    transport.inject(&device, 0, &[0x90, 0x3C, 0x64]);
    context.flush();

    let events = recorder.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device_id, device);
    assert_eq!(
        events[0].event,
        MidiEvent::NoteOn {
            channel: 0,
            note: 0x3C,
            velocity: 0x64
        }
    );
    assert_eq!(context.metrics().messages_received, 1);
}

#[test]
fn mask_filters_unsubscribed_types() {
    let (context, transport, device) = context_with_port("Keys");
    let recorder = Arc::new(Recorder::default());
    context.subscribe(recorder.clone(), EventMask::of(EventType::ControlChange));

    transport.inject(&device, 0, &[0x90, 0x3C, 0x64]);
    transport.inject(&device, 0, &[0xB0, 0x07, 0x7F]);
    context.flush();

    let types: Vec<_> = recorder
        .events
        .lock()
        .iter()
        .map(|e| e.event.event_type())
        .collect();
    assert_eq!(types, vec![EventType::ControlChange]);
}

#[test]
fn device_notifications_and_names() {
    let context = MidiContext::with_defaults().unwrap();
    let recorder = Arc::new(Recorder::default());
    context.subscribe(recorder.clone(), EventMask::DEVICES);

    let transport = Arc::new(VirtualTransport::new());
    let device = DeviceId::from("dev1");
    transport.add_port(&device, "Pads", Role::Input);
    context.register_transport(transport.clone()).unwrap();
    context.flush();

    assert!(context.device_ids().contains(&device));
    assert_eq!(context.device_name(&device), "Pads");
    assert_eq!(
        recorder.devices.lock().clone(),
        vec![DeviceEvent::InputAttached(device.clone())]
    );

    transport.remove_port(&device, Role::Input);
    context.flush();

    assert!(!context.device_ids().contains(&device));
    assert_eq!(context.device_name(&device), "");
    assert_eq!(
        recorder.devices.lock().last(),
        Some(&DeviceEvent::InputDetached(device))
    );
}

#[test]
fn send_reaches_output_port() {
    let (context, transport, device) = context_with_port("Synth");
    let message = MidiMessage::Short(ShortMessage::control_change(2, 7, 100).unwrap());

    context.send(&device, 3, &message);

    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].group, 3);
    assert_eq!(sent[0].bytes, vec![0xB2, 7, 100]);
    assert_eq!(context.metrics().messages_sent, 1);
}

#[test]
fn send_to_unknown_device_is_dropped() {
    let (context, transport, _) = context_with_port("Synth");
    let message = MidiMessage::Short(ShortMessage::note_off(0, 60, 0).unwrap());

    context.send(&DeviceId::from("missing"), 0, &message);

    assert!(transport.sent().is_empty());
    assert_eq!(context.metrics().messages_dropped, 1);
}

#[test]
fn unsubscribed_listener_stops_receiving() {
    let (context, transport, device) = context_with_port("Keys");
    let recorder = Arc::new(Recorder::default());
    let id = context.subscribe(recorder.clone(), EventMask::ALL_EVENTS);

    transport.inject(&device, 0, &[0xF8]);
    context.flush();
    assert!(context.unsubscribe(id));
    assert!(!context.unsubscribe(id));
    transport.inject(&device, 0, &[0xF8]);
    context.flush();

    assert_eq!(recorder.events.lock().len(), 1);
}

#[test]
fn terminate_detaches_everything() {
    let (context, transport, device) = context_with_port("Keys");
    context.terminate();

    assert!(!transport.is_started());
    assert!(!context.device_ids().contains(&device));
}
