//! Print every MIDI and device event seen by an RTP-MIDI session.
//!
//! Run with `cargo run --example session_monitor -- [port] [peer-addr]`.
//! Connect from any AppleMIDI client (macOS Audio MIDI Setup, rtpMIDI) or
//! pass a peer address such as `192.168.1.20:5004` to invite it.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use unimidi::{DeviceEvent, EventMask, MidiContext, MidiListener, ReceivedEvent};

struct Monitor;

impl MidiListener for Monitor {
    fn on_midi_event(&self, event: &ReceivedEvent) {
        println!(
            "{:<40} group {:>2}  {:?}",
            event.device_id, event.group, event.event
        );
    }

    fn on_device_event(&self, event: &DeviceEvent) {
        println!("{:<40} {:?}", event.device_id(), event);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = env::args().skip(1);
    let port = match args.next() {
        Some(raw) => raw.parse()?,
        None => unimidi::DEFAULT_RTP_MIDI_PORT,
    };
    let peer: Option<SocketAddr> = args.next().map(|raw| raw.parse()).transpose()?;

    let context = MidiContext::with_defaults()?;
    context.subscribe(Arc::new(Monitor), EventMask::ALL);
    context.start_rtp_midi_server("unimidi monitor", port)?;
    println!("Session listening on {port} (data on {})", port + 1);

    if let Some(addr) = peer {
        context.connect_to_rtp_midi_server("unimidi monitor", port, addr)?;
        println!("Invited {addr}");
    }

    loop {
        thread::sleep(Duration::from_secs(10));
        let metrics = context.metrics();
        println!(
            "-- peers {} | received {} | gaps {} | recovered {} | duplicates {}",
            metrics.active_peers,
            metrics.messages_received,
            metrics.sequence_gaps,
            metrics.journal_recoveries,
            metrics.duplicates
        );
    }
}
