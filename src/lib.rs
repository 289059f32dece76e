//! unimidi - cross-platform MIDI message model, device registry and RTP-MIDI
//!
//! This library gives applications one API for MIDI I/O regardless of where
//! the bytes come from: USB class-compliant devices, Bluetooth LE MIDI,
//! in-process virtual ports, or RTP-MIDI (AppleMIDI) network sessions.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unimidi::{EventMask, EventType, MidiContext, MidiEvent, MidiListener, ReceivedEvent};
//!
//! struct Printer;
//!
//! impl MidiListener for Printer {
//!     fn on_midi_event(&self, event: &ReceivedEvent) {
//!         println!("{} -> {:?}", event.device_id, event.event);
//!     }
//! }
//!
//! let context = MidiContext::with_defaults()?;
//! context.subscribe(Arc::new(Printer), EventMask::of(EventType::NoteOn));
//! context.start_rtp_midi_server("Studio", unimidi::DEFAULT_RTP_MIDI_PORT)?;
//!
//! for device in context.device_ids() {
//!     let note = MidiEvent::NoteOn { channel: 0, note: 60, velocity: 100 };
//!     context.send_event(&device, 0, &note)?;
//! }
//! # Ok::<(), unimidi::Error>(())
//! ```
//!
//! # Features
//!
//! - **Validated message model** - every constructor range-checks its fields
//! - **Ordered dispatch** - one thread delivers every event and device
//!   notification in arrival order
//! - **RTP-MIDI sessions** - AppleMIDI handshake, clock sync, receiver
//!   feedback and recovery-journal gap repair
//! - **Pluggable transports** - platform backends implement
//!   [`TransportAdapter`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
mod context;
pub mod device;
pub mod dispatch;
pub mod metrics;
pub mod protocol;
pub mod transport;

pub use config::{ContextConfig, DispatchConfig, RtpMidiConfig};
pub use context::MidiContext;
pub use device::{DeviceEvent, DeviceId, Role};
pub use dispatch::{ListenerId, MidiListener, ReceivedEvent};
pub use metrics::MetricsSnapshot;
pub use protocol::{
    Error, EventMask, EventType, MetaMessage, MidiEvent, MidiMessage, Result, ShortMessage,
    SysexMessage,
};
pub use transport::{TransportAdapter, TransportKind, VirtualTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Conventional RTP-MIDI control port; data uses the next port up
pub const DEFAULT_RTP_MIDI_PORT: u16 = 5004;
