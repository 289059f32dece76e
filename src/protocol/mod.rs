//! MIDI message model
//!
//! This module provides the wire representation of MIDI messages, the
//! listener-facing event union, and the codec between them.

mod codec;
mod error;
mod event;
mod message;
mod types;

pub use codec::{Decoder, MAX_VARLEN, decode, decode_short, decode_sysex, encode, read_varlen, write_varlen};
pub use error::{Error, InvalidMidiData, Result};
pub use event::MidiEvent;
pub use message::{
    MAX_14BIT, META_STATUS, MetaMessage, MidiMessage, SYSEX_END, SYSEX_START, ShortMessage,
    SysexMessage,
};
pub use types::{EventMask, EventType};

/// Number of MIDI channels per group
pub const CHANNELS: u8 = 16;

/// Number of groups (USB cables / MIDI 2.0 groups) per connection
pub const GROUPS: u8 = 16;
