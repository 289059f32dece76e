//! Wire-level MIDI message model

use bytes::Bytes;

use super::codec::write_varlen;
use super::{EventType, InvalidMidiData, Result};

/// Start of system exclusive
pub const SYSEX_START: u8 = 0xF0;
/// End of system exclusive
pub const SYSEX_END: u8 = 0xF7;
/// Meta event marker in Standard MIDI Files
pub const META_STATUS: u8 = 0xFF;

/// Largest 14-bit value (pitch wheel, song position pointer)
pub const MAX_14BIT: u16 = 0x3FFF;

/// Status byte plus up to two data bytes.
///
/// Construction validates the status and every data byte the status requires;
/// unused data bytes are stored as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortMessage {
    status: u8,
    data1: u8,
    data2: u8,
}

impl ShortMessage {
    /// Create from raw status and data bytes
    pub fn new(status: u8, data1: u8, data2: u8) -> Result<Self> {
        let event_type = EventType::from_status(status)
            .filter(|t| *t != EventType::SystemExclusive)
            .ok_or(InvalidMidiData::UnrecognizedStatus { status })?;

        let needed = event_type.data_len();
        let data = [data1, data2];
        for (index, value) in data.iter().take(needed).enumerate() {
            if *value > 0x7F {
                return Err(InvalidMidiData::DataOutOfRange {
                    index,
                    value: *value,
                }
                .into());
            }
        }

        Ok(Self {
            status,
            data1: if needed >= 1 { data1 } else { 0 },
            data2: if needed >= 2 { data2 } else { 0 },
        })
    }

    /// Create a channel voice message from its type and channel
    pub fn channel_message(event_type: EventType, channel: u8, data1: u8, data2: u8) -> Result<Self> {
        if !event_type.is_channel_voice() {
            return Err(InvalidMidiData::UnrecognizedStatus {
                status: event_type.as_u8(),
            }
            .into());
        }
        if channel > 0x0F {
            return Err(InvalidMidiData::ChannelOutOfRange { channel }.into());
        }
        Self::new(event_type.as_u8() | channel, data1, data2)
    }

    /// Note On
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Result<Self> {
        Self::channel_message(EventType::NoteOn, channel, note, velocity)
    }

    /// Note Off
    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Result<Self> {
        Self::channel_message(EventType::NoteOff, channel, note, velocity)
    }

    /// Polyphonic key pressure
    pub fn polyphonic_aftertouch(channel: u8, note: u8, pressure: u8) -> Result<Self> {
        Self::channel_message(EventType::PolyphonicAftertouch, channel, note, pressure)
    }

    /// Control Change
    pub fn control_change(channel: u8, function: u8, value: u8) -> Result<Self> {
        Self::channel_message(EventType::ControlChange, channel, function, value)
    }

    /// Program Change
    pub fn program_change(channel: u8, program: u8) -> Result<Self> {
        Self::channel_message(EventType::ProgramChange, channel, program, 0)
    }

    /// Channel pressure
    pub fn channel_aftertouch(channel: u8, pressure: u8) -> Result<Self> {
        Self::channel_message(EventType::ChannelAftertouch, channel, pressure, 0)
    }

    /// Pitch wheel, `amount` in 0..=16383 (8192 is centre)
    pub fn pitch_wheel(channel: u8, amount: u16) -> Result<Self> {
        let (lsb, msb) = split_14bit(amount)?;
        Self::channel_message(EventType::PitchWheel, channel, lsb, msb)
    }

    /// MTC quarter frame
    pub fn time_code_quarter_frame(value: u8) -> Result<Self> {
        Self::new(EventType::TimeCodeQuarterFrame.as_u8(), value, 0)
    }

    /// Song position pointer in MIDI beats, 0..=16383
    pub fn song_position_pointer(position: u16) -> Result<Self> {
        let (lsb, msb) = split_14bit(position)?;
        Self::new(EventType::SongPositionPointer.as_u8(), lsb, msb)
    }

    /// Song select
    pub fn song_select(song: u8) -> Result<Self> {
        Self::new(EventType::SongSelect.as_u8(), song, 0)
    }

    /// Data-less system message (tune request or any realtime type)
    pub fn system(event_type: EventType) -> Result<Self> {
        if event_type.is_channel_voice() || event_type.data_len() != 0 {
            return Err(InvalidMidiData::MissingDataBytes {
                status: event_type.as_u8(),
                needed: event_type.data_len(),
                got: 0,
            }
            .into());
        }
        Self::new(event_type.as_u8(), 0, 0)
    }

    /// Raw status byte (including channel)
    #[must_use]
    pub const fn status(&self) -> u8 {
        self.status
    }

    /// Status with the channel nibble masked off for channel messages
    #[must_use]
    pub const fn command(&self) -> u8 {
        if self.status < 0xF0 {
            self.status & 0xF0
        } else {
            self.status
        }
    }

    /// Event type
    #[must_use]
    pub fn event_type(&self) -> EventType {
        EventType::from_status(self.status).expect("status validated at construction")
    }

    /// Channel for channel voice messages
    #[must_use]
    pub const fn channel(&self) -> Option<u8> {
        if self.status < 0xF0 {
            Some(self.status & 0x0F)
        } else {
            None
        }
    }

    /// First data byte
    #[must_use]
    pub const fn data1(&self) -> u8 {
        self.data1
    }

    /// Second data byte
    #[must_use]
    pub const fn data2(&self) -> u8 {
        self.data2
    }

    /// 14-bit value assembled lsb-first from the two data bytes
    #[must_use]
    pub const fn value_14bit(&self) -> u16 {
        (self.data1 as u16 & 0x7F) | ((self.data2 as u16 & 0x7F) << 7)
    }

    /// Encoded length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.event_type().data_len()
    }

    /// Always false; a short message has at least a status byte
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Append the wire bytes to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let bytes = [self.status, self.data1, self.data2];
        out.extend_from_slice(&bytes[..self.len()]);
    }

    /// Wire bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        self.encode_into(&mut out);
        out
    }
}

fn split_14bit(value: u16) -> Result<(u8, u8)> {
    if value > MAX_14BIT {
        return Err(InvalidMidiData::ValueOutOfRange {
            value: u32::from(value),
            max: u32::from(MAX_14BIT),
        }
        .into());
    }
    Ok(((value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8))
}

/// System exclusive message.
///
/// Bytes are stored as delivered; some transports strip the F0/F7 framing, so
/// both framed and bare payloads are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SysexMessage {
    data: Bytes,
}

impl SysexMessage {
    /// Wrap bytes exactly as delivered
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Build from a bare payload, adding F0/F7 framing
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 2);
        data.push(SYSEX_START);
        data.extend_from_slice(payload);
        data.push(SYSEX_END);
        Self { data: data.into() }
    }

    /// Status byte (always F0)
    #[must_use]
    pub const fn status(&self) -> u8 {
        SYSEX_START
    }

    /// Bytes as delivered
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Payload without F0/F7 framing
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let mut payload = &self.data[..];
        if let [SYSEX_START, rest @ ..] = payload {
            payload = rest;
        }
        if let [rest @ .., SYSEX_END] = payload {
            payload = rest;
        }
        payload
    }

    /// Append F0, payload and F7 to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(SYSEX_START);
        out.extend_from_slice(self.payload());
        out.push(SYSEX_END);
    }

    /// Framed wire bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload().len() + 2);
        self.encode_into(&mut out);
        out
    }
}

/// Standard MIDI File meta event. Never sent to live transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaMessage {
    meta_type: u8,
    data: Bytes,
}

impl MetaMessage {
    /// End of track meta type
    pub const END_OF_TRACK: u8 = 0x2F;
    /// Set tempo meta type
    pub const SET_TEMPO: u8 = 0x51;

    /// Create a meta message
    pub fn new(meta_type: u8, data: impl Into<Bytes>) -> Self {
        Self {
            meta_type: meta_type & 0x7F,
            data: data.into(),
        }
    }

    /// Status byte (always FF)
    #[must_use]
    pub const fn status(&self) -> u8 {
        META_STATUS
    }

    /// Meta type
    #[must_use]
    pub const fn meta_type(&self) -> u8 {
        self.meta_type
    }

    /// Meta payload
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Append the SMF form `FF type len data`, with `len` as a variable-length quantity
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(META_STATUS);
        out.push(self.meta_type);
        write_varlen(out, u32::try_from(self.data.len()).unwrap_or(u32::MAX));
        out.extend_from_slice(&self.data);
    }
}

/// Any MIDI message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MidiMessage {
    /// Channel voice, system common or realtime message
    Short(ShortMessage),
    /// System exclusive
    Sysex(SysexMessage),
    /// Standard MIDI File meta event
    Meta(MetaMessage),
}

impl MidiMessage {
    /// Status byte
    #[must_use]
    pub fn status(&self) -> u8 {
        match self {
            Self::Short(msg) => msg.status(),
            Self::Sysex(msg) => msg.status(),
            Self::Meta(msg) => msg.status(),
        }
    }

    /// Live event type; `None` for meta messages
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::Short(msg) => Some(msg.event_type()),
            Self::Sysex(_) => Some(EventType::SystemExclusive),
            Self::Meta(_) => None,
        }
    }

    /// Check if this is a meta message
    #[must_use]
    pub const fn is_meta(&self) -> bool {
        matches!(self, Self::Meta(_))
    }

    /// Append the wire bytes to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Short(msg) => msg.encode_into(out),
            Self::Sysex(msg) => msg.encode_into(out),
            Self::Meta(msg) => msg.encode_into(out),
        }
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        super::encode(self)
    }

    /// Decode from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        super::decode(bytes)
    }
}

impl From<ShortMessage> for MidiMessage {
    fn from(msg: ShortMessage) -> Self {
        Self::Short(msg)
    }
}

impl From<SysexMessage> for MidiMessage {
    fn from(msg: SysexMessage) -> Self {
        Self::Sysex(msg)
    }
}

impl From<MetaMessage> for MidiMessage {
    fn from(msg: MetaMessage) -> Self {
        Self::Meta(msg)
    }
}
