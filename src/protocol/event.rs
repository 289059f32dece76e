//! Structured MIDI events delivered to listeners

use super::{EventType, MidiMessage, Result, ShortMessage, SysexMessage};

/// One decoded MIDI event. Channels are 0..=15.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MidiEvent {
    /// Note released
    NoteOff {
        /// Channel
        channel: u8,
        /// Note number
        note: u8,
        /// Release velocity
        velocity: u8,
    },
    /// Note pressed
    NoteOn {
        /// Channel
        channel: u8,
        /// Note number
        note: u8,
        /// Velocity
        velocity: u8,
    },
    /// Per-note pressure
    PolyphonicAftertouch {
        /// Channel
        channel: u8,
        /// Note number
        note: u8,
        /// Pressure
        pressure: u8,
    },
    /// Controller change
    ControlChange {
        /// Channel
        channel: u8,
        /// Controller number
        function: u8,
        /// Controller value
        value: u8,
    },
    /// Program change
    ProgramChange {
        /// Channel
        channel: u8,
        /// Program number
        program: u8,
    },
    /// Channel pressure
    ChannelAftertouch {
        /// Channel
        channel: u8,
        /// Pressure
        pressure: u8,
    },
    /// Pitch wheel, 0..=16383 with 8192 centred
    PitchWheel {
        /// Channel
        channel: u8,
        /// Bend amount
        amount: u16,
    },
    /// System exclusive
    SystemExclusive(SysexMessage),
    /// MTC quarter frame
    TimeCodeQuarterFrame {
        /// Frame type and value nibbles
        timing: u8,
    },
    /// Song position pointer
    SongPositionPointer {
        /// Position in MIDI beats
        position: u16,
    },
    /// Song select
    SongSelect {
        /// Song number
        song: u8,
    },
    /// Tune request
    TuneRequest,
    /// Timing clock
    TimingClock,
    /// Start
    Start,
    /// Continue
    Continue,
    /// Stop
    Stop,
    /// Active sensing
    ActiveSensing,
    /// System reset
    Reset,
}

impl MidiEvent {
    /// Interpret a live message. Meta messages yield `None`.
    #[must_use]
    pub fn from_message(message: &MidiMessage) -> Option<Self> {
        match message {
            MidiMessage::Short(msg) => Some(Self::from_short(msg)),
            MidiMessage::Sysex(msg) => Some(Self::SystemExclusive(msg.clone())),
            MidiMessage::Meta(_) => None,
        }
    }

    fn from_short(msg: &ShortMessage) -> Self {
        let channel = msg.channel().unwrap_or(0);
        let (d1, d2) = (msg.data1(), msg.data2());
        match msg.event_type() {
            EventType::NoteOff => Self::NoteOff {
                channel,
                note: d1,
                velocity: d2,
            },
            EventType::NoteOn => Self::NoteOn {
                channel,
                note: d1,
                velocity: d2,
            },
            EventType::PolyphonicAftertouch => Self::PolyphonicAftertouch {
                channel,
                note: d1,
                pressure: d2,
            },
            EventType::ControlChange => Self::ControlChange {
                channel,
                function: d1,
                value: d2,
            },
            EventType::ProgramChange => Self::ProgramChange {
                channel,
                program: d1,
            },
            EventType::ChannelAftertouch => Self::ChannelAftertouch {
                channel,
                pressure: d1,
            },
            EventType::PitchWheel => Self::PitchWheel {
                channel,
                amount: msg.value_14bit(),
            },
            EventType::TimeCodeQuarterFrame => Self::TimeCodeQuarterFrame { timing: d1 },
            EventType::SongPositionPointer => Self::SongPositionPointer {
                position: msg.value_14bit(),
            },
            EventType::SongSelect => Self::SongSelect { song: d1 },
            EventType::TuneRequest => Self::TuneRequest,
            EventType::TimingClock => Self::TimingClock,
            EventType::Start => Self::Start,
            EventType::Continue => Self::Continue,
            EventType::Stop => Self::Stop,
            EventType::ActiveSensing => Self::ActiveSensing,
            EventType::Reset => Self::Reset,
            EventType::SystemExclusive => unreachable!("sysex never builds a ShortMessage"),
        }
    }

    /// Build the wire message, validating every field range
    pub fn to_message(&self) -> Result<MidiMessage> {
        let short = match *self {
            Self::NoteOff {
                channel,
                note,
                velocity,
            } => ShortMessage::note_off(channel, note, velocity)?,
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => ShortMessage::note_on(channel, note, velocity)?,
            Self::PolyphonicAftertouch {
                channel,
                note,
                pressure,
            } => ShortMessage::polyphonic_aftertouch(channel, note, pressure)?,
            Self::ControlChange {
                channel,
                function,
                value,
            } => ShortMessage::control_change(channel, function, value)?,
            Self::ProgramChange { channel, program } => {
                ShortMessage::program_change(channel, program)?
            }
            Self::ChannelAftertouch { channel, pressure } => {
                ShortMessage::channel_aftertouch(channel, pressure)?
            }
            Self::PitchWheel { channel, amount } => ShortMessage::pitch_wheel(channel, amount)?,
            Self::SystemExclusive(ref msg) => return Ok(MidiMessage::Sysex(msg.clone())),
            Self::TimeCodeQuarterFrame { timing } => ShortMessage::time_code_quarter_frame(timing)?,
            Self::SongPositionPointer { position } => {
                ShortMessage::song_position_pointer(position)?
            }
            Self::SongSelect { song } => ShortMessage::song_select(song)?,
            Self::TuneRequest
            | Self::TimingClock
            | Self::Start
            | Self::Continue
            | Self::Stop
            | Self::ActiveSensing
            | Self::Reset => ShortMessage::system(self.event_type())?,
        };
        Ok(MidiMessage::Short(short))
    }

    /// Event type
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::NoteOff { .. } => EventType::NoteOff,
            Self::NoteOn { .. } => EventType::NoteOn,
            Self::PolyphonicAftertouch { .. } => EventType::PolyphonicAftertouch,
            Self::ControlChange { .. } => EventType::ControlChange,
            Self::ProgramChange { .. } => EventType::ProgramChange,
            Self::ChannelAftertouch { .. } => EventType::ChannelAftertouch,
            Self::PitchWheel { .. } => EventType::PitchWheel,
            Self::SystemExclusive(_) => EventType::SystemExclusive,
            Self::TimeCodeQuarterFrame { .. } => EventType::TimeCodeQuarterFrame,
            Self::SongPositionPointer { .. } => EventType::SongPositionPointer,
            Self::SongSelect { .. } => EventType::SongSelect,
            Self::TuneRequest => EventType::TuneRequest,
            Self::TimingClock => EventType::TimingClock,
            Self::Start => EventType::Start,
            Self::Continue => EventType::Continue,
            Self::Stop => EventType::Stop,
            Self::ActiveSensing => EventType::ActiveSensing,
            Self::Reset => EventType::Reset,
        }
    }

    /// Channel for channel voice events
    #[must_use]
    pub const fn channel(&self) -> Option<u8> {
        match *self {
            Self::NoteOff { channel, .. }
            | Self::NoteOn { channel, .. }
            | Self::PolyphonicAftertouch { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::ProgramChange { channel, .. }
            | Self::ChannelAftertouch { channel, .. }
            | Self::PitchWheel { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;

    #[test]
    fn test_from_message_note_on() {
        let message = decode(&[0x90, 0x3C, 0x64]).unwrap();
        let event = MidiEvent::from_message(&message).unwrap();
        assert_eq!(
            event,
            MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100
            }
        );
        assert_eq!(event.event_type(), EventType::NoteOn);
    }

    #[test]
    fn test_to_message_roundtrip_all_kinds() {
        let events = [
            MidiEvent::NoteOff { channel: 1, note: 2, velocity: 3 },
            MidiEvent::PolyphonicAftertouch { channel: 4, note: 5, pressure: 6 },
            MidiEvent::ControlChange { channel: 7, function: 64, value: 127 },
            MidiEvent::ProgramChange { channel: 8, program: 9 },
            MidiEvent::ChannelAftertouch { channel: 10, pressure: 11 },
            MidiEvent::PitchWheel { channel: 15, amount: 16383 },
            MidiEvent::SystemExclusive(SysexMessage::from_payload(&[0x7D, 0x01])),
            MidiEvent::TimeCodeQuarterFrame { timing: 0x35 },
            MidiEvent::SongPositionPointer { position: 1234 },
            MidiEvent::SongSelect { song: 12 },
            MidiEvent::TuneRequest,
            MidiEvent::TimingClock,
            MidiEvent::Start,
            MidiEvent::Continue,
            MidiEvent::Stop,
            MidiEvent::ActiveSensing,
            MidiEvent::Reset,
        ];

        for event in events {
            let message = event.to_message().unwrap();
            let bytes = message.encode();
            let decoded = MidiEvent::from_message(&decode(&bytes).unwrap()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn test_to_message_validates_ranges() {
        assert!(MidiEvent::NoteOn { channel: 0, note: 128, velocity: 1 }.to_message().is_err());
        assert!(MidiEvent::PitchWheel { channel: 0, amount: 20000 }.to_message().is_err());
        assert!(MidiEvent::ProgramChange { channel: 16, program: 0 }.to_message().is_err());
    }
}
