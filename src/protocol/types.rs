//! MIDI event types and listener capability masks

use std::fmt;
use std::ops::BitOr;

/// Event type of a live MIDI message, keyed by its (masked) status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum EventType {
    /// Note released
    NoteOff = 0x80,
    /// Note pressed
    NoteOn = 0x90,
    /// Per-note pressure
    PolyphonicAftertouch = 0xA0,
    /// Controller value
    ControlChange = 0xB0,
    /// Patch select
    ProgramChange = 0xC0,
    /// Channel-wide pressure
    ChannelAftertouch = 0xD0,
    /// 14-bit pitch bend
    PitchWheel = 0xE0,

    /// Vendor-specific variable-length message
    SystemExclusive = 0xF0,
    /// MTC quarter frame
    TimeCodeQuarterFrame = 0xF1,
    /// 14-bit beat position
    SongPositionPointer = 0xF2,
    /// Song number
    SongSelect = 0xF3,
    /// Oscillator tune request
    TuneRequest = 0xF6,

    /// Clock tick (24 per quarter note)
    TimingClock = 0xF8,
    /// Sequence start
    Start = 0xFA,
    /// Sequence continue
    Continue = 0xFB,
    /// Sequence stop
    Stop = 0xFC,
    /// Keep-alive
    ActiveSensing = 0xFE,
    /// System reset
    Reset = 0xFF,
}

impl EventType {
    /// Every live event type in status order.
    pub const ALL: [Self; 18] = [
        Self::NoteOff,
        Self::NoteOn,
        Self::PolyphonicAftertouch,
        Self::ControlChange,
        Self::ProgramChange,
        Self::ChannelAftertouch,
        Self::PitchWheel,
        Self::SystemExclusive,
        Self::TimeCodeQuarterFrame,
        Self::SongPositionPointer,
        Self::SongSelect,
        Self::TuneRequest,
        Self::TimingClock,
        Self::Start,
        Self::Continue,
        Self::Stop,
        Self::ActiveSensing,
        Self::Reset,
    ];

    /// Resolve a status byte. Channel statuses are masked to their high nibble.
    #[must_use]
    pub fn from_status(status: u8) -> Option<Self> {
        match status {
            0x80..=0xEF => match status & 0xF0 {
                0x80 => Some(Self::NoteOff),
                0x90 => Some(Self::NoteOn),
                0xA0 => Some(Self::PolyphonicAftertouch),
                0xB0 => Some(Self::ControlChange),
                0xC0 => Some(Self::ProgramChange),
                0xD0 => Some(Self::ChannelAftertouch),
                _ => Some(Self::PitchWheel),
            },
            0xF0 => Some(Self::SystemExclusive),
            0xF1 => Some(Self::TimeCodeQuarterFrame),
            0xF2 => Some(Self::SongPositionPointer),
            0xF3 => Some(Self::SongSelect),
            0xF6 => Some(Self::TuneRequest),
            0xF8 => Some(Self::TimingClock),
            0xFA => Some(Self::Start),
            0xFB => Some(Self::Continue),
            0xFC => Some(Self::Stop),
            0xFE => Some(Self::ActiveSensing),
            0xFF => Some(Self::Reset),
            _ => None,
        }
    }

    /// Status byte (channel 0 for channel messages)
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Number of data bytes following the status byte.
    ///
    /// System exclusive is variable length and reports 0.
    #[must_use]
    pub const fn data_len(self) -> usize {
        match self {
            Self::NoteOff
            | Self::NoteOn
            | Self::PolyphonicAftertouch
            | Self::ControlChange
            | Self::PitchWheel
            | Self::SongPositionPointer => 2,
            Self::ProgramChange
            | Self::ChannelAftertouch
            | Self::TimeCodeQuarterFrame
            | Self::SongSelect => 1,
            _ => 0,
        }
    }

    /// Channel voice message (status 0x80..=0xEF)
    #[must_use]
    pub const fn is_channel_voice(self) -> bool {
        (self as u8) < 0xF0
    }

    /// System realtime message (status 0xF8..=0xFF)
    #[must_use]
    pub const fn is_realtime(self) -> bool {
        (self as u8) >= 0xF8
    }

    /// System common message, excluding sysex
    #[must_use]
    pub const fn is_system_common(self) -> bool {
        matches!(
            self,
            Self::TimeCodeQuarterFrame | Self::SongPositionPointer | Self::SongSelect | Self::TuneRequest
        )
    }

    const fn bit(self) -> u32 {
        1 << self.index()
    }

    const fn index(self) -> u32 {
        match self {
            Self::NoteOff => 0,
            Self::NoteOn => 1,
            Self::PolyphonicAftertouch => 2,
            Self::ControlChange => 3,
            Self::ProgramChange => 4,
            Self::ChannelAftertouch => 5,
            Self::PitchWheel => 6,
            Self::SystemExclusive => 7,
            Self::TimeCodeQuarterFrame => 8,
            Self::SongPositionPointer => 9,
            Self::SongSelect => 10,
            Self::TuneRequest => 11,
            Self::TimingClock => 12,
            Self::Start => 13,
            Self::Continue => 14,
            Self::Stop => 15,
            Self::ActiveSensing => 16,
            Self::Reset => 17,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoteOff => "NoteOff",
            Self::NoteOn => "NoteOn",
            Self::PolyphonicAftertouch => "PolyphonicAftertouch",
            Self::ControlChange => "ControlChange",
            Self::ProgramChange => "ProgramChange",
            Self::ChannelAftertouch => "ChannelAftertouch",
            Self::PitchWheel => "PitchWheel",
            Self::SystemExclusive => "SystemExclusive",
            Self::TimeCodeQuarterFrame => "TimeCodeQuarterFrame",
            Self::SongPositionPointer => "SongPositionPointer",
            Self::SongSelect => "SongSelect",
            Self::TuneRequest => "TuneRequest",
            Self::TimingClock => "TimingClock",
            Self::Start => "Start",
            Self::Continue => "Continue",
            Self::Stop => "Stop",
            Self::ActiveSensing => "ActiveSensing",
            Self::Reset => "Reset",
        };
        write!(f, "{name}")
    }
}

/// Set of event types a listener is interested in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventMask(u32);

impl EventMask {
    const DEVICE_BIT: u32 = 1 << 31;
    const EVENT_BITS: u32 = (1 << 18) - 1;

    /// Nothing
    pub const NONE: Self = Self(0);
    /// Every MIDI event type (not device notifications)
    pub const ALL_EVENTS: Self = Self(Self::EVENT_BITS);
    /// Every MIDI event type plus device notifications
    pub const ALL: Self = Self(Self::EVENT_BITS | Self::DEVICE_BIT);
    /// Channel voice messages
    pub const PLAYING: Self = Self((1 << 7) - 1);
    /// System exclusive, common and realtime messages
    pub const SYSTEM: Self = Self(Self::EVENT_BITS & !((1 << 7) - 1));
    /// Device attach/detach notifications
    pub const DEVICES: Self = Self(Self::DEVICE_BIT);

    /// Create an empty mask
    #[must_use]
    pub const fn new() -> Self {
        Self::NONE
    }

    /// Mask containing a single event type
    #[must_use]
    pub const fn of(event_type: EventType) -> Self {
        Self(event_type.bit())
    }

    /// Add an event type
    #[must_use]
    pub const fn with(self, event_type: EventType) -> Self {
        Self(self.0 | event_type.bit())
    }

    /// Add device notifications
    #[must_use]
    pub const fn with_devices(self) -> Self {
        Self(self.0 | Self::DEVICE_BIT)
    }

    /// Union of two masks
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if an event type is included
    #[must_use]
    pub const fn contains(self, event_type: EventType) -> bool {
        (self.0 & event_type.bit()) != 0
    }

    /// Check if device notifications are included
    #[must_use]
    pub const fn wants_devices(self) -> bool {
        (self.0 & Self::DEVICE_BIT) != 0
    }

    /// Check if nothing is included
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the contained event types
    pub fn event_types(self) -> impl Iterator<Item = EventType> {
        EventType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl From<EventType> for EventMask {
    fn from(event_type: EventType) -> Self {
        Self::of(event_type)
    }
}

impl FromIterator<EventType> for EventMask {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.event_types().map(|t| t.to_string()).collect();
        if self.wants_devices() {
            parts.push("Devices".to_string());
        }
        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_status_roundtrip() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::from_status(event_type.as_u8()), Some(event_type));
        }
    }

    #[test]
    fn test_channel_status_is_masked() {
        assert_eq!(EventType::from_status(0x9F), Some(EventType::NoteOn));
        assert_eq!(EventType::from_status(0xE3), Some(EventType::PitchWheel));
    }

    #[test]
    fn test_undefined_status_rejected() {
        for status in [0x00, 0x7F, 0xF4, 0xF5, 0xF7, 0xF9, 0xFD] {
            assert_eq!(EventType::from_status(status), None, "{status:#x}");
        }
    }

    #[test]
    fn test_mask_aggregates() {
        assert!(EventMask::PLAYING.contains(EventType::PitchWheel));
        assert!(!EventMask::PLAYING.contains(EventType::SystemExclusive));
        assert!(EventMask::SYSTEM.contains(EventType::Reset));
        assert!(!EventMask::SYSTEM.contains(EventType::NoteOn));
        assert_eq!(EventMask::PLAYING | EventMask::SYSTEM, EventMask::ALL_EVENTS);
        assert!(!EventMask::ALL_EVENTS.wants_devices());
        assert!(EventMask::ALL.wants_devices());
    }

    #[test]
    fn test_mask_from_iter() {
        let mask: EventMask = [EventType::NoteOn, EventType::NoteOff].into_iter().collect();
        assert!(mask.contains(EventType::NoteOn));
        assert!(mask.contains(EventType::NoteOff));
        assert!(!mask.contains(EventType::ControlChange));
        assert_eq!(mask.event_types().count(), 2);
    }
}
