//! MIDI message codec (encode/decode)
//!
//! Pure value transformations between wire bytes and [`MidiMessage`]. Running
//! status is not reassembled here; transports deliver complete messages.

use super::{
    EventType, InvalidMidiData, MidiMessage, Result, SYSEX_END, SYSEX_START, ShortMessage,
    SysexMessage,
};

/// Largest value a four-octet variable-length quantity can hold
pub const MAX_VARLEN: u32 = 0x0FFF_FFFF;

/// Decode one complete message.
///
/// A leading F0 selects system exclusive, which always succeeds; anything else
/// is decoded as a short message.
pub fn decode(bytes: &[u8]) -> Result<MidiMessage> {
    match bytes.first() {
        Some(&SYSEX_START) => Ok(MidiMessage::Sysex(decode_sysex(bytes))),
        Some(_) => decode_short(bytes).map(MidiMessage::Short),
        None => Err(InvalidMidiData::Empty.into()),
    }
}

/// Decode a short message from `status [data1 [data2]]`.
///
/// # Errors
///
/// Returns [`InvalidMidiData`] when the status is not a recognized voice or
/// system status, when fewer data bytes are present than the status requires,
/// or when a required data byte has its high bit set. Extra trailing bytes are
/// ignored.
pub fn decode_short(bytes: &[u8]) -> Result<ShortMessage> {
    let (&status, data) = bytes.split_first().ok_or(InvalidMidiData::Empty)?;

    let event_type = EventType::from_status(status)
        .filter(|t| *t != EventType::SystemExclusive)
        .ok_or(InvalidMidiData::UnrecognizedStatus { status })?;

    let needed = event_type.data_len();
    if data.len() < needed {
        return Err(InvalidMidiData::MissingDataBytes {
            status,
            needed,
            got: data.len(),
        }
        .into());
    }

    let data1 = if needed >= 1 { data[0] } else { 0 };
    let data2 = if needed >= 2 { data[1] } else { 0 };
    ShortMessage::new(status, data1, data2)
}

/// Wrap system exclusive bytes. Framing is not validated.
#[must_use]
pub fn decode_sysex(bytes: &[u8]) -> SysexMessage {
    SysexMessage::new(bytes.to_vec())
}

/// Encode a message to the bytes a native transport expects
#[must_use]
pub fn encode(message: &MidiMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    message.encode_into(&mut out);
    out
}

/// Iterator over a buffer holding several complete messages back to back.
///
/// After a decode error the iterator skips to the next status byte.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Create a decoder over `bytes`
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn advance(&mut self, consumed: usize) {
        self.bytes = &self.bytes[consumed.min(self.bytes.len())..];
    }

    fn resync(&mut self) {
        let skip = self.bytes[1..]
            .iter()
            .position(|b| *b >= 0x80)
            .map_or(self.bytes.len(), |pos| pos + 1);
        self.advance(skip);
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<MidiMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        let status = *self.bytes.first()?;

        if status == SYSEX_START {
            let end = self
                .bytes
                .iter()
                .position(|b| *b == SYSEX_END)
                .map_or(self.bytes.len(), |pos| pos + 1);
            let sysex = decode_sysex(&self.bytes[..end]);
            self.advance(end);
            return Some(Ok(MidiMessage::Sysex(sysex)));
        }

        match decode_short(self.bytes) {
            Ok(msg) => {
                self.advance(msg.len());
                Some(Ok(MidiMessage::Short(msg)))
            }
            Err(err) => {
                self.resync();
                Some(Err(err))
            }
        }
    }
}

/// Append `value` as a MIDI variable-length quantity (7 bits per octet, msb first).
pub fn write_varlen(out: &mut Vec<u8>, value: u32) {
    let value = value.min(MAX_VARLEN);
    let mut shift = 21;
    while shift > 0 && (value >> shift) == 0 {
        shift -= 7;
    }
    while shift > 0 {
        out.push(0x80 | ((value >> shift) & 0x7F) as u8);
        shift -= 7;
    }
    out.push((value & 0x7F) as u8);
}

/// Read a variable-length quantity of at most four octets.
///
/// Returns the value and the number of octets consumed.
#[must_use]
pub fn read_varlen(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (idx, byte) in bytes.iter().take(4).enumerate() {
        value = (value << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some((value, idx + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Error;

    #[test]
    fn test_decode_note_on() {
        let msg = decode_short(&[0x90, 0x3C, 0x64]).unwrap();
        assert_eq!(msg.event_type(), EventType::NoteOn);
        assert_eq!(msg.channel(), Some(0));
        assert_eq!(msg.data1(), 60);
        assert_eq!(msg.data2(), 100);
    }

    #[test]
    fn test_decode_missing_data() {
        let result = decode_short(&[0x90, 0x3C]);
        assert!(matches!(
            result,
            Err(Error::InvalidMidiData(InvalidMidiData::MissingDataBytes {
                status: 0x90,
                needed: 2,
                got: 1
            }))
        ));

        assert!(decode_short(&[0xC0]).is_err());
        assert!(decode_short(&[0xF3]).is_err());
        assert!(decode_short(&[0xF8]).is_ok());
    }

    #[test]
    fn test_decode_rejects_running_status_and_undefined() {
        assert!(matches!(
            decode_short(&[0x3C, 0x64]),
            Err(Error::InvalidMidiData(InvalidMidiData::UnrecognizedStatus { status: 0x3C }))
        ));
        assert!(decode_short(&[0xF4]).is_err());
        assert!(decode_short(&[0xFD]).is_err());
        assert!(decode_short(&[]).is_err());
    }

    #[test]
    fn test_decode_sysex_is_opaque() {
        let msg = decode(&[0xF0, 0x43, 0x12]).unwrap();
        assert!(matches!(msg, MidiMessage::Sysex(_)));
        assert_eq!(encode(&msg), vec![0xF0, 0x43, 0x12, 0xF7]);
    }

    #[test]
    fn test_decoder_splits_buffer() {
        let bytes = [0x90, 60, 100, 0xF8, 0xF0, 1, 2, 0xF7, 0xC1, 7];
        let messages: Vec<_> = Decoder::new(&bytes).collect::<Result<_>>().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].event_type(), Some(EventType::TimingClock));
        assert_eq!(messages[2].event_type(), Some(EventType::SystemExclusive));
        assert_eq!(messages[3].status(), 0xC1);
    }

    #[test]
    fn test_decoder_resyncs_after_garbage() {
        let bytes = [0x90, 60, 0xF4, 0x80, 60, 0];
        let results: Vec<_> = Decoder::new(&bytes).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().status(), 0x80);
    }

    #[test]
    fn test_varlen() {
        for (value, expected) in [
            (0u32, vec![0x00]),
            (0x40, vec![0x40]),
            (0x7F, vec![0x7F]),
            (0x80, vec![0x81, 0x00]),
            (0x2000, vec![0xC0, 0x00]),
            (0x3FFF, vec![0xFF, 0x7F]),
            (0x0FFF_FFFF, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut out = Vec::new();
            write_varlen(&mut out, value);
            assert_eq!(out, expected, "{value:#x}");
            assert_eq!(read_varlen(&out), Some((value, expected.len())));
        }
        assert_eq!(read_varlen(&[0x81, 0x80, 0x80, 0x80, 0x00]), None);
        assert_eq!(read_varlen(&[0x81]), None);
    }

    // Property-based tests
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn voice_status_strategy() -> impl Strategy<Value = u8> {
            prop_oneof![
                0x80u8..=0x8F,
                0x90u8..=0x9F,
                0xA0u8..=0xAF,
                0xB0u8..=0xBF,
                0xE0u8..=0xEF,
            ]
        }

        proptest! {
            /// Property: every valid three-byte channel voice message roundtrips
            #[test]
            fn prop_channel_voice_roundtrip(
                status in voice_status_strategy(),
                d1 in 0u8..=127,
                d2 in 0u8..=127,
            ) {
                let msg = ShortMessage::new(status, d1, d2).unwrap();
                let decoded = decode_short(&msg.to_bytes()).unwrap();
                prop_assert_eq!(decoded.status(), status);
                prop_assert_eq!(decoded.data1(), d1);
                prop_assert_eq!(decoded.data2(), d2);
            }

            /// Property: note on keeps channel, note and velocity; status nibble is 0x9
            #[test]
            fn prop_note_on_roundtrip(channel in 0u8..=15, note in 0u8..=127, velocity in 0u8..=127) {
                let bytes = ShortMessage::note_on(channel, note, velocity).unwrap().to_bytes();
                prop_assert_eq!(bytes[0] >> 4, 0x9);
                let decoded = decode_short(&bytes).unwrap();
                prop_assert_eq!(decoded.channel(), Some(channel));
                prop_assert_eq!(decoded.data1(), note);
                prop_assert_eq!(decoded.data2(), velocity);
            }

            /// Property: pitch bend amount survives the 7-bit lsb/msb split
            #[test]
            fn prop_pitch_wheel_roundtrip(channel in 0u8..=15, amount in 0u16..=16383) {
                let bytes = ShortMessage::pitch_wheel(channel, amount).unwrap().to_bytes();
                prop_assert_eq!(bytes[1], (amount & 0x7F) as u8);
                prop_assert_eq!(bytes[2], ((amount >> 7) & 0x7F) as u8);
                let decoded = decode_short(&bytes).unwrap();
                prop_assert_eq!(decoded.value_14bit(), amount);
            }

            /// Property: song position pointer uses the same 14-bit packing
            #[test]
            fn prop_song_position_roundtrip(position in 0u16..=16383) {
                let bytes = ShortMessage::song_position_pointer(position).unwrap().to_bytes();
                prop_assert_eq!(decode_short(&bytes).unwrap().value_14bit(), position);
            }

            /// Property: decoding arbitrary bytes never panics
            #[test]
            fn prop_decode_total(bytes in prop::collection::vec(any::<u8>(), 0..8)) {
                let _ = decode(&bytes);
                let _ = Decoder::new(&bytes).count();
            }

            /// Property: variable-length quantities roundtrip
            #[test]
            fn prop_varlen_roundtrip(value in 0u32..=MAX_VARLEN) {
                let mut out = Vec::new();
                write_varlen(&mut out, value);
                prop_assert_eq!(read_varlen(&out), Some((value, out.len())));
            }
        }
    }
}
