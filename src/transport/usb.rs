//! USB-MIDI 1.0 event packet framing
//!
//! Each 32-bit event packet carries a cable number (the group), a Code Index
//! Number giving the message length, and up to three MIDI bytes. System
//! exclusive spans several packets and is reassembled per cable.
//!
//! Packets that do not carry a MIDI message (miscellaneous function codes,
//! cable events and stray single bytes) are surfaced with their own
//! [`UsbEventKind`] so adapters decide what to forward.

use tracing::trace;

use crate::protocol::{EventType, SYSEX_END, SYSEX_START};

/// Size of one USB-MIDI event packet
pub const EVENT_PACKET_LEN: usize = 4;

/// Number of virtual cables on one USB-MIDI interface
pub const CABLES: usize = 16;

mod cin {
    pub const MISCELLANEOUS: u8 = 0x0;
    pub const CABLE_EVENT: u8 = 0x1;
    pub const TWO_BYTE_COMMON: u8 = 0x2;
    pub const THREE_BYTE_COMMON: u8 = 0x3;
    pub const SYSEX_CONTINUE: u8 = 0x4;
    pub const SINGLE_BYTE_OR_SYSEX_END1: u8 = 0x5;
    pub const SYSEX_END2: u8 = 0x6;
    pub const SYSEX_END3: u8 = 0x7;
    pub const SINGLE_BYTE: u8 = 0xF;
}

/// What an event packet carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEventKind {
    /// A complete MIDI message
    Midi,
    /// CIN 0x0, reserved for future extensions. All three bytes are kept.
    Miscellaneous,
    /// CIN 0x1, reserved for future cable events. All three bytes are kept.
    CableEvent,
    /// A lone byte that is not a complete message: a data byte, an undefined
    /// status or a status that needs data bytes
    SingleByte,
}

/// Payload recovered from one or more event packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbMessage {
    /// Cable number, surfaced as the group
    pub cable: u8,
    /// What `bytes` holds
    pub kind: UsbEventKind,
    /// MIDI bytes, or the raw packet bytes for the other kinds
    pub bytes: Vec<u8>,
}

impl UsbMessage {
    /// Check whether `bytes` is a MIDI message ready for the decoder
    #[must_use]
    pub fn is_midi(&self) -> bool {
        self.kind == UsbEventKind::Midi
    }
}

/// Stateful decoder for a stream of USB-MIDI event packets.
#[derive(Debug, Clone, Default)]
pub struct UsbMidiDecoder {
    sysex: [Vec<u8>; CABLES],
}

impl UsbMidiDecoder {
    /// Create a decoder with no sysex in progress
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a transfer buffer; trailing bytes short of a packet are ignored
    pub fn decode(&mut self, buffer: &[u8]) -> Vec<UsbMessage> {
        buffer
            .chunks_exact(EVENT_PACKET_LEN)
            .filter_map(|chunk| self.decode_packet([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Decode one event packet, returning a message once one is complete
    pub fn decode_packet(&mut self, packet: [u8; EVENT_PACKET_LEN]) -> Option<UsbMessage> {
        let cable = packet[0] >> 4;
        let code = packet[0] & 0x0F;
        let midi = &packet[1..];
        let sysex = &mut self.sysex[usize::from(cable)];

        let kind = match code {
            cin::MISCELLANEOUS => UsbEventKind::Miscellaneous,
            cin::CABLE_EVENT => UsbEventKind::CableEvent,
            cin::SINGLE_BYTE if !is_complete_single_byte(midi[0]) => UsbEventKind::SingleByte,
            cin::SINGLE_BYTE_OR_SYSEX_END1
                if sysex.is_empty() && !is_complete_single_byte(midi[0]) =>
            {
                UsbEventKind::SingleByte
            }
            _ => UsbEventKind::Midi,
        };
        if kind != UsbEventKind::Midi {
            trace!(cable, code, ?kind, bytes = ?midi, "non-message event packet");
            let len = if kind == UsbEventKind::SingleByte { 1 } else { 3 };
            return Some(UsbMessage {
                cable,
                kind,
                bytes: midi[..len].to_vec(),
            });
        }

        let bytes = match code {
            cin::SYSEX_CONTINUE => {
                sysex.extend_from_slice(midi);
                return None;
            }
            cin::SINGLE_BYTE_OR_SYSEX_END1 if midi[0] == SYSEX_END || !sysex.is_empty() => {
                finish_sysex(sysex, &midi[..1])
            }
            cin::SYSEX_END2 => finish_sysex(sysex, &midi[..2]),
            cin::SYSEX_END3 => finish_sysex(sysex, &midi[..3]),
            cin::SINGLE_BYTE_OR_SYSEX_END1 | cin::SINGLE_BYTE => midi[..1].to_vec(),
            cin::TWO_BYTE_COMMON => midi[..2].to_vec(),
            cin::THREE_BYTE_COMMON => midi[..3].to_vec(),
            0x8..=0xE => {
                let len = if matches!(code, 0xC | 0xD) { 2 } else { 3 };
                midi[..len].to_vec()
            }
            _ => return None,
        };

        Some(UsbMessage {
            cable,
            kind,
            bytes,
        })
    }
}

/// Status bytes that form a message on their own
fn is_complete_single_byte(byte: u8) -> bool {
    byte != SYSEX_START
        && EventType::from_status(byte).is_some_and(|event| event.data_len() == 0)
}

fn finish_sysex(buffer: &mut Vec<u8>, tail: &[u8]) -> Vec<u8> {
    let mut bytes = std::mem::take(buffer);
    bytes.extend_from_slice(tail);
    bytes
}

/// Code Index Number for a complete short message
fn short_cin(bytes: &[u8]) -> u8 {
    match bytes[0] {
        status @ 0x80..=0xEF => status >> 4,
        status => match EventType::from_status(status).map(EventType::data_len) {
            Some(1) => cin::TWO_BYTE_COMMON,
            Some(2) => cin::THREE_BYTE_COMMON,
            _ if status >= 0xF8 => cin::SINGLE_BYTE,
            _ => cin::SINGLE_BYTE_OR_SYSEX_END1,
        },
    }
}

/// Encode one complete message into event packets on `cable`.
///
/// System exclusive is split into three-byte packets. Empty input yields no
/// packets.
#[must_use]
pub fn encode(cable: u8, bytes: &[u8]) -> Vec<u8> {
    let header = (cable & 0x0F) << 4;
    let mut out = Vec::with_capacity(bytes.len().div_ceil(3) * EVENT_PACKET_LEN);

    let Some(&first) = bytes.first() else {
        return out;
    };

    if first != SYSEX_START {
        let len = bytes.len().min(3);
        let mut packet = [header | short_cin(bytes), 0, 0, 0];
        packet[1..=len].copy_from_slice(&bytes[..len]);
        out.extend_from_slice(&packet);
        return out;
    }

    let mut chunks = bytes.chunks(3).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let code = match (last, chunk.len()) {
            (false, _) => cin::SYSEX_CONTINUE,
            (true, 1) => cin::SINGLE_BYTE_OR_SYSEX_END1,
            (true, 2) => cin::SYSEX_END2,
            (true, _) => cin::SYSEX_END3,
        };
        let mut packet = [header | code, 0, 0, 0];
        packet[1..=chunk.len()].copy_from_slice(chunk);
        out.extend_from_slice(&packet);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_packet() {
        assert_eq!(encode(1, &[0x93, 60, 100]), vec![0x19, 0x93, 60, 100]);

        let mut decoder = UsbMidiDecoder::new();
        let message = decoder.decode_packet([0x19, 0x93, 60, 100]).unwrap();
        assert_eq!(message.cable, 1);
        assert_eq!(message.bytes, vec![0x93, 60, 100]);
    }

    #[test]
    fn test_program_change_and_realtime() {
        assert_eq!(encode(0, &[0xC2, 5]), vec![0x0C, 0xC2, 5, 0]);
        assert_eq!(encode(0, &[0xF8]), vec![0x0F, 0xF8, 0, 0]);
        assert_eq!(encode(0, &[0xF2, 1, 2]), vec![0x03, 0xF2, 1, 2]);
        assert_eq!(encode(0, &[0xF3, 1]), vec![0x02, 0xF3, 1, 0]);
        assert_eq!(encode(0, &[0xF6]), vec![0x05, 0xF6, 0, 0]);

        let mut decoder = UsbMidiDecoder::new();
        let messages = decoder.decode(&[0x0C, 0xC2, 5, 0, 0x0F, 0xF8, 0, 0, 0x05, 0xF6, 0, 0]);
        assert_eq!(messages[0].bytes, vec![0xC2, 5]);
        assert_eq!(messages[1].bytes, vec![0xF8]);
        assert_eq!(messages[2].bytes, vec![0xF6]);
    }

    #[test]
    fn test_sysex_spans_packets() {
        let sysex = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];
        let packets = encode(2, &sysex);
        assert_eq!(
            packets,
            vec![0x24, 0xF0, 0x7E, 0x7F, 0x27, 0x06, 0x01, 0xF7]
        );

        let mut decoder = UsbMidiDecoder::new();
        let messages = decoder.decode(&packets);
        assert_eq!(
            messages,
            vec![UsbMessage {
                cable: 2,
                kind: UsbEventKind::Midi,
                bytes: sysex.to_vec()
            }]
        );
    }

    #[test]
    fn test_sysex_per_cable_reassembly() {
        let mut decoder = UsbMidiDecoder::new();
        assert!(decoder.decode_packet([0x04, 0xF0, 0x01, 0x02]).is_none());
        assert!(decoder.decode_packet([0x14, 0xF0, 0x0A, 0x0B]).is_none());
        let first = decoder.decode_packet([0x05, 0xF7, 0, 0]).unwrap();
        let second = decoder.decode_packet([0x16, 0x0C, 0xF7, 0]).unwrap();
        assert_eq!(first.bytes, vec![0xF0, 0x01, 0x02, 0xF7]);
        assert_eq!(second.bytes, vec![0xF0, 0x0A, 0x0B, 0x0C, 0xF7]);
    }

    #[test]
    fn test_misc_and_cable_events_surface_raw_bytes() {
        let mut decoder = UsbMidiDecoder::new();
        let misc = decoder.decode_packet([0x30, 0x12, 0x34, 0x56]).unwrap();
        assert_eq!(misc.cable, 3);
        assert_eq!(misc.kind, UsbEventKind::Miscellaneous);
        assert_eq!(misc.bytes, vec![0x12, 0x34, 0x56]);
        assert!(!misc.is_midi());

        let cable_event = decoder.decode_packet([0x01, 0x90, 60, 100]).unwrap();
        assert_eq!(cable_event.kind, UsbEventKind::CableEvent);
        assert_eq!(cable_event.bytes, vec![0x90, 60, 100]);
        assert!(encode(0, &[]).is_empty());
    }

    #[test]
    fn test_single_bytes_classified() {
        let mut decoder = UsbMidiDecoder::new();
        let kinds: Vec<(UsbEventKind, Vec<u8>)> = decoder
            .decode(&[
                0x0F, 0xFA, 0, 0, // start
                0x0F, 0x3C, 0, 0, // data byte
                0x0F, 0xF9, 0, 0, // undefined realtime
                0x05, 0xF4, 0, 0, // undefined common
                0x0F, 0x90, 0, 0, // status without its data
            ])
            .into_iter()
            .map(|m| (m.kind, m.bytes))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (UsbEventKind::Midi, vec![0xFA]),
                (UsbEventKind::SingleByte, vec![0x3C]),
                (UsbEventKind::SingleByte, vec![0xF9]),
                (UsbEventKind::SingleByte, vec![0xF4]),
                (UsbEventKind::SingleByte, vec![0x90]),
            ]
        );
    }

    #[test]
    fn test_single_byte_during_sysex_ends_it() {
        let mut decoder = UsbMidiDecoder::new();
        assert!(decoder.decode_packet([0x04, 0xF0, 0x01, 0x02]).is_none());
        let message = decoder.decode_packet([0x05, 0xF7, 0, 0]).unwrap();
        assert!(message.is_midi());
        assert_eq!(message.bytes, vec![0xF0, 0x01, 0x02, 0xF7]);
    }
}
