//! RTP-MIDI data packets: RTP header plus MIDI command section
//!
//! ```text
//!  0                   1                   2                   3
//! |V=2|P|X|  CC   |M|     PT      |        Sequence number        |
//! |                           Timestamp                           |
//! |                             SSRC                              |
//! |B|J|Z|P|LEN... |  MIDI list ...  | recovery journal (if J) ... |
//! ```

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{EventType, SYSEX_END, SYSEX_START, read_varlen, write_varlen};

/// RTP version carried in every packet
pub const RTP_VERSION: u8 = 2;
/// Dynamic payload type used by AppleMIDI
pub const PAYLOAD_TYPE: u8 = 0x61;
/// Fixed RTP header length
pub const RTP_HEADER_LEN: usize = 12;
/// Longest MIDI list a command section header can describe
pub const MAX_COMMAND_LIST_LEN: usize = 0x0FFF;

/// Sysex cancel byte, only meaningful at the end of a segment
pub(super) const SYSEX_CANCEL: u8 = 0xF4;

/// Wire-level error for RTP-MIDI control and data packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Input shorter than the structure being decoded
    TooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },
    /// Control packet missing the FF FF signature
    BadSignature,
    /// Control command code not understood
    UnknownCommand([u8; 2]),
    /// RTP or AppleMIDI protocol version other than 2
    UnsupportedVersion(u32),
    /// RTP payload type other than MIDI
    UnexpectedPayloadType(u8),
    /// Section length runs past the end of the packet
    LengthMismatch {
        /// Declared length
        declared: usize,
        /// Bytes remaining
        available: usize,
    },
    /// Command list byte at `offset` cannot start a command
    InvalidCommand {
        /// Offset within the MIDI list
        offset: usize,
    },
    /// Recovery journal structure inconsistent
    MalformedJournal(&'static str),
    /// Command list exceeds the 12-bit length field
    CommandListTooLong(usize),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { expected, actual } => {
                write!(f, "packet too short: need {expected} bytes, have {actual}")
            }
            Self::BadSignature => write!(f, "missing AppleMIDI signature"),
            Self::UnknownCommand(code) => write!(
                f,
                "unknown control command {:?}",
                String::from_utf8_lossy(code)
            ),
            Self::UnsupportedVersion(version) => write!(f, "unsupported protocol version {version}"),
            Self::UnexpectedPayloadType(pt) => write!(f, "unexpected RTP payload type {pt:#04x}"),
            Self::LengthMismatch {
                declared,
                available,
            } => write!(
                f,
                "section declares {declared} bytes but only {available} remain"
            ),
            Self::InvalidCommand { offset } => {
                write!(f, "invalid MIDI command at list offset {offset}")
            }
            Self::MalformedJournal(what) => write!(f, "malformed recovery journal: {what}"),
            Self::CommandListTooLong(len) => {
                write!(f, "command list of {len} bytes exceeds {MAX_COMMAND_LIST_LEN}")
            }
        }
    }
}

impl std::error::Error for PacketError {}

pub(super) fn ensure_len(bytes: &[u8], expected: usize) -> Result<(), PacketError> {
    if bytes.len() < expected {
        return Err(PacketError::TooShort {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Fixed RTP header fields used by RTP-MIDI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit (unused by RTP-MIDI, preserved)
    pub marker: bool,
    /// Per-stream sequence number, wrapping
    pub sequence: u16,
    /// Media timestamp in session clock units (10 kHz)
    pub timestamp: u32,
    /// Sender stream identifier
    pub ssrc: u32,
}

impl RtpHeader {
    /// Append the 12-byte header
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(RTP_VERSION << 6);
        out.put_u8((u8::from(self.marker) << 7) | PAYLOAD_TYPE);
        out.put_u16(self.sequence);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
    }

    /// Decode the header, returning it with the remaining payload.
    ///
    /// CSRC entries and header extensions are skipped; padding is stripped.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        ensure_len(bytes, RTP_HEADER_LEN)?;
        let version = bytes[0] >> 6;
        if version != RTP_VERSION {
            return Err(PacketError::UnsupportedVersion(u32::from(version)));
        }
        let padding = bytes[0] & 0x20 != 0;
        let extension = bytes[0] & 0x10 != 0;
        let csrc_count = usize::from(bytes[0] & 0x0F);

        let payload_type = bytes[1] & 0x7F;
        if payload_type != PAYLOAD_TYPE {
            return Err(PacketError::UnexpectedPayloadType(payload_type));
        }

        let header = Self {
            marker: bytes[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        };

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        ensure_len(bytes, offset)?;
        if extension {
            ensure_len(bytes, offset + 4)?;
            let words = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
            offset += 4 + words * 4;
            ensure_len(bytes, offset)?;
        }

        let mut end = bytes.len();
        if padding {
            let pad = usize::from(bytes[end - 1]);
            if pad == 0 || end < offset + pad {
                return Err(PacketError::LengthMismatch {
                    declared: pad,
                    available: end - offset,
                });
            }
            end -= pad;
        }

        Ok((header, &bytes[offset..end]))
    }
}

/// One entry of a MIDI command list.
///
/// `bytes` always starts with a status byte: running status is expanded on
/// decode. System exclusive segments keep their framing bytes (`F0..F0`,
/// `F7..F0`, `F7..F7`, `F0..F7`, or ending in `F4` when cancelled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiCommand {
    /// Delta time from the previous command, in session clock units
    pub delta: u32,
    /// Command bytes
    pub bytes: Bytes,
}

impl MidiCommand {
    /// Command with zero delta time
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            delta: 0,
            bytes: bytes.into(),
        }
    }
}

/// Decoded RTP-MIDI data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPacket {
    /// RTP header
    pub header: RtpHeader,
    /// MIDI command list
    pub commands: Vec<MidiCommand>,
    /// Raw recovery journal, present when the J flag is set
    pub journal: Option<Bytes>,
}

impl MidiPacket {
    /// Encode header, command section and journal.
    ///
    /// The first command's delta time is omitted (Z = 0); every command is
    /// written with a full status byte (P = 0).
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut list = Vec::new();
        for (index, command) in self.commands.iter().enumerate() {
            if index > 0 {
                write_varlen(&mut list, command.delta);
            }
            list.extend_from_slice(&command.bytes);
        }
        if list.len() > MAX_COMMAND_LIST_LEN {
            return Err(PacketError::CommandListTooLong(list.len()));
        }

        let journal_len = self.journal.as_ref().map_or(0, Bytes::len);
        let mut out = BytesMut::with_capacity(RTP_HEADER_LEN + 2 + list.len() + journal_len);
        self.header.encode_into(&mut out);

        let j_flag = if self.journal.is_some() { 0x40 } else { 0 };
        if list.len() > 0x0F {
            let len = list.len();
            out.put_u8(0x80 | j_flag | ((len >> 8) & 0x0F) as u8);
            out.put_u8((len & 0xFF) as u8);
        } else {
            out.put_u8(j_flag | list.len() as u8);
        }
        out.put_slice(&list);
        if let Some(journal) = &self.journal {
            out.put_slice(journal);
        }
        Ok(out.to_vec())
    }

    /// Decode a full data packet
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let (header, payload) = RtpHeader::decode(bytes)?;
        ensure_len(payload, 1)?;

        let flags = payload[0];
        let long = flags & 0x80 != 0;
        let has_journal = flags & 0x40 != 0;
        let first_has_delta = flags & 0x20 != 0;

        let (len, header_len) = if long {
            ensure_len(payload, 2)?;
            (
                (usize::from(flags & 0x0F) << 8) | usize::from(payload[1]),
                2,
            )
        } else {
            (usize::from(flags & 0x0F), 1)
        };

        let available = payload.len() - header_len;
        if len > available {
            return Err(PacketError::LengthMismatch {
                declared: len,
                available,
            });
        }

        let list = &payload[header_len..header_len + len];
        let commands = decode_command_list(list, first_has_delta)?;

        let rest = &payload[header_len + len..];
        let journal = if has_journal {
            ensure_len(rest, 3)?;
            Some(Bytes::copy_from_slice(rest))
        } else {
            None
        };

        Ok(Self {
            header,
            commands,
            journal,
        })
    }
}

fn decode_command_list(list: &[u8], first_has_delta: bool) -> Result<Vec<MidiCommand>, PacketError> {
    let mut commands = Vec::new();
    let mut pos = 0;
    let mut running: Option<u8> = None;

    while pos < list.len() {
        let delta = if commands.is_empty() && !first_has_delta {
            0
        } else {
            let (delta, used) =
                read_varlen(&list[pos..]).ok_or(PacketError::InvalidCommand { offset: pos })?;
            pos += used;
            delta
        };

        let start = pos;
        let Some(&first) = list.get(pos) else {
            // Trailing delta time with no command
            break;
        };

        let status = if first >= 0x80 {
            pos += 1;
            first
        } else {
            // Running status never carries across packets here, so a phantom
            // (P flag) first command is rejected like any orphan data byte.
            running.ok_or(PacketError::InvalidCommand { offset: start })?
        };

        let bytes = match status {
            SYSEX_START | SYSEX_END => {
                running = None;
                let end = list[pos..]
                    .iter()
                    .position(|b| matches!(*b, SYSEX_START | SYSEX_END | SYSEX_CANCEL))
                    .ok_or(PacketError::InvalidCommand { offset: start })?;
                pos += end + 1;
                Bytes::copy_from_slice(&list[start..pos])
            }
            0xF8..=0xFF => Bytes::copy_from_slice(&[status]),
            _ => {
                let event_type =
                    EventType::from_status(status).ok_or(PacketError::InvalidCommand { offset: start })?;
                let needed = event_type.data_len();
                let data = list
                    .get(pos..pos + needed)
                    .filter(|data| data.iter().all(|b| *b < 0x80))
                    .ok_or(PacketError::InvalidCommand { offset: start })?;
                pos += needed;

                running = event_type.is_channel_voice().then_some(status);
                let mut bytes = BytesMut::with_capacity(1 + needed);
                bytes.put_u8(status);
                bytes.put_slice(data);
                bytes.freeze()
            }
        };

        commands.push(MidiCommand { delta, bytes });
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u16) -> RtpHeader {
        RtpHeader {
            marker: false,
            sequence,
            timestamp: 1000,
            ssrc: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_encode_single_note() {
        let packet = MidiPacket {
            header: header(7),
            commands: vec![MidiCommand::new(vec![0x90, 60, 100])],
            journal: None,
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x80, 0x61, 0x00, 0x07, 0x00, 0x00, 0x03, 0xE8, 0xDE, 0xAD, 0xBE, 0xEF, 0x03,
                0x90, 60, 100
            ]
        );
        assert_eq!(MidiPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_long_list_uses_b_flag() {
        let commands: Vec<_> = (0..8u8)
            .map(|n| MidiCommand::new(vec![0x90, 60 + n, 100]))
            .collect();
        let packet = MidiPacket {
            header: header(1),
            commands,
            journal: Some(Bytes::from_static(&[0x00, 0x00, 0x01])),
        };
        let bytes = packet.encode().unwrap();
        // 8 commands of 3 bytes plus 7 one-byte deltas
        assert_eq!(bytes[RTP_HEADER_LEN], 0x80 | 0x40);
        assert_eq!(bytes[RTP_HEADER_LEN + 1], 31);
        assert_eq!(MidiPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_running_status_expanded() {
        let mut bytes = BytesMut::new();
        header(2).encode_into(&mut bytes);
        // Z=1: first command has a delta; second command uses running status
        bytes.put_slice(&[0x20 | 0x07, 0x00, 0x90, 60, 100, 0x05, 62, 90]);

        let packet = MidiPacket::decode(&bytes).unwrap();
        assert_eq!(packet.commands.len(), 2);
        assert_eq!(packet.commands[1].delta, 5);
        assert_eq!(packet.commands[1].bytes.as_ref(), &[0x90, 62, 90]);
    }

    #[test]
    fn test_sysex_segments_kept_whole() {
        let mut bytes = BytesMut::new();
        header(3).encode_into(&mut bytes);
        bytes.put_slice(&[0x06, 0xF7, 0x01, 0x02, 0xF0, 0x00, 0xF8]);

        let packet = MidiPacket::decode(&bytes).unwrap();
        assert_eq!(packet.commands[0].bytes.as_ref(), &[0xF7, 0x01, 0x02, 0xF0]);
        assert_eq!(packet.commands[1].bytes.as_ref(), &[0xF8]);
    }

    #[test]
    fn test_rejects_bad_packets() {
        assert!(matches!(
            MidiPacket::decode(&[0x80, 0x61]),
            Err(PacketError::TooShort { .. })
        ));

        let mut wrong_type = BytesMut::new();
        header(1).encode_into(&mut wrong_type);
        wrong_type[1] = 0x60;
        wrong_type.put_u8(0x00);
        assert!(matches!(
            MidiPacket::decode(&wrong_type),
            Err(PacketError::UnexpectedPayloadType(0x60))
        ));

        let mut overlong = BytesMut::new();
        header(1).encode_into(&mut overlong);
        overlong.put_slice(&[0x05, 0x90, 60]);
        assert!(matches!(
            MidiPacket::decode(&overlong),
            Err(PacketError::LengthMismatch { declared: 5, available: 2 })
        ));

        let mut orphan = BytesMut::new();
        header(1).encode_into(&mut orphan);
        orphan.put_slice(&[0x02, 60, 100]);
        assert!(matches!(
            MidiPacket::decode(&orphan),
            Err(PacketError::InvalidCommand { offset: 0 })
        ));
    }
}
