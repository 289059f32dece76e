//! BLE-MIDI packet framing
//!
//! A packet is a header byte carrying the upper six bits of a 13-bit
//! millisecond timestamp, followed by messages each preceded by a byte with
//! the lower seven bits. Running status is allowed, realtime bytes may
//! interrupt system exclusive, and system exclusive may span packets.

use tracing::trace;

use crate::protocol::{EventType, SYSEX_END, SYSEX_START};

/// Payload size of a default ATT MTU (23 bytes minus the ATT header)
pub const DEFAULT_MTU: usize = 20;

/// Smallest packet able to carry a timestamp and a three-byte message
const MIN_MTU: usize = 5;

/// Complete MIDI message recovered from BLE packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleMessage {
    /// 13-bit millisecond timestamp
    pub timestamp: u16,
    /// MIDI bytes
    pub bytes: Vec<u8>,
}

/// Stateful decoder for one BLE-MIDI characteristic.
#[derive(Debug, Clone, Default)]
pub struct BleMidiDecoder {
    running_status: Option<u8>,
    sysex: Option<Vec<u8>>,
}

impl BleMidiDecoder {
    /// Create a decoder with no running status
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one notification payload
    pub fn decode(&mut self, packet: &[u8]) -> Vec<BleMessage> {
        let mut out = Vec::new();
        let Some((&header, body)) = packet.split_first() else {
            return out;
        };
        if header & 0x80 == 0 {
            trace!(header, "packet without header byte ignored");
            return out;
        }

        let mut high = u16::from(header & 0x3F);
        let mut last_low: Option<u16> = None;
        let mut timestamp = high << 7;
        let mut pos = 0;

        while pos < body.len() {
            let byte = body[pos];

            if byte < 0x80 {
                if let Some(sysex) = self.sysex.as_mut() {
                    sysex.push(byte);
                    pos += 1;
                } else if let Some(status) = self.running_status {
                    pos = take_message(status, body, pos, timestamp, &mut out);
                } else {
                    trace!(byte, "orphan data byte skipped");
                    pos += 1;
                }
                continue;
            }

            let low = u16::from(byte & 0x7F);
            if last_low.is_some_and(|prev| low < prev) {
                high = (high + 1) & 0x3F;
            }
            last_low = Some(low);
            timestamp = (high << 7) | low;
            pos += 1;

            let Some(&next) = body.get(pos) else {
                break;
            };

            if next < 0x80 {
                match self.running_status {
                    Some(status) => pos = take_message(status, body, pos, timestamp, &mut out),
                    None => pos += 1,
                }
                continue;
            }

            pos += 1;
            match next {
                SYSEX_END => {
                    if let Some(mut sysex) = self.sysex.take() {
                        sysex.push(SYSEX_END);
                        out.push(BleMessage {
                            timestamp,
                            bytes: sysex,
                        });
                    }
                }
                0xF8..=0xFF => out.push(BleMessage {
                    timestamp,
                    bytes: vec![next],
                }),
                SYSEX_START => {
                    self.running_status = None;
                    self.sysex = Some(vec![SYSEX_START]);
                }
                status => {
                    if self.sysex.take().is_some() {
                        trace!(status, "unterminated system exclusive discarded");
                    }
                    self.running_status = (status < 0xF0).then_some(status);
                    pos = take_message(status, body, pos, timestamp, &mut out);
                }
            }
        }
        out
    }
}

fn take_message(
    status: u8,
    body: &[u8],
    start: usize,
    timestamp: u16,
    out: &mut Vec<BleMessage>,
) -> usize {
    let Some(event_type) = EventType::from_status(status) else {
        trace!(status, "undefined status skipped");
        return start;
    };
    let needed = event_type.data_len();
    let data: Vec<u8> = body[start..]
        .iter()
        .take(needed)
        .take_while(|b| **b < 0x80)
        .copied()
        .collect();
    let consumed = start + data.len();
    if data.len() < needed {
        trace!(status, "truncated message dropped");
        return consumed;
    }

    let mut bytes = Vec::with_capacity(1 + needed);
    bytes.push(status);
    bytes.extend_from_slice(&data);
    out.push(BleMessage { timestamp, bytes });
    consumed
}

/// Encode one complete message into BLE-MIDI packets of at most `mtu` bytes.
///
/// Short messages always fit one packet. System exclusive continues in
/// further packets, each starting with a header byte.
#[must_use]
pub fn encode(timestamp: u16, message: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let mtu = mtu.max(MIN_MTU);
    let header = 0x80 | ((timestamp >> 7) & 0x3F) as u8;
    let stamp = 0x80 | (timestamp & 0x7F) as u8;

    let Some(&first) = message.first() else {
        return Vec::new();
    };

    if first != SYSEX_START {
        let mut packet = Vec::with_capacity(2 + message.len());
        packet.extend_from_slice(&[header, stamp]);
        packet.extend_from_slice(message);
        return vec![packet];
    }

    let mut payload = &message[1..];
    if let [rest @ .., SYSEX_END] = payload {
        payload = rest;
    }

    let mut packets = Vec::new();
    let mut current = vec![header, stamp, SYSEX_START];
    for &byte in payload {
        if current.len() >= mtu {
            packets.push(std::mem::replace(&mut current, vec![header]));
        }
        current.push(byte);
    }
    if current.len() + 2 > mtu {
        packets.push(std::mem::replace(&mut current, vec![header]));
    }
    current.extend_from_slice(&[stamp, SYSEX_END]);
    packets.push(current);
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_note_on() {
        let packet = encode(0, &[0x90, 60, 100], DEFAULT_MTU);
        assert_eq!(packet, vec![vec![0x80, 0x80, 0x90, 60, 100]]);

        let messages = BleMidiDecoder::new().decode(&packet[0]);
        assert_eq!(
            messages,
            vec![BleMessage {
                timestamp: 0,
                bytes: vec![0x90, 60, 100]
            }]
        );
    }

    #[test]
    fn test_running_status_with_and_without_timestamp() {
        let mut decoder = BleMidiDecoder::new();
        let messages = decoder.decode(&[0x80, 0x81, 0x90, 60, 100, 62, 90, 0x82, 64, 80]);
        let bytes: Vec<_> = messages.iter().map(|m| m.bytes.clone()).collect();
        assert_eq!(
            bytes,
            vec![vec![0x90, 60, 100], vec![0x90, 62, 90], vec![0x90, 64, 80]]
        );
        assert_eq!(messages[2].timestamp, 2);
    }

    #[test]
    fn test_timestamp_low_wraps_into_high() {
        let messages = BleMidiDecoder::new().decode(&[0x81, 0xFF, 0xF8, 0x80, 0xFA]);
        assert_eq!(messages[0].timestamp, (1 << 7) | 127);
        assert_eq!(messages[1].timestamp, 2 << 7);
    }

    #[test]
    fn test_sysex_spanning_packets() {
        let mut sysex = vec![0xF0];
        sysex.extend(0u8..30);
        sysex.push(0xF7);

        let packets = encode(5, &sysex, DEFAULT_MTU);
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= DEFAULT_MTU));

        let mut decoder = BleMidiDecoder::new();
        let messages: Vec<_> = packets.iter().flat_map(|p| decoder.decode(p)).collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].bytes, sysex);
    }

    #[test]
    fn test_realtime_inside_sysex() {
        let mut decoder = BleMidiDecoder::new();
        let messages = decoder.decode(&[0x80, 0x80, 0xF0, 0x01, 0x02, 0x80, 0xF8, 0x03, 0x80, 0xF7]);
        let bytes: Vec<_> = messages.into_iter().map(|m| m.bytes).collect();
        assert_eq!(bytes, vec![vec![0xF8], vec![0xF0, 0x01, 0x02, 0x03, 0xF7]]);
    }

    #[test]
    fn test_invalid_header_ignored() {
        assert!(BleMidiDecoder::new().decode(&[0x00, 0x80, 0x90, 60, 100]).is_empty());
        assert!(BleMidiDecoder::new().decode(&[]).is_empty());
    }
}
