//! Recovery journal for RTP-MIDI streams
//!
//! Senders attach a journal to every data packet describing the channel
//! state changed since the last checkpoint the receiver acknowledged. A
//! receiver that detects a sequence gap compares the journal against its own
//! view of each channel and synthesizes the commands it missed.
//!
//! Only channel journals are produced, with chapters P (program), C
//! (controllers), W (pitch wheel), N (notes), T (channel pressure) and A
//! (polyphonic pressure). Chapters M and E and the system journal are skipped
//! on decode.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::{PacketError, ensure_len};
use crate::protocol::{CHANNELS, EventType, ShortMessage};

const JOURNAL_HEADER_LEN: usize = 3;
const CHANNEL_HEADER_LEN: usize = 3;
const MAX_CHANNEL_JOURNAL_LEN: usize = 0x03FF;
/// Most log entries a 7-bit length field can describe
const MAX_LOGS: usize = 127;

const TOC_P: u8 = 0x80;
const TOC_C: u8 = 0x40;
const TOC_M: u8 = 0x20;
const TOC_W: u8 = 0x10;
const TOC_N: u8 = 0x08;
const TOC_E: u8 = 0x04;
const TOC_T: u8 = 0x02;
const TOC_A: u8 = 0x01;

/// All Sound Off and All Notes Off release every sounding note
const ALL_SOUND_OFF: u8 = 120;
const ALL_NOTES_OFF: u8 = 123;

/// Recoverable state of one MIDI channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelState {
    /// Last program change
    pub program: Option<u8>,
    /// Last value per controller number
    pub controllers: BTreeMap<u8, u8>,
    /// Last pitch wheel position
    pub pitch: Option<u16>,
    /// Sounding notes and their velocities
    pub notes_on: BTreeMap<u8, u8>,
    /// Notes released and not sounding again
    pub notes_off: BTreeSet<u8>,
    /// Last channel pressure
    pub channel_pressure: Option<u8>,
    /// Last pressure per note
    pub poly_pressure: BTreeMap<u8, u8>,
}

impl ChannelState {
    /// Check whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.is_none()
            && self.controllers.is_empty()
            && self.pitch.is_none()
            && self.notes_on.is_empty()
            && self.notes_off.is_empty()
            && self.channel_pressure.is_none()
            && self.poly_pressure.is_empty()
    }

    /// Fold one channel voice message into the state
    pub fn apply(&mut self, msg: &ShortMessage) {
        match msg.event_type() {
            EventType::NoteOn if msg.data2() > 0 => {
                self.notes_on.insert(msg.data1(), msg.data2());
                self.notes_off.remove(&msg.data1());
            }
            EventType::NoteOn | EventType::NoteOff => self.release(msg.data1()),
            EventType::ControlChange => {
                self.controllers.insert(msg.data1(), msg.data2());
                if matches!(msg.data1(), ALL_SOUND_OFF | ALL_NOTES_OFF) {
                    let sounding: Vec<u8> = self.notes_on.keys().copied().collect();
                    for note in sounding {
                        self.release(note);
                    }
                }
            }
            EventType::ProgramChange => self.program = Some(msg.data1()),
            EventType::ChannelAftertouch => self.channel_pressure = Some(msg.data1()),
            EventType::PolyphonicAftertouch => {
                self.poly_pressure.insert(msg.data1(), msg.data2());
            }
            EventType::PitchWheel => self.pitch = Some(msg.value_14bit()),
            _ => {}
        }
    }

    fn release(&mut self, note: u8) {
        self.notes_on.remove(&note);
        self.notes_off.insert(note);
    }

    /// Commands that bring this state in line with `journal`.
    ///
    /// Values this side already holds are not repeated. The returned
    /// commands are not applied; callers apply them as they deliver.
    #[must_use]
    pub fn recovery_messages(&self, channel: u8, journal: &Self) -> Vec<ShortMessage> {
        let mut out = Vec::new();

        if let Some(program) = journal.program.filter(|p| self.program != Some(*p)) {
            out.push(ShortMessage::program_change(channel, program));
        }
        for (&number, &value) in &journal.controllers {
            if self.controllers.get(&number) != Some(&value) {
                out.push(ShortMessage::control_change(channel, number, value));
            }
        }
        if let Some(pitch) = journal.pitch.filter(|p| self.pitch != Some(*p)) {
            out.push(ShortMessage::pitch_wheel(channel, pitch));
        }
        for &note in &journal.notes_off {
            if self.notes_on.contains_key(&note) {
                out.push(ShortMessage::note_off(channel, note, 0));
            }
        }
        for (&note, &velocity) in &journal.notes_on {
            if !self.notes_on.contains_key(&note) {
                out.push(ShortMessage::note_on(channel, note, velocity));
            }
        }
        if let Some(pressure) = journal
            .channel_pressure
            .filter(|p| self.channel_pressure != Some(*p))
        {
            out.push(ShortMessage::channel_aftertouch(channel, pressure));
        }
        for (&note, &pressure) in &journal.poly_pressure {
            if self.poly_pressure.get(&note) != Some(&pressure) {
                out.push(ShortMessage::polyphonic_aftertouch(channel, note, pressure));
            }
        }

        // Every value above came from 7-bit fields, so construction only
        // fails on a corrupted state.
        out.into_iter().filter_map(Result::ok).collect()
    }

    fn encode_into(&self, channel: u8, out: &mut BytesMut) {
        let mut toc = 0u8;
        let mut body = BytesMut::new();

        if let Some(program) = self.program {
            toc |= TOC_P;
            body.put_slice(&[program & 0x7F, 0, 0]);
        }
        if !self.controllers.is_empty() {
            toc |= TOC_C;
            put_log_chapter(&mut body, &self.controllers);
        }
        if let Some(pitch) = self.pitch {
            toc |= TOC_W;
            body.put_u8((pitch & 0x7F) as u8);
            body.put_u8(((pitch >> 7) & 0x7F) as u8);
        }
        if !self.notes_on.is_empty() || !self.notes_off.is_empty() {
            toc |= TOC_N;
            self.put_note_chapter(&mut body);
        }
        if let Some(pressure) = self.channel_pressure {
            toc |= TOC_T;
            body.put_u8(pressure & 0x7F);
        }
        if !self.poly_pressure.is_empty() {
            toc |= TOC_A;
            put_log_chapter(&mut body, &self.poly_pressure);
        }

        let len = CHANNEL_HEADER_LEN + body.len();
        debug_assert!(len <= MAX_CHANNEL_JOURNAL_LEN);
        out.put_u8(((channel & 0x0F) << 3) | ((len >> 8) & 0x03) as u8);
        out.put_u8((len & 0xFF) as u8);
        out.put_u8(toc);
        out.put_slice(&body);
    }

    fn put_note_chapter(&self, body: &mut BytesMut) {
        let logs: Vec<(u8, u8)> = self
            .notes_on
            .iter()
            .take(MAX_LOGS)
            .map(|(n, v)| (*n, *v))
            .collect();

        let mut octets = [0u8; 16];
        for &note in &self.notes_off {
            octets[usize::from(note / 8)] |= 0x80 >> (note % 8);
        }
        let low = octets.iter().position(|o| *o != 0);
        let high = octets.iter().rposition(|o| *o != 0);

        body.put_u8(logs.len() as u8);
        match (low, high) {
            (Some(low), Some(high)) => {
                body.put_u8(((low as u8) << 4) | high as u8);
                for (note, velocity) in logs {
                    body.put_slice(&[note & 0x7F, 0x80 | (velocity & 0x7F)]);
                }
                body.put_slice(&octets[low..=high]);
            }
            _ => {
                body.put_u8(0xF0);
                for (note, velocity) in logs {
                    body.put_slice(&[note & 0x7F, 0x80 | (velocity & 0x7F)]);
                }
            }
        }
    }

    fn decode_body(toc: u8, mut body: &[u8]) -> Result<Self, PacketError> {
        let mut state = Self::default();

        if toc & TOC_P != 0 {
            ensure_len(body, 3)?;
            state.program = Some(body[0] & 0x7F);
            body = &body[3..];
        }
        if toc & TOC_C != 0 {
            let (logs, rest) = take_logs(body)?;
            for log in logs.chunks_exact(2) {
                // A set means the value is a toggle or count, not a level
                if log[1] & 0x80 == 0 {
                    state.controllers.insert(log[0] & 0x7F, log[1] & 0x7F);
                }
            }
            body = rest;
        }
        if toc & TOC_M != 0 {
            ensure_len(body, 2)?;
            let len = (usize::from(body[0] & 0x03) << 8) | usize::from(body[1]);
            if len < 2 || len > body.len() {
                return Err(PacketError::MalformedJournal("chapter M length"));
            }
            body = &body[len..];
        }
        if toc & TOC_W != 0 {
            ensure_len(body, 2)?;
            state.pitch = Some(u16::from(body[0] & 0x7F) | (u16::from(body[1] & 0x7F) << 7));
            body = &body[2..];
        }
        if toc & TOC_N != 0 {
            body = state.decode_note_chapter(body)?;
        }
        if toc & TOC_E != 0 {
            let (_, rest) = take_logs(body)?;
            body = rest;
        }
        if toc & TOC_T != 0 {
            ensure_len(body, 1)?;
            state.channel_pressure = Some(body[0] & 0x7F);
            body = &body[1..];
        }
        if toc & TOC_A != 0 {
            let (logs, _) = take_logs(body)?;
            for log in logs.chunks_exact(2) {
                state.poly_pressure.insert(log[0] & 0x7F, log[1] & 0x7F);
            }
        }

        Ok(state)
    }

    fn decode_note_chapter<'a>(&mut self, body: &'a [u8]) -> Result<&'a [u8], PacketError> {
        ensure_len(body, 2)?;
        let count = usize::from(body[0] & 0x7F);
        let low = usize::from(body[1] >> 4);
        let high = usize::from(body[1] & 0x0F);
        // LEN 127 with LOW 15 and HIGH 0 encodes 128 logs
        let count = if count == MAX_LOGS && low == 15 && high == 0 {
            128
        } else {
            count
        };
        let offbit_len = if low <= high { high - low + 1 } else { 0 };

        let logs_end = 2 + count * 2;
        ensure_len(body, logs_end + offbit_len)?;

        for log in body[2..logs_end].chunks_exact(2) {
            let note = log[0] & 0x7F;
            let velocity = log[1] & 0x7F;
            if velocity == 0 {
                self.notes_on.remove(&note);
                self.notes_off.insert(note);
            } else {
                self.notes_on.insert(note, velocity);
                self.notes_off.remove(&note);
            }
        }
        for (index, octet) in body[logs_end..logs_end + offbit_len].iter().enumerate() {
            for bit in 0..8u8 {
                if octet & (0x80 >> bit) != 0 {
                    let note = ((low + index) * 8) as u8 + bit;
                    if !self.notes_on.contains_key(&note) {
                        self.notes_off.insert(note);
                    }
                }
            }
        }
        Ok(&body[logs_end + offbit_len..])
    }
}

/// Chapter with a `S|LEN` header counting `LEN + 1` two-byte logs
fn put_log_chapter(body: &mut BytesMut, logs: &BTreeMap<u8, u8>) {
    let count = logs.len().min(MAX_LOGS + 1);
    body.put_u8((count - 1) as u8);
    for (&key, &value) in logs.iter().take(count) {
        body.put_slice(&[key & 0x7F, value & 0x7F]);
    }
}

fn take_logs(body: &[u8]) -> Result<(&[u8], &[u8]), PacketError> {
    ensure_len(body, 1)?;
    let count = usize::from(body[0] & 0x7F) + 1;
    let end = 1 + count * 2;
    ensure_len(body, end)?;
    Ok((&body[1..end], &body[end..]))
}

/// One channel journal recovered from a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelJournal {
    /// Channel number 0-15
    pub channel: u8,
    /// State the sender described
    pub state: ChannelState,
}

/// Decoded recovery journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    /// Sequence number of the checkpoint packet
    pub checkpoint: u16,
    /// Journal describes only the previous packet
    pub single_packet_loss: bool,
    /// Channel journals in wire order
    pub channels: Vec<ChannelJournal>,
}

impl Journal {
    /// Decode the journal section of a data packet
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        ensure_len(bytes, JOURNAL_HEADER_LEN)?;
        let flags = bytes[0];
        let single_packet_loss = flags & 0x80 != 0;
        let has_system = flags & 0x40 != 0;
        let has_channels = flags & 0x20 != 0;
        let checkpoint = u16::from_be_bytes([bytes[1], bytes[2]]);

        let mut rest = &bytes[JOURNAL_HEADER_LEN..];
        if has_system {
            ensure_len(rest, 2)?;
            let len = (usize::from(rest[0] & 0x03) << 8) | usize::from(rest[1]);
            if len < 2 || len > rest.len() {
                return Err(PacketError::MalformedJournal("system journal length"));
            }
            rest = &rest[len..];
        }

        let mut channels = Vec::new();
        if has_channels {
            let total = usize::from(flags & 0x0F) + 1;
            for _ in 0..total {
                ensure_len(rest, CHANNEL_HEADER_LEN)?;
                let channel = (rest[0] >> 3) & 0x0F;
                let len = (usize::from(rest[0] & 0x03) << 8) | usize::from(rest[1]);
                if len < CHANNEL_HEADER_LEN || len > rest.len() {
                    return Err(PacketError::MalformedJournal("channel journal length"));
                }
                let toc = rest[2];
                let state = ChannelState::decode_body(toc, &rest[CHANNEL_HEADER_LEN..len])?;
                channels.push(ChannelJournal { channel, state });
                rest = &rest[len..];
            }
        }

        Ok(Self {
            checkpoint,
            single_packet_loss,
            channels,
        })
    }
}

/// Sender-side journal of recently sent channel commands.
///
/// Entries are kept until the receiver acknowledges them with feedback or
/// until `capacity` is exceeded, in which case the oldest entry is folded
/// into a base state that stays in the journal until acknowledged.
#[derive(Debug, Clone)]
pub struct RecoveryJournal {
    capacity: usize,
    checkpoint: u16,
    base: Vec<ChannelState>,
    base_through: Option<u16>,
    entries: VecDeque<(u16, Vec<ShortMessage>)>,
}

impl RecoveryJournal {
    /// Journal whose checkpoint precedes `first_sequence`
    #[must_use]
    pub fn new(capacity: usize, first_sequence: u16) -> Self {
        Self {
            capacity: capacity.max(1),
            checkpoint: first_sequence.wrapping_sub(1),
            base: vec![ChannelState::default(); usize::from(CHANNELS)],
            base_through: None,
            entries: VecDeque::new(),
        }
    }

    /// Sequence number of the checkpoint packet
    #[must_use]
    pub const fn checkpoint(&self) -> u16 {
        self.checkpoint
    }

    /// Number of retained packet entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.base_through.is_none()
    }

    /// Record the channel commands of a sent packet
    pub fn record(&mut self, sequence: u16, messages: &[ShortMessage]) {
        let channel_messages: Vec<ShortMessage> = messages
            .iter()
            .filter(|m| m.channel().is_some())
            .copied()
            .collect();
        if channel_messages.is_empty() {
            return;
        }

        self.entries.push_back((sequence, channel_messages));
        while self.entries.len() > self.capacity {
            if let Some((evicted, messages)) = self.entries.pop_front() {
                for msg in &messages {
                    if let Some(channel) = msg.channel() {
                        self.base[usize::from(channel)].apply(msg);
                    }
                }
                self.base_through = Some(evicted);
            }
        }
    }

    /// Drop everything up to and including `sequence`
    pub fn acknowledge(&mut self, sequence: u16) {
        // Feedback older than the current checkpoint is stale
        if !is_at_or_after(sequence, self.checkpoint) {
            return;
        }
        self.checkpoint = sequence;
        self.entries
            .retain(|(entry, _)| !is_at_or_after(sequence, *entry));
        if self
            .base_through
            .is_some_and(|through| is_at_or_after(sequence, through))
        {
            self.base_through = None;
            self.base.iter_mut().for_each(|state| *state = ChannelState::default());
        }
    }

    /// Journal section for the next packet, `None` when there is nothing to
    /// recover
    #[must_use]
    pub fn encode(&self) -> Option<Bytes> {
        self.encode_within(usize::MAX)
    }

    /// Journal section of at most `max_len` bytes.
    ///
    /// Channels are written most recently changed first. A channel journal
    /// that does not fit the remaining space is left out whole, so a receiver
    /// recovers the channels it is given and nothing else. `None` when no
    /// channel fits.
    #[must_use]
    pub fn encode_within(&self, max_len: usize) -> Option<Bytes> {
        let mut budget = max_len.checked_sub(JOURNAL_HEADER_LEN)?;

        let mut states = self.base.clone();
        for (_, messages) in &self.entries {
            for msg in messages {
                if let Some(channel) = msg.channel() {
                    states[usize::from(channel)].apply(msg);
                }
            }
        }

        let mut body = BytesMut::new();
        let mut included = 0u8;
        for channel in self.channels_by_recency() {
            let state = &states[usize::from(channel)];
            if state.is_empty() {
                continue;
            }
            let mut encoded = BytesMut::new();
            state.encode_into(channel, &mut encoded);
            if encoded.len() > budget {
                continue;
            }
            budget -= encoded.len();
            body.put_slice(&encoded);
            included += 1;
        }
        if included == 0 {
            return None;
        }

        let mut out = BytesMut::with_capacity(JOURNAL_HEADER_LEN + body.len());
        // S=0 Y=0 A=1 H=0, TOTCHAN = channels - 1
        out.put_u8(0x20 | ((included - 1) & 0x0F));
        out.put_u16(self.checkpoint);
        out.put_slice(&body);
        Some(out.freeze())
    }

    /// Every channel, the ones touched by the newest entries first
    fn channels_by_recency(&self) -> Vec<u8> {
        let mut order = Vec::with_capacity(usize::from(CHANNELS));
        let touched = self
            .entries
            .iter()
            .rev()
            .flat_map(|(_, messages)| messages.iter().rev())
            .filter_map(ShortMessage::channel);
        for channel in touched.chain(0..CHANNELS) {
            if !order.contains(&channel) {
                order.push(channel);
            }
        }
        order
    }
}

/// `a` is the same as or later than `b` in wrapping sequence space
fn is_at_or_after(a: u16, b: u16) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let diff = a.wrapping_sub(b) as i16;
    diff >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(channel: u8, note: u8, velocity: u8) -> ShortMessage {
        ShortMessage::note_on(channel, note, velocity).unwrap()
    }

    #[test]
    fn test_empty_journal_encodes_nothing() {
        let journal = RecoveryJournal::new(8, 1);
        assert!(journal.encode().is_none());
        assert!(journal.is_empty());
    }

    #[test]
    fn test_note_chapter_layout() {
        let mut journal = RecoveryJournal::new(8, 10);
        journal.record(10, &[note_on(0, 60, 100)]);
        let bytes = journal.encode().unwrap();

        // Journal header: A flag, one channel, checkpoint 9
        assert_eq!(&bytes[..3], &[0x20, 0x00, 0x09]);
        // Channel 0, length 3 + 4, TOC with N only
        assert_eq!(&bytes[3..6], &[0x00, 0x07, TOC_N]);
        // One log, no offbits, note 60 velocity 100 with Y set
        assert_eq!(&bytes[6..], &[0x01, 0xF0, 60, 0x80 | 100]);
    }

    #[test]
    fn test_all_chapters_decode() {
        let mut journal = RecoveryJournal::new(8, 1);
        journal.record(
            1,
            &[
                ShortMessage::program_change(2, 5).unwrap(),
                ShortMessage::control_change(2, 7, 90).unwrap(),
                ShortMessage::pitch_wheel(2, 0x2000).unwrap(),
                note_on(2, 60, 100),
                note_on(2, 64, 80),
                ShortMessage::note_off(2, 64, 0).unwrap(),
                ShortMessage::channel_aftertouch(2, 33).unwrap(),
                ShortMessage::polyphonic_aftertouch(2, 60, 44).unwrap(),
            ],
        );
        let decoded = Journal::decode(&journal.encode().unwrap()).unwrap();
        assert_eq!(decoded.checkpoint, 0);
        assert_eq!(decoded.channels.len(), 1);

        let channel = &decoded.channels[0];
        assert_eq!(channel.channel, 2);
        assert_eq!(channel.state.program, Some(5));
        assert_eq!(channel.state.controllers.get(&7), Some(&90));
        assert_eq!(channel.state.pitch, Some(0x2000));
        assert_eq!(channel.state.notes_on.get(&60), Some(&100));
        assert!(channel.state.notes_off.contains(&64));
        assert_eq!(channel.state.channel_pressure, Some(33));
        assert_eq!(channel.state.poly_pressure.get(&60), Some(&44));
    }

    #[test]
    fn test_acknowledge_trims_and_advances_checkpoint() {
        let mut journal = RecoveryJournal::new(8, 1);
        journal.record(1, &[note_on(0, 60, 100)]);
        journal.record(2, &[note_on(1, 62, 100)]);
        journal.acknowledge(1);
        assert_eq!(journal.checkpoint(), 1);
        assert_eq!(journal.len(), 1);

        let decoded = Journal::decode(&journal.encode().unwrap()).unwrap();
        assert_eq!(decoded.channels.len(), 1);
        assert_eq!(decoded.channels[0].channel, 1);

        // Stale feedback is ignored
        journal.acknowledge(0);
        assert_eq!(journal.checkpoint(), 1);

        journal.acknowledge(2);
        assert!(journal.encode().is_none());
    }

    #[test]
    fn test_evicted_entries_stay_until_acknowledged() {
        let mut journal = RecoveryJournal::new(1, 1);
        journal.record(1, &[note_on(0, 60, 100)]);
        journal.record(2, &[note_on(0, 62, 100)]);
        assert_eq!(journal.len(), 1);

        let decoded = Journal::decode(&journal.encode().unwrap()).unwrap();
        let notes: Vec<u8> = decoded.channels[0].state.notes_on.keys().copied().collect();
        assert_eq!(notes, vec![60, 62]);

        journal.acknowledge(2);
        assert!(journal.is_empty());
    }

    #[test]
    fn test_recovery_messages_fill_missing_state() {
        let mut local = ChannelState::default();
        local.apply(&note_on(0, 64, 90));

        let mut remote = ChannelState::default();
        remote.apply(&note_on(0, 64, 90));
        remote.apply(&ShortMessage::note_off(0, 64, 0).unwrap());
        remote.apply(&note_on(0, 60, 100));
        remote.apply(&ShortMessage::control_change(0, 1, 42).unwrap());

        let recovered = local.recovery_messages(0, &remote);
        assert_eq!(
            recovered,
            vec![
                ShortMessage::control_change(0, 1, 42).unwrap(),
                ShortMessage::note_off(0, 64, 0).unwrap(),
                note_on(0, 60, 100),
            ]
        );

        for msg in &recovered {
            local.apply(msg);
        }
        assert!(local.recovery_messages(0, &remote).is_empty());
    }

    #[test]
    fn test_decode_skips_system_journal_and_chapter_e() {
        let bytes = [
            0x60, 0x00, 0x05, // Y and A set, one channel, checkpoint 5
            0x00, 0x03, 0xAA, // system journal of three bytes
            0x18, 0x09, TOC_E | TOC_T, // channel 3, nine bytes
            0x01, 0x10, 0x20, 0x11, 0x21, // chapter E, two logs
            0x55, // chapter T
        ];
        let journal = Journal::decode(&bytes).unwrap();
        assert_eq!(journal.checkpoint, 5);
        assert_eq!(journal.channels[0].channel, 3);
        assert_eq!(journal.channels[0].state.channel_pressure, Some(0x55));
    }

    #[test]
    fn test_channels_written_most_recent_first() {
        let mut journal = RecoveryJournal::new(8, 1);
        journal.record(1, &[note_on(3, 60, 100)]);
        journal.record(2, &[note_on(9, 61, 100)]);
        journal.record(3, &[note_on(0, 62, 100)]);

        let decoded = Journal::decode(&journal.encode().unwrap()).unwrap();
        let channels: Vec<u8> = decoded.channels.iter().map(|c| c.channel).collect();
        assert_eq!(channels, vec![0, 9, 3]);
    }

    #[test]
    fn test_encode_within_keeps_recent_channels_that_fit() {
        let mut journal = RecoveryJournal::new(256, 1);
        let mut sequence = 1;
        for channel in 0..CHANNELS {
            for number in 0..64 {
                let cc = ShortMessage::control_change(channel, number, 1).unwrap();
                journal.record(sequence, &[cc]);
                sequence += 1;
            }
        }
        journal.record(sequence, &[note_on(5, 61, 90)]);

        let full = journal.encode().unwrap();
        let trimmed = journal.encode_within(400).unwrap();
        assert!(full.len() > 400);
        assert!(trimmed.len() <= 400);

        let decoded = Journal::decode(&trimmed).unwrap();
        assert_eq!(decoded.checkpoint, 0);
        assert_eq!(decoded.channels[0].channel, 5);
        assert_eq!(decoded.channels[0].state.notes_on.get(&61), Some(&90));
        // The rest of the space goes to the channels changed just before
        let channels: Vec<u8> = decoded.channels.iter().map(|c| c.channel).collect();
        assert_eq!(channels, vec![5, 15]);
    }

    #[test]
    fn test_encode_within_too_small_is_none() {
        let mut journal = RecoveryJournal::new(8, 1);
        journal.record(1, &[note_on(0, 60, 100)]);
        assert!(journal.encode_within(2).is_none());
        assert!(journal.encode_within(9).is_none());
        assert_eq!(journal.encode_within(10), journal.encode());
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert!(Journal::decode(&[0x20, 0x00]).is_err());
        assert_eq!(
            Journal::decode(&[0x20, 0x00, 0x01, 0x00, 0x40, 0x00]),
            Err(PacketError::MalformedJournal("channel journal length"))
        );
    }
}
