//! Sans-IO AppleMIDI session engine
//!
//! An [`RtpMidiSession`] serves one pair of ports (control on `port`, data on
//! `port + 1`) and any number of peers. It never touches a socket: callers
//! feed it datagrams together with the current time and carry out the
//! returned [`Action`]s.
//!
//! Each peer has its own outbound sequence counter and recovery journal, and
//! its own inbound sequence tracker and channel state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::control::{ClockSync, ControlCommand, Feedback, Invitation};
use super::history::{SequenceOutcome, SequenceTracker};
use super::journal::{ChannelState, Journal, RecoveryJournal};
use super::packet::{
    MAX_COMMAND_LIST_LEN, MidiCommand, MidiPacket, PacketError, RTP_HEADER_LEN, RtpHeader,
    SYSEX_CANCEL,
};
use crate::config::RtpMidiConfig;
use crate::device::DeviceId;
use crate::metrics::Metrics;
use crate::protocol::{
    CHANNELS, Decoder, Error, MidiMessage, SYSEX_END, SYSEX_START, ShortMessage, SysexMessage,
    decode_short,
};
use crate::transport::TransportKind;

/// Which of the session's two sockets a datagram uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// Session port: invitations, feedback, end
    Control,
    /// Session port + 1: MIDI data and clock sync
    Data,
}

/// Why a peer left the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent `BY`
    Ended,
    /// Ended locally
    Closed,
    /// Nothing heard within the peer timeout
    Timeout,
}

/// Work the owner of a session carries out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a datagram
    Transmit {
        /// Socket to send from
        port: PortKind,
        /// Destination
        to: SocketAddr,
        /// Datagram
        bytes: Vec<u8>,
    },
    /// Handshake completed; the peer is an input and an output
    PeerConnected {
        /// Device id of the peer
        device_id: DeviceId,
        /// Session name the peer announced
        name: Option<String>,
    },
    /// A previously connected peer is gone
    PeerDisconnected {
        /// Device id of the peer
        device_id: DeviceId,
        /// Cause
        reason: DisconnectReason,
    },
    /// MIDI received from a peer
    Deliver {
        /// Device id of the peer
        device_id: DeviceId,
        /// Decoded message
        message: MidiMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InviteStage {
    Control,
    Data,
}

#[derive(Debug)]
enum PeerState {
    /// We invited the peer and wait for `OK`
    Inviting {
        stage: InviteStage,
        attempts: u32,
        next_attempt: Instant,
    },
    /// The peer invited us on the control port; waiting for the data port
    Invited,
    Connected,
}

#[derive(Debug)]
struct Peer {
    device_id: DeviceId,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    token: u32,
    remote_ssrc: Option<u32>,
    name: Option<String>,
    state: PeerState,
    initiator: bool,
    /// `PeerConnected` was emitted and `PeerDisconnected` is owed
    announced: bool,
    last_heard: Instant,
    next_sync: Instant,
    next_feedback: Instant,
    feedback_pending: bool,
    clock_offset: Option<i64>,
    send_sequence: u16,
    journal: RecoveryJournal,
    received: SequenceTracker,
    channels: Vec<ChannelState>,
    sysex: Option<Vec<u8>>,
}

impl Peer {
    fn new(
        device_id: DeviceId,
        control_addr: SocketAddr,
        token: u32,
        state: PeerState,
        now: Instant,
        config: &RtpMidiConfig,
    ) -> Self {
        let send_sequence = random_u32() as u16;
        Self {
            device_id,
            control_addr,
            data_addr: data_addr_for(control_addr),
            token,
            remote_ssrc: None,
            name: None,
            initiator: matches!(state, PeerState::Inviting { .. }),
            state,
            announced: false,
            last_heard: now,
            next_sync: now,
            next_feedback: now + config.feedback_interval,
            feedback_pending: false,
            clock_offset: None,
            send_sequence,
            journal: RecoveryJournal::new(config.journal_capacity, send_sequence),
            received: SequenceTracker::new(),
            channels: vec![ChannelState::default(); usize::from(CHANNELS)],
            sysex: None,
        }
    }

    const fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Connected)
    }

    fn connect(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.state = PeerState::Connected;
        self.last_heard = now;
        if !self.announced {
            self.announced = true;
            info!(device = %self.device_id, name = ?self.name, "RTP-MIDI peer connected");
            actions.push(Action::PeerConnected {
                device_id: self.device_id.clone(),
                name: self.name.clone(),
            });
        }
    }

    fn deliver(&self, message: MidiMessage, actions: &mut Vec<Action>) {
        actions.push(Action::Deliver {
            device_id: self.device_id.clone(),
            message,
        });
    }

    fn apply_and_deliver(&mut self, msg: ShortMessage, actions: &mut Vec<Action>) {
        if let Some(channel) = msg.channel() {
            self.channels[usize::from(channel)].apply(&msg);
        }
        self.deliver(MidiMessage::Short(msg), actions);
    }

    fn recover(&mut self, journal: Option<&[u8]>, metrics: &Metrics, actions: &mut Vec<Action>) {
        let Some(bytes) = journal else {
            warn!(device = %self.device_id, "sequence gap without recovery journal");
            return;
        };

        match Journal::decode(bytes) {
            Ok(journal) => {
                let mut recovered = 0usize;
                for channel_journal in journal.channels {
                    let channel = channel_journal.channel;
                    let messages = self.channels[usize::from(channel)]
                        .recovery_messages(channel, &channel_journal.state);
                    recovered += messages.len();
                    for msg in messages {
                        self.apply_and_deliver(msg, actions);
                    }
                }
                metrics.record_journal_recovery();
                warn!(
                    device = %self.device_id,
                    checkpoint = journal.checkpoint,
                    recovered,
                    "recovered channel state from journal"
                );
            }
            Err(err) => {
                metrics.record_protocol_violation();
                warn!(device = %self.device_id, error = %err, "undecodable recovery journal");
            }
        }
    }

    fn receive_command(&mut self, command: &MidiCommand, metrics: &Metrics, actions: &mut Vec<Action>) {
        let bytes = &command.bytes[..];
        match bytes {
            [first @ (SYSEX_START | SYSEX_END), body @ .., last] => {
                self.receive_sysex_segment(*first, body, *last, actions);
            }
            _ => match decode_short(bytes) {
                Ok(msg) => self.apply_and_deliver(msg, actions),
                Err(err) => {
                    metrics.record_decode_error();
                    debug!(device = %self.device_id, error = %err, "undecodable command dropped");
                }
            },
        }
    }

    fn receive_sysex_segment(&mut self, first: u8, body: &[u8], last: u8, actions: &mut Vec<Action>) {
        match (first, last) {
            (_, SYSEX_CANCEL) => {
                if self.sysex.take().is_some() {
                    trace!(device = %self.device_id, "system exclusive cancelled");
                }
            }
            (SYSEX_START, SYSEX_END) => {
                if self.sysex.take().is_some() {
                    trace!(device = %self.device_id, "unterminated system exclusive discarded");
                }
                self.deliver(MidiMessage::Sysex(SysexMessage::from_payload(body)), actions);
            }
            (SYSEX_START, SYSEX_START) => self.sysex = Some(body.to_vec()),
            (SYSEX_END, SYSEX_START) => match self.sysex.as_mut() {
                Some(buffer) => buffer.extend_from_slice(body),
                None => trace!(device = %self.device_id, "orphan sysex segment dropped"),
            },
            (SYSEX_END, SYSEX_END) => match self.sysex.take() {
                Some(mut buffer) => {
                    buffer.extend_from_slice(body);
                    self.deliver(MidiMessage::Sysex(SysexMessage::from_payload(&buffer)), actions);
                }
                None => trace!(device = %self.device_id, "orphan sysex segment dropped"),
            },
            _ => trace!(device = %self.device_id, first, last, "malformed sysex segment dropped"),
        }
    }

    /// Build, journal and queue one outbound data packet
    fn transmit(
        &mut self,
        command: Bytes,
        short: Option<ShortMessage>,
        header: (u32, u32),
        max_packet_size: usize,
        actions: &mut Vec<Action>,
    ) -> Result<(), PacketError> {
        let (ssrc, timestamp) = header;
        let sequence = self.send_sequence;

        let budget = max_packet_size.saturating_sub(RTP_HEADER_LEN + 2 + command.len());
        let journal = match self.journal.encode() {
            Some(full) if full.len() > budget => {
                let trimmed = self.journal.encode_within(budget);
                warn!(
                    device = %self.device_id,
                    journal_len = full.len(),
                    kept = trimmed.as_ref().map_or(0, Bytes::len),
                    budget,
                    "recovery journal trimmed to fit packet"
                );
                trimmed
            }
            journal => journal,
        };

        let packet = MidiPacket {
            header: RtpHeader {
                marker: false,
                sequence,
                timestamp,
                ssrc,
            },
            commands: vec![MidiCommand::new(command)],
            journal,
        };
        let bytes = packet.encode()?;
        self.send_sequence = sequence.wrapping_add(1);

        if let Some(short) = short {
            self.journal.record(sequence, &[short]);
        }
        actions.push(Action::Transmit {
            port: PortKind::Data,
            to: self.data_addr,
            bytes,
        });
        Ok(())
    }
}

/// The local end of a session
#[derive(Debug)]
struct Local {
    name: String,
    port: u16,
    ssrc: u32,
}

impl Local {
    fn invitation(&self, token: u32) -> Vec<u8> {
        ControlCommand::Invitation(self.fields(token)).encode()
    }

    fn fields(&self, token: u32) -> Invitation {
        Invitation::new(token, self.ssrc, Some(self.name.clone()))
    }
}

/// AppleMIDI session state machine.
#[derive(Debug)]
pub struct RtpMidiSession {
    local: Local,
    config: RtpMidiConfig,
    metrics: Arc<Metrics>,
    epoch: Instant,
    /// Keyed by the peer's control address
    peers: HashMap<SocketAddr, Peer>,
}

impl RtpMidiSession {
    /// Create a session announcing `name` on `port`
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        port: u16,
        config: RtpMidiConfig,
        metrics: Arc<Metrics>,
        now: Instant,
    ) -> Self {
        Self {
            local: Local {
                name: name.into(),
                port,
                ssrc: random_u32(),
            },
            config,
            metrics,
            epoch: now,
            peers: HashMap::new(),
        }
    }

    /// Session name announced to peers
    #[must_use]
    pub fn name(&self) -> &str {
        &self.local.name
    }

    /// Control port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local.port
    }

    /// Local stream identifier
    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.local.ssrc
    }

    /// Peers in any state, including pending invitations
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Device ids of connected peers
    #[must_use]
    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.device_id.clone())
            .collect()
    }

    /// Session name announced by a peer
    #[must_use]
    pub fn peer_name(&self, device_id: &DeviceId) -> Option<String> {
        self.peer(device_id).and_then(|p| p.name.clone())
    }

    /// Estimated offset of the peer's clock from ours, in 100 microsecond
    /// units, once a sync exchange completed
    #[must_use]
    pub fn clock_offset(&self, device_id: &DeviceId) -> Option<i64> {
        self.peer(device_id).and_then(|p| p.clock_offset)
    }

    fn peer(&self, device_id: &DeviceId) -> Option<&Peer> {
        self.peers.values().find(|p| &p.device_id == device_id)
    }

    /// Invite the session listening on control address `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`] when the session is full.
    pub fn invite(&mut self, addr: SocketAddr, now: Instant) -> Result<Vec<Action>, Error> {
        if self.peers.contains_key(&addr) {
            debug!(%addr, "peer already known; invitation skipped");
            return Ok(Vec::new());
        }
        if self.peers.len() >= self.config.max_peers {
            return Err(Error::TransportUnavailable {
                transport: TransportKind::RtpMidi.as_str(),
                reason: format!("session full ({} peers)", self.config.max_peers),
            });
        }

        let token = random_u32();
        let state = PeerState::Inviting {
            stage: InviteStage::Control,
            attempts: 1,
            next_attempt: now + self.config.invitation_retry_interval,
        };
        let peer = Peer::new(
            DeviceId::rtp_midi(self.local.port, addr),
            addr,
            token,
            state,
            now,
            &self.config,
        );
        self.peers.insert(addr, peer);

        info!(session = %self.local.name, %addr, "inviting RTP-MIDI peer");
        Ok(vec![Action::Transmit {
            port: PortKind::Control,
            to: addr,
            bytes: self.local.invitation(token),
        }])
    }

    /// Handle a datagram received on the control port
    pub fn handle_control(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Action>, PacketError> {
        let command = ControlCommand::decode(bytes)?;
        trace!(%from, code = ?String::from_utf8_lossy(&command.code()), "control command");

        let mut actions = Vec::new();
        match command {
            ControlCommand::Invitation(invitation) => {
                self.accept_invitation(from, invitation, now, &mut actions);
            }
            ControlCommand::Accepted(accepted) => {
                let Some(peer) = self.peers.get_mut(&from) else {
                    debug!(%from, "OK from unknown peer ignored");
                    return Ok(actions);
                };
                let awaiting = matches!(
                    peer.state,
                    PeerState::Inviting {
                        stage: InviteStage::Control,
                        ..
                    }
                );
                if !awaiting || accepted.token != peer.token {
                    debug!(%from, "unexpected OK ignored");
                    return Ok(actions);
                }
                peer.remote_ssrc = Some(accepted.ssrc);
                peer.name = accepted.name;
                peer.last_heard = now;
                peer.state = PeerState::Inviting {
                    stage: InviteStage::Data,
                    attempts: 1,
                    next_attempt: now + self.config.invitation_retry_interval,
                };
                actions.push(Action::Transmit {
                    port: PortKind::Data,
                    to: peer.data_addr,
                    bytes: self.local.invitation(peer.token),
                });
            }
            ControlCommand::Rejected(rejected) => self.rejected(from, &rejected, &mut actions),
            ControlCommand::End(end) => self.ended(end.ssrc, &mut actions),
            ControlCommand::Sync(sync) => self.sync(sync, now, &mut actions),
            ControlCommand::Feedback(feedback) => self.feedback(feedback, now),
        }
        Ok(actions)
    }

    /// Handle a datagram received on the data port
    pub fn handle_data(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Action>, PacketError> {
        if !ControlCommand::is_control(bytes) {
            return self.receive_midi(from, bytes, now);
        }

        let command = ControlCommand::decode(bytes)?;
        trace!(%from, code = ?String::from_utf8_lossy(&command.code()), "data port command");

        let mut actions = Vec::new();
        match command {
            ControlCommand::Invitation(invitation) => {
                let peer = self.peers.values_mut().find(|p| {
                    matches!(p.state, PeerState::Invited)
                        && p.remote_ssrc == Some(invitation.ssrc)
                        && p.control_addr.ip() == from.ip()
                });
                let Some(peer) = peer else {
                    debug!(%from, "data port invitation without control handshake rejected");
                    actions.push(Action::Transmit {
                        port: PortKind::Data,
                        to: from,
                        bytes: ControlCommand::Rejected(self.local.fields(invitation.token))
                            .encode(),
                    });
                    return Ok(actions);
                };
                peer.data_addr = from;
                peer.next_feedback = now + self.config.feedback_interval;
                actions.push(Action::Transmit {
                    port: PortKind::Data,
                    to: from,
                    bytes: ControlCommand::Accepted(self.local.fields(invitation.token)).encode(),
                });
                peer.connect(now, &mut actions);
            }
            ControlCommand::Accepted(accepted) => {
                let peer = self.peers.values_mut().find(|p| {
                    p.data_addr == from
                        && p.token == accepted.token
                        && matches!(
                            p.state,
                            PeerState::Inviting {
                                stage: InviteStage::Data,
                                ..
                            }
                        )
                });
                let Some(peer) = peer else {
                    debug!(%from, "unexpected data port OK ignored");
                    return Ok(actions);
                };
                peer.next_sync = now + self.config.sync_interval;
                peer.next_feedback = now + self.config.feedback_interval;
                peer.connect(now, &mut actions);
                actions.push(Action::Transmit {
                    port: PortKind::Data,
                    to: peer.data_addr,
                    bytes: start_sync(self.local.ssrc, clock(self.epoch, now)),
                });
            }
            ControlCommand::Rejected(rejected) => {
                if let Some(control) = self
                    .peers
                    .values()
                    .find(|p| p.data_addr == from)
                    .map(|p| p.control_addr)
                {
                    self.rejected(control, &rejected, &mut actions);
                }
            }
            ControlCommand::End(end) => self.ended(end.ssrc, &mut actions),
            ControlCommand::Sync(sync) => self.sync(sync, now, &mut actions),
            ControlCommand::Feedback(feedback) => self.feedback(feedback, now),
        }
        Ok(actions)
    }

    fn accept_invitation(
        &mut self,
        from: SocketAddr,
        invitation: Invitation,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let announced = match self.peers.get(&from) {
            Some(existing) => existing.announced,
            None if self.peers.len() >= self.config.max_peers => {
                warn!(session = %self.local.name, %from, "session full; invitation rejected");
                actions.push(Action::Transmit {
                    port: PortKind::Control,
                    to: from,
                    bytes: ControlCommand::Rejected(self.local.fields(invitation.token)).encode(),
                });
                return;
            }
            None => false,
        };

        let mut peer = Peer::new(
            DeviceId::rtp_midi(self.local.port, from),
            from,
            invitation.token,
            PeerState::Invited,
            now,
            &self.config,
        );
        peer.remote_ssrc = Some(invitation.ssrc);
        peer.name = invitation.name;
        peer.announced = announced;
        self.peers.insert(from, peer);

        debug!(session = %self.local.name, %from, "invitation accepted on control port");
        actions.push(Action::Transmit {
            port: PortKind::Control,
            to: from,
            bytes: ControlCommand::Accepted(self.local.fields(invitation.token)).encode(),
        });
    }

    fn rejected(&mut self, control: SocketAddr, rejected: &Invitation, actions: &mut Vec<Action>) {
        let Some(peer) = self.peers.get(&control) else {
            return;
        };
        if peer.token != rejected.token || peer.is_connected() {
            debug!(%control, "unexpected NO ignored");
            return;
        }
        info!(session = %self.local.name, %control, "invitation rejected by peer");
        self.remove_peer(control, DisconnectReason::Ended, false, actions);
    }

    fn ended(&mut self, ssrc: u32, actions: &mut Vec<Action>) {
        let key = self
            .peers
            .iter()
            .find(|(_, p)| p.remote_ssrc == Some(ssrc))
            .map(|(key, _)| *key);
        match key {
            Some(key) => self.remove_peer(key, DisconnectReason::Ended, false, actions),
            None => debug!(ssrc, "BY from unknown peer ignored"),
        }
    }

    fn sync(&mut self, sync: ClockSync, now: Instant, actions: &mut Vec<Action>) {
        let Some(peer) = self
            .peers
            .values_mut()
            .find(|p| p.is_connected() && p.remote_ssrc == Some(sync.ssrc))
        else {
            debug!(ssrc = sync.ssrc, "clock sync from unknown peer ignored");
            return;
        };
        peer.last_heard = now;

        let local = clock(self.epoch, now);
        let [t1, t2, t3] = sync.timestamps;
        match sync.count {
            0 => actions.push(Action::Transmit {
                port: PortKind::Data,
                to: peer.data_addr,
                bytes: ControlCommand::Sync(ClockSync {
                    ssrc: self.local.ssrc,
                    count: 1,
                    timestamps: [t1, local, 0],
                })
                .encode(),
            }),
            1 => {
                peer.clock_offset = Some(signed(t2) - (signed(t1) + signed(local)) / 2);
                actions.push(Action::Transmit {
                    port: PortKind::Data,
                    to: peer.data_addr,
                    bytes: ControlCommand::Sync(ClockSync {
                        ssrc: self.local.ssrc,
                        count: 2,
                        timestamps: [t1, t2, local],
                    })
                    .encode(),
                });
            }
            2 => peer.clock_offset = Some((signed(t1) + signed(t3)) / 2 - signed(t2)),
            count => debug!(count, "clock sync with invalid count ignored"),
        }
        trace!(device = %peer.device_id, offset = ?peer.clock_offset, "clock sync");
    }

    fn feedback(&mut self, feedback: Feedback, now: Instant) {
        match self
            .peers
            .values_mut()
            .find(|p| p.remote_ssrc == Some(feedback.ssrc))
        {
            Some(peer) => {
                peer.last_heard = now;
                peer.journal.acknowledge(feedback.sequence);
                trace!(
                    device = %peer.device_id,
                    sequence = feedback.sequence,
                    "journal trimmed by receiver feedback"
                );
            }
            None => debug!(ssrc = feedback.ssrc, "feedback from unknown peer ignored"),
        }
    }

    fn receive_midi(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Action>, PacketError> {
        let packet = MidiPacket::decode(bytes)?;
        let mut actions = Vec::new();

        let Some(peer) = self
            .peers
            .values_mut()
            .find(|p| p.data_addr == from && p.is_connected())
        else {
            self.metrics.record_dropped();
            debug!(%from, "MIDI from unconnected address dropped");
            return Ok(actions);
        };
        peer.last_heard = now;

        let sequence = packet.header.sequence;
        match peer.received.record(sequence) {
            SequenceOutcome::Duplicate => {
                self.metrics.record_duplicate();
                debug!(device = %peer.device_id, sequence, "duplicate packet dropped");
                return Ok(actions);
            }
            SequenceOutcome::Late => {
                self.metrics.record_dropped();
                debug!(device = %peer.device_id, sequence, "late packet dropped");
                return Ok(actions);
            }
            SequenceOutcome::Gap { missing } => {
                self.metrics.record_sequence_gap();
                warn!(device = %peer.device_id, sequence, missing, "sequence gap detected");
                peer.recover(packet.journal.as_deref(), &self.metrics, &mut actions);
            }
            SequenceOutcome::First | SequenceOutcome::InOrder => {}
        }

        peer.feedback_pending = true;
        for command in &packet.commands {
            peer.receive_command(command, &self.metrics, &mut actions);
        }
        Ok(actions)
    }

    /// Send MIDI bytes (one or more complete messages) to a connected peer.
    ///
    /// System exclusive longer than a packet is split into segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] when `device_id` is not a connected
    /// peer of this session.
    pub fn send(&mut self, device_id: &DeviceId, bytes: &[u8], now: Instant) -> Result<Vec<Action>, Error> {
        let header = (self.local.ssrc, media_timestamp(self.epoch, now));
        let max_packet_size = self.config.max_packet_size;
        let Some(peer) = self
            .peers
            .values_mut()
            .find(|p| &p.device_id == device_id && p.is_connected())
        else {
            return Err(Error::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        };

        let max_segment = max_packet_size
            .saturating_sub(RTP_HEADER_LEN + 2)
            .min(MAX_COMMAND_LIST_LEN);

        let mut actions = Vec::new();
        for decoded in Decoder::new(bytes) {
            match decoded {
                Ok(MidiMessage::Short(short)) => {
                    peer.transmit(
                        Bytes::from(short.to_bytes()),
                        Some(short),
                        header,
                        max_packet_size,
                        &mut actions,
                    )?;
                }
                Ok(MidiMessage::Sysex(sysex)) => {
                    for segment in sysex_segments(sysex.payload(), max_segment) {
                        peer.transmit(segment, None, header, max_packet_size, &mut actions)?;
                    }
                }
                Ok(MidiMessage::Meta(_)) => {}
                Err(err) => {
                    self.metrics.record_decode_error();
                    debug!(device = %device_id, error = %err, "undecodable bytes not sent");
                }
            }
        }
        Ok(actions)
    }

    /// Drive timers: invitation retries, clock sync, receiver feedback and
    /// peer timeouts
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut expired = Vec::new();

        for (key, peer) in &mut self.peers {
            let silent_for = now.saturating_duration_since(peer.last_heard);
            match &mut peer.state {
                PeerState::Inviting {
                    stage,
                    attempts,
                    next_attempt,
                } => {
                    if now < *next_attempt {
                        continue;
                    }
                    if *attempts >= self.config.max_invitation_attempts {
                        warn!(peer = %key, attempts = *attempts, "invitation unanswered; giving up");
                        expired.push((*key, DisconnectReason::Timeout, false));
                        continue;
                    }
                    *attempts += 1;
                    *next_attempt = now + self.config.invitation_retry_interval;
                    let (port, to) = match stage {
                        InviteStage::Control => (PortKind::Control, peer.control_addr),
                        InviteStage::Data => (PortKind::Data, peer.data_addr),
                    };
                    debug!(peer = %key, attempt = *attempts, "retrying invitation");
                    actions.push(Action::Transmit {
                        port,
                        to,
                        bytes: self.local.invitation(peer.token),
                    });
                }
                PeerState::Invited => {
                    if silent_for >= self.config.peer_timeout {
                        expired.push((*key, DisconnectReason::Timeout, false));
                    }
                }
                PeerState::Connected => {
                    if silent_for >= self.config.peer_timeout {
                        expired.push((*key, DisconnectReason::Timeout, true));
                        continue;
                    }
                    if peer.initiator && now >= peer.next_sync {
                        peer.next_sync = now + self.config.sync_interval;
                        actions.push(Action::Transmit {
                            port: PortKind::Data,
                            to: peer.data_addr,
                            bytes: start_sync(self.local.ssrc, clock(self.epoch, now)),
                        });
                    }
                    if peer.feedback_pending && now >= peer.next_feedback {
                        peer.feedback_pending = false;
                        peer.next_feedback = now + self.config.feedback_interval;
                        if let Some(sequence) = peer.received.highest() {
                            actions.push(Action::Transmit {
                                port: PortKind::Control,
                                to: peer.control_addr,
                                bytes: ControlCommand::Feedback(Feedback {
                                    ssrc: self.local.ssrc,
                                    sequence,
                                })
                                .encode(),
                            });
                        }
                    }
                }
            }
        }

        for (key, reason, notify) in expired {
            self.remove_peer(key, reason, notify, &mut actions);
        }
        actions
    }

    /// End the session with one peer
    pub fn end(&mut self, device_id: &DeviceId) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(key) = self.peer(device_id).map(|p| p.control_addr) {
            self.remove_peer(key, DisconnectReason::Closed, true, &mut actions);
        }
        actions
    }

    /// End the session with every peer
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let keys: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for key in keys {
            self.remove_peer(key, DisconnectReason::Closed, true, &mut actions);
        }
        actions
    }

    fn remove_peer(
        &mut self,
        key: SocketAddr,
        reason: DisconnectReason,
        notify_peer: bool,
        actions: &mut Vec<Action>,
    ) {
        let Some(peer) = self.peers.remove(&key) else {
            return;
        };

        if notify_peer {
            actions.push(Action::Transmit {
                port: PortKind::Control,
                to: peer.control_addr,
                bytes: ControlCommand::End(Invitation::new(peer.token, self.local.ssrc, None))
                    .encode(),
            });
        }
        if !peer.announced {
            return;
        }

        if reason == DisconnectReason::Timeout {
            let err = Error::SessionTimeout {
                device_id: peer.device_id.to_string(),
            };
            warn!(error = %err, "RTP-MIDI peer timed out");
        } else {
            info!(device = %peer.device_id, ?reason, "RTP-MIDI peer disconnected");
        }
        actions.push(Action::PeerDisconnected {
            device_id: peer.device_id,
            reason,
        });
    }
}

/// Split a sysex payload into command-list segments of at most
/// `max_segment` bytes (`F0..F0`, `F7..F0`, `F7..F7`).
fn sysex_segments(payload: &[u8], max_segment: usize) -> Vec<Bytes> {
    let frame = |first: u8, chunk: &[u8], last: u8| {
        let mut segment = Vec::with_capacity(chunk.len() + 2);
        segment.push(first);
        segment.extend_from_slice(chunk);
        segment.push(last);
        Bytes::from(segment)
    };

    if payload.len() + 2 <= max_segment {
        return vec![frame(SYSEX_START, payload, SYSEX_END)];
    }

    let chunk_len = max_segment.saturating_sub(2).max(1);
    let chunks: Vec<&[u8]> = payload.chunks(chunk_len).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let first = if index == 0 { SYSEX_START } else { SYSEX_END };
            let end = if index == last { SYSEX_END } else { SYSEX_START };
            frame(first, chunk, end)
        })
        .collect()
}

fn start_sync(ssrc: u32, now: u64) -> Vec<u8> {
    ControlCommand::Sync(ClockSync {
        ssrc,
        count: 0,
        timestamps: [now, 0, 0],
    })
    .encode()
}

fn data_addr_for(control: SocketAddr) -> SocketAddr {
    SocketAddr::new(control.ip(), control.port().wrapping_add(1))
}

/// Session clock in 100 microsecond units
fn clock(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_micros() / 100).unwrap_or(u64::MAX)
}

/// RTP timestamps carry the low 32 bits of the session clock
#[allow(clippy::cast_possible_truncation)]
fn media_timestamp(epoch: Instant, now: Instant) -> u32 {
    clock(epoch, now) as u32
}

#[allow(clippy::cast_possible_wrap)]
const fn signed(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_possible_truncation)]
fn random_u32() -> u32 {
    Uuid::new_v4().as_u128() as u32
}
