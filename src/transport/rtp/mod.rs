//! RTP-MIDI (AppleMIDI) network sessions
//!
//! - [`control`]: session control commands on the control port
//! - [`packet`]: RTP data packets and MIDI command lists
//! - [`journal`]: recovery journal encoding, decoding and state repair
//! - [`history`]: inbound sequence tracking
//! - [`session`]: the sans-IO session state machine
//! - [`server`]: UDP sockets and threads hosting a session

pub mod control;
pub mod history;
pub mod journal;
pub mod packet;
pub mod session;
pub mod server;

pub use control::{ClockSync, ControlCommand, Feedback, Invitation, PROTOCOL_VERSION};
pub use history::{SequenceOutcome, SequenceTracker};
pub use journal::{ChannelJournal, ChannelState, Journal, RecoveryJournal};
pub use packet::{MidiCommand, MidiPacket, PacketError, RtpHeader};
pub use session::{Action, DisconnectReason, PortKind, RtpMidiSession};
pub use server::RtpMidiServer;
