//! Error types shared across the MIDI core

use thiserror::Error;

use crate::transport::rtp::PacketError;

/// Reasons a byte sequence is not a valid MIDI message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidMidiData {
    /// No bytes were supplied
    #[error("empty message")]
    Empty,

    /// First byte is not a status byte this layer recognizes
    #[error("unrecognized status byte {status:#04x}")]
    UnrecognizedStatus {
        /// Offending status byte
        status: u8,
    },

    /// Status requires more data bytes than were present
    #[error("status {status:#04x} needs {needed} data bytes, got {got}")]
    MissingDataBytes {
        /// Status byte
        status: u8,
        /// Data bytes required by the status category
        needed: usize,
        /// Data bytes present
        got: usize,
    },

    /// A data byte has its high bit set
    #[error("data byte {index} out of range: {value:#04x}")]
    DataOutOfRange {
        /// Position of the data byte (0 = first byte after status)
        index: usize,
        /// Offending value
        value: u8,
    },

    /// Channel outside 0..=15
    #[error("channel out of range: {channel}")]
    ChannelOutOfRange {
        /// Offending channel
        channel: u8,
    },

    /// Multi-byte value outside its field width
    #[error("value {value} exceeds maximum {max}")]
    ValueOutOfRange {
        /// Offending value
        value: u32,
        /// Largest allowed value
        max: u32,
    },
}

/// MIDI core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed short message or out-of-range field
    #[error("invalid MIDI data: {0}")]
    InvalidMidiData(#[from] InvalidMidiData),

    /// Lookup of an id that is not attached
    #[error("device not found: {device_id}")]
    DeviceNotFound {
        /// Requested device id
        device_id: String,
    },

    /// Platform feature absent or transport failed to start
    #[error("{transport} transport unavailable: {reason}")]
    TransportUnavailable {
        /// Transport name
        transport: &'static str,
        /// Human-readable reason
        reason: String,
    },

    /// Malformed RTP-MIDI packet
    #[error("RTP-MIDI protocol violation: {0}")]
    ProtocolViolation(#[from] PacketError),

    /// Peer stopped responding
    #[error("RTP-MIDI session with {device_id} timed out")]
    SessionTimeout {
        /// Device id of the silent peer
        device_id: String,
    },

    /// UDP port already bound by another session or process
    #[error("port {port} already in use")]
    PortInUse {
        /// Requested port
        port: u16,
    },

    /// Configuration rejected at setup time
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Context has been terminated
    #[error("MIDI context has been shut down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
