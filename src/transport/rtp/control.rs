//! AppleMIDI session control commands
//!
//! Every control packet starts with `FF FF` and a two-letter ASCII command.
//! All integers are big-endian.
//!
//! ```text
//! IN/OK/NO/BY: FF FF c c | version u32 | token u32 | ssrc u32 | [name NUL]
//! CK:          FF FF C K | ssrc u32 | count u8 | pad 3 | ts1 u64 | ts2 u64 | ts3 u64
//! RS:          FF FF R S | ssrc u32 | sequence u16 | pad 2
//! ```

use bytes::{BufMut, BytesMut};

use super::packet::{PacketError, ensure_len};

/// Leading bytes of every control packet
pub const SIGNATURE: [u8; 2] = [0xFF, 0xFF];
/// AppleMIDI protocol version
pub const PROTOCOL_VERSION: u32 = 2;

const INVITATION_LEN: usize = 16;
const SYNC_LEN: usize = 36;
const FEEDBACK_LEN: usize = 12;

/// Fields shared by IN, OK, NO and BY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Protocol version, always 2 when sent
    pub version: u32,
    /// Initiator token echoed by the responder
    pub token: u32,
    /// Sender stream identifier
    pub ssrc: u32,
    /// Session name
    pub name: Option<String>,
}

impl Invitation {
    /// Invitation fields with the current protocol version
    pub fn new(token: u32, ssrc: u32, name: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token,
            ssrc,
            name,
        }
    }
}

/// Clock synchronization exchange (CK)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    /// Sender stream identifier
    pub ssrc: u32,
    /// 0, 1 or 2: how many timestamps are valid
    pub count: u8,
    /// Timestamps in 100 microsecond units
    pub timestamps: [u64; 3],
}

/// Receiver feedback (RS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    /// Sender stream identifier
    pub ssrc: u32,
    /// Highest sequence number received
    pub sequence: u16,
}

/// AppleMIDI control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `IN`: invite the receiver to a session
    Invitation(Invitation),
    /// `OK`: accept an invitation
    Accepted(Invitation),
    /// `NO`: reject an invitation
    Rejected(Invitation),
    /// `BY`: end the session
    End(Invitation),
    /// `CK`: clock synchronization
    Sync(ClockSync),
    /// `RS`: receiver feedback for journal trimming
    Feedback(Feedback),
}

impl ControlCommand {
    /// Check whether a datagram is a control packet rather than RTP
    #[must_use]
    pub fn is_control(bytes: &[u8]) -> bool {
        bytes.starts_with(&SIGNATURE)
    }

    /// Two-letter command code
    #[must_use]
    pub const fn code(&self) -> [u8; 2] {
        match self {
            Self::Invitation(_) => *b"IN",
            Self::Accepted(_) => *b"OK",
            Self::Rejected(_) => *b"NO",
            Self::End(_) => *b"BY",
            Self::Sync(_) => *b"CK",
            Self::Feedback(_) => *b"RS",
        }
    }

    /// Sender stream identifier
    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        match self {
            Self::Invitation(inv) | Self::Accepted(inv) | Self::Rejected(inv) | Self::End(inv) => {
                inv.ssrc
            }
            Self::Sync(sync) => sync.ssrc,
            Self::Feedback(feedback) => feedback.ssrc,
        }
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(SYNC_LEN);
        out.put_slice(&SIGNATURE);
        out.put_slice(&self.code());

        match self {
            Self::Invitation(inv) | Self::Accepted(inv) | Self::Rejected(inv) | Self::End(inv) => {
                out.put_u32(inv.version);
                out.put_u32(inv.token);
                out.put_u32(inv.ssrc);
                if let Some(name) = &inv.name {
                    out.put_slice(name.as_bytes());
                    out.put_u8(0);
                }
            }
            Self::Sync(sync) => {
                out.put_u32(sync.ssrc);
                out.put_u8(sync.count);
                out.put_slice(&[0; 3]);
                for ts in sync.timestamps {
                    out.put_u64(ts);
                }
            }
            Self::Feedback(feedback) => {
                out.put_u32(feedback.ssrc);
                out.put_u16(feedback.sequence);
                out.put_u16(0);
            }
        }
        out.to_vec()
    }

    /// Decode a control packet
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        ensure_len(bytes, 4)?;
        if !Self::is_control(bytes) {
            return Err(PacketError::BadSignature);
        }
        let code = [bytes[2], bytes[3]];
        match &code {
            b"IN" => decode_invitation(bytes).map(Self::Invitation),
            b"OK" => decode_invitation(bytes).map(Self::Accepted),
            b"NO" => decode_invitation(bytes).map(Self::Rejected),
            b"BY" => decode_invitation(bytes).map(Self::End),
            b"CK" => {
                ensure_len(bytes, SYNC_LEN)?;
                let mut timestamps = [0u64; 3];
                for (index, ts) in timestamps.iter_mut().enumerate() {
                    *ts = read_u64(bytes, 12 + index * 8);
                }
                Ok(Self::Sync(ClockSync {
                    ssrc: read_u32(bytes, 4),
                    count: bytes[8],
                    timestamps,
                }))
            }
            b"RS" => {
                ensure_len(bytes, FEEDBACK_LEN)?;
                Ok(Self::Feedback(Feedback {
                    ssrc: read_u32(bytes, 4),
                    sequence: u16::from_be_bytes([bytes[8], bytes[9]]),
                }))
            }
            _ => Err(PacketError::UnknownCommand(code)),
        }
    }
}

fn decode_invitation(bytes: &[u8]) -> Result<Invitation, PacketError> {
    ensure_len(bytes, INVITATION_LEN)?;
    let version = read_u32(bytes, 4);
    if version != PROTOCOL_VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let name_bytes = &bytes[INVITATION_LEN..];
    let name_bytes = name_bytes
        .iter()
        .position(|b| *b == 0)
        .map_or(name_bytes, |nul| &name_bytes[..nul]);
    let name = (!name_bytes.is_empty()).then(|| String::from_utf8_lossy(name_bytes).into_owned());

    Ok(Invitation {
        version,
        token: read_u32(bytes, 8),
        ssrc: read_u32(bytes, 12),
        name,
    })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(word)
}
