//! Context configuration

use std::time::Duration;

use crate::protocol::{Error, Result};

/// Dispatch thread settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DispatchConfig {
    /// Bounded queue between transport threads and the dispatch thread.
    /// Messages arriving while it is full are dropped and counted.
    pub queue_capacity: usize,
    /// Name of the dispatch thread
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            thread_name: "unimidi-dispatch".to_owned(),
        }
    }
}

/// RTP-MIDI session timing and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtpMidiConfig {
    /// Interval between clock synchronizations started by the inviting side
    pub sync_interval: Duration,
    /// Silence after which a connected peer is dropped
    pub peer_timeout: Duration,
    /// Delay between unanswered invitations
    pub invitation_retry_interval: Duration,
    /// Invitations sent before giving up
    pub max_invitation_attempts: u32,
    /// Interval between receiver feedback (RS) packets
    pub feedback_interval: Duration,
    /// Sent packets retained in the recovery journal log before older ones are
    /// folded into the checkpoint state
    pub journal_capacity: usize,
    /// Concurrent peers per session; further invitations are rejected
    pub max_peers: usize,
    /// Socket read timeout, which bounds how quickly timers fire and stop returns
    pub poll_interval: Duration,
    /// Largest datagram sent
    pub max_packet_size: usize,
}

impl Default for RtpMidiConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(30),
            invitation_retry_interval: Duration::from_millis(1500),
            max_invitation_attempts: 12,
            feedback_interval: Duration::from_secs(1),
            journal_capacity: 64,
            max_peers: 16,
            poll_interval: Duration::from_millis(100),
            max_packet_size: 1472,
        }
    }
}

impl RtpMidiConfig {
    /// Smallest accepted `max_packet_size`: RTP header, command section header
    /// and one three-byte command
    pub const MIN_PACKET_SIZE: usize = 64;

    /// Reject settings the session engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be non-zero".into()));
        }
        if self.max_peers == 0 {
            return Err(Error::InvalidConfig("max_peers must be at least 1".into()));
        }
        if self.max_invitation_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_invitation_attempts must be at least 1".into(),
            ));
        }
        if self.journal_capacity == 0 {
            return Err(Error::InvalidConfig("journal_capacity must be at least 1".into()));
        }
        if self.max_packet_size < Self::MIN_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size must be at least {}",
                Self::MIN_PACKET_SIZE
            )));
        }
        Ok(())
    }
}

/// Settings for a [`MidiContext`](crate::MidiContext).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextConfig {
    /// Dispatch thread settings
    pub dispatch: DispatchConfig,
    /// RTP-MIDI settings shared by every session
    pub rtp: RtpMidiConfig,
}

impl ContextConfig {
    /// Replace the dispatch settings
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Replace the RTP-MIDI settings
    #[must_use]
    pub fn with_rtp(mut self, rtp: RtpMidiConfig) -> Self {
        self.rtp = rtp;
        self
    }

    /// Reject settings the context cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be at least 1".into()));
        }
        self.rtp.validate()
    }
}
