//! Stable device identifiers

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Prefix of device ids assigned to RTP-MIDI peers
pub const RTP_MIDI_PREFIX: &str = "rtpmidi:";

/// Opaque identifier of one MIDI endpoint, unique per transport.
///
/// Cloning is cheap; the string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// Create from any string
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Id of an RTP-MIDI peer, derived from the local session port and the
    /// peer's control address
    #[must_use]
    pub fn rtp_midi(local_port: u16, peer: SocketAddr) -> Self {
        Self::new(format!("{RTP_MIDI_PREFIX}{local_port}:{peer}"))
    }

    /// Local session port of an RTP-MIDI device id
    #[must_use]
    pub fn rtp_midi_port(&self) -> Option<u16> {
        let rest = self.0.strip_prefix(RTP_MIDI_PREFIX)?;
        let (port, _) = rest.split_once(':')?;
        port.parse().ok()
    }

    /// Borrow the id string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_midi_id_carries_port() {
        let peer: SocketAddr = "192.168.1.20:5008".parse().unwrap();
        let id = DeviceId::rtp_midi(5004, peer);
        assert_eq!(id.as_str(), "rtpmidi:5004:192.168.1.20:5008");
        assert_eq!(id.rtp_midi_port(), Some(5004));
    }

    #[test]
    fn test_rtp_midi_id_ipv6() {
        let peer: SocketAddr = "[::1]:6000".parse().unwrap();
        assert_eq!(DeviceId::rtp_midi(5004, peer).rtp_midi_port(), Some(5004));
    }

    #[test]
    fn test_non_rtp_id_has_no_port() {
        assert_eq!(DeviceId::from("usb:1234:5678:0").rtp_midi_port(), None);
        assert_eq!(DeviceId::from("rtpmidi:notaport:x").rtp_midi_port(), None);
    }
}
