//! Device identifiers, endpoints and the attached-device registry

mod endpoint;
mod id;
mod registry;

pub use endpoint::{DeviceReceiver, Receiver, Transmitter};
pub use id::{DeviceId, RTP_MIDI_PREFIX};
pub use registry::DeviceRegistry;

use std::fmt;

/// Direction of a device endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Produces messages (a MIDI input port, backed by a [`Transmitter`])
    Input,
    /// Accepts messages (a MIDI output port, backed by a [`Receiver`])
    Output,
}

impl Role {
    /// Both roles, input first
    pub const BOTH: [Self; 2] = [Self::Input, Self::Output];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Attach/detach notification delivered to listeners subscribed to devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// Input endpoint became available
    InputAttached(DeviceId),
    /// Output endpoint became available
    OutputAttached(DeviceId),
    /// Input endpoint went away
    InputDetached(DeviceId),
    /// Output endpoint went away
    OutputDetached(DeviceId),
}

impl DeviceEvent {
    /// Attach notification for `role`
    #[must_use]
    pub fn attached(device_id: DeviceId, role: Role) -> Self {
        match role {
            Role::Input => Self::InputAttached(device_id),
            Role::Output => Self::OutputAttached(device_id),
        }
    }

    /// Detach notification for `role`
    #[must_use]
    pub fn detached(device_id: DeviceId, role: Role) -> Self {
        match role {
            Role::Input => Self::InputDetached(device_id),
            Role::Output => Self::OutputDetached(device_id),
        }
    }

    /// Device the notification is about
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::InputAttached(id)
            | Self::OutputAttached(id)
            | Self::InputDetached(id)
            | Self::OutputDetached(id) => id,
        }
    }

    /// Endpoint role
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::InputAttached(_) | Self::InputDetached(_) => Role::Input,
            Self::OutputAttached(_) | Self::OutputDetached(_) => Role::Output,
        }
    }

    /// Check whether this is an attach notification
    #[must_use]
    pub fn is_attach(&self) -> bool {
        matches!(self, Self::InputAttached(_) | Self::OutputAttached(_))
    }
}
