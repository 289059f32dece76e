//! In-process virtual ports

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::device::{DeviceId, Role};
use crate::protocol::Result;

use super::{AdapterSink, TransportAdapter, TransportKind};

/// Bytes handed to a virtual output port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBytes {
    /// Destination port
    pub device_id: DeviceId,
    /// Group the bytes were sent on
    pub group: u8,
    /// Encoded message
    pub bytes: Vec<u8>,
}

/// Transport with software-defined ports.
///
/// Inputs inject bytes as if a device produced them; outputs record what is
/// sent to them. Ports added before [`start`](TransportAdapter::start) are
/// attached when the transport starts.
#[derive(Debug, Default)]
pub struct VirtualTransport {
    sink: RwLock<Option<AdapterSink>>,
    ports: Mutex<HashMap<DeviceId, HashSet<Role>>>,
    names: Mutex<HashMap<DeviceId, String>>,
    sent: Mutex<Vec<SentBytes>>,
}

impl VirtualTransport {
    /// Create a transport with no ports
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name reported for a port
    pub fn set_name(&self, device_id: &DeviceId, name: impl Into<String>) {
        self.names.lock().insert(device_id.clone(), name.into());
    }

    /// Add a port and attach it if the transport is running
    pub fn add_port(&self, device_id: &DeviceId, name: impl Into<String>, role: Role) {
        self.set_name(device_id, name);
        let added = self
            .ports
            .lock()
            .entry(device_id.clone())
            .or_default()
            .insert(role);
        if added {
            if let Some(sink) = self.sink.read().as_ref() {
                sink.notify_attached(device_id, role);
            }
        }
    }

    /// Remove a port in one role and detach it if the transport is running
    pub fn remove_port(&self, device_id: &DeviceId, role: Role) {
        let removed = {
            let mut ports = self.ports.lock();
            let removed = ports
                .get_mut(device_id)
                .is_some_and(|roles| roles.remove(&role));
            if ports.get(device_id).is_some_and(HashSet::is_empty) {
                ports.remove(device_id);
            }
            removed
        };
        if removed {
            if let Some(sink) = self.sink.read().as_ref() {
                sink.notify_detached(device_id, role);
            }
        }
    }

    /// Feed bytes into the core as if `device_id` produced them
    pub fn inject(&self, device_id: &DeviceId, group: u8, bytes: &[u8]) {
        match self.sink.read().as_ref() {
            Some(sink) => sink.deliver_bytes(device_id, group, bytes),
            None => debug!(device = %device_id, "inject before start ignored"),
        }
    }

    /// Everything sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<SentBytes> {
        self.sent.lock().clone()
    }

    /// Take and clear everything sent so far
    pub fn take_sent(&self) -> Vec<SentBytes> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Check whether the transport has been started
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.sink.read().is_some()
    }
}

impl TransportAdapter for VirtualTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Virtual
    }

    #[instrument(level = "debug", skip_all)]
    fn start(&self, sink: AdapterSink) -> Result<()> {
        let ports: Vec<(DeviceId, Role)> = self
            .ports
            .lock()
            .iter()
            .flat_map(|(id, roles)| roles.iter().map(move |role| (id.clone(), *role)))
            .collect();
        for (id, role) in &ports {
            sink.notify_attached(id, *role);
        }
        *self.sink.write() = Some(sink);
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    fn stop(&self) {
        let Some(sink) = self.sink.write().take() else {
            return;
        };
        let ports = self.ports.lock().clone();
        for (id, roles) in ports {
            for role in roles {
                sink.notify_detached(&id, role);
            }
        }
    }

    fn send(&self, device_id: &DeviceId, group: u8, bytes: &[u8]) -> Result<()> {
        self.sent.lock().push(SentBytes {
            device_id: device_id.clone(),
            group,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn query_name(&self, device_id: &DeviceId) -> Option<String> {
        self.names.lock().get(device_id).cloned()
    }
}
