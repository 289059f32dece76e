//! Thread-safe registry of attached devices

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::protocol::{Error, Result};
use crate::transport::TransportAdapter;

use super::{DeviceId, DeviceReceiver, Receiver, Role, Transmitter};

/// Attached devices and their endpoints.
///
/// Lookups take one map lock at a time so transport callbacks attaching one
/// device do not block dispatch reading another. Attach and detach hold the
/// id set lock for the whole update, taking the endpoint maps, the owner map
/// and the name cache after it in that order. An id is in
/// [`snapshot`](Self::snapshot) exactly when at least one endpoint is
/// attached, and every attached endpoint has an owner.
#[derive(Default)]
pub struct DeviceRegistry {
    device_ids: Mutex<HashSet<DeviceId>>,
    transmitters: RwLock<HashMap<DeviceId, Arc<Transmitter>>>,
    receivers: RwLock<HashMap<DeviceId, Arc<DeviceReceiver>>>,
    names: Mutex<HashMap<DeviceId, String>>,
    owners: RwLock<HashMap<DeviceId, Arc<dyn TransportAdapter>>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint owned by `transport`.
    ///
    /// Returns `false` if the endpoint was already attached.
    pub fn attach(
        &self,
        device_id: &DeviceId,
        role: Role,
        transport: &Arc<dyn TransportAdapter>,
    ) -> bool {
        let mut device_ids = self.device_ids.lock();

        let inserted = match role {
            Role::Input => {
                let mut transmitters = self.transmitters.write();
                if transmitters.contains_key(device_id) {
                    false
                } else {
                    transmitters.insert(device_id.clone(), Arc::new(Transmitter::new()));
                    true
                }
            }
            Role::Output => {
                let mut receivers = self.receivers.write();
                if receivers.contains_key(device_id) {
                    false
                } else {
                    let receiver = DeviceReceiver::new(device_id.clone(), Arc::clone(transport));
                    receivers.insert(device_id.clone(), Arc::new(receiver));
                    true
                }
            }
        };

        if !inserted {
            drop(device_ids);
            trace!(device = %device_id, %role, "already attached");
            return false;
        }

        self.owners
            .write()
            .entry(device_id.clone())
            .or_insert_with(|| Arc::clone(transport));
        device_ids.insert(device_id.clone());
        drop(device_ids);

        debug!(device = %device_id, %role, transport = %transport.kind(), "device attached");
        true
    }

    /// Remove an endpoint.
    ///
    /// The id leaves the id set and the name cache once no endpoint remains.
    /// Returns `false` if the endpoint was not attached.
    pub fn detach(&self, device_id: &DeviceId, role: Role) -> bool {
        let mut device_ids = self.device_ids.lock();

        let (removed, other_attached) = match role {
            Role::Input => {
                let transmitter = self.transmitters.write().remove(device_id);
                if let Some(transmitter) = &transmitter {
                    transmitter.clear_receiver();
                }
                (
                    transmitter.is_some(),
                    self.receivers.read().contains_key(device_id),
                )
            }
            Role::Output => {
                let receiver = self.receivers.write().remove(device_id);
                if let Some(receiver) = &receiver {
                    receiver.close();
                }
                (
                    receiver.is_some(),
                    self.transmitters.read().contains_key(device_id),
                )
            }
        };

        if !other_attached {
            device_ids.remove(device_id);
            self.owners.write().remove(device_id);
            self.names.lock().remove(device_id);
        }
        drop(device_ids);

        if removed {
            debug!(device = %device_id, %role, "device detached");
        }
        removed
    }

    /// Remove both endpoints of a device, returning the roles that were attached
    pub fn detach_all(&self, device_id: &DeviceId) -> Vec<Role> {
        Role::BOTH
            .into_iter()
            .filter(|role| self.detach(device_id, *role))
            .collect()
    }

    /// Check whether any endpoint of `device_id` is attached
    #[must_use]
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.device_ids.lock().contains(device_id)
    }

    /// Check whether the endpoint for `role` is attached
    #[must_use]
    pub fn has_endpoint(&self, device_id: &DeviceId, role: Role) -> bool {
        match role {
            Role::Input => self.transmitters.read().contains_key(device_id),
            Role::Output => self.receivers.read().contains_key(device_id),
        }
    }

    /// Copy of every attached device id
    #[must_use]
    pub fn snapshot(&self) -> HashSet<DeviceId> {
        self.device_ids.lock().clone()
    }

    /// Number of attached devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.device_ids.lock().len()
    }

    /// Check whether no device is attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.device_ids.lock().is_empty()
    }

    /// Input endpoint of a device
    pub fn transmitter(&self, device_id: &DeviceId) -> Result<Arc<Transmitter>> {
        self.transmitters
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    /// Every input endpoint, copied out of the lock
    #[must_use]
    pub fn transmitters(&self) -> Vec<Arc<Transmitter>> {
        self.transmitters.read().values().cloned().collect()
    }

    /// Output endpoint of a device
    #[must_use]
    pub fn receiver(&self, device_id: &DeviceId) -> Option<Arc<DeviceReceiver>> {
        self.receivers.read().get(device_id).cloned()
    }

    /// Transport that attached the device
    #[must_use]
    pub fn owner(&self, device_id: &DeviceId) -> Option<Arc<dyn TransportAdapter>> {
        self.owners.read().get(device_id).cloned()
    }

    /// Display name of a device.
    ///
    /// Served from the cache when possible, otherwise asked of the owning
    /// transport once. Unknown devices and failed lookups yield an empty string.
    #[must_use]
    pub fn name(&self, device_id: &DeviceId) -> String {
        if let Some(name) = self.names.lock().get(device_id) {
            return name.clone();
        }

        let Some(owner) = self.owner(device_id) else {
            return String::new();
        };

        match owner.query_name(device_id) {
            Some(name) => {
                // A detach racing the query must not leave a stale entry behind.
                let device_ids = self.device_ids.lock();
                if device_ids.contains(device_id) {
                    self.names.lock().insert(device_id.clone(), name.clone());
                }
                drop(device_ids);
                name
            }
            None => {
                trace!(device = %device_id, "name lookup failed");
                String::new()
            }
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .field("inputs", &self.transmitters.read().len())
            .field("outputs", &self.receivers.read().len())
            .finish()
    }
}
