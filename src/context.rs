//! Application-facing entry point

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::ContextConfig;
use crate::device::{DeviceId, DeviceRegistry};
use crate::dispatch::{DispatchHub, ListenerId, MidiListener};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::protocol::{Error, EventMask, MidiEvent, MidiMessage, Result};
use crate::transport::{AdapterSink, RtpMidiServer, TransportAdapter, TransportKind};

/// One MIDI runtime: device registry, dispatch thread, registered transports
/// and RTP-MIDI sessions.
///
/// Everything is torn down by [`terminate`](Self::terminate) or on drop.
pub struct MidiContext {
    config: ContextConfig,
    metrics: Arc<Metrics>,
    hub: Arc<DispatchHub>,
    transports: Mutex<Vec<Arc<dyn TransportAdapter>>>,
    rtp_servers: Mutex<HashMap<u16, Arc<RtpMidiServer>>>,
    terminated: AtomicBool,
}

impl MidiContext {
    /// Validate `config` and start the dispatch thread
    #[instrument(level = "info", skip(config))]
    pub fn new(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(DeviceRegistry::new());
        let hub = DispatchHub::start(&config.dispatch, registry, Arc::clone(&metrics))?;
        info!("MIDI context initialized");

        Ok(Self {
            config,
            metrics,
            hub: Arc::new(hub),
            transports: Mutex::new(Vec::new()),
            rtp_servers: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        })
    }

    /// Context with default settings
    pub fn with_defaults() -> Result<Self> {
        Self::new(ContextConfig::default())
    }

    /// Settings the context was created with
    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Attached devices
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.hub.registry()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Register a listener for the event types in `mask`.
    ///
    /// Add [`EventMask::with_devices`] to also receive attach and detach
    /// notifications.
    pub fn subscribe(&self, listener: Arc<dyn MidiListener>, mask: EventMask) -> ListenerId {
        self.hub.subscribe(listener, mask)
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Start a transport and route its traffic through this context.
    ///
    /// Fails with whatever the transport reports, typically
    /// [`Error::TransportUnavailable`].
    #[instrument(level = "info", skip(self, transport), fields(kind = %transport.kind()))]
    pub fn register_transport(&self, transport: Arc<dyn TransportAdapter>) -> Result<()> {
        self.ensure_running()?;
        transport.start(AdapterSink::new(Arc::clone(&self.hub), &transport))?;
        self.transports.lock().push(transport);
        Ok(())
    }

    /// Send a message to a device.
    ///
    /// Unknown or detached devices are ignored; a device can vanish between
    /// lookup and send.
    pub fn send(&self, device_id: &DeviceId, group: u8, message: &MidiMessage) {
        if self.terminated.load(Ordering::Acquire) {
            debug!(device = %device_id, "send after terminate ignored");
            return;
        }
        self.hub.send(device_id, group, message);
    }

    /// Validate `event` and send it to a device.
    ///
    /// Returns [`Error::InvalidMidiData`] for out-of-range fields; delivery
    /// itself is best effort as with [`send`](Self::send).
    pub fn send_event(&self, device_id: &DeviceId, group: u8, event: &MidiEvent) -> Result<()> {
        let message = event.to_message()?;
        self.send(device_id, group, &message);
        Ok(())
    }

    /// Start an RTP-MIDI session on `port` (control) and `port + 1` (data).
    ///
    /// Starting a port that already runs is a no-op.
    #[instrument(level = "info", skip(self))]
    pub fn start_rtp_midi_server(&self, session_name: &str, port: u16) -> Result<()> {
        self.ensure_running()?;
        let mut servers = self.rtp_servers.lock();
        if servers.contains_key(&port) {
            debug!(port, "RTP-MIDI session already running");
            return Ok(());
        }

        let server = Arc::new(RtpMidiServer::bind(
            session_name,
            port,
            &self.config.rtp,
            Arc::clone(&self.metrics),
        )?);
        let adapter: Arc<dyn TransportAdapter> = server.clone();
        adapter.start(AdapterSink::new(Arc::clone(&self.hub), &adapter))?;
        self.hub.register_route(port, adapter);
        servers.insert(port, server);
        Ok(())
    }

    /// Check whether an RTP-MIDI session runs on `port`
    #[must_use]
    pub fn is_rtp_midi_running(&self, port: u16) -> bool {
        self.rtp_servers
            .lock()
            .get(&port)
            .is_some_and(|server| server.is_running())
    }

    /// Invite a remote session from the local session on `listen_port`,
    /// starting it first if needed.
    ///
    /// The peer is attached as a device once the handshake completes.
    #[instrument(level = "info", skip(self))]
    pub fn connect_to_rtp_midi_server(
        &self,
        session_name: &str,
        listen_port: u16,
        addr: SocketAddr,
    ) -> Result<()> {
        self.start_rtp_midi_server(session_name, listen_port)?;
        let server = self
            .rtp_servers
            .lock()
            .get(&listen_port)
            .cloned()
            .ok_or_else(|| Error::TransportUnavailable {
                transport: TransportKind::RtpMidi.as_str(),
                reason: format!("no session on port {listen_port}"),
            })?;
        server.connect(addr)
    }

    /// Stop the RTP-MIDI session on `port`, ending every peer.
    ///
    /// Returns `false` if no session ran there. No message from the session
    /// is dispatched after this returns.
    #[instrument(level = "info", skip(self))]
    pub fn stop_rtp_midi(&self, port: u16) -> bool {
        let Some(server) = self.rtp_servers.lock().remove(&port) else {
            return false;
        };
        self.hub.remove_route(port);
        server.stop();
        true
    }

    /// Stop every RTP-MIDI session
    pub fn stop_all_rtp_midi(&self) {
        let servers: Vec<_> = self.rtp_servers.lock().drain().collect();
        for (port, server) in servers {
            self.hub.remove_route(port);
            server.stop();
        }
    }

    /// Ids of every attached device
    #[must_use]
    pub fn device_ids(&self) -> HashSet<DeviceId> {
        self.registry().snapshot()
    }

    /// Display name of a device, or an empty string if unknown
    #[must_use]
    pub fn device_name(&self, device_id: &DeviceId) -> String {
        self.registry().name(device_id)
    }

    /// Block until every event queued so far has reached listeners
    pub fn flush(&self) {
        self.hub.flush();
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop every session and transport, then the dispatch thread.
    ///
    /// Idempotent. No listener is called after this returns.
    #[instrument(level = "info", skip(self))]
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_all_rtp_midi();

        let transports: Vec<_> = self.transports.lock().drain(..).collect();
        for transport in transports {
            debug!(kind = %transport.kind(), "stopping transport");
            transport.stop();
        }

        self.hub.shutdown();
        if !self.registry().is_empty() {
            warn!(
                devices = self.registry().len(),
                "devices still attached at terminate"
            );
        }
        info!("MIDI context terminated");
    }
}

impl Drop for MidiContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for MidiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiContext")
            .field("terminated", &self.terminated.load(Ordering::Acquire))
            .field("hub", &self.hub)
            .field("rtp_ports", &self.rtp_servers.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
