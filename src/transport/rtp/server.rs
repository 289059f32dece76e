//! UDP host for an [`RtpMidiSession`]
//!
//! Binds the control port and the data port beside it, runs one receive
//! thread per socket, and carries out the session's actions. The control
//! thread also drives the session timers between datagrams.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use super::session::{Action, PortKind, RtpMidiSession};
use crate::config::RtpMidiConfig;
use crate::device::{DeviceId, Role};
use crate::metrics::Metrics;
use crate::protocol::{Error, Result};
use crate::transport::{AdapterSink, SocketBinding, TransportAdapter, TransportKind};

/// Largest datagram accepted
const RECV_BUFFER_LEN: usize = 65_535;

struct Inner {
    port: u16,
    control: SocketBinding,
    data: SocketBinding,
    session: Mutex<RtpMidiSession>,
    sink: RwLock<Option<AdapterSink>>,
    running: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Inner {
    fn socket(&self, port: PortKind) -> &SocketBinding {
        match port {
            PortKind::Control => &self.control,
            PortKind::Data => &self.data,
        }
    }

    /// Carry out session actions. Never called with the session locked.
    fn execute(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        let sink = self.sink.read().clone();

        for action in actions {
            match action {
                Action::Transmit { port, to, bytes } => {
                    if let Err(err) = self.socket(port).send_to(&bytes, to) {
                        debug!(%to, error = %err, "RTP-MIDI datagram not sent");
                    }
                }
                Action::PeerConnected { device_id, .. } => {
                    self.metrics.record_peer_connected();
                    if let Some(sink) = &sink {
                        for role in Role::BOTH {
                            sink.notify_attached(&device_id, role);
                        }
                    }
                }
                Action::PeerDisconnected { device_id, .. } => {
                    self.metrics.record_peer_disconnected();
                    if let Some(sink) = &sink {
                        for role in Role::BOTH {
                            sink.notify_detached(&device_id, role);
                        }
                    }
                }
                Action::Deliver { device_id, message } => match &sink {
                    Some(sink) => sink.deliver_message(&device_id, 0, message),
                    None => self.metrics.record_dropped(),
                },
            }
        }
    }

    fn receive_loop(&self, port: PortKind) {
        let socket = self.socket(port).clone();
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        while self.running.load(Ordering::Acquire) {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let now = Instant::now();
                    let result = {
                        let mut session = self.session.lock();
                        match port {
                            PortKind::Control => session.handle_control(from, &buf[..len], now),
                            PortKind::Data => session.handle_data(from, &buf[..len], now),
                        }
                    };
                    match result {
                        Ok(actions) => self.execute(actions),
                        Err(err) => {
                            self.metrics.record_protocol_violation();
                            let err = Error::from(err);
                            warn!(%from, port = ?port, error = %err, "malformed RTP-MIDI datagram dropped");
                        }
                    }
                }
                Err(err) if err.is_timeout() => {}
                Err(err) => {
                    if self.running.load(Ordering::Acquire) {
                        debug!(port = ?port, error = %err, "RTP-MIDI receive failed");
                    }
                }
            }

            if port == PortKind::Control {
                let actions = self.session.lock().poll(Instant::now());
                self.execute(actions);
            }
        }
        trace!(port = self.port, kind = ?port, "RTP-MIDI receive loop exited");
    }
}

/// RTP-MIDI session bound to a UDP port pair, usable as a transport.
pub struct RtpMidiServer {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RtpMidiServer {
    /// Bind the control port and `port + 1` on every interface.
    ///
    /// Returns [`Error::InvalidConfig`] for port 0 or 65535 (no room for the
    /// data port) and [`Error::PortInUse`] when either port is taken.
    #[instrument(level = "info", skip(config, metrics))]
    pub fn bind(name: &str, port: u16, config: &RtpMidiConfig, metrics: Arc<Metrics>) -> Result<Self> {
        if port == 0 || port == u16::MAX {
            return Err(Error::InvalidConfig(format!(
                "RTP-MIDI port {port} leaves no room for the data port"
            )));
        }
        config.validate()?;

        let control = SocketBinding::bind(any_interface(port))?;
        let data = SocketBinding::bind(any_interface(port + 1))?;
        control.set_read_timeout(Some(config.poll_interval))?;
        data.set_read_timeout(Some(config.poll_interval))?;

        let session = RtpMidiSession::new(
            name,
            port,
            config.clone(),
            Arc::clone(&metrics),
            Instant::now(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                port,
                control,
                data,
                session: Mutex::new(session),
                sink: RwLock::new(None),
                running: AtomicBool::new(false),
                metrics,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Control port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Session name announced to peers
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.session.lock().name().to_owned()
    }

    /// Check whether the receive threads are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Device ids of connected peers
    #[must_use]
    pub fn peers(&self) -> Vec<DeviceId> {
        self.inner.session.lock().connected_peers()
    }

    /// Invite the session whose control port is at `addr`.
    ///
    /// The handshake completes in the background; the peer appears as a
    /// device once it accepts on both ports.
    #[instrument(level = "info", skip(self), fields(port = self.inner.port))]
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        if !self.is_running() {
            return Err(Error::TransportUnavailable {
                transport: TransportKind::RtpMidi.as_str(),
                reason: "session not started".into(),
            });
        }
        let actions = self.inner.session.lock().invite(addr, Instant::now())?;
        self.inner.execute(actions);
        Ok(())
    }

    /// End the session with one peer
    pub fn disconnect(&self, device_id: &DeviceId) {
        let actions = self.inner.session.lock().end(device_id);
        self.inner.execute(actions);
    }

    fn spawn(&self, port: PortKind) -> Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        let name = match port {
            PortKind::Control => format!("unimidi-rtp-{}-control", self.inner.port),
            PortKind::Data => format!("unimidi-rtp-{}-data", self.inner.port),
        };
        thread::Builder::new()
            .name(name)
            .spawn(move || inner.receive_loop(port))
            .map_err(Error::Io)
    }
}

impl TransportAdapter for RtpMidiServer {
    fn kind(&self) -> TransportKind {
        TransportKind::RtpMidi
    }

    #[instrument(level = "info", skip(self, sink), fields(port = self.inner.port))]
    fn start(&self, sink: AdapterSink) -> Result<()> {
        *self.inner.sink.write() = Some(sink);
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = self.workers.lock();
        for port in [PortKind::Control, PortKind::Data] {
            match self.spawn(port) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    self.inner.running.store(false, Ordering::Release);
                    for handle in workers.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        info!(
            session = %self.inner.session.lock().name(),
            port = self.inner.port,
            "RTP-MIDI session started"
        );
        Ok(())
    }

    #[instrument(level = "info", skip(self), fields(port = self.inner.port))]
    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let actions = self.inner.session.lock().stop();
        self.inner.execute(actions);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("RTP-MIDI receive thread panicked");
            }
        }
        *self.inner.sink.write() = None;
        info!(port = self.inner.port, "RTP-MIDI session stopped");
    }

    fn send(&self, device_id: &DeviceId, _group: u8, bytes: &[u8]) -> Result<()> {
        let actions = self
            .inner
            .session
            .lock()
            .send(device_id, bytes, Instant::now())?;
        self.inner.execute(actions);
        Ok(())
    }

    fn query_name(&self, device_id: &DeviceId) -> Option<String> {
        self.inner.session.lock().peer_name(device_id)
    }
}

impl Drop for RtpMidiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RtpMidiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpMidiServer")
            .field("port", &self.inner.port)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn any_interface(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
}
