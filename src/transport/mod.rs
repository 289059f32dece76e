//! Transports: the adapter contract, framers for USB-MIDI and BLE-MIDI, an
//! in-process virtual transport, and the RTP-MIDI network engine

mod adapter;
pub mod ble;
mod socket;
pub mod usb;
mod virtual_port;

pub mod rtp;

pub use adapter::{AdapterSink, TransportAdapter, TransportKind};
pub use rtp::RtpMidiServer;
pub use socket::{SocketBinding, SocketError};
pub use virtual_port::{SentBytes, VirtualTransport};
