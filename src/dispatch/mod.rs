//! Event dispatch: listener fan-out, loopback and the outbound send path

mod hub;
mod listener;

pub use hub::DispatchHub;
pub use listener::{ListenerId, MidiListener, ReceivedEvent};
