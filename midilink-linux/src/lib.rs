//! MidiLink daemon building blocks: UDP transports, session roles, and the
//! registry that ties discovery and local MIDI ports together.

pub mod client;
pub mod config;
pub mod mdns;
pub mod registry;
pub mod seq;
pub mod server;
pub mod transport;
