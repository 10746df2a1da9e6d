//! Sans-I/O engine for RTP-MIDI (AppleMIDI) sessions.
//!
//! The crate holds the protocol logic only; the host performs all I/O.
//!
//! ## Host responsibilities
//!
//! - **Sockets**: the host owns the two UDP sockets of a session (control
//!   and MIDI) and feeds every inbound datagram to [`peer::RtpPeer::data_ready`],
//!   tagged with the channel it arrived on. Outbound packets come back as
//!   [`peer::PeerOutput::Packet`] values to put on the wire.
//! - **Timers**: handshake timeouts and the periodic clock-sync cadence are
//!   driven by the host; the peer only reacts to datagrams and send requests.
//! - **MIDI graph**: decoded events surface as [`peer::PeerOutput::Midi`];
//!   local events enter through [`peer::RtpPeer::send_midi`].

pub mod buffer;
pub mod midi;
pub mod peer;

pub use buffer::{BufferError, ByteReader, ByteWriter};
pub use midi::{CodecError, MidiEvent};
pub use peer::{CloseReason, PeerError, PeerOutput, PeerStatus, PortKind, RtpPeer};
