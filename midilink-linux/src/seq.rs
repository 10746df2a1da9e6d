//! Local MIDI sequencer seam.
//!
//! The registry talks to the host MIDI graph through this interface. The
//! ALSA integration that implements it for real lives outside this crate;
//! it feeds [`SeqEvent`]s into the registry's channel and receives port and
//! publish calls back.

use midilink_core::midi::MidiEvent;
use tracing::debug;

/// Identifier of a local virtual MIDI port.
pub type SeqPort = u32;

/// Host MIDI graph operations consumed by the registry.
pub trait Sequencer: Send {
    /// Create a virtual port visible to local applications.
    fn create_port(&mut self, name: &str) -> SeqPort;
    fn remove_port(&mut self, port: SeqPort);
    /// Deliver events to the local subscribers of `port`.
    fn publish(&mut self, port: SeqPort, events: &[MidiEvent]);
}

/// Notifications from the host MIDI graph.
#[derive(Debug, Clone)]
pub enum SeqEvent {
    /// A local client subscribed to one of our ports.
    Subscribed {
        port: SeqPort,
        subscriber_port: SeqPort,
        subscriber_name: String,
    },
    /// A local client disconnected from one of our ports.
    Unsubscribed {
        port: SeqPort,
        subscriber_port: SeqPort,
    },
    /// A local client published an event on one of our ports.
    Midi { port: SeqPort, event: MidiEvent },
}

/// Stand-in sequencer: allocates port ids and logs deliveries.
#[derive(Default)]
pub struct NullSequencer {
    next_port: SeqPort,
}

impl NullSequencer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sequencer for NullSequencer {
    fn create_port(&mut self, name: &str) -> SeqPort {
        let port = self.next_port;
        self.next_port += 1;
        debug!("created virtual port {port} ({name})");
        port
    }

    fn remove_port(&mut self, port: SeqPort) {
        debug!("removed virtual port {port}");
    }

    fn publish(&mut self, port: SeqPort, events: &[MidiEvent]) {
        debug!("{} events for local port {port}", events.len());
    }
}
