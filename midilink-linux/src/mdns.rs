//! mDNS seam: service publication and discovery events.
//!
//! The actual multicast DNS responder/browser is an external collaborator.
//! It announces `_apple-midi._udp` records through [`MdnsPublisher`] and
//! feeds browse results into the registry as [`DiscoveryEvent`]s.

use tracing::info;

/// Service type under which RTP-MIDI sessions are published and browsed.
pub const SERVICE_TYPE: &str = "_apple-midi._udp";

/// Publication operations consumed by the registry.
pub trait MdnsPublisher: Send {
    fn announce(&mut self, name: &str, port: u16);
    fn unannounce(&mut self, name: &str, port: u16);
}

/// Browse results delivered to the registry.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered {
        name: String,
        address: String,
        port: u16,
    },
    Removed {
        name: String,
    },
}

/// Stand-in publisher: logs what would be announced.
pub struct NullPublisher;

impl MdnsPublisher for NullPublisher {
    fn announce(&mut self, name: &str, port: u16) {
        info!("would announce {SERVICE_TYPE} instance {name} on port {port}");
    }

    fn unannounce(&mut self, name: &str, port: u16) {
        info!("would retract {SERVICE_TYPE} instance {name} on port {port}");
    }
}
