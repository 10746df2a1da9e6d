//! Adjacent UDP socket pair: control on `P`, MIDI on `P + 1`.

use std::io;
use std::net::SocketAddr;

use midilink_core::peer::PortKind;
use tokio::net::UdpSocket;
use tracing::warn;

const BIND_ATTEMPTS: usize = 16;

/// The two sockets of one RTP-MIDI endpoint. Servers bind unconnected and
/// answer many remotes; clients connect both sockets to a single remote pair.
pub struct TransportPair {
    control: UdpSocket,
    midi: UdpSocket,
    control_port: u16,
}

impl TransportPair {
    /// Bind a pair on `port`/`port + 1`. `port == 0` picks a free adjacent
    /// pair; the chosen control port is reported by [`Self::control_port`].
    pub async fn bind(port: u16) -> io::Result<Self> {
        if port != 0 {
            let control = UdpSocket::bind(("0.0.0.0", port)).await?;
            let midi = UdpSocket::bind(("0.0.0.0", port + 1)).await?;
            return Ok(Self {
                control,
                midi,
                control_port: port,
            });
        }
        for _ in 0..BIND_ATTEMPTS {
            let control = UdpSocket::bind(("0.0.0.0", 0)).await?;
            let control_port = control.local_addr()?.port();
            if control_port == u16::MAX {
                continue;
            }
            if let Ok(midi) = UdpSocket::bind(("0.0.0.0", control_port + 1)).await {
                return Ok(Self {
                    control,
                    midi,
                    control_port,
                });
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no adjacent udp port pair available",
        ))
    }

    /// Bind an ephemeral pair and connect it to the remote control address
    /// and the adjacent MIDI address.
    pub async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let pair = Self::bind(0).await?;
        pair.control.connect(remote).await?;
        let mut midi_remote = remote;
        midi_remote.set_port(remote.port() + 1);
        pair.midi.connect(midi_remote).await?;
        Ok(pair)
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn socket(&self, port: PortKind) -> &UdpSocket {
        match port {
            PortKind::Control => &self.control,
            PortKind::Midi => &self.midi,
        }
    }

    /// Fire-and-forget send on a connected pair.
    pub async fn send(&self, port: PortKind, data: &[u8]) {
        if let Err(err) = self.socket(port).send(data).await {
            warn!("udp send on {port:?} channel failed: {err}");
        }
    }

    /// Fire-and-forget send to an explicit remote (server side).
    pub async fn send_to(&self, port: PortKind, data: &[u8], addr: SocketAddr) {
        if let Err(err) = self.socket(port).send_to(data, addr).await {
            warn!("udp send to {addr} on {port:?} channel failed: {err}");
        }
    }
}
