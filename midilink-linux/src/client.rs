//! Initiator role: drive one session to Connected against a remote endpoint.

use std::io;
use std::time::Duration;

use midilink_core::midi::MidiEvent;
use midilink_core::peer::{PeerOutput, PortKind, RtpPeer};
use tokio::net::lookup_host;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::transport::TransportPair;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub enum ClientCommand {
    SendMidi(Vec<MidiEvent>),
    Goodbye,
}

/// Session notification, tagged with the local port the registry chose.
#[derive(Debug)]
pub struct ClientEvent {
    pub tag: u32,
    pub kind: ClientEventKind,
}

#[derive(Debug)]
pub enum ClientEventKind {
    Connected { remote_name: String },
    Midi(Vec<MidiEvent>),
    Closed,
}

/// Handle to a running initiator session task. Dropping the handle makes
/// the task say goodbye and exit.
pub struct RtpClient {
    commands: UnboundedSender<ClientCommand>,
}

impl RtpClient {
    /// Resolve the endpoint, open a transport, and start the session task.
    pub async fn connect(
        local_name: String,
        host: &str,
        port: u16,
        tag: u32,
        events: UnboundedSender<ClientEvent>,
    ) -> io::Result<Self> {
        let remote = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "endpoint did not resolve"))?;
        let transport = TransportPair::connect(remote).await?;
        debug!("session to {remote} from local control port {}", transport.control_port());
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(session(local_name, transport, tag, events, command_rx));
        Ok(Self { commands })
    }

    pub fn send_midi(&self, events: Vec<MidiEvent>) {
        let _ = self.commands.send(ClientCommand::SendMidi(events));
    }

    pub fn goodbye(&self) {
        let _ = self.commands.send(ClientCommand::Goodbye);
    }
}

enum Wake {
    Control(io::Result<usize>),
    Midi(io::Result<usize>),
    Command(Option<ClientCommand>),
    HandshakeTimeout,
    ClockSync,
}

async fn session(
    local_name: String,
    transport: TransportPair,
    tag: u32,
    events: UnboundedSender<ClientEvent>,
    mut commands: UnboundedReceiver<ClientCommand>,
) {
    let mut peer = RtpPeer::initiator(local_name);
    let mut control_buf = [0u8; 1500];
    let mut midi_buf = [0u8; 1500];

    let invite = peer.invite();
    if dispatch(&transport, &events, tag, invite).await {
        return;
    }

    let handshake_deadline = time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(handshake_deadline);
    let mut clock_sync = time::interval_at(
        Instant::now() + CLOCK_SYNC_INTERVAL,
        CLOCK_SYNC_INTERVAL,
    );

    loop {
        let wake = tokio::select! {
            received = transport.socket(PortKind::Control).recv(&mut control_buf) => {
                Wake::Control(received)
            }
            received = transport.socket(PortKind::Midi).recv(&mut midi_buf) => {
                Wake::Midi(received)
            }
            command = commands.recv() => Wake::Command(command),
            _ = &mut handshake_deadline, if !peer.is_connected() => Wake::HandshakeTimeout,
            _ = clock_sync.tick(), if peer.is_connected() => Wake::ClockSync,
        };

        let outputs = match wake {
            Wake::Control(Ok(n)) => peer.data_ready(PortKind::Control, &control_buf[..n]),
            Wake::Midi(Ok(n)) => peer.data_ready(PortKind::Midi, &midi_buf[..n]),
            Wake::Control(Err(err)) | Wake::Midi(Err(err)) => {
                warn!("socket error, closing session: {err}");
                peer.send_goodbye()
            }
            Wake::Command(Some(ClientCommand::SendMidi(midi))) => match peer.send_midi(&midi) {
                Ok(outputs) => outputs,
                Err(err) => {
                    debug!("cannot send midi: {err}");
                    Vec::new()
                }
            },
            Wake::Command(Some(ClientCommand::Goodbye)) | Wake::Command(None) => {
                peer.send_goodbye()
            }
            Wake::HandshakeTimeout => {
                warn!("handshake with {} did not finish in time", peer.remote_name());
                peer.send_goodbye()
            }
            Wake::ClockSync => peer.send_clock_sync(),
        };

        if dispatch(&transport, &events, tag, outputs).await {
            break;
        }
    }
}

/// Emit peer outputs; returns true once the session closed.
async fn dispatch(
    transport: &TransportPair,
    events: &UnboundedSender<ClientEvent>,
    tag: u32,
    outputs: Vec<PeerOutput>,
) -> bool {
    let mut closed = false;
    for output in outputs {
        match output {
            PeerOutput::Packet { port, data } => transport.send(port, &data).await,
            PeerOutput::Midi(midi) => {
                let _ = events.send(ClientEvent {
                    tag,
                    kind: ClientEventKind::Midi(midi),
                });
            }
            PeerOutput::Connected { remote_name } => {
                info!("session established with {remote_name}");
                let _ = events.send(ClientEvent {
                    tag,
                    kind: ClientEventKind::Connected { remote_name },
                });
            }
            PeerOutput::Closed(reason) => {
                info!("session closed: {reason:?}");
                let _ = events.send(ClientEvent {
                    tag,
                    kind: ClientEventKind::Closed,
                });
                closed = true;
            }
        }
    }
    closed
}
