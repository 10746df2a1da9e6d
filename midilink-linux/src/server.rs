//! Responder role: accept remote initiators on a bound socket pair.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use midilink_core::midi::MidiEvent;
use midilink_core::peer::{self, PeerOutput, PortKind, RtpPeer};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::transport::TransportPair;

pub enum ServerCommand {
    SendMidi { peer: u32, events: Vec<MidiEvent> },
    SendMidiToAll(Vec<MidiEvent>),
    Shutdown,
}

/// Notification from a server task, tagged with the server instance and the
/// peer it concerns.
#[derive(Debug)]
pub struct ServerEvent {
    pub tag: u32,
    pub peer: u32,
    pub kind: ServerEventKind,
}

#[derive(Debug)]
pub enum ServerEventKind {
    Connected { remote_name: String },
    Midi(Vec<MidiEvent>),
    Closed,
}

/// Handle to a running responder server task.
#[derive(Clone)]
pub struct RtpServer {
    control_port: u16,
    commands: UnboundedSender<ServerCommand>,
}

impl RtpServer {
    /// Bind the socket pair (`port == 0` picks one) and start accepting.
    pub async fn bind(
        local_name: String,
        port: u16,
        tag: u32,
        events: UnboundedSender<ServerEvent>,
    ) -> io::Result<Self> {
        let transport = TransportPair::bind(port).await?;
        let control_port = transport.control_port();
        info!("{local_name}: listening on control port {control_port}");
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(local_name, transport, tag, events, command_rx));
        Ok(Self {
            control_port,
            commands,
        })
    }

    /// The bound control port, for mDNS publication.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn send_midi(&self, peer: u32, events: Vec<MidiEvent>) {
        let _ = self.commands.send(ServerCommand::SendMidi { peer, events });
    }

    pub fn send_midi_to_all_peers(&self, events: Vec<MidiEvent>) {
        let _ = self.commands.send(ServerCommand::SendMidiToAll(events));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ServerCommand::Shutdown);
    }
}

struct PeerSlot {
    peer: RtpPeer,
    control_addr: SocketAddr,
    midi_addr: Option<SocketAddr>,
}

struct ServerState {
    local_name: String,
    tag: u32,
    next_id: u32,
    peers: HashMap<u32, PeerSlot>,
    by_control: HashMap<SocketAddr, u32>,
    by_midi: HashMap<SocketAddr, u32>,
}

enum Wake {
    Control(io::Result<(usize, SocketAddr)>),
    Midi(io::Result<(usize, SocketAddr)>),
    Command(Option<ServerCommand>),
}

async fn accept_loop(
    local_name: String,
    transport: TransportPair,
    tag: u32,
    events: UnboundedSender<ServerEvent>,
    mut commands: UnboundedReceiver<ServerCommand>,
) {
    let mut state = ServerState {
        local_name,
        tag,
        next_id: 0,
        peers: HashMap::new(),
        by_control: HashMap::new(),
        by_midi: HashMap::new(),
    };
    let mut control_buf = [0u8; 1500];
    let mut midi_buf = [0u8; 1500];

    loop {
        let wake = tokio::select! {
            received = transport.socket(PortKind::Control).recv_from(&mut control_buf) => {
                Wake::Control(received)
            }
            received = transport.socket(PortKind::Midi).recv_from(&mut midi_buf) => {
                Wake::Midi(received)
            }
            command = commands.recv() => Wake::Command(command),
        };

        match wake {
            Wake::Control(Ok((n, from))) => {
                state
                    .handle_datagram(&transport, &events, PortKind::Control, from, &control_buf[..n])
                    .await;
            }
            Wake::Midi(Ok((n, from))) => {
                state
                    .handle_datagram(&transport, &events, PortKind::Midi, from, &midi_buf[..n])
                    .await;
            }
            Wake::Control(Err(err)) | Wake::Midi(Err(err)) => {
                warn!("server socket error: {err}");
                state.shutdown(&transport, &events).await;
                break;
            }
            Wake::Command(Some(ServerCommand::SendMidi { peer, events: midi })) => {
                state.send_midi(&transport, &events, peer, midi).await;
            }
            Wake::Command(Some(ServerCommand::SendMidiToAll(midi))) => {
                state.send_midi_to_all(&transport, &events, midi).await;
            }
            Wake::Command(Some(ServerCommand::Shutdown)) | Wake::Command(None) => {
                state.shutdown(&transport, &events).await;
                break;
            }
        }
    }
}

impl ServerState {
    async fn handle_datagram(
        &mut self,
        transport: &TransportPair,
        events: &UnboundedSender<ServerEvent>,
        kind: PortKind,
        from: SocketAddr,
        data: &[u8],
    ) {
        let known = match kind {
            PortKind::Control => self.by_control.get(&from).copied(),
            PortKind::Midi => self.by_midi.get(&from).copied(),
        };
        let id = match known {
            Some(id) => id,
            None => match kind {
                PortKind::Control if peer::is_invitation(data) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    info!("incoming session from {from}");
                    self.peers.insert(
                        id,
                        PeerSlot {
                            peer: RtpPeer::responder(self.local_name.clone()),
                            control_addr: from,
                            midi_addr: None,
                        },
                    );
                    self.by_control.insert(from, id);
                    id
                }
                // A MIDI-channel datagram from a source we have not seen:
                // match the invitation token or the RTP ssrc, both at the
                // same offset, against the peers accepted on control.
                PortKind::Midi => match self.match_unbound_midi(data) {
                    Some(id) => {
                        self.by_midi.insert(from, id);
                        if let Some(slot) = self.peers.get_mut(&id) {
                            slot.midi_addr = Some(from);
                        }
                        id
                    }
                    None => {
                        debug!("datagram from unknown midi endpoint {from}");
                        return;
                    }
                },
                _ => {
                    debug!("ignoring datagram from unknown endpoint {from}");
                    return;
                }
            },
        };
        let outputs = match self.peers.get_mut(&id) {
            Some(slot) => slot.peer.data_ready(kind, data),
            None => return,
        };
        self.dispatch(transport, events, id, outputs).await;
    }

    fn match_unbound_midi(&self, data: &[u8]) -> Option<u32> {
        if data.len() < 12 {
            return None;
        }
        let key = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        if data[0] == 0xFF && data[1] == 0xFF {
            self.peers
                .iter()
                .find(|(_, slot)| slot.peer.initiator_token() == key)
                .map(|(&id, _)| id)
        } else {
            self.peers
                .iter()
                .find(|(_, slot)| slot.peer.remote_ssrc() == key)
                .map(|(&id, _)| id)
        }
    }

    async fn dispatch(
        &mut self,
        transport: &TransportPair,
        events: &UnboundedSender<ServerEvent>,
        id: u32,
        outputs: Vec<PeerOutput>,
    ) {
        let (control_addr, midi_addr) = match self.peers.get(&id) {
            Some(slot) => (slot.control_addr, slot.midi_addr),
            None => return,
        };
        let mut closed = false;
        for output in outputs {
            match output {
                PeerOutput::Packet { port, data } => {
                    let addr = match port {
                        PortKind::Control => control_addr,
                        PortKind::Midi => midi_addr.unwrap_or_else(|| {
                            let mut addr = control_addr;
                            addr.set_port(addr.port() + 1);
                            addr
                        }),
                    };
                    transport.send_to(port, &data, addr).await;
                }
                PeerOutput::Midi(midi) => {
                    let _ = events.send(ServerEvent {
                        tag: self.tag,
                        peer: id,
                        kind: ServerEventKind::Midi(midi),
                    });
                }
                PeerOutput::Connected { remote_name } => {
                    info!("{}: peer {remote_name} connected", self.local_name);
                    let _ = events.send(ServerEvent {
                        tag: self.tag,
                        peer: id,
                        kind: ServerEventKind::Connected { remote_name },
                    });
                }
                PeerOutput::Closed(reason) => {
                    info!("{}: peer closed ({reason:?})", self.local_name);
                    let _ = events.send(ServerEvent {
                        tag: self.tag,
                        peer: id,
                        kind: ServerEventKind::Closed,
                    });
                    closed = true;
                }
            }
        }
        if closed {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: u32) {
        if let Some(slot) = self.peers.remove(&id) {
            self.by_control.remove(&slot.control_addr);
            if let Some(addr) = slot.midi_addr {
                self.by_midi.remove(&addr);
            }
        }
    }

    async fn send_midi(
        &mut self,
        transport: &TransportPair,
        events: &UnboundedSender<ServerEvent>,
        id: u32,
        midi: Vec<MidiEvent>,
    ) {
        let outputs = match self.peers.get_mut(&id) {
            Some(slot) => match slot.peer.send_midi(&midi) {
                Ok(outputs) => outputs,
                Err(err) => {
                    debug!("peer {id} not ready: {err}");
                    return;
                }
            },
            None => {
                warn!("midi for unknown peer {id}");
                return;
            }
        };
        self.dispatch(transport, events, id, outputs).await;
    }

    async fn send_midi_to_all(
        &mut self,
        transport: &TransportPair,
        events: &UnboundedSender<ServerEvent>,
        midi: Vec<MidiEvent>,
    ) {
        let connected: Vec<u32> = self
            .peers
            .iter()
            .filter(|(_, slot)| slot.peer.is_connected())
            .map(|(&id, _)| id)
            .collect();
        for id in connected {
            self.send_midi(transport, events, id, midi.clone()).await;
        }
    }

    async fn shutdown(&mut self, transport: &TransportPair, events: &UnboundedSender<ServerEvent>) {
        let ids: Vec<u32> = self.peers.keys().copied().collect();
        for id in ids {
            let outputs = match self.peers.get_mut(&id) {
                Some(slot) => slot.peer.send_goodbye(),
                None => continue,
            };
            self.dispatch(transport, events, id, outputs).await;
        }
    }
}
