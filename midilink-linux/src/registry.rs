//! Top-level coordinator: pairs discovered endpoints and local MIDI ports
//! with RTP-MIDI sessions.
//!
//! Discovered remote endpoints become local virtual ports backed by a
//! client session (created on first local subscription, released on the
//! last). Remote initiators reaching one of our servers get a virtual port
//! of their own. A local subscription to the published "Network" port
//! exports that subscriber through a dedicated server.

use std::collections::HashMap;

use midilink_core::midi::MidiEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::client::{ClientEvent, ClientEventKind, RtpClient};
use crate::mdns::{DiscoveryEvent, MdnsPublisher};
use crate::seq::{SeqEvent, SeqPort, Sequencer};
use crate::server::{RtpServer, ServerEvent, ServerEventKind};

/// A discovered remote endpoint and the client session bound to it.
struct ClientInfo {
    name: String,
    address: String,
    port: u16,
    use_count: u32,
    client: Option<RtpClient>,
}

/// One remote initiator connected to one of our servers.
struct ServerConnection {
    remote_name: String,
    server_tag: u32,
    peer: u32,
}

struct ServerEntry {
    name: String,
    server: RtpServer,
}

pub struct Registry {
    name: String,
    seq: Box<dyn Sequencer>,
    mdns: Box<dyn MdnsPublisher>,
    network_port: SeqPort,
    known_clients: HashMap<SeqPort, ClientInfo>,
    known_server_connections: HashMap<SeqPort, ServerConnection>,
    /// Subscriber port on the Network port -> export server tag.
    local_to_server: HashMap<SeqPort, u32>,
    servers: HashMap<u32, ServerEntry>,
    /// (server tag, peer id) -> virtual port exposing that peer.
    conn_ports: HashMap<(u32, u32), SeqPort>,
    next_tag: u32,
    client_tx: UnboundedSender<ClientEvent>,
    server_tx: UnboundedSender<ServerEvent>,
    client_rx: Option<UnboundedReceiver<ClientEvent>>,
    server_rx: Option<UnboundedReceiver<ServerEvent>>,
}

impl Registry {
    pub fn new(
        name: String,
        mut seq: Box<dyn Sequencer>,
        mdns: Box<dyn MdnsPublisher>,
    ) -> Self {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let network_port = seq.create_port("Network");
        Self {
            name,
            seq,
            mdns,
            network_port,
            known_clients: HashMap::new(),
            known_server_connections: HashMap::new(),
            local_to_server: HashMap::new(),
            servers: HashMap::new(),
            conn_ports: HashMap::new(),
            next_tag: 0,
            client_tx,
            server_tx,
            client_rx: Some(client_rx),
            server_rx: Some(server_rx),
        }
    }

    /// Open a responder server on `port` and announce it under the daemon
    /// name. Returns the control port actually bound.
    pub async fn add_import_server(&mut self, port: u16) -> std::io::Result<u16> {
        let tag = self.next_tag;
        self.next_tag += 1;
        let server = RtpServer::bind(self.name.clone(), port, tag, self.server_tx.clone()).await?;
        let control_port = server.control_port();
        self.mdns.announce(&self.name, control_port);
        self.servers.insert(
            tag,
            ServerEntry {
                name: self.name.clone(),
                server,
            },
        );
        Ok(control_port)
    }

    /// Drive the registry until every event source is gone.
    pub async fn run(
        mut self,
        mut seq_events: UnboundedReceiver<SeqEvent>,
        mut discovery: UnboundedReceiver<DiscoveryEvent>,
    ) {
        let (mut client_rx, mut server_rx) = match (self.client_rx.take(), self.server_rx.take()) {
            (Some(client_rx), Some(server_rx)) => (client_rx, server_rx),
            _ => return,
        };
        loop {
            tokio::select! {
                Some(event) = discovery.recv() => match event {
                    DiscoveryEvent::Discovered { name, address, port } => {
                        self.on_discovery(name, address, port);
                    }
                    DiscoveryEvent::Removed { name } => self.on_remove(&name),
                },
                Some(event) = seq_events.recv() => self.on_seq_event(event).await,
                Some(event) = client_rx.recv() => self.on_client_event(event),
                Some(event) = server_rx.recv() => self.on_server_event(event),
                else => break,
            }
        }
    }

    /// A remote endpoint was discovered (or configured): give it a virtual
    /// port. Re-announcements of a known `address:port` change nothing.
    fn on_discovery(&mut self, name: String, address: String, port: u16) {
        let duplicate = self
            .known_clients
            .values()
            .any(|c| c.address == address && c.port == port);
        if duplicate {
            debug!("rediscovered {address}:{port}, most likely an mDNS re-announce");
            return;
        }
        let seq_port = self.seq.create_port(&name);
        info!("new virtual port {seq_port} for {name} at {address}:{port}");
        self.known_clients.insert(
            seq_port,
            ClientInfo {
                name,
                address,
                port,
                use_count: 0,
                client: None,
            },
        );
    }

    /// A discovered endpoint went away. Matching is by instance name, the
    /// only key an mDNS removal carries.
    fn on_remove(&mut self, name: &str) {
        let ports: Vec<SeqPort> = self
            .known_clients
            .iter()
            .filter(|(_, info)| info.name == name)
            .map(|(&port, _)| port)
            .collect();
        if ports.is_empty() {
            debug!("removal for unknown endpoint {name}");
            return;
        }
        for port in ports {
            if let Some(info) = self.known_clients.remove(&port) {
                if let Some(client) = info.client {
                    client.goodbye();
                }
                self.seq.remove_port(port);
                info!("removed {name} (port {port})");
            }
        }
    }

    async fn on_seq_event(&mut self, event: SeqEvent) {
        match event {
            SeqEvent::Subscribed {
                port,
                subscriber_port,
                subscriber_name,
            } => {
                if port == self.network_port {
                    self.add_export_server(subscriber_port, &subscriber_name)
                        .await;
                } else {
                    self.on_local_subscribe(port).await;
                }
            }
            SeqEvent::Unsubscribed {
                port,
                subscriber_port,
            } => {
                if port == self.network_port {
                    self.remove_export_server(subscriber_port);
                } else {
                    self.on_local_unsubscribe(port);
                }
            }
            SeqEvent::Midi { port, event } => self.on_local_midi(port, event),
        }
    }

    /// First subscriber connects the session; later ones share it.
    async fn on_local_subscribe(&mut self, port: SeqPort) {
        let Some(info) = self.known_clients.get_mut(&port) else {
            debug!("subscription on unmanaged port {port}");
            return;
        };
        info.use_count += 1;
        if info.client.is_some() {
            debug!("port {port} already connected ({} users)", info.use_count);
            return;
        }
        match RtpClient::connect(
            self.name.clone(),
            &info.address,
            info.port,
            port,
            self.client_tx.clone(),
        )
        .await
        {
            Ok(client) => info.client = Some(client),
            Err(err) => warn!("cannot connect to {}:{}: {err}", info.address, info.port),
        }
    }

    fn on_local_unsubscribe(&mut self, port: SeqPort) {
        let Some(info) = self.known_clients.get_mut(&port) else {
            return;
        };
        info.use_count = info.use_count.saturating_sub(1);
        if info.use_count == 0 {
            if let Some(client) = info.client.take() {
                client.goodbye();
                info!("released session for {}", info.name);
            }
        }
    }

    /// Export a local subscriber of the Network port through its own server.
    async fn add_export_server(&mut self, subscriber_port: SeqPort, subscriber_name: &str) {
        if self.local_to_server.contains_key(&subscriber_port) {
            return;
        }
        let name = format!("{}/{}", self.name, subscriber_name);
        let tag = self.next_tag;
        self.next_tag += 1;
        match RtpServer::bind(name.clone(), 0, tag, self.server_tx.clone()).await {
            Ok(server) => {
                self.mdns.announce(&name, server.control_port());
                self.servers.insert(tag, ServerEntry { name, server });
                self.local_to_server.insert(subscriber_port, tag);
            }
            Err(err) => warn!("cannot bind export server for {subscriber_name}: {err}"),
        }
    }

    fn remove_export_server(&mut self, subscriber_port: SeqPort) {
        let Some(tag) = self.local_to_server.remove(&subscriber_port) else {
            return;
        };
        if let Some(entry) = self.servers.remove(&tag) {
            self.mdns.unannounce(&entry.name, entry.server.control_port());
            entry.server.shutdown();
            info!("unpublished {}", entry.name);
        }
        // Virtual ports owned by that server's peers go away with it.
        let gone: Vec<((u32, u32), SeqPort)> = self
            .conn_ports
            .iter()
            .filter(|((server_tag, _), _)| *server_tag == tag)
            .map(|(&key, &port)| (key, port))
            .collect();
        for (key, port) in gone {
            self.conn_ports.remove(&key);
            self.known_server_connections.remove(&port);
            self.seq.remove_port(port);
        }
    }

    /// Route a locally published event to the session behind its port.
    fn on_local_midi(&mut self, port: SeqPort, event: MidiEvent) {
        if port == self.network_port {
            // Every export server mirrors the Network port.
            for tag in self.local_to_server.values() {
                if let Some(entry) = self.servers.get(tag) {
                    entry.server.send_midi_to_all_peers(vec![event.clone()]);
                }
            }
            return;
        }
        if let Some(info) = self.known_clients.get(&port) {
            match &info.client {
                Some(client) => client.send_midi(vec![event]),
                None => warn!("midi on port {port} with no active session"),
            }
            return;
        }
        if let Some(conn) = self.known_server_connections.get(&port) {
            if let Some(entry) = self.servers.get(&conn.server_tag) {
                entry.server.send_midi(conn.peer, vec![event]);
            }
            return;
        }
        debug!("midi event on unmanaged port {port}");
    }

    fn on_client_event(&mut self, event: ClientEvent) {
        let port = event.tag;
        match event.kind {
            ClientEventKind::Connected { remote_name } => {
                info!("port {port} connected to {remote_name}");
            }
            ClientEventKind::Midi(events) => self.seq.publish(port, &events),
            ClientEventKind::Closed => {
                if let Some(info) = self.known_clients.get_mut(&port) {
                    info.client = None;
                    info.use_count = 0;
                    info!("session for {} closed", info.name);
                }
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        let key = (event.tag, event.peer);
        match event.kind {
            ServerEventKind::Connected { remote_name } => {
                let port = self.seq.create_port(&remote_name);
                info!("remote client {remote_name} exposed as port {port}");
                self.conn_ports.insert(key, port);
                self.known_server_connections.insert(
                    port,
                    ServerConnection {
                        remote_name,
                        server_tag: event.tag,
                        peer: event.peer,
                    },
                );
            }
            ServerEventKind::Midi(events) => match self.conn_ports.get(&key) {
                Some(&port) => self.seq.publish(port, &events),
                None => warn!("midi for a peer that no longer exists"),
            },
            ServerEventKind::Closed => {
                if let Some(port) = self.conn_ports.remove(&key) {
                    if let Some(conn) = self.known_server_connections.remove(&port) {
                        info!("remote client {} went away", conn.remote_name);
                    }
                    self.seq.remove_port(port);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct SeqState {
        next_port: SeqPort,
        created: Vec<(SeqPort, String)>,
        removed: Vec<SeqPort>,
        published: Vec<(SeqPort, Vec<MidiEvent>)>,
    }

    #[derive(Clone, Default)]
    struct RecordingSequencer(Arc<Mutex<SeqState>>);

    impl Sequencer for RecordingSequencer {
        fn create_port(&mut self, name: &str) -> SeqPort {
            let mut state = self.0.lock().unwrap();
            let port = state.next_port;
            state.next_port += 1;
            state.created.push((port, name.to_string()));
            port
        }

        fn remove_port(&mut self, port: SeqPort) {
            self.0.lock().unwrap().removed.push(port);
        }

        fn publish(&mut self, port: SeqPort, events: &[MidiEvent]) {
            self.0
                .lock()
                .unwrap()
                .published
                .push((port, events.to_vec()));
        }
    }

    #[derive(Clone, Default)]
    struct RecordingMdns(Arc<Mutex<Vec<(String, u16, bool)>>>);

    impl MdnsPublisher for RecordingMdns {
        fn announce(&mut self, name: &str, port: u16) {
            self.0.lock().unwrap().push((name.to_string(), port, true));
        }

        fn unannounce(&mut self, name: &str, port: u16) {
            self.0.lock().unwrap().push((name.to_string(), port, false));
        }
    }

    fn registry() -> (Registry, RecordingSequencer, RecordingMdns) {
        let seq = RecordingSequencer::default();
        let mdns = RecordingMdns::default();
        let registry = Registry::new(
            "unit".to_string(),
            Box::new(seq.clone()),
            Box::new(mdns.clone()),
        );
        (registry, seq, mdns)
    }

    #[test]
    fn network_port_is_created_up_front() {
        let (_registry, seq, _) = registry();
        let state = seq.0.lock().unwrap();
        assert_eq!(state.created, vec![(0, "Network".to_string())]);
    }

    #[test]
    fn duplicate_discovery_is_idempotent() {
        let (mut registry, seq, _) = registry();
        registry.on_discovery("foo".into(), "10.0.0.1".into(), 5004);
        registry.on_discovery("foo".into(), "10.0.0.1".into(), 5004);
        assert_eq!(registry.known_clients.len(), 1);
        // One Network port plus one discovered port.
        assert_eq!(seq.0.lock().unwrap().created.len(), 2);
    }

    #[test]
    fn same_name_different_endpoint_is_not_a_duplicate() {
        let (mut registry, _, _) = registry();
        registry.on_discovery("foo".into(), "10.0.0.1".into(), 5004);
        registry.on_discovery("foo".into(), "10.0.0.2".into(), 5004);
        assert_eq!(registry.known_clients.len(), 2);
    }

    #[test]
    fn remove_by_name_clears_port_and_table() {
        let (mut registry, seq, _) = registry();
        registry.on_discovery("foo".into(), "10.0.0.1".into(), 5004);
        registry.on_remove("foo");
        assert!(registry.known_clients.is_empty());
        assert_eq!(seq.0.lock().unwrap().removed, vec![1]);
    }

    #[tokio::test]
    async fn subscribe_connects_and_unsubscribe_releases() {
        let (mut registry, _, _) = registry();
        registry.on_discovery("foo".into(), "127.0.0.1".into(), 5004);
        let port = *registry.known_clients.keys().next().unwrap();

        registry.on_local_subscribe(port).await;
        registry.on_local_subscribe(port).await;
        let info = registry.known_clients.get(&port).unwrap();
        assert_eq!(info.use_count, 2);
        assert!(info.client.is_some());

        registry.on_local_unsubscribe(port);
        assert!(registry.known_clients.get(&port).unwrap().client.is_some());
        registry.on_local_unsubscribe(port);
        assert!(registry.known_clients.get(&port).unwrap().client.is_none());
    }

    #[tokio::test]
    async fn export_server_is_announced_and_retracted() {
        let (mut registry, _, mdns) = registry();
        registry
            .on_seq_event(SeqEvent::Subscribed {
                port: registry.network_port,
                subscriber_port: 77,
                subscriber_name: "synth".into(),
            })
            .await;
        assert_eq!(registry.local_to_server.len(), 1);
        {
            let log = mdns.0.lock().unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].0, "unit/synth");
            assert!(log[0].2);
        }

        registry
            .on_seq_event(SeqEvent::Unsubscribed {
                port: registry.network_port,
                subscriber_port: 77,
            })
            .await;
        assert!(registry.local_to_server.is_empty());
        assert!(registry.servers.is_empty());
        let log = mdns.0.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(!log[1].2);
    }

    #[tokio::test]
    async fn a_port_lives_in_at_most_one_table() {
        let (mut registry, _, _) = registry();
        registry.on_discovery("foo".into(), "10.0.0.1".into(), 5004);
        registry.on_server_event(ServerEvent {
            tag: 9,
            peer: 0,
            kind: ServerEventKind::Connected {
                remote_name: "remote".into(),
            },
        });
        for port in registry.known_clients.keys() {
            assert!(!registry.known_server_connections.contains_key(port));
            assert!(!registry.local_to_server.contains_key(port));
        }
        for port in registry.known_server_connections.keys() {
            assert!(!registry.known_clients.contains_key(port));
            assert!(!registry.local_to_server.contains_key(port));
        }
    }

    #[test]
    fn inbound_peer_midi_reaches_its_port() {
        let (mut registry, seq, _) = registry();
        registry.on_server_event(ServerEvent {
            tag: 3,
            peer: 1,
            kind: ServerEventKind::Connected {
                remote_name: "remote".into(),
            },
        });
        let events = vec![MidiEvent::NoteOn {
            channel: 0,
            note: 64,
            velocity: 80,
        }];
        registry.on_server_event(ServerEvent {
            tag: 3,
            peer: 1,
            kind: ServerEventKind::Midi(events.clone()),
        });
        let state = seq.0.lock().unwrap();
        assert_eq!(state.published, vec![(1, events)]);
    }

    #[test]
    fn closed_peer_drops_its_port() {
        let (mut registry, seq, _) = registry();
        registry.on_server_event(ServerEvent {
            tag: 3,
            peer: 1,
            kind: ServerEventKind::Connected {
                remote_name: "remote".into(),
            },
        });
        registry.on_server_event(ServerEvent {
            tag: 3,
            peer: 1,
            kind: ServerEventKind::Closed,
        });
        assert!(registry.known_server_connections.is_empty());
        assert!(registry.conn_ports.is_empty());
        assert_eq!(seq.0.lock().unwrap().removed, vec![1]);
    }

    #[test]
    fn client_close_resets_the_entry() {
        let (mut registry, _, _) = registry();
        registry.on_discovery("foo".into(), "10.0.0.1".into(), 5004);
        let port = *registry.known_clients.keys().next().unwrap();
        registry.known_clients.get_mut(&port).unwrap().use_count = 2;
        registry.on_client_event(ClientEvent {
            tag: port,
            kind: ClientEventKind::Closed,
        });
        let info = registry.known_clients.get(&port).unwrap();
        assert_eq!(info.use_count, 0);
        assert!(info.client.is_none());
    }
}
