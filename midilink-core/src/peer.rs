//! AppleMIDI session peer: two-channel handshake, clock sync, sequencing,
//! and MIDI packet I/O.
//!
//! The peer performs no I/O of its own. The host feeds inbound datagrams
//! through [`RtpPeer::data_ready`] and receives [`PeerOutput`] values back:
//! packets to emit through whatever transport owns the peer, decoded MIDI,
//! and lifecycle notifications. Timeouts and send cadence also belong to
//! the host.

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::{BufferError, ByteReader, ByteWriter};
use crate::midi::{self, MidiEvent};

/// The only AppleMIDI protocol version in the wild.
pub const PROTOCOL_VERSION: u32 = 2;

const SIGNATURE: u16 = 0xFFFF;
const RTP_MIDI_PAYLOAD_TYPE: u8 = 0x61;

// Command codes are the two ASCII characters read as a big-endian u16.
const CMD_IN: u16 = 0x494E;
const CMD_OK: u16 = 0x4F4B;
const CMD_NO: u16 = 0x4E4F;
const CMD_BY: u16 = 0x4259;
const CMD_CK: u16 = 0x434B;
const CMD_RS: u16 = 0x5253;

/// Which of the session's two UDP channels a datagram belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Control,
    Midi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    NotConnected,
    ControlConnected,
    MidiConnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Goodbye,
    Rejected,
    ProtocolViolation,
}

/// What the host must do after feeding the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutput {
    /// Emit a datagram on the given channel.
    Packet { port: PortKind, data: Vec<u8> },
    /// Decoded inbound MIDI events, in wire order.
    Midi(Vec<MidiEvent>),
    /// Both channels completed the IN/OK handshake.
    Connected { remote_name: String },
    /// The session ended; the owner should drop the peer. Emitted once.
    Closed(CloseReason),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer is not connected")]
    NotConnected,
}

/// One remote RTP-MIDI session, initiator or responder role.
pub struct RtpPeer {
    local_name: String,
    remote_name: String,
    status: PeerStatus,
    initiator: bool,
    local_ssrc: u32,
    remote_ssrc: u32,
    initiator_token: u32,
    seq_nr: u16,
    remote_seq_nr: u16,
    seq_nr_ack: u16,
    timestamp_origin: Instant,
    latency: u64,
    closed: bool,
}

impl RtpPeer {
    /// A peer that will invite the remote side.
    pub fn initiator(local_name: impl Into<String>) -> Self {
        Self::new(local_name.into(), true)
    }

    /// A peer that answers a remote invitation.
    pub fn responder(local_name: impl Into<String>) -> Self {
        Self::new(local_name.into(), false)
    }

    fn new(local_name: String, initiator: bool) -> Self {
        let seq_nr = rand::random::<u16>();
        Self {
            local_name,
            remote_name: String::new(),
            status: PeerStatus::NotConnected,
            initiator,
            local_ssrc: rand::random(),
            remote_ssrc: 0,
            initiator_token: if initiator { rand::random() } else { 0 },
            seq_nr,
            remote_seq_nr: 0,
            seq_nr_ack: seq_nr,
            timestamp_origin: Instant::now(),
            latency: 0,
            closed: false,
        }
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    pub fn remote_ssrc(&self) -> u32 {
        self.remote_ssrc
    }

    pub fn initiator_token(&self) -> u32 {
        self.initiator_token
    }

    pub fn seq_nr(&self) -> u16 {
        self.seq_nr
    }

    pub fn remote_seq_nr(&self) -> u16 {
        self.remote_seq_nr
    }

    pub fn seq_nr_ack(&self) -> u16 {
        self.seq_nr_ack
    }

    /// Smoothed one-way latency estimate, in 100 microsecond ticks.
    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Session time in 100 microsecond ticks since peer creation.
    pub fn timestamp(&self) -> u64 {
        self.timestamp_origin.elapsed().as_millis() as u64 * 10
    }

    /// Start the initiator handshake by inviting the remote control channel.
    pub fn invite(&mut self) -> Vec<PeerOutput> {
        match self.command_packet(CMD_IN, self.initiator_token, true) {
            Ok(data) => vec![PeerOutput::Packet {
                port: PortKind::Control,
                data,
            }],
            Err(err) => {
                warn!("cannot build invitation: {err}");
                Vec::new()
            }
        }
    }

    /// Start a clock-sync round on the MIDI channel. Used by the initiator
    /// for the periodic latency refresh while connected.
    pub fn send_clock_sync(&mut self) -> Vec<PeerOutput> {
        match self.clock_packet(0, self.timestamp(), 0, 0) {
            Ok(data) => vec![PeerOutput::Packet {
                port: PortKind::Midi,
                data,
            }],
            Err(err) => {
                warn!("cannot build clock sync: {err}");
                Vec::new()
            }
        }
    }

    /// Encode events into one RTP MIDI packet. Requires `Connected`;
    /// `seq_nr` advances exactly once per emitted packet.
    pub fn send_midi(&mut self, events: &[MidiEvent]) -> Result<Vec<PeerOutput>, PeerError> {
        if self.status != PeerStatus::Connected {
            return Err(PeerError::NotConnected);
        }
        let mut payload = [0u8; 128];
        let mut writer = ByteWriter::new(&mut payload);
        midi::encode_payload(events, &mut writer);
        let midi_len = writer.position();
        if midi_len == 0 {
            return Ok(Vec::new());
        }

        let next_seq = self.seq_nr.wrapping_add(1);
        let mut raw = [0u8; 160];
        let mut w = ByteWriter::new(&mut raw);
        let built = (|| -> Result<(), BufferError> {
            w.write_u8(0x80)?;
            w.write_u8(RTP_MIDI_PAYLOAD_TYPE)?;
            w.write_u16(next_seq)?;
            w.write_u32(self.timestamp() as u32)?;
            w.write_u32(self.local_ssrc)?;
            if midi_len < 0x10 {
                w.write_u8(midi_len as u8)?;
            } else {
                w.write_u8(0x80 | ((midi_len >> 8) as u8 & 0x0F))?;
                w.write_u8((midi_len & 0xFF) as u8)?;
            }
            w.write_bytes(&payload[..midi_len])
        })();
        match built {
            Ok(()) => {
                self.seq_nr = next_seq;
                Ok(vec![PeerOutput::Packet {
                    port: PortKind::Midi,
                    data: w.written().to_vec(),
                }])
            }
            Err(err) => {
                warn!("cannot build RTP MIDI packet: {err}");
                Ok(Vec::new())
            }
        }
    }

    /// Close the session, telling the remote side on the control channel.
    pub fn send_goodbye(&mut self) -> Vec<PeerOutput> {
        if self.closed {
            return Vec::new();
        }
        let mut outputs = Vec::new();
        match self.command_packet(CMD_BY, self.initiator_token, false) {
            Ok(data) => outputs.push(PeerOutput::Packet {
                port: PortKind::Control,
                data,
            }),
            Err(err) => warn!("cannot build goodbye: {err}"),
        }
        outputs.extend(self.terminate(CloseReason::Goodbye));
        outputs
    }

    /// Feed one inbound datagram from the given channel.
    pub fn data_ready(&mut self, port: PortKind, data: &[u8]) -> Vec<PeerOutput> {
        if self.closed {
            return Vec::new();
        }
        if data.len() >= 4 && data[0] == 0xFF && data[1] == 0xFF {
            self.parse_command(port, data)
        } else if port == PortKind::Midi {
            self.parse_midi(data)
        } else {
            warn!(
                "unexpected non-command packet on control channel ({} bytes)",
                data.len()
            );
            Vec::new()
        }
    }

    fn parse_command(&mut self, port: PortKind, data: &[u8]) -> Vec<PeerOutput> {
        let mut r = ByteReader::new(data);
        let result = (|| -> Result<Vec<PeerOutput>, BufferError> {
            r.skip(2)?; // signature, checked by the caller
            let command = r.read_u16()?;
            Ok(match command {
                CMD_OK => self.on_accepted(port, &mut r)?,
                CMD_IN => self.on_invitation(port, &mut r)?,
                CMD_CK => self.on_clock_sync(port, &mut r)?,
                CMD_BY => self.on_goodbye(&mut r)?,
                CMD_NO => self.on_rejected(&mut r)?,
                CMD_RS => self.on_feedback(&mut r)?,
                other => {
                    warn!("unknown command {other:#06x}, dropping packet");
                    Vec::new()
                }
            })
        })();
        result.unwrap_or_else(|err| {
            warn!("dropping malformed command packet: {err}");
            Vec::new()
        })
    }

    /// OK while we are the initiator: the remote accepted an invitation.
    fn on_accepted(
        &mut self,
        port: PortKind,
        r: &mut ByteReader<'_>,
    ) -> Result<Vec<PeerOutput>, BufferError> {
        let protocol = r.read_u32()?;
        let token = r.read_u32()?;
        let ssrc = r.read_u32()?;
        let name = r.read_cstring()?;
        if protocol != PROTOCOL_VERSION {
            warn!("remote speaks protocol {protocol}, expected {PROTOCOL_VERSION}");
            return Ok(self.terminate(CloseReason::ProtocolViolation));
        }
        if !self.initiator {
            warn!("accept without a pending invitation");
            return Ok(self.terminate(CloseReason::ProtocolViolation));
        }
        if token != self.initiator_token {
            warn!("accept for an unknown initiator token, not connecting");
            return Ok(self.terminate(CloseReason::ProtocolViolation));
        }
        match (port, self.status) {
            (PortKind::Control, PeerStatus::NotConnected) => {
                self.remote_ssrc = ssrc;
                self.remote_name = name;
                self.status = PeerStatus::ControlConnected;
                info!(
                    "{} accepted on control, inviting midi channel",
                    self.remote_name
                );
                Ok(vec![PeerOutput::Packet {
                    port: PortKind::Midi,
                    data: self.command_packet(CMD_IN, self.initiator_token, true)?,
                }])
            }
            (PortKind::Midi, PeerStatus::ControlConnected) => {
                self.status = PeerStatus::Connected;
                info!("{} accepted on midi, session established", self.remote_name);
                Ok(vec![
                    PeerOutput::Packet {
                        port: PortKind::Midi,
                        data: self.clock_packet(0, self.timestamp(), 0, 0)?,
                    },
                    PeerOutput::Connected {
                        remote_name: self.remote_name.clone(),
                    },
                ])
            }
            (PortKind::Midi, PeerStatus::NotConnected) => {
                warn!("accept on midi before control");
                Ok(self.terminate(CloseReason::ProtocolViolation))
            }
            _ => {
                debug!("duplicate accept on {port:?}, ignoring");
                Ok(Vec::new())
            }
        }
    }

    /// IN while we are the responder: a remote initiator wants a session.
    fn on_invitation(
        &mut self,
        port: PortKind,
        r: &mut ByteReader<'_>,
    ) -> Result<Vec<PeerOutput>, BufferError> {
        let protocol = r.read_u32()?;
        let token = r.read_u32()?;
        let ssrc = r.read_u32()?;
        let name = r.read_cstring()?;
        if protocol != PROTOCOL_VERSION {
            warn!("invitation with protocol {protocol}, expected {PROTOCOL_VERSION}");
            return Ok(self.terminate(CloseReason::ProtocolViolation));
        }
        if self.initiator {
            warn!("invitation received by an initiating peer");
            return Ok(self.terminate(CloseReason::ProtocolViolation));
        }
        let accept = |peer: &Self| -> Result<Vec<PeerOutput>, BufferError> {
            Ok(vec![PeerOutput::Packet {
                port,
                data: peer.command_packet(CMD_OK, token, true)?,
            }])
        };
        match (port, self.status) {
            (PortKind::Control, PeerStatus::NotConnected) => {
                self.initiator_token = token;
                self.remote_ssrc = ssrc;
                self.remote_name = name;
                self.status = PeerStatus::ControlConnected;
                info!("connection request from {}", self.remote_name);
                accept(self)
            }
            (PortKind::Midi, PeerStatus::ControlConnected) => {
                if token != self.initiator_token {
                    warn!("midi invitation with a different token, not connecting");
                    return Ok(self.terminate(CloseReason::ProtocolViolation));
                }
                self.status = PeerStatus::Connected;
                info!("session established with {}", self.remote_name);
                let mut outputs = accept(self)?;
                outputs.push(PeerOutput::Connected {
                    remote_name: self.remote_name.clone(),
                });
                Ok(outputs)
            }
            // Datagram retransmits: answer again, change nothing.
            (PortKind::Control, _) | (PortKind::Midi, PeerStatus::Connected)
                if token == self.initiator_token =>
            {
                debug!("repeated invitation on {port:?}");
                accept(self)
            }
            _ => {
                warn!("invitation on {port:?} in state {:?}", self.status);
                Ok(self.terminate(CloseReason::ProtocolViolation))
            }
        }
    }

    fn on_clock_sync(
        &mut self,
        port: PortKind,
        r: &mut ByteReader<'_>,
    ) -> Result<Vec<PeerOutput>, BufferError> {
        let _ssrc = r.read_u32()?;
        let count = r.read_u8()?;
        r.skip(3)?;
        let ts1 = r.read_u64()?;
        let ts2 = r.read_u64()?;
        let _ts3 = r.read_u64()?;
        // Clock sync only refreshes the latency estimate; it never moves
        // the session status.
        match count {
            0 => Ok(vec![PeerOutput::Packet {
                port,
                data: self.clock_packet(1, ts1, self.timestamp(), 0)?,
            }]),
            1 => {
                if !self.initiator {
                    debug!("clock answer while not initiating a round, ignoring");
                    return Ok(Vec::new());
                }
                if self.status != PeerStatus::Connected {
                    debug!("clock answer before the handshake finished, ignoring");
                    return Ok(Vec::new());
                }
                let ts3 = self.timestamp();
                self.update_latency(ts3.saturating_sub(ts1) / 2);
                Ok(vec![PeerOutput::Packet {
                    port,
                    data: self.clock_packet(2, ts1, ts2, ts3)?,
                }])
            }
            2 => {
                if self.status == PeerStatus::Connected {
                    self.update_latency(self.timestamp().saturating_sub(ts2) / 2);
                }
                Ok(Vec::new())
            }
            other => {
                warn!("bad clock sync count {other}, ignoring");
                Ok(Vec::new())
            }
        }
    }

    fn on_goodbye(&mut self, r: &mut ByteReader<'_>) -> Result<Vec<PeerOutput>, BufferError> {
        let protocol = r.read_u32()?;
        let _token = r.read_u32()?;
        let ssrc = r.read_u32()?;
        if protocol != PROTOCOL_VERSION {
            warn!("goodbye with protocol {protocol}, dropping");
            return Ok(Vec::new());
        }
        if ssrc != self.remote_ssrc {
            warn!("goodbye for a different session ({ssrc:#010x}), ignoring");
            return Ok(Vec::new());
        }
        info!("{} said goodbye", self.remote_name);
        Ok(self.terminate(CloseReason::Goodbye))
    }

    fn on_rejected(&mut self, r: &mut ByteReader<'_>) -> Result<Vec<PeerOutput>, BufferError> {
        let _protocol = r.read_u32()?;
        let _token = r.read_u32()?;
        let ssrc = r.read_u32()?;
        warn!("invitation rejected by remote ssrc {ssrc:#010x}");
        Ok(self.terminate(CloseReason::Rejected))
    }

    /// Receiver feedback: the remote acknowledges our stream up to a
    /// sequence number. Without a journal there is nothing to retransmit.
    fn on_feedback(&mut self, r: &mut ByteReader<'_>) -> Result<Vec<PeerOutput>, BufferError> {
        let _ssrc = r.read_u32()?;
        self.seq_nr_ack = r.read_u16()?;
        debug!(
            "feedback: remote has our stream up to {} / {}",
            self.seq_nr_ack, self.seq_nr
        );
        Ok(Vec::new())
    }

    fn parse_midi(&mut self, data: &[u8]) -> Vec<PeerOutput> {
        let result = (|| -> Result<Vec<PeerOutput>, BufferError> {
            let mut r = ByteReader::new(data);
            let _flags = r.read_u8()?;
            let payload_type = r.read_u8()?;
            if payload_type != RTP_MIDI_PAYLOAD_TYPE {
                warn!("packet is not RTP MIDI (type {payload_type:#04x}), ignoring");
                return Ok(Vec::new());
            }
            let seq = r.read_u16()?;
            let _timestamp = r.read_u32()?;
            let ssrc = r.read_u32()?;
            if ssrc != self.remote_ssrc {
                warn!("RTP MIDI from unknown ssrc {ssrc:#010x}, ignoring");
                return Ok(Vec::new());
            }
            if self.status != PeerStatus::Connected {
                warn!("RTP MIDI before the session is established, dropping");
                return Ok(Vec::new());
            }
            self.remote_seq_nr = seq;
            let header = r.read_u8()?;
            let length = if header & 0x80 != 0 {
                (usize::from(header & 0x0F) << 8) | usize::from(r.read_u8()?)
            } else {
                usize::from(header & 0x0F)
            };
            let payload = r.read_bytes(length)?;
            // A journal, if flagged, trails the command section; we recover
            // nothing from it, so the remaining bytes are skipped.
            let (events, err) = midi::decode_payload(payload);
            if let Some(err) = err {
                warn!("partial midi decode from {}: {err}", self.remote_name);
            }
            Ok(if events.is_empty() {
                Vec::new()
            } else {
                vec![PeerOutput::Midi(events)]
            })
        })();
        result.unwrap_or_else(|err| {
            warn!("dropping malformed RTP MIDI packet: {err}");
            Vec::new()
        })
    }

    fn update_latency(&mut self, sample: u64) {
        self.latency = if self.latency == 0 {
            sample
        } else {
            (self.latency + sample) / 2
        };
        debug!(
            "latency to {}: {:.1} ms",
            self.remote_name,
            self.latency as f64 / 10.0
        );
    }

    fn terminate(&mut self, reason: CloseReason) -> Vec<PeerOutput> {
        self.status = PeerStatus::NotConnected;
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        vec![PeerOutput::Closed(reason)]
    }

    fn command_packet(
        &self,
        command: u16,
        token: u32,
        with_name: bool,
    ) -> Result<Vec<u8>, BufferError> {
        let mut raw = [0u8; 256];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(SIGNATURE)?;
        w.write_u16(command)?;
        w.write_u32(PROTOCOL_VERSION)?;
        w.write_u32(token)?;
        w.write_u32(self.local_ssrc)?;
        if with_name {
            w.write_cstring(&self.local_name)?;
        }
        Ok(w.written().to_vec())
    }

    fn clock_packet(&self, count: u8, ts1: u64, ts2: u64, ts3: u64) -> Result<Vec<u8>, BufferError> {
        let mut raw = [0u8; 36];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(SIGNATURE)?;
        w.write_u16(CMD_CK)?;
        w.write_u32(self.local_ssrc)?;
        w.write_u8(count)?;
        w.write_bytes(&[0u8; 3])?;
        w.write_u64(ts1)?;
        w.write_u64(ts2)?;
        w.write_u64(ts3)?;
        Ok(w.written().to_vec())
    }
}

/// Whether a datagram is an AppleMIDI invitation. Server transports use
/// this to decide when an unknown source address starts a new session.
pub fn is_invitation(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == 0xFF
        && data[1] == 0xFF
        && u16::from_be_bytes([data[2], data[3]]) == CMD_IN
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deliver queued packets back and forth until both sides go quiet,
    /// collecting the non-packet outputs of each peer.
    fn pump(
        initiator: &mut RtpPeer,
        responder: &mut RtpPeer,
        outputs: Vec<PeerOutput>,
    ) -> (Vec<PeerOutput>, Vec<PeerOutput>) {
        let mut to_responder: Vec<(PortKind, Vec<u8>)> = Vec::new();
        let mut to_initiator: Vec<(PortKind, Vec<u8>)> = Vec::new();
        let mut initiator_notes = Vec::new();
        let mut responder_notes = Vec::new();

        let sort = |from_initiator: bool,
                        outs: Vec<PeerOutput>,
                        to_responder: &mut Vec<(PortKind, Vec<u8>)>,
                        to_initiator: &mut Vec<(PortKind, Vec<u8>)>,
                        initiator_notes: &mut Vec<PeerOutput>,
                        responder_notes: &mut Vec<PeerOutput>| {
            for out in outs {
                match out {
                    PeerOutput::Packet { port, data } => {
                        if from_initiator {
                            to_responder.push((port, data));
                        } else {
                            to_initiator.push((port, data));
                        }
                    }
                    other => {
                        if from_initiator {
                            initiator_notes.push(other);
                        } else {
                            responder_notes.push(other);
                        }
                    }
                }
            }
        };

        sort(
            true,
            outputs,
            &mut to_responder,
            &mut to_initiator,
            &mut initiator_notes,
            &mut responder_notes,
        );
        while !to_responder.is_empty() || !to_initiator.is_empty() {
            if !to_responder.is_empty() {
                let (port, data) = to_responder.remove(0);
                let outs = responder.data_ready(port, &data);
                sort(
                    false,
                    outs,
                    &mut to_responder,
                    &mut to_initiator,
                    &mut initiator_notes,
                    &mut responder_notes,
                );
            }
            if !to_initiator.is_empty() {
                let (port, data) = to_initiator.remove(0);
                let outs = initiator.data_ready(port, &data);
                sort(
                    true,
                    outs,
                    &mut to_responder,
                    &mut to_initiator,
                    &mut initiator_notes,
                    &mut responder_notes,
                );
            }
        }
        (initiator_notes, responder_notes)
    }

    fn connected_pair() -> (RtpPeer, RtpPeer) {
        let mut client = RtpPeer::initiator("client");
        let mut server = RtpPeer::responder("server");
        let invite = client.invite();
        let (client_notes, server_notes) = pump(&mut client, &mut server, invite);
        assert!(client_notes
            .iter()
            .any(|o| matches!(o, PeerOutput::Connected { .. })));
        assert!(server_notes
            .iter()
            .any(|o| matches!(o, PeerOutput::Connected { .. })));
        (client, server)
    }

    #[test]
    fn handshake_reaches_connected_on_both_sides() {
        let (client, server) = connected_pair();
        assert!(client.is_connected());
        assert!(server.is_connected());
        assert_eq!(client.remote_name(), "server");
        assert_eq!(server.remote_name(), "client");
        assert_eq!(client.remote_ssrc(), server.local_ssrc());
        assert_eq!(server.remote_ssrc(), client.local_ssrc());
        assert_eq!(server.initiator_token(), client.initiator_token());
    }

    #[test]
    fn midi_travels_between_connected_peers() {
        let (mut client, mut server) = connected_pair();
        let events = vec![
            MidiEvent::NoteOn {
                channel: 3,
                note: 60,
                velocity: 100,
            },
            MidiEvent::ControlChange {
                channel: 0,
                controller: 7,
                value: 127,
            },
        ];
        let outs = client.send_midi(&events).unwrap();
        let (_, server_notes) = pump(&mut client, &mut server, outs);
        assert_eq!(server_notes, vec![PeerOutput::Midi(events)]);
        assert_eq!(server.remote_seq_nr(), client.seq_nr());
    }

    #[test]
    fn no_midi_before_connected() {
        let mut client = RtpPeer::initiator("client");
        assert_eq!(
            client.send_midi(&[MidiEvent::ActiveSensing]),
            Err(PeerError::NotConnected)
        );
        assert_eq!(client.status(), PeerStatus::NotConnected);
    }

    #[test]
    fn seq_nr_advances_once_per_packet() {
        let (mut client, mut server) = connected_pair();
        let start = client.seq_nr();
        for _ in 0..3 {
            let outs = client
                .send_midi(&[MidiEvent::ActiveSensing])
                .unwrap();
            pump(&mut client, &mut server, outs);
        }
        assert_eq!(client.seq_nr(), start.wrapping_add(3));
    }

    #[test]
    fn goodbye_closes_both_sides_once() {
        let (mut client, mut server) = connected_pair();
        let outs = client.send_goodbye();
        assert!(outs.contains(&PeerOutput::Closed(CloseReason::Goodbye)));
        let (_, server_notes) = pump(&mut client, &mut server, outs);
        let closes = server_notes
            .iter()
            .filter(|o| matches!(o, PeerOutput::Closed(CloseReason::Goodbye)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(server.status(), PeerStatus::NotConnected);
        // A second goodbye emits nothing further.
        assert!(client.send_goodbye().is_empty());
    }

    #[test]
    fn goodbye_for_wrong_ssrc_is_ignored() {
        let (_, mut server) = connected_pair();
        let mut raw = [0u8; 16];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(0xFFFF).unwrap();
        w.write_u16(CMD_BY).unwrap();
        w.write_u32(PROTOCOL_VERSION).unwrap();
        w.write_u32(server.initiator_token()).unwrap();
        w.write_u32(server.remote_ssrc().wrapping_add(1)).unwrap();
        let outs = server.data_ready(PortKind::Control, w.written());
        assert!(outs.is_empty());
        assert!(server.is_connected());
    }

    #[test]
    fn rejection_terminates_the_peer() {
        let mut client = RtpPeer::initiator("client");
        client.invite();
        let mut raw = [0u8; 16];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(0xFFFF).unwrap();
        w.write_u16(CMD_NO).unwrap();
        w.write_u32(PROTOCOL_VERSION).unwrap();
        w.write_u32(client.initiator_token()).unwrap();
        w.write_u32(0x1234).unwrap();
        let outs = client.data_ready(PortKind::Control, w.written());
        assert_eq!(outs, vec![PeerOutput::Closed(CloseReason::Rejected)]);
    }

    #[test]
    fn token_mismatch_during_handshake_terminates() {
        let mut server = RtpPeer::responder("server");
        let invitation = |token: u32, port: PortKind, peer: &mut RtpPeer| {
            let mut raw = [0u8; 64];
            let mut w = ByteWriter::new(&mut raw);
            w.write_u16(0xFFFF).unwrap();
            w.write_u16(CMD_IN).unwrap();
            w.write_u32(PROTOCOL_VERSION).unwrap();
            w.write_u32(token).unwrap();
            w.write_u32(0xABCD).unwrap();
            w.write_cstring("client").unwrap();
            peer.data_ready(port, w.written())
        };
        let outs = invitation(7, PortKind::Control, &mut server);
        assert!(matches!(outs.as_slice(), [PeerOutput::Packet { .. }]));
        assert_eq!(server.status(), PeerStatus::ControlConnected);
        let outs = invitation(8, PortKind::Midi, &mut server);
        assert_eq!(
            outs,
            vec![PeerOutput::Closed(CloseReason::ProtocolViolation)]
        );
    }

    #[test]
    fn clock_sync_echoes_ts1() {
        let (_, mut server) = connected_pair();
        let mut raw = [0u8; 36];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(0xFFFF).unwrap();
        w.write_u16(CMD_CK).unwrap();
        w.write_u32(0xABCD).unwrap();
        w.write_u8(0).unwrap();
        w.write_bytes(&[0u8; 3]).unwrap();
        w.write_u64(0x0102030405060708).unwrap();
        w.write_u64(0).unwrap();
        w.write_u64(0).unwrap();
        let outs = server.data_ready(PortKind::Midi, w.written());
        match outs.as_slice() {
            [PeerOutput::Packet { port, data }] => {
                assert_eq!(*port, PortKind::Midi);
                assert_eq!(data[8], 1, "count must be 1");
                assert_eq!(&data[12..20], &0x0102030405060708u64.to_be_bytes());
            }
            other => panic!("expected one clock packet, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_clock_count_is_ignored() {
        let (mut client, _) = connected_pair();
        let mut raw = [0u8; 36];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(0xFFFF).unwrap();
        w.write_u16(CMD_CK).unwrap();
        w.write_u32(0xABCD).unwrap();
        w.write_u8(9).unwrap();
        w.write_bytes(&[0u8; 3]).unwrap();
        w.write_u64(0).unwrap();
        w.write_u64(0).unwrap();
        w.write_u64(0).unwrap();
        assert!(client.data_ready(PortKind::Midi, w.written()).is_empty());
        assert!(client.is_connected());
    }

    #[test]
    fn truncated_command_is_dropped_without_state_change() {
        let mut server = RtpPeer::responder("server");
        let outs = server.data_ready(PortKind::Control, &[0xFF, 0xFF, 0x49, 0x4E, 0x00]);
        assert!(outs.is_empty());
        assert_eq!(server.status(), PeerStatus::NotConnected);
    }

    #[test]
    fn midi_from_unknown_ssrc_is_dropped() {
        let (mut client, mut server) = connected_pair();
        let outs = client.send_midi(&[MidiEvent::ActiveSensing]).unwrap();
        let packet = match outs.into_iter().next() {
            Some(PeerOutput::Packet { data, .. }) => data,
            other => panic!("expected packet, got {other:?}"),
        };
        let mut forged = packet.clone();
        forged[8..12].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        assert!(server.data_ready(PortKind::Midi, &forged).is_empty());
        // The original packet still goes through.
        assert_eq!(
            server.data_ready(PortKind::Midi, &packet),
            vec![PeerOutput::Midi(vec![MidiEvent::ActiveSensing])]
        );
    }

    #[test]
    fn feedback_updates_ack_high_water() {
        let (mut client, _) = connected_pair();
        let mut raw = [0u8; 12];
        let mut w = ByteWriter::new(&mut raw);
        w.write_u16(0xFFFF).unwrap();
        w.write_u16(CMD_RS).unwrap();
        w.write_u32(client.remote_ssrc()).unwrap();
        w.write_u16(4242).unwrap();
        w.write_u16(0).unwrap();
        assert!(client.data_ready(PortKind::Control, w.written()).is_empty());
        assert_eq!(client.seq_nr_ack(), 4242);
    }

    #[test]
    fn long_form_payload_length_is_accepted() {
        let (mut client, mut server) = connected_pair();
        // 17 events of 3 bytes force the two-byte length form (51 bytes).
        let events: Vec<MidiEvent> = (0..17)
            .map(|n| MidiEvent::NoteOn {
                channel: 0,
                note: n,
                velocity: 1,
            })
            .collect();
        let outs = client.send_midi(&events).unwrap();
        let (_, server_notes) = pump(&mut client, &mut server, outs);
        assert_eq!(server_notes, vec![PeerOutput::Midi(events)]);
    }

    #[test]
    fn invitation_detection() {
        assert!(is_invitation(&[0xFF, 0xFF, 0x49, 0x4E, 0x00]));
        assert!(!is_invitation(&[0xFF, 0xFF, 0x4F, 0x4B]));
        assert!(!is_invitation(&[0x80, 0x61, 0x00, 0x00]));
    }
}
