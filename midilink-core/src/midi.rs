//! Structured MIDI events and the running-status codec for RTP payloads.

use thiserror::Error;
use tracing::warn;

use crate::buffer::{BufferError, ByteReader, ByteWriter};

/// One channel-voice or system MIDI event. Channels are 0-15; pitch bend is
/// the signed value centered at 0 (the wire carries it biased by 8192).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    PolyKeyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    PitchBend { channel: u8, value: i16 },
    ActiveSensing,
    /// Payload bytes between the 0xF0/0xF7 delimiters.
    Sysex(Vec<u8>),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported midi status byte {0:#04x}")]
    UnknownStatus(u8),
    #[error("data byte {0:#04x} without a running status")]
    OrphanData(u8),
    #[error("midi payload truncated")]
    Truncated,
    #[error("event does not fit in the outbound buffer")]
    Overflow,
}

impl From<BufferError> for CodecError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Underflow => CodecError::Truncated,
            BufferError::Overflow => CodecError::Overflow,
        }
    }
}

/// Decode a running-status MIDI byte stream, as carried in an RTP MIDI
/// command section. Decoding stops at the first unsupported or truncated
/// event; everything decoded up to that point is still returned.
pub fn decode_payload(payload: &[u8]) -> (Vec<MidiEvent>, Option<CodecError>) {
    let mut reader = ByteReader::new(payload);
    let mut status: Option<u8> = None;
    let mut events = Vec::new();
    while reader.remaining() > 0 {
        match decode_event(&mut reader, &mut status) {
            Ok(event) => events.push(event),
            Err(err) => return (events, Some(err)),
        }
    }
    (events, None)
}

fn decode_event(
    reader: &mut ByteReader<'_>,
    status: &mut Option<u8>,
) -> Result<MidiEvent, CodecError> {
    let first = reader.peek_u8()?;
    let current = if first & 0x80 != 0 {
        reader.read_u8()?;
        *status = Some(first);
        first
    } else {
        // Data byte: reuse the running status, leaving the byte unread.
        (*status).ok_or(CodecError::OrphanData(first))?
    };

    if current == 0xF0 {
        let mut data = Vec::new();
        while reader.remaining() > 0 {
            let byte = reader.read_u8()?;
            if byte == 0xF7 {
                break;
            }
            data.push(byte);
        }
        return Ok(MidiEvent::Sysex(data));
    }
    if current == 0xFE {
        return Ok(MidiEvent::ActiveSensing);
    }

    let channel = current & 0x0F;
    match current & 0xF0 {
        0x80 => Ok(MidiEvent::NoteOff {
            channel,
            note: reader.read_u8()?,
            velocity: reader.read_u8()?,
        }),
        0x90 => Ok(MidiEvent::NoteOn {
            channel,
            note: reader.read_u8()?,
            velocity: reader.read_u8()?,
        }),
        0xA0 => Ok(MidiEvent::PolyKeyPressure {
            channel,
            note: reader.read_u8()?,
            pressure: reader.read_u8()?,
        }),
        0xB0 => Ok(MidiEvent::ControlChange {
            channel,
            controller: reader.read_u8()?,
            value: reader.read_u8()?,
        }),
        0xC0 => Ok(MidiEvent::ProgramChange {
            channel,
            program: reader.read_u8()?,
        }),
        0xD0 => Ok(MidiEvent::ChannelPressure {
            channel,
            pressure: reader.read_u8()?,
        }),
        0xE0 => {
            let lsb = reader.read_u8()?;
            let msb = reader.read_u8()?;
            let value = ((i16::from(msb) << 7) | i16::from(lsb)) - 8192;
            Ok(MidiEvent::PitchBend { channel, value })
        }
        _ => Err(CodecError::UnknownStatus(current)),
    }
}

/// Encode one event with a full status byte; running status is never used on
/// the outbound wire. The writer is untouched when the event does not fit.
pub fn encode_event(event: &MidiEvent, writer: &mut ByteWriter<'_>) -> Result<(), CodecError> {
    let needed = match event {
        MidiEvent::ProgramChange { .. } | MidiEvent::ChannelPressure { .. } => 2,
        MidiEvent::ActiveSensing => 1,
        MidiEvent::Sysex(data) => data.len() + 2,
        _ => 3,
    };
    if writer.remaining() < needed {
        return Err(CodecError::Overflow);
    }
    match event {
        MidiEvent::NoteOn {
            channel,
            note,
            velocity,
        } => {
            writer.write_u8(0x90 | (channel & 0x0F))?;
            writer.write_u8(*note)?;
            writer.write_u8(*velocity)?;
        }
        MidiEvent::NoteOff {
            channel,
            note,
            velocity,
        } => {
            writer.write_u8(0x80 | (channel & 0x0F))?;
            writer.write_u8(*note)?;
            writer.write_u8(*velocity)?;
        }
        MidiEvent::PolyKeyPressure {
            channel,
            note,
            pressure,
        } => {
            writer.write_u8(0xA0 | (channel & 0x0F))?;
            writer.write_u8(*note)?;
            writer.write_u8(*pressure)?;
        }
        MidiEvent::ControlChange {
            channel,
            controller,
            value,
        } => {
            writer.write_u8(0xB0 | (channel & 0x0F))?;
            writer.write_u8(*controller)?;
            writer.write_u8(*value)?;
        }
        MidiEvent::ProgramChange { channel, program } => {
            writer.write_u8(0xC0 | (channel & 0x0F))?;
            writer.write_u8(*program)?;
        }
        MidiEvent::ChannelPressure { channel, pressure } => {
            writer.write_u8(0xD0 | (channel & 0x0F))?;
            writer.write_u8(*pressure)?;
        }
        MidiEvent::PitchBend { channel, value } => {
            let biased = (i32::from(*value) + 8192) as u16;
            writer.write_u8(0xE0 | (channel & 0x0F))?;
            writer.write_u8((biased & 0x7F) as u8)?;
            writer.write_u8(((biased >> 7) & 0x7F) as u8)?;
        }
        MidiEvent::ActiveSensing => {
            writer.write_u8(0xFE)?;
        }
        MidiEvent::Sysex(data) => {
            writer.write_u8(0xF0)?;
            writer.write_bytes(data)?;
            writer.write_u8(0xF7)?;
        }
    }
    Ok(())
}

/// Encode a batch of events into `writer`. Events that do not fit are
/// dropped with a warning; the count of encoded events is returned.
pub fn encode_payload(events: &[MidiEvent], writer: &mut ByteWriter<'_>) -> usize {
    let mut encoded = 0;
    for event in events {
        match encode_event(event, writer) {
            Ok(()) => encoded += 1,
            Err(err) => warn!("dropping midi event: {err}"),
        }
    }
    encoded
}
