//! Datagram wire format.
//!
//! Every datagram starts with the same 8-byte header. Pipe ID 0 is reserved
//! for control traffic between multiplexers; any other pipe ID marks a data
//! datagram whose payload is the packet contents.
//!
//! # Datagram Format
//!
//! ```text
//! +-------------------+
//! | pipe_id (4)       |  u32, 0 = control
//! +-------------------+
//! | stream_pos (4)    |  u32 byte offset of payload in the pipe stream
//! +-------------------+
//! | payload           |  1..=max_packet_size bytes (length implied)
//! | (variable)        |
//! +-------------------+
//! ```
//!
//! # Control Messages
//!
//! ```text
//! kind (1) | fields
//!   1 ACK        pipe_id u32, next_pos u32
//!   2 HEARTBEAT
//!   3 ARRIVE     pipe_id u32, seq u32, value u64
//!   4 RELEASE    pipe_id u32, seq u32, value u64
//!   5 ABORT      lost_node u32
//!   6 LEAVE
//! ```
//!
//! All integers are little-endian.

use crate::error::{PacketError, Result};

/// Size of the datagram header in bytes
pub const HEADER_SIZE: usize = 8;

/// Pipe ID reserved for control messages
pub const CONTROL_PIPE: u32 = 0;

const KIND_ACK: u8 = 1;
const KIND_HEARTBEAT: u8 = 2;
const KIND_ARRIVE: u8 = 3;
const KIND_RELEASE: u8 = 4;
const KIND_ABORT: u8 = 5;
const KIND_LEAVE: u8 = 6;

/// Messages exchanged between multiplexers on the control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Slave has every byte of `pipe_id` before `next_pos`
    Ack { pipe_id: u32, next_pos: u32 },

    /// Sender is alive
    Heartbeat,

    /// Slave entered collective `seq` on `pipe_id` with `value`
    Arrive { pipe_id: u32, seq: u32, value: u64 },

    /// Collective `seq` on `pipe_id` completed with `value`
    Release { pipe_id: u32, seq: u32, value: u64 },

    /// Master lost `lost_node`; the cluster is finished
    Abort { lost_node: u32 },

    /// Sender is shutting down cleanly
    Leave,
}

/// A decoded datagram borrowing from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Datagram<'a> {
    Data {
        pipe_id: u32,
        stream_pos: u32,
        payload: &'a [u8],
    },
    Control(ControlMessage),
}

/// Encode a data datagram into `out` (cleared first).
pub fn encode_data(pipe_id: u32, stream_pos: u32, payload: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(HEADER_SIZE + payload.len());
    out.extend_from_slice(&pipe_id.to_le_bytes());
    out.extend_from_slice(&stream_pos.to_le_bytes());
    out.extend_from_slice(payload);
}

/// Encode a control datagram into `out` (cleared first).
pub fn encode_control(message: &ControlMessage, out: &mut Vec<u8>) {
    out.clear();
    out.extend_from_slice(&CONTROL_PIPE.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    match *message {
        ControlMessage::Ack { pipe_id, next_pos } => {
            out.push(KIND_ACK);
            out.extend_from_slice(&pipe_id.to_le_bytes());
            out.extend_from_slice(&next_pos.to_le_bytes());
        }
        ControlMessage::Heartbeat => out.push(KIND_HEARTBEAT),
        ControlMessage::Arrive {
            pipe_id,
            seq,
            value,
        } => {
            out.push(KIND_ARRIVE);
            out.extend_from_slice(&pipe_id.to_le_bytes());
            out.extend_from_slice(&seq.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        ControlMessage::Release {
            pipe_id,
            seq,
            value,
        } => {
            out.push(KIND_RELEASE);
            out.extend_from_slice(&pipe_id.to_le_bytes());
            out.extend_from_slice(&seq.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        ControlMessage::Abort { lost_node } => {
            out.push(KIND_ABORT);
            out.extend_from_slice(&lost_node.to_le_bytes());
        }
        ControlMessage::Leave => out.push(KIND_LEAVE),
    }
}

/// Decode a datagram.
///
/// # Errors
/// - `PacketError::TooShort` if the header or control fields are truncated
/// - `PacketError::ExceedsMaxSize` if a data payload is empty or too large
/// - `PacketError::UnknownControl` for an unknown control kind
pub fn decode(bytes: &[u8], max_packet_size: usize) -> Result<Datagram<'_>> {
    let pipe_id = read_u32(bytes, 0)?;
    let stream_pos = read_u32(bytes, 4)?;
    let body = &bytes[HEADER_SIZE..];

    if pipe_id != CONTROL_PIPE {
        if body.is_empty() || body.len() > max_packet_size {
            return Err(PacketError::ExceedsMaxSize {
                size: body.len(),
                max: max_packet_size,
            }
            .into());
        }
        return Ok(Datagram::Data {
            pipe_id,
            stream_pos,
            payload: body,
        });
    }

    let kind = *body.first().ok_or(PacketError::TooShort {
        required: HEADER_SIZE + 1,
        actual: bytes.len(),
    })?;
    let fields = &body[1..];

    let message = match kind {
        KIND_ACK => ControlMessage::Ack {
            pipe_id: read_u32(fields, 0)?,
            next_pos: read_u32(fields, 4)?,
        },
        KIND_HEARTBEAT => ControlMessage::Heartbeat,
        KIND_ARRIVE => ControlMessage::Arrive {
            pipe_id: read_u32(fields, 0)?,
            seq: read_u32(fields, 4)?,
            value: read_u64(fields, 8)?,
        },
        KIND_RELEASE => ControlMessage::Release {
            pipe_id: read_u32(fields, 0)?,
            seq: read_u32(fields, 4)?,
            value: read_u64(fields, 8)?,
        },
        KIND_ABORT => ControlMessage::Abort {
            lost_node: read_u32(fields, 0)?,
        },
        KIND_LEAVE => ControlMessage::Leave,
        other => return Err(PacketError::UnknownControl(other).into()),
    };

    Ok(Datagram::Control(message))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let field: [u8; 4] = bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(PacketError::TooShort {
            required: offset + 4,
            actual: bytes.len(),
        })?;
    Ok(u32::from_le_bytes(field))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let field: [u8; 8] = bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or(PacketError::TooShort {
            required: offset + 8,
            actual: bytes.len(),
        })?;
    Ok(u64::from_le_bytes(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_data_layout_is_bit_exact() {
        let mut out = Vec::new();
        encode_data(0x0102_0304, 0x0A0B_0C0D, b"xy", &mut out);
        assert_eq!(
            out,
            vec![0x04, 0x03, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A, b'x', b'y']
        );

        let decoded = decode(&out, 100).unwrap();
        assert_eq!(
            decoded,
            Datagram::Data {
                pipe_id: 0x0102_0304,
                stream_pos: 0x0A0B_0C0D,
                payload: b"xy",
            }
        );
    }

    #[test]
    fn test_control_messages_decode() {
        let messages = [
            ControlMessage::Ack {
                pipe_id: 3,
                next_pos: 4096,
            },
            ControlMessage::Heartbeat,
            ControlMessage::Arrive {
                pipe_id: 1,
                seq: 9,
                value: u64::MAX,
            },
            ControlMessage::Release {
                pipe_id: 1,
                seq: 9,
                value: 42,
            },
            ControlMessage::Abort { lost_node: 2 },
            ControlMessage::Leave,
        ];

        let mut out = Vec::new();
        for message in messages {
            encode_control(&message, &mut out);
            assert_eq!(decode(&out, 100).unwrap(), Datagram::Control(message));
        }
    }

    #[test]
    fn test_truncated_header() {
        let result = decode(&[1, 0, 0], 100);
        assert!(matches!(
            result,
            Err(Error::Packet(PacketError::TooShort { .. }))
        ));
    }

    #[test]
    fn test_truncated_control_fields() {
        let mut out = Vec::new();
        encode_control(
            &ControlMessage::Ack {
                pipe_id: 1,
                next_pos: 2,
            },
            &mut out,
        );
        out.truncate(out.len() - 1);
        assert!(decode(&out, 100).is_err());
    }

    #[test]
    fn test_oversized_and_empty_payloads_rejected() {
        let mut out = Vec::new();
        encode_data(1, 0, &[0u8; 11], &mut out);
        assert!(matches!(
            decode(&out, 10),
            Err(Error::Packet(PacketError::ExceedsMaxSize { size: 11, max: 10 }))
        ));

        encode_data(1, 0, &[], &mut out);
        assert!(decode(&out, 10).is_err());
    }

    #[test]
    fn test_unknown_control_kind() {
        let mut out = vec![0u8; HEADER_SIZE];
        out.push(0xEE);
        assert!(matches!(
            decode(&out, 10),
            Err(Error::Packet(PacketError::UnknownControl(0xEE)))
        ));
    }
}
