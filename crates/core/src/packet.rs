//! Packets and the cursors that fill and drain them.
//!
//! A packet is the unit of transport: a fixed-capacity payload buffer of
//! `max_packet_size` bytes plus the metadata the multiplexer needs to route
//! and order it.
//!
//! # Ownership
//!
//! Packets move by value. Whoever holds a `Packet` (the pool's free stack, a
//! pipe's in-flight queue, a slave's receive queue, or a pipe's active
//! read/write buffer) owns it exclusively; handing it on is a move.
//!
//! # Cursors
//!
//! `PacketWriter` appends raw native-endian bytes of any `bytemuck::Pod` value.
//! It resets the packet size when created and records the final size when
//! dropped. `PacketReader` reads the same values back; every read is bounds
//! checked against the packet size.

use crate::error::{PacketError, Result};
use bytemuck::Pod;
use std::mem::size_of;

/// A fixed-capacity payload buffer routed by pipe ID.
#[derive(Debug)]
pub struct Packet {
    /// Payload storage; its length is the packet capacity
    buf: Box<[u8]>,

    /// Bytes of `buf` actually in use (packetSize)
    len: usize,

    /// Destination pipe
    pipe_id: u32,

    /// Byte offset of this payload within its pipe's stream
    stream_pos: u32,
}

impl Packet {
    /// Allocate an empty packet with `capacity` payload bytes.
    ///
    /// Outside tests, packets come from `Multiplexer::new_packet`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            pipe_id: 0,
            stream_pos: 0,
        }
    }

    /// Maximum payload bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Payload bytes in use.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes still free.
    pub fn remaining_capacity(&self) -> usize {
        self.buf.len() - self.len
    }

    /// The used part of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole payload buffer, for filling in place before `set_len`.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Set the number of payload bytes in use.
    ///
    /// # Errors
    /// `PacketError::Overflow` if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.buf.len() {
            return Err(PacketError::Overflow {
                requested: len,
                available: self.buf.len(),
                capacity: self.buf.len(),
            }
            .into());
        }
        self.len = len;
        Ok(())
    }

    /// Append bytes after the used part of the payload.
    ///
    /// Returns how many bytes fit; the rest of `data` is left for the caller.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining_capacity());
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    pub fn pipe_id(&self) -> u32 {
        self.pipe_id
    }

    pub fn stream_pos(&self) -> u32 {
        self.stream_pos
    }

    /// Stamp routing metadata; done by the multiplexer on send and receive.
    pub(crate) fn set_route(&mut self, pipe_id: u32, stream_pos: u32) {
        self.pipe_id = pipe_id;
        self.stream_pos = stream_pos;
    }

    /// Forget contents and routing; used when a packet returns to the pool.
    pub(crate) fn reset(&mut self) {
        self.len = 0;
        self.pipe_id = 0;
        self.stream_pos = 0;
    }

    /// Start writing from the beginning of the payload.
    pub fn writer(&mut self) -> PacketWriter<'_> {
        PacketWriter::new(self)
    }

    /// Start reading from the beginning of the payload.
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self)
    }
}

/// Write cursor over a packet's payload.
///
/// Creating a writer empties the packet. Dropping it (or calling `finish`)
/// sets the packet size to the number of bytes written.
pub struct PacketWriter<'a> {
    packet: &'a mut Packet,
    pos: usize,
}

impl<'a> PacketWriter<'a> {
    pub fn new(packet: &'a mut Packet) -> Self {
        packet.len = 0;
        Self { packet, pos: 0 }
    }

    /// Append the raw bytes of a single value.
    pub fn write<T: Pod>(&mut self, value: T) -> Result<()> {
        self.write_bytes(bytemuck::bytes_of(&value))
    }

    /// Append the raw bytes of a slice of values.
    pub fn write_slice<T: Pod>(&mut self, values: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice(values))
    }

    /// Append raw bytes.
    ///
    /// # Errors
    /// `PacketError::Overflow` if the bytes do not fit; nothing is written.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let available = self.remaining();
        if bytes.len() > available {
            return Err(PacketError::Overflow {
                requested: bytes.len(),
                available,
                capacity: self.packet.capacity(),
            }
            .into());
        }
        self.packet.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes that still fit.
    pub fn remaining(&self) -> usize {
        self.packet.capacity() - self.pos
    }

    /// Record the size now and release the packet.
    pub fn finish(self) -> usize {
        self.pos
    }
}

impl Drop for PacketWriter<'_> {
    fn drop(&mut self) {
        self.packet.len = self.pos;
    }
}

/// Read cursor over the used part of a packet's payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(packet: &'a Packet) -> Self {
        Self {
            data: packet.payload(),
            pos: 0,
        }
    }

    /// Read one value.
    pub fn read<T: Pod>(&mut self) -> Result<T> {
        let bytes = self.read_bytes(size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Fill `values` from the packet.
    pub fn read_into<T: Pod>(&mut self, values: &mut [T]) -> Result<()> {
        let bytes = self.read_bytes(std::mem::size_of_val(values))?;
        bytemuck::cast_slice_mut::<T, u8>(values).copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow the next `count` bytes.
    ///
    /// # Errors
    /// `PacketError::OutOfBounds` if fewer than `count` bytes remain; the
    /// cursor does not move.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let available = self.remaining();
        if count > available {
            return Err(PacketError::OutOfBounds {
                requested: count,
                available,
            }
            .into());
        }
        let bytes = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    /// Borrow everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once the cursor reached the packet size.
    pub fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }
}
