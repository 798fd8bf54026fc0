//! Replaying master-side resource results to slaves.
//!
//! Resource pipes (files, directories, sockets) perform every operation for
//! real on the master only. After each operation the master sends exactly one
//! record describing the outcome; a slave performing the same operation
//! receives that record and returns the identical value or an equivalent
//! error. Both sides therefore take the same control-flow branch.
//!
//! # Record Layout
//!
//! Each record fills one packet and starts with a tag byte:
//!
//! ```text
//! VALUE  1  u64
//! DATA   2  raw bytes up to the end of the packet (none = end of stream)
//! TEXT   3  u16 length, UTF-8
//! ENTRY  4  entry type u8, u16 length, UTF-8 name
//! END    5
//! ERROR  6  io::ErrorKind code u8, u16 length, UTF-8 message
//! ```
//!
//! Values use the host byte order like every other packet cursor write.

use crate::error::{Error, PacketError, PipeError, Result, Side};
use crate::multiplexer::Multiplexer;
use crate::packet::{Packet, PacketReader, PacketWriter};
use crate::pipe::ClusterPipe;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) const TAG_VALUE: u8 = 1;
pub(crate) const TAG_DATA: u8 = 2;
pub(crate) const TAG_TEXT: u8 = 3;
pub(crate) const TAG_ENTRY: u8 = 4;
pub(crate) const TAG_END: u8 = 5;
pub(crate) const TAG_ERROR: u8 = 6;

/// Bytes of a DATA record before the payload.
pub(crate) const DATA_OFFSET: usize = 1;

/// A decoded record.
#[derive(Debug)]
pub(crate) enum Record {
    Value(u64),
    /// The received packet; payload starts at `DATA_OFFSET`
    Data(Packet),
    Text(String),
    Entry(u8, String),
    End,
    Failure(io::ErrorKind, String),
}

impl Record {
    fn tag(&self) -> u8 {
        match self {
            Record::Value(_) => TAG_VALUE,
            Record::Data(_) => TAG_DATA,
            Record::Text(_) => TAG_TEXT,
            Record::Entry(..) => TAG_ENTRY,
            Record::End => TAG_END,
            Record::Failure(..) => TAG_ERROR,
        }
    }

    pub(crate) fn unexpected(&self, expected: &'static str) -> Error {
        PipeError::UnexpectedRecord {
            expected,
            found: self.tag(),
        }
        .into()
    }
}

/// A result type a master can replay.
pub(crate) trait Replayable: Sized {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()>;

    fn decode(record: Record) -> Result<Self>;
}

impl Replayable for u64 {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        writer.write(TAG_VALUE)?;
        writer.write(*self)
    }

    fn decode(record: Record) -> Result<Self> {
        match record {
            Record::Value(value) => Ok(value),
            other => Err(other.unexpected("value")),
        }
    }
}

impl Replayable for usize {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        (*self as u64).encode(writer)
    }

    fn decode(record: Record) -> Result<Self> {
        u64::decode(record).map(|value| value as usize)
    }
}

impl Replayable for bool {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        u64::from(*self).encode(writer)
    }

    fn decode(record: Record) -> Result<Self> {
        u64::decode(record).map(|value| value != 0)
    }
}

impl Replayable for () {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        0u64.encode(writer)
    }

    fn decode(record: Record) -> Result<Self> {
        u64::decode(record).map(|_| ())
    }
}

impl Replayable for String {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        writer.write(TAG_TEXT)?;
        write_text(writer, self)
    }

    fn decode(record: Record) -> Result<Self> {
        match record {
            Record::Text(text) => Ok(text),
            other => Err(other.unexpected("text")),
        }
    }
}

impl Replayable for SocketAddr {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        self.to_string().encode(writer)
    }

    fn decode(record: Record) -> Result<Self> {
        String::decode(record)?
            .parse()
            .map_err(|_| PacketError::InvalidText.into())
    }
}

pub(crate) fn write_text(writer: &mut PacketWriter<'_>, text: &str) -> Result<()> {
    let len = u16::try_from(text.len()).map_err(|_| PacketError::Overflow {
        requested: text.len(),
        available: u16::MAX as usize,
        capacity: u16::MAX as usize,
    })?;
    writer.write(len)?;
    writer.write_bytes(text.as_bytes())
}

pub(crate) fn read_text(reader: &mut PacketReader<'_>) -> Result<String> {
    let len = reader.read::<u16>()? as usize;
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidText.into())
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a char.
fn truncate_to(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn encode_failure(writer: &mut PacketWriter<'_>, err: &io::Error) -> Result<()> {
    writer.write(TAG_ERROR)?;
    writer.write(kind_to_code(err.kind()))?;
    let message = err.to_string();
    let room = writer.remaining().saturating_sub(2);
    write_text(writer, truncate_to(&message, room))
}

/// Wire code for an `io::ErrorKind`; unknown kinds travel as `Other`.
pub(crate) fn kind_to_code(kind: io::ErrorKind) -> u8 {
    use io::ErrorKind::*;
    match kind {
        NotFound => 1,
        PermissionDenied => 2,
        ConnectionRefused => 3,
        ConnectionReset => 4,
        ConnectionAborted => 5,
        NotConnected => 6,
        AddrInUse => 7,
        AddrNotAvailable => 8,
        BrokenPipe => 9,
        AlreadyExists => 10,
        WouldBlock => 11,
        InvalidInput => 12,
        InvalidData => 13,
        TimedOut => 14,
        WriteZero => 15,
        Interrupted => 16,
        Unsupported => 17,
        UnexpectedEof => 18,
        OutOfMemory => 19,
        _ => 0,
    }
}

pub(crate) fn code_to_kind(code: u8) -> io::ErrorKind {
    use io::ErrorKind::*;
    match code {
        1 => NotFound,
        2 => PermissionDenied,
        3 => ConnectionRefused,
        4 => ConnectionReset,
        5 => ConnectionAborted,
        6 => NotConnected,
        7 => AddrInUse,
        8 => AddrNotAvailable,
        9 => BrokenPipe,
        10 => AlreadyExists,
        11 => WouldBlock,
        12 => InvalidInput,
        13 => InvalidData,
        14 => TimedOut,
        15 => WriteZero,
        16 => Interrupted,
        17 => Unsupported,
        18 => UnexpectedEof,
        19 => OutOfMemory,
        _ => Other,
    }
}

fn parse(packet: &Packet) -> Result<Option<Record>> {
    let mut reader = packet.reader();
    let tag = reader.read::<u8>()?;
    let record = match tag {
        TAG_VALUE => Record::Value(reader.read::<u64>()?),
        TAG_DATA => return Ok(None),
        TAG_TEXT => Record::Text(read_text(&mut reader)?),
        TAG_ENTRY => {
            let entry_type = reader.read::<u8>()?;
            Record::Entry(entry_type, read_text(&mut reader)?)
        }
        TAG_END => Record::End,
        TAG_ERROR => {
            let kind = code_to_kind(reader.read::<u8>()?);
            Record::Failure(kind, read_text(&mut reader)?)
        }
        found => {
            return Err(PipeError::UnexpectedRecord {
                expected: "record tag",
                found,
            }
            .into())
        }
    };
    Ok(Some(record))
}

/// How a replayed `io::Error` is reported.
#[derive(Debug, Clone)]
pub(crate) enum ErrorContext {
    /// Opening the resource at this path
    Open(String),
    /// Any other resource operation
    Io,
}

impl ErrorContext {
    pub(crate) fn wrap(&self, err: io::Error) -> Error {
        match self {
            ErrorContext::Open(path) => Error::Open {
                path: path.clone(),
                source: err,
            },
            ErrorContext::Io => Error::Io(err),
        }
    }
}

/// A cluster pipe that carries one record per resource operation.
#[derive(Debug)]
pub(crate) struct ReplayChannel {
    pipe: ClusterPipe,
}

impl ReplayChannel {
    pub(crate) fn open(multiplexer: &Arc<Multiplexer>) -> Result<Self> {
        Ok(Self {
            pipe: ClusterPipe::open(multiplexer)?,
        })
    }

    pub(crate) fn pipe(&self) -> &ClusterPipe {
        &self.pipe
    }

    pub(crate) fn pipe_mut(&mut self) -> &mut ClusterPipe {
        &mut self.pipe
    }

    /// Largest DATA payload that fits in one record.
    pub(crate) fn max_chunk(&self) -> usize {
        self.pipe.multiplexer().max_packet_size() - DATA_OFFSET
    }

    fn send_record(&self, encode: impl FnOnce(&mut PacketWriter<'_>) -> Result<()>) -> Result<()> {
        let mut packet = self.pipe.new_packet();
        let encoded = {
            let mut writer = packet.writer();
            encode(&mut writer)
        };
        match encoded {
            Ok(()) => self.pipe.send_packet(packet),
            Err(e) => {
                self.pipe.delete_packet(packet);
                Err(e)
            }
        }
    }

    /// Master: forward `result` if `side` is coupled, then hand it back with
    /// errors wrapped according to `context`.
    pub(crate) fn forward<T: Replayable>(
        &self,
        side: Side,
        result: io::Result<T>,
        context: &ErrorContext,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                if self.pipe.forwards(side) {
                    self.send_record(|writer| value.encode(writer))?;
                }
                Ok(value)
            }
            Err(e) => Err(self.forward_error(side, e, context)),
        }
    }

    /// Master: forward a failed operation and return the wrapped error.
    pub(crate) fn forward_error(&self, side: Side, err: io::Error, context: &ErrorContext) -> Error {
        if self.pipe.forwards(side) {
            if let Err(send_failed) = self.send_record(|writer| encode_failure(writer, &err)) {
                return send_failed;
            }
        }
        context.wrap(err)
    }

    /// Master: forward a data chunk (empty = end of stream).
    pub(crate) fn forward_data(
        &self,
        side: Side,
        result: io::Result<Vec<u8>>,
        context: &ErrorContext,
    ) -> Result<Vec<u8>> {
        match result {
            Ok(data) => {
                if self.pipe.forwards(side) {
                    self.send_record(|writer| {
                        writer.write(TAG_DATA)?;
                        writer.write_bytes(&data)
                    })?;
                }
                Ok(data)
            }
            Err(e) => Err(self.forward_error(side, e, context)),
        }
    }

    /// Slave: receive the next record for `side`.
    ///
    /// DATA records keep their packet; every other record is decoded and the
    /// packet recycled. Forwarded errors come back wrapped per `context`.
    pub(crate) fn receive(&self, side: Side, context: &ErrorContext) -> Result<Record> {
        self.pipe.check_slave_access(side)?;
        let packet = self.pipe.receive_packet()?;
        let parsed = parse(&packet);
        let record = match parsed {
            Ok(None) => return Ok(Record::Data(packet)),
            Ok(Some(record)) => record,
            Err(e) => {
                self.pipe.delete_packet(packet);
                return Err(e);
            }
        };
        self.pipe.delete_packet(packet);

        match record {
            Record::Failure(kind, message) => Err(context.wrap(io::Error::new(kind, message))),
            other => Ok(other),
        }
    }

    /// Slave: receive and decode a value for `side`.
    pub(crate) fn replay<T: Replayable>(&self, side: Side, context: &ErrorContext) -> Result<T> {
        let record = self.receive(side, context)?;
        if let Record::Data(packet) = record {
            self.pipe.delete_packet(packet);
            return Err(PipeError::UnexpectedRecord {
                expected: "value",
                found: TAG_DATA,
            }
            .into());
        }
        T::decode(record)
    }

    /// Slave: receive a data chunk for `side`.
    pub(crate) fn replay_data(&self, side: Side, context: &ErrorContext) -> Result<Packet> {
        match self.receive(side, context)? {
            Record::Data(packet) => Ok(packet),
            other => Err(other.unexpected("data")),
        }
    }
}

/// Bytes served to the caller between two underlying reads.
///
/// The master keeps its own copy of each chunk; slaves keep the received
/// packet itself.
#[derive(Debug, Default)]
pub(crate) struct ChunkBuffer {
    chunk: Chunk,
    pos: usize,
}

#[derive(Debug, Default)]
enum Chunk {
    #[default]
    Empty,
    Owned(Vec<u8>),
    Received(Packet),
}

impl ChunkBuffer {
    fn bytes(&self) -> &[u8] {
        match &self.chunk {
            Chunk::Empty => &[],
            Chunk::Owned(data) => data,
            Chunk::Received(packet) => &packet.payload()[DATA_OFFSET..],
        }
    }

    /// Bytes not yet handed out.
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.bytes()[self.pos..]
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Copy as much as fits into `out`.
    pub(crate) fn take_into(&mut self, out: &mut [u8]) -> usize {
        let available = self.remaining();
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        n
    }

    pub(crate) fn set_owned(&mut self, pipe: &ClusterPipe, data: Vec<u8>) {
        self.clear(pipe);
        self.chunk = Chunk::Owned(data);
    }

    pub(crate) fn set_received(&mut self, pipe: &ClusterPipe, packet: Packet) {
        self.clear(pipe);
        self.chunk = Chunk::Received(packet);
    }

    /// Drop the chunk, returning a received packet to the pool.
    pub(crate) fn clear(&mut self, pipe: &ClusterPipe) {
        if let Chunk::Received(packet) = std::mem::take(&mut self.chunk) {
            pipe.delete_packet(packet);
        }
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::network::{LoopbackNetwork, NetworkConfig};

    fn pair() -> (Arc<Multiplexer>, Arc<Multiplexer>) {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(11));
        let master = Multiplexer::new(ClusterConfig::for_node(2, 0), net.endpoint(0)).unwrap();
        let slave = Multiplexer::new(ClusterConfig::for_node(2, 1), net.endpoint(1)).unwrap();
        (master, slave)
    }

    #[test]
    fn test_error_kind_codes() {
        for kind in [
            io::ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert_eq!(code_to_kind(kind_to_code(kind)), kind);
        }
        assert_eq!(code_to_kind(200), io::ErrorKind::Other);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to("abc", 10), "abc");
        assert_eq!(truncate_to("aé", 2), "a");
    }

    #[test]
    fn test_values_and_errors_replayed() {
        let (master, slave) = pair();
        let out = ReplayChannel::open(&master).unwrap();
        let input = ReplayChannel::open(&slave).unwrap();
        let context = ErrorContext::Open("missing.bin".into());

        assert_eq!(out.forward(Side::Read, Ok(1234usize), &ErrorContext::Io).unwrap(), 1234);
        let failure: io::Result<u64> = Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        let err = out.forward(Side::Read, failure, &context).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));

        assert_eq!(input.replay::<usize>(Side::Read, &ErrorContext::Io).unwrap(), 1234);
        match input.replay::<u64>(Side::Read, &context) {
            Err(Error::Open { path, source }) => {
                assert_eq!(path, "missing.bin");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
                assert_eq!(source.to_string(), "no such file");
            }
            other => panic!("expected open error, got {:?}", other),
        }

        drop(input);
        drop(slave);
    }

    #[test]
    fn test_data_chunks_keep_packet() {
        let (master, slave) = pair();
        let out = ReplayChannel::open(&master).unwrap();
        let input = ReplayChannel::open(&slave).unwrap();

        out.forward_data(Side::Read, Ok(b"chunk".to_vec()), &ErrorContext::Io)
            .unwrap();
        out.forward(Side::Read, Ok(String::from("text")), &ErrorContext::Io)
            .unwrap();

        let packet = input.replay_data(Side::Read, &ErrorContext::Io).unwrap();
        let mut buffer = ChunkBuffer::default();
        buffer.set_received(input.pipe(), packet);
        let mut out_buf = [0u8; 3];
        assert_eq!(buffer.take_into(&mut out_buf), 3);
        assert_eq!(buffer.remaining(), b"nk");
        buffer.clear(input.pipe());
        assert!(buffer.is_exhausted());

        // A text record where data was expected is a protocol error
        assert!(matches!(
            input.replay_data(Side::Read, &ErrorContext::Io),
            Err(Error::Pipe(PipeError::UnexpectedRecord { .. }))
        ));

        drop(input);
        drop(slave);
    }
}
