//! Error types for the cluster pipe system.
//!
//! All operations return structured errors rather than panicking. Errors that
//! a master observes while touching a real resource are forwarded to slaves,
//! so both the message and the `io::ErrorKind` must survive a trip over the
//! wire (see `replay`).

use std::io;
use thiserror::Error;

/// Top-level error type for all operations in the system.
///
/// Each variant corresponds to a specific failure domain:
/// - Packet: cursor bounds, wire decoding
/// - Transport: lost nodes, shutdown, diagnostic timeouts
/// - Pipe: protocol misuse (decoupled slaves, wrong role, stray records)
/// - Open: a resource could not be opened (identical on every node)
/// - I/O: resource reads and writes
#[derive(Debug, Error)]
pub enum Error {
    /// Packet cursor or wire format error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Unrecoverable transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Pipe protocol violation
    #[error("pipe error: {0}")]
    Pipe(#[from] PipeError),

    /// The underlying file, directory or socket could not be opened
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Resource I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the error means the cluster can no longer run in lock-step.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(TransportError::NodeLost { .. }))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Open { source, .. } => source,
            Error::Transport(TransportError::NodeLost { .. }) => {
                io::Error::new(io::ErrorKind::ConnectionAborted, err)
            }
            Error::Pipe(PipeError::Decoupled { .. }) => {
                io::Error::new(io::ErrorKind::Unsupported, err)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Packet cursor and wire errors.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Read past the used part of a packet
    #[error("read out of bounds: requested {requested} bytes, {available} available")]
    OutOfBounds { requested: usize, available: usize },

    /// Write past the packet capacity
    #[error("packet overflow: requested {requested} bytes, {available} of {capacity} left")]
    Overflow {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    /// Datagram is too short to contain a valid header
    #[error("datagram too short: need at least {required} bytes, got {actual}")]
    TooShort { required: usize, actual: usize },

    /// Datagram payload exceeds the configured maximum packet size
    #[error("payload size {size} exceeds maximum packet size {max}")]
    ExceedsMaxSize { size: usize, max: usize },

    /// Unknown control message kind
    #[error("unknown control message kind {0}")]
    UnknownControl(u8),

    /// Text field is not valid UTF-8
    #[error("invalid UTF-8 in packet text field")]
    InvalidText,
}

/// Transport errors. Transient packet loss never shows up here.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A cluster node stopped responding or left; lock-step execution is over
    #[error("cluster node {node} lost: {reason}")]
    NodeLost { node: usize, reason: String },

    /// The multiplexer has been shut down
    #[error("multiplexer is shut down")]
    ShutDown,

    /// A collective operation exceeded the diagnostic timeout
    #[error("collective operation on pipe {pipe_id} still incomplete after {waited_ms}ms")]
    CollectiveTimeout { pipe_id: u32, waited_ms: u64 },
}

/// Which half of a pipe an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Read => f.write_str("read"),
            Side::Write => f.write_str("write"),
        }
    }
}

/// Pipe protocol misuse.
#[derive(Debug, Error)]
pub enum PipeError {
    /// A slave used a decoupled side for anything but re-coupling
    #[error("pipe {pipe_id}: {side} side is decoupled on this slave")]
    Decoupled { pipe_id: u32, side: Side },

    /// Operation may only be performed on the master node
    #[error("{0} is only valid on the master node")]
    MasterOnly(&'static str),

    /// Operation may only be performed on slave nodes
    #[error("{0} is only valid on slave nodes")]
    SlaveOnly(&'static str),

    /// No pipe with this ID is open on the multiplexer
    #[error("unknown pipe {0}")]
    UnknownPipe(u32),

    /// A slave received a record that does not match the current operation
    #[error("unexpected record: expected {expected}, got tag {found}")]
    UnexpectedRecord { expected: &'static str, found: u8 },

    /// Gather operator is not defined for the value type
    #[error("gather operator {op:?} is not supported for {type_name}")]
    UnsupportedGatherOp {
        op: crate::collective::GatherOp,
        type_name: &'static str,
    },
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_converts_to_source_kind() {
        let err = Error::Open {
            path: "missing.bin".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(err.to_string(), "failed to open missing.bin: gone");

        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_node_lost_is_fatal() {
        let err: Error = TransportError::NodeLost {
            node: 2,
            reason: "silent".to_string(),
        }
        .into();
        assert!(err.is_fatal());

        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_decoupled_message_names_side() {
        let err = PipeError::Decoupled {
            pipe_id: 7,
            side: Side::Write,
        };
        assert_eq!(err.to_string(), "pipe 7: write side is decoupled on this slave");
    }
}
