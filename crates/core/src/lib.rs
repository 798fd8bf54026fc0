//! cluster-pipe-core: master/slave replay of I/O across a cluster
//!
//! This library lets every node of a cluster run the same program in
//! lock-step while only one node, the master, touches real resources:
//! - A multiplexer carries packets from the master to every slave reliably
//!   and in order over an unreliable datagram network
//! - Cluster pipes add coupling state and collective operations (barrier,
//!   gather) on top of numbered channels
//! - Multicast pipes turn a channel into a byte stream
//! - File, directory and TCP pipes perform each operation on the master and
//!   replay its result, or its error, on every slave
//!
//! # Architecture
//!
//! - `packet`: Fixed-capacity packets with checked read/write cursors
//! - `pool`: Packet recycling
//! - `wire`: Datagram header and control message codec
//! - `network`: Datagram transports (seeded loopback simulator, UDP)
//! - `reorder`: In-order delivery on slaves
//! - `collective`: Gather operators and deterministic reduction
//! - `multiplexer`: Acknowledgment, retransmission, liveness, collectives
//! - `pipe`: `ClusterPipe` and the `PipeChannel` capability trait
//! - `multicast`: Byte stream pipe
//! - `replay`: Forwarding resource results and errors to slaves
//! - `file`, `directory`, `tcp`: Shared resources and their entry points
//! - `config`, `metrics`: Deployment settings and counters
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and recoverable
//! - **Identical views**: Slaves observe exactly the bytes, values and errors
//!   the master observed, in the same order
//! - **Loud failure**: Losing a node ends lock-step execution with an error on
//!   every surviving node instead of a hang
//! - **Deterministic**: Seeded network simulation makes runs reproducible

pub mod collective;
pub mod config;
pub mod directory;
pub mod error;
pub mod file;
pub mod metrics;
pub mod multicast;
pub mod multiplexer;
pub mod network;
pub mod packet;
pub mod pipe;
pub mod pool;
pub mod reorder;
mod replay;
pub mod tcp;
pub mod wire;

// Re-export commonly used types
pub use collective::{GatherOp, Gatherable};
pub use config::ClusterConfig;
pub use directory::{open_directory, DirectoryResource, EntryType};
pub use error::{Error, Result};
pub use file::{open_file, OpenMode, SeekableResource};
pub use multicast::MulticastPipe;
pub use multiplexer::Multiplexer;
pub use network::{LoopbackNetwork, NetworkConfig, Transport};
pub use packet::{Packet, PacketReader, PacketWriter};
pub use pipe::{ClusterPipe, PipeChannel};
pub use tcp::{open_tcp_pipe, NetResource};
