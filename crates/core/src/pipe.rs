//! `ClusterPipe`: one logical channel through the multiplexer.
//!
//! A cluster pipe owns a pipe ID and two independent coupling flags. While a
//! side is coupled, master and slaves perform the same calls in the same
//! order and the master's results are replayed to the slaves. While a side is
//! decoupled, every node acts on its own and slaves may not touch that side
//! except to couple it again.

use crate::collective::{GatherOp, Gatherable};
use crate::error::{PipeError, Result, Side};
use crate::multiplexer::Multiplexer;
use crate::packet::Packet;
use std::sync::Arc;

/// Capabilities shared by every pipe built on a `ClusterPipe`.
///
/// Concrete pipes provide access to their `ClusterPipe` and may override
/// `flush_pipe` and `couple`.
pub trait PipeChannel {
    fn cluster_pipe(&self) -> &ClusterPipe;

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe;

    fn multiplexer(&self) -> &Arc<Multiplexer> {
        self.cluster_pipe().multiplexer()
    }

    fn pipe_id(&self) -> u32 {
        self.cluster_pipe().pipe_id()
    }

    fn is_master(&self) -> bool {
        self.cluster_pipe().is_master()
    }

    fn num_nodes(&self) -> usize {
        self.cluster_pipe().num_nodes()
    }

    fn node_index(&self) -> usize {
        self.cluster_pipe().node_index()
    }

    fn is_read_coupled(&self) -> bool {
        self.cluster_pipe().is_read_coupled()
    }

    fn is_write_coupled(&self) -> bool {
        self.cluster_pipe().is_write_coupled()
    }

    /// Push buffered master-side data to the multiplexer now.
    fn flush_pipe(&mut self) -> Result<()> {
        Ok(())
    }

    /// Change the coupling state. Legal in any state, on any node.
    fn couple(&mut self, read_coupled: bool, write_coupled: bool) -> Result<()> {
        self.cluster_pipe_mut().couple(read_coupled, write_coupled);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.cluster_pipe().barrier()
    }

    fn gather<T: Gatherable>(&self, value: T, op: GatherOp) -> Result<T>
    where
        Self: Sized,
    {
        self.cluster_pipe().gather(value, op)
    }
}

/// A pipe ID plus coupling state. Closes the pipe ID when dropped.
#[derive(Debug)]
pub struct ClusterPipe {
    multiplexer: Arc<Multiplexer>,
    pipe_id: u32,
    read_coupled: bool,
    write_coupled: bool,
}

impl ClusterPipe {
    /// Open the next pipe on `multiplexer`, fully coupled.
    pub fn open(multiplexer: &Arc<Multiplexer>) -> Result<Self> {
        let pipe_id = multiplexer.open_pipe()?;
        Ok(Self {
            multiplexer: Arc::clone(multiplexer),
            pipe_id,
            read_coupled: true,
            write_coupled: true,
        })
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    pub fn pipe_id(&self) -> u32 {
        self.pipe_id
    }

    pub fn is_master(&self) -> bool {
        self.multiplexer.is_master()
    }

    pub fn num_nodes(&self) -> usize {
        self.multiplexer.num_nodes()
    }

    pub fn node_index(&self) -> usize {
        self.multiplexer.node_index()
    }

    pub fn is_read_coupled(&self) -> bool {
        self.read_coupled
    }

    pub fn is_write_coupled(&self) -> bool {
        self.write_coupled
    }

    pub fn is_coupled(&self, side: Side) -> bool {
        match side {
            Side::Read => self.read_coupled,
            Side::Write => self.write_coupled,
        }
    }

    pub fn couple(&mut self, read_coupled: bool, write_coupled: bool) {
        self.read_coupled = read_coupled;
        self.write_coupled = write_coupled;
    }

    /// Fail with `PipeError::Decoupled` if this is a slave and `side` is
    /// decoupled.
    pub fn check_slave_access(&self, side: Side) -> Result<()> {
        if !self.is_master() && !self.is_coupled(side) {
            return Err(PipeError::Decoupled {
                pipe_id: self.pipe_id,
                side,
            }
            .into());
        }
        Ok(())
    }

    /// Whether the master must replay results for `side` to the slaves.
    pub fn forwards(&self, side: Side) -> bool {
        self.is_master() && self.num_nodes() > 1 && self.is_coupled(side)
    }

    pub fn new_packet(&self) -> Packet {
        self.multiplexer.new_packet()
    }

    pub fn delete_packet(&self, packet: Packet) {
        self.multiplexer.delete_packet(packet);
    }

    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        self.multiplexer.send_packet(self.pipe_id, packet)
    }

    pub fn receive_packet(&self) -> Result<Packet> {
        self.multiplexer.receive_packet(self.pipe_id)
    }

    pub fn barrier(&self) -> Result<()> {
        self.multiplexer.barrier(self.pipe_id)
    }

    pub fn gather<T: Gatherable>(&self, value: T, op: GatherOp) -> Result<T> {
        self.multiplexer.gather(self.pipe_id, value, op)
    }
}

impl PipeChannel for ClusterPipe {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self
    }
}

impl Drop for ClusterPipe {
    fn drop(&mut self) {
        self.multiplexer.close_pipe(self.pipe_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::error::Error;
    use crate::network::{LoopbackNetwork, NetworkConfig};

    fn single_node() -> Arc<Multiplexer> {
        let net = LoopbackNetwork::new(1, NetworkConfig::perfect(1));
        Multiplexer::new(ClusterConfig::for_node(1, 0), net.endpoint(0)).unwrap()
    }

    #[test]
    fn test_initially_coupled() {
        let mux = single_node();
        let pipe = ClusterPipe::open(&mux).unwrap();
        assert!(pipe.is_read_coupled());
        assert!(pipe.is_write_coupled());
        assert_eq!(pipe.pipe_id(), 1);
        assert!(PipeChannel::is_master(&pipe));
    }

    #[test]
    fn test_coupling_states() {
        let mux = single_node();
        let mut pipe = ClusterPipe::open(&mux).unwrap();
        for (read, write) in [(false, true), (true, false), (false, false), (true, true)] {
            pipe.couple(read, write);
            assert_eq!(pipe.is_read_coupled(), read);
            assert_eq!(pipe.is_write_coupled(), write);
        }
    }

    #[test]
    fn test_master_never_forwards_alone() {
        let mux = single_node();
        let pipe = ClusterPipe::open(&mux).unwrap();
        assert!(!pipe.forwards(Side::Read));
        assert!(pipe.check_slave_access(Side::Read).is_ok());
    }

    #[test]
    fn test_slave_decoupled_access_rejected() {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(1));
        let slave = Multiplexer::new(ClusterConfig::for_node(2, 1), net.endpoint(1)).unwrap();
        let mut pipe = ClusterPipe::open(&slave).unwrap();

        pipe.couple(false, true);
        assert!(matches!(
            pipe.check_slave_access(Side::Read),
            Err(Error::Pipe(PipeError::Decoupled { side: Side::Read, .. }))
        ));
        assert!(pipe.check_slave_access(Side::Write).is_ok());
    }

    #[test]
    fn test_gather_through_trait() {
        let mux = single_node();
        let pipe = ClusterPipe::open(&mux).unwrap();
        assert_eq!(PipeChannel::gather(&pipe, 5i64, GatherOp::Max).unwrap(), 5);
        PipeChannel::barrier(&pipe).unwrap();
    }
}
