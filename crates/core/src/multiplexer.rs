//! The multiplexer: reliable ordered pipes and collectives over datagrams.
//!
//! One multiplexer per node owns the transport to every other node, the packet
//! pool, and the bookkeeping for every pipe. Pipes are addressed only by their
//! numeric ID, so all nodes must open pipes in the same order.
//!
//! # Reliable Ordered Delivery
//!
//! - The master stamps each data packet with the byte offset of its payload
//!   in the pipe's stream and sends it to every slave
//! - Slaves deliver packets strictly in offset order (see `reorder`) and
//!   acknowledge the next offset they expect after every data datagram
//! - The master keeps each packet until every slave acknowledged it, and
//!   re-sends it to the laggards every `retransmit_timeout`
//! - A packet re-sent `max_retransmits` times without an acknowledgment, or a
//!   peer silent for `node_timeout`, means the node is lost
//!
//! # Collectives
//!
//! Slaves send `Arrive` to the master (re-sent until answered). When all N
//! contributions for a sequence number are present, the master reduces them
//! in node-index order and broadcasts `Release` with the result. A repeated
//! `Arrive` for the last completed sequence number is answered with the
//! remembered `Release`.
//!
//! # Failure
//!
//! Losing a node ends lock-step execution. The master tells the surviving
//! slaves with `Abort`, and every blocking call on every surviving node that
//! would otherwise wait returns `TransportError::NodeLost`.
//!
//! # Threads
//!
//! A background thread receives datagrams, sends acknowledgments and
//! heartbeats, and re-sends packets. Callers block on one condition variable
//! that the background thread signals whenever state changes.

use crate::collective::{self, GatherOp, Gatherable};
use crate::config::ClusterConfig;
use crate::error::{PacketError, PipeError, Result, TransportError};
use crate::metrics::MultiplexerStats;
use crate::network::{Transport, UdpTransport};
use crate::packet::Packet;
use crate::pool::{PacketPool, PoolStats};
use crate::reorder::{pos_before, InsertOutcome, ReorderBuffer};
use crate::wire::{self, ControlMessage, Datagram};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// How often a departing node repeats its `Leave` message.
const LEAVE_REPEATS: usize = 3;

/// A packet sent by the master that not every slave has acknowledged.
#[derive(Debug)]
struct InFlight {
    packet: Packet,
    /// Stream position just past this packet's payload
    end_pos: u32,
    last_sent: Instant,
    resends: u32,
}

#[derive(Debug)]
struct MasterPipe {
    /// Stream position of the next packet
    next_pos: u32,
    in_flight: VecDeque<InFlight>,
    /// Highest acknowledged position per node (index 0 unused)
    acked: Vec<u32>,
    /// Sequence number of the collective in progress
    seq: u32,
    /// Contributions to the collective in progress, by node index
    arrivals: Vec<Option<u64>>,
    /// Last completed collective, for answering repeated arrivals
    last_release: Option<(u32, u64)>,
}

#[derive(Debug)]
struct SlavePipe {
    inbound: ReorderBuffer,
    /// Sequence number of the next collective
    seq: u32,
    /// Result for `seq`, once the master released it
    release: Option<(u32, u64)>,
}

#[derive(Debug)]
enum Role {
    Master(MasterPipe),
    Slave(SlavePipe),
}

#[derive(Debug)]
struct PipeState {
    /// When the pipe was closed locally. A closed pipe stays as a tombstone
    /// until late traffic for it has settled, then it is retired.
    closed_at: Option<Instant>,
    role: Role,
}

impl PipeState {
    fn new(config: &ClusterConfig) -> Self {
        let role = if config.is_master() {
            Role::Master(MasterPipe {
                next_pos: 0,
                in_flight: VecDeque::new(),
                acked: vec![0; config.num_nodes],
                seq: 0,
                arrivals: vec![None; config.num_nodes],
                last_release: None,
            })
        } else {
            Role::Slave(SlavePipe {
                inbound: ReorderBuffer::new(config.reorder_window),
                seq: 0,
                release: None,
            })
        };
        Self {
            closed_at: None,
            role,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// A closed pipe with nothing left to deliver or re-send.
    ///
    /// Master tombstones also wait out `grace` so a slave that missed the
    /// last `Release` can still get it repeated.
    fn is_settled(&self, now: Instant, grace: Duration) -> bool {
        let Some(closed_at) = self.closed_at else {
            return false;
        };
        match &self.role {
            Role::Master(master) => {
                master.in_flight.is_empty() && now.duration_since(closed_at) >= grace
            }
            Role::Slave(slave) => slave.inbound.is_idle(),
        }
    }

    fn master_mut(&mut self) -> Option<&mut MasterPipe> {
        match &mut self.role {
            Role::Master(pipe) => Some(pipe),
            Role::Slave(_) => None,
        }
    }

    fn slave_mut(&mut self) -> Option<&mut SlavePipe> {
        match &mut self.role {
            Role::Slave(pipe) => Some(pipe),
            Role::Master(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Peer {
    last_heard: Instant,
    departed: bool,
}

#[derive(Debug)]
struct State {
    next_pipe_id: u32,
    pipes: HashMap<u32, PipeState>,
    peers: Vec<Peer>,
    /// Lost node and reason; once set, lock-step execution is over
    fatal: Option<(usize, String)>,
    shut_down: bool,
    stats: MultiplexerStats,
    /// Encode buffer for outgoing datagrams
    scratch: Vec<u8>,
    last_heartbeat: Instant,
}

impl State {
    fn check_alive(&self) -> Result<()> {
        if let Some((node, reason)) = &self.fatal {
            return Err(TransportError::NodeLost {
                node: *node,
                reason: reason.clone(),
            }
            .into());
        }
        if self.shut_down {
            return Err(TransportError::ShutDown.into());
        }
        Ok(())
    }

    fn pipe_entry(&mut self, pipe_id: u32, config: &ClusterConfig) -> &mut PipeState {
        self.pipes
            .entry(pipe_id)
            .or_insert_with(|| PipeState::new(config))
    }

    /// Opened and closed here, and since removed from `pipes`.
    fn is_retired(&self, pipe_id: u32) -> bool {
        pipe_id < self.next_pipe_id && !self.pipes.contains_key(&pipe_id)
    }

    /// Drop settled tombstones.
    fn retire_closed(&mut self, grace: Duration) {
        let now = Instant::now();
        self.pipes.retain(|&pipe_id, pipe| {
            let settled = pipe.is_settled(now, grace);
            if settled {
                trace!(pipe_id, "retired closed pipe");
            }
            !settled
        });
    }

    /// First slave that has left the cluster.
    fn departed_slave(&self) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, peer)| peer.departed)
            .map(|(node, _)| node)
    }

    fn has_in_flight(&self) -> bool {
        self.pipes.values().any(|pipe| match &pipe.role {
            Role::Master(master) => !master.in_flight.is_empty(),
            Role::Slave(_) => false,
        })
    }
}

struct Shared {
    config: ClusterConfig,
    max_packet_size: usize,
    transport: Box<dyn Transport>,
    pool: PacketPool,
    state: Mutex<State>,
    changed: Condvar,
    stopping: AtomicBool,
}

/// Routes packets between the pipes of all cluster nodes.
///
/// Create one per node with `Multiplexer::new` and share it as
/// `Arc<Multiplexer>`; pipes keep a clone of that `Arc`.
pub struct Multiplexer {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("node_index", &self.shared.config.node_index)
            .field("num_nodes", &self.shared.config.num_nodes)
            .finish()
    }
}

impl Multiplexer {
    /// Start a multiplexer for this node over `transport`.
    ///
    /// # Errors
    /// `Error::Config` if the configuration is invalid, `Error::Io` if the
    /// background thread cannot be spawned.
    pub fn new<T: Transport>(config: ClusterConfig, transport: T) -> Result<Arc<Self>> {
        config.validate()?;

        let now = Instant::now();
        let max_packet_size = config.max_packet_size();
        let state = State {
            next_pipe_id: wire::CONTROL_PIPE + 1,
            pipes: HashMap::new(),
            peers: vec![
                Peer {
                    last_heard: now,
                    departed: false,
                };
                config.num_nodes
            ],
            fatal: None,
            shut_down: false,
            stats: MultiplexerStats::default(),
            scratch: Vec::with_capacity(config.max_datagram_size()),
            last_heartbeat: now,
        };

        let shared = Arc::new(Shared {
            max_packet_size,
            transport: Box::new(transport),
            pool: PacketPool::new(max_packet_size),
            state: Mutex::new(state),
            changed: Condvar::new(),
            stopping: AtomicBool::new(false),
            config,
        });

        let io_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("mux-io-{}", shared.config.node_index))
            .spawn(move || io_shared.run_io())?;

        info!(
            node = shared.config.node_index,
            nodes = shared.config.num_nodes,
            max_packet_size,
            "multiplexer started"
        );

        Ok(Arc::new(Self {
            shared,
            io_thread: Mutex::new(Some(handle)),
        }))
    }

    /// Start a multiplexer on a UDP socket bound to `config.nodes[node_index]`.
    pub fn with_udp(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let transport = UdpTransport::bind(&config)?;
        Self::new(config, transport)
    }

    pub fn is_master(&self) -> bool {
        self.shared.config.is_master()
    }

    pub fn num_nodes(&self) -> usize {
        self.shared.config.num_nodes
    }

    pub fn node_index(&self) -> usize {
        self.shared.config.node_index
    }

    /// Payload capacity of every packet.
    pub fn max_packet_size(&self) -> usize {
        self.shared.max_packet_size
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.shared.config
    }

    /// Take an empty packet from the pool.
    pub fn new_packet(&self) -> Packet {
        self.shared.pool.acquire()
    }

    /// Return a packet to the pool.
    pub fn delete_packet(&self, packet: Packet) {
        self.shared.pool.release(packet);
    }

    /// Allocate the next pipe ID.
    ///
    /// Every node must open its pipes in the same order; the ID is the only
    /// thing that ties a master pipe to its slave counterparts.
    pub fn open_pipe(&self) -> Result<u32> {
        let mut state = self.shared.lock_state();
        state.check_alive()?;

        let pipe_id = state.next_pipe_id;
        state.next_pipe_id += 1;
        state.pipe_entry(pipe_id, &self.shared.config);

        debug!(node = self.node_index(), pipe_id, "opened pipe");
        Ok(pipe_id)
    }

    /// Close a pipe locally.
    ///
    /// On the master, packets still in flight keep being re-sent until every
    /// slave has them. On a slave, anything not yet consumed is discarded.
    pub fn close_pipe(&self, pipe_id: u32) {
        let mut state = self.shared.lock_state();
        let Some(pipe) = state.pipes.get_mut(&pipe_id) else {
            return;
        };
        pipe.closed_at = Some(Instant::now());

        if let Role::Slave(slave) = &mut pipe.role {
            for packet in slave.inbound.drain() {
                self.shared.pool.release(packet);
            }
        }
        state.retire_closed(self.shared.config.node_timeout());
        debug!(node = self.node_index(), pipe_id, "closed pipe");
    }

    /// Send a packet to every slave on `pipe_id` (master only).
    ///
    /// Ownership of the packet passes to the multiplexer. Empty packets are
    /// recycled without being sent. Blocks while the pipe has `send_window`
    /// packets waiting for acknowledgment.
    ///
    /// # Errors
    /// - `PipeError::MasterOnly` on a slave
    /// - `PipeError::UnknownPipe` if the pipe is not open
    /// - `TransportError::NodeLost` / `ShutDown` if the cluster is finished
    pub fn send_packet(&self, pipe_id: u32, mut packet: Packet) -> Result<()> {
        let shared = &self.shared;
        if !self.is_master() {
            shared.pool.release(packet);
            return Err(PipeError::MasterOnly("send_packet").into());
        }
        if packet.is_empty() {
            shared.pool.release(packet);
            return Ok(());
        }
        if packet.len() > shared.max_packet_size {
            return Err(PacketError::ExceedsMaxSize {
                size: packet.len(),
                max: shared.max_packet_size,
            }
            .into());
        }

        let num_nodes = shared.config.num_nodes;
        let mut state = shared.lock_state();
        loop {
            state.check_alive()?;
            if let Some(node) = state.departed_slave() {
                return Err(TransportError::NodeLost {
                    node,
                    reason: "left while the master was still sending".into(),
                }
                .into());
            }
            let window_full = match state.pipes.get_mut(&pipe_id) {
                Some(pipe) if !pipe.is_closed() => match pipe.master_mut() {
                    Some(master) => master.in_flight.len() >= shared.config.send_window,
                    None => return Err(PipeError::UnknownPipe(pipe_id).into()),
                },
                _ => return Err(PipeError::UnknownPipe(pipe_id).into()),
            };
            if !window_full {
                break;
            }
            state = shared.wait(state);
        }

        let State {
            pipes,
            peers,
            stats,
            scratch,
            ..
        } = &mut *state;
        let Some(master) = pipes.get_mut(&pipe_id).and_then(PipeState::master_mut) else {
            return Err(PipeError::UnknownPipe(pipe_id).into());
        };

        let stream_pos = master.next_pos;
        master.next_pos = stream_pos.wrapping_add(packet.len() as u32);
        packet.set_route(pipe_id, stream_pos);
        stats.packets_sent += 1;
        stats.bytes_sent += packet.len() as u64;

        if num_nodes == 1 {
            shared.pool.release(packet);
            return Ok(());
        }

        wire::encode_data(pipe_id, stream_pos, packet.payload(), scratch);
        for (node, peer) in peers.iter().enumerate().skip(1) {
            if !peer.departed {
                shared.transmit(node, scratch);
            }
        }
        trace!(pipe_id, stream_pos, len = packet.len(), "sent packet");

        master.in_flight.push_back(InFlight {
            end_pos: master.next_pos,
            packet,
            last_sent: Instant::now(),
            resends: 0,
        });
        Ok(())
    }

    /// Wait for the next in-order packet on `pipe_id` (slaves only).
    ///
    /// Ownership of the packet passes to the caller, who should hand it back
    /// with `delete_packet` when done.
    pub fn receive_packet(&self, pipe_id: u32) -> Result<Packet> {
        let shared = &self.shared;
        if self.is_master() {
            return Err(PipeError::SlaveOnly("receive_packet").into());
        }

        let mut state = shared.lock_state();
        loop {
            if state.is_retired(pipe_id) {
                return Err(PipeError::UnknownPipe(pipe_id).into());
            }
            let pipe = state.pipe_entry(pipe_id, &shared.config);
            if pipe.is_closed() {
                return Err(PipeError::UnknownPipe(pipe_id).into());
            }
            if let Some(packet) = pipe.slave_mut().and_then(|slave| slave.inbound.pop_ready()) {
                return Ok(packet);
            }
            state.check_alive()?;
            state = shared.wait(state);
        }
    }

    /// Block until every node called `barrier` on this pipe.
    pub fn barrier(&self, pipe_id: u32) -> Result<()> {
        self.collective(pipe_id, 0, |_| 0)?;
        self.shared.lock_state().stats.barriers += 1;
        Ok(())
    }

    /// Combine one value per node with `op`; every node gets the same result.
    ///
    /// # Errors
    /// `PipeError::UnsupportedGatherOp` before any communication if `op` is
    /// not defined for `T`.
    pub fn gather<T: Gatherable>(&self, pipe_id: u32, value: T, op: GatherOp) -> Result<T> {
        collective::check_supported::<T>(op)?;
        let bits = value.to_bits();
        let result = self.collective(pipe_id, bits, |contributions| {
            collective::reduce_bits::<T>(contributions, op).unwrap_or(bits)
        })?;
        self.shared.lock_state().stats.gathers += 1;
        Ok(T::from_bits(result))
    }

    fn collective(&self, pipe_id: u32, bits: u64, reduce: impl Fn(&[u64]) -> u64) -> Result<u64> {
        if self.is_master() {
            self.master_collective(pipe_id, bits, reduce)
        } else {
            self.slave_collective(pipe_id, bits)
        }
    }

    fn master_collective(&self, pipe_id: u32, bits: u64, reduce: impl Fn(&[u64]) -> u64) -> Result<u64> {
        let shared = &self.shared;
        let started = Instant::now();
        let mut state = shared.lock_state();

        match state.pipes.get_mut(&pipe_id).and_then(PipeState::master_mut) {
            Some(master) => master.arrivals[0] = Some(bits),
            None => return Err(PipeError::UnknownPipe(pipe_id).into()),
        }

        loop {
            state.check_alive()?;
            if let Some(node) = state.departed_slave() {
                return Err(TransportError::NodeLost {
                    node,
                    reason: "left during a collective operation".into(),
                }
                .into());
            }

            let State {
                pipes,
                scratch,
                ..
            } = &mut *state;
            let Some(master) = pipes.get_mut(&pipe_id).and_then(PipeState::master_mut) else {
                return Err(PipeError::UnknownPipe(pipe_id).into());
            };

            if master.arrivals.iter().all(Option::is_some) {
                let contributions: Vec<u64> = master.arrivals.iter().flatten().copied().collect();
                let result = reduce(&contributions);
                let seq = master.seq;
                master.last_release = Some((seq, result));
                master.seq = seq.wrapping_add(1);
                master.arrivals.iter_mut().for_each(|slot| *slot = None);

                let release = ControlMessage::Release {
                    pipe_id,
                    seq,
                    value: result,
                };
                for node in 1..shared.config.num_nodes {
                    shared.send_control(scratch, node, &release);
                }
                debug!(pipe_id, seq, "collective complete");
                return Ok(result);
            }

            state = shared.wait_collective(state, pipe_id, started)?;
        }
    }

    fn slave_collective(&self, pipe_id: u32, bits: u64) -> Result<u64> {
        let shared = &self.shared;
        let started = Instant::now();
        let resend_every = shared.config.retransmit_timeout();
        let mut state = shared.lock_state();
        if state.is_retired(pipe_id) {
            return Err(PipeError::UnknownPipe(pipe_id).into());
        }

        let seq = match state.pipe_entry(pipe_id, &shared.config).slave_mut() {
            Some(slave) => slave.seq,
            None => return Err(PipeError::UnknownPipe(pipe_id).into()),
        };
        let arrive = ControlMessage::Arrive {
            pipe_id,
            seq,
            value: bits,
        };
        shared.send_control(&mut state.scratch, 0, &arrive);
        let mut last_sent = Instant::now();

        loop {
            if let Some(slave) = state.pipe_entry(pipe_id, &shared.config).slave_mut() {
                if let Some((released, value)) = slave.release {
                    if released == seq {
                        slave.release = None;
                        slave.seq = seq.wrapping_add(1);
                        return Ok(value);
                    }
                }
            }
            state.check_alive()?;

            if last_sent.elapsed() >= resend_every {
                trace!(pipe_id, seq, "re-sending collective arrival");
                shared.send_control(&mut state.scratch, 0, &arrive);
                last_sent = Instant::now();
            }

            state = shared.wait_collective(state, pipe_id, started)?;
        }
    }

    /// Snapshot of this node's counters.
    pub fn stats(&self) -> MultiplexerStats {
        self.shared.lock_state().stats
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Leave the cluster.
    ///
    /// The master first waits, at most `node_timeout`, until every packet has
    /// been acknowledged and every slave has left, so no slave is stranded
    /// waiting for a re-send or a collective release. Idempotent; also run
    /// on drop.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.lock_state();
            if state.shut_down {
                return;
            }

            if self.is_master() {
                let deadline = Instant::now() + shared.config.node_timeout();
                loop {
                    let slaves_present = state.peers.iter().skip(1).any(|peer| !peer.departed);
                    let settled = !state.has_in_flight() && !slaves_present;
                    let now = Instant::now();
                    if settled || state.fatal.is_some() || now >= deadline {
                        if !settled && state.fatal.is_none() {
                            warn!("shutting down with unacknowledged packets or slaves still present");
                        }
                        break;
                    }
                    state = shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }

            let State {
                peers,
                scratch,
                pipes,
                ..
            } = &mut *state;
            for _ in 0..LEAVE_REPEATS {
                for (node, peer) in peers.iter().enumerate() {
                    if node != shared.config.node_index && !peer.departed {
                        shared.send_control(scratch, node, &ControlMessage::Leave);
                    }
                }
            }

            for pipe in pipes.values_mut() {
                match &mut pipe.role {
                    Role::Master(master) => {
                        for flight in master.in_flight.drain(..) {
                            shared.pool.release(flight.packet);
                        }
                    }
                    Role::Slave(slave) => {
                        for packet in slave.inbound.drain() {
                            shared.pool.release(packet);
                        }
                    }
                }
            }

            state.shut_down = true;
            shared.changed.notify_all();
        }

        shared.stopping.store(true, Ordering::SeqCst);
        let handle = self
            .io_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("multiplexer I/O thread panicked");
            }
        }
        info!(node = self.node_index(), "multiplexer shut down");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for a state change during a collective, bounded by the resend
    /// interval and the optional diagnostic timeout.
    fn wait_collective<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        pipe_id: u32,
        started: Instant,
    ) -> Result<MutexGuard<'a, State>> {
        if let Some(limit) = self.config.collective_timeout() {
            if started.elapsed() >= limit {
                return Err(TransportError::CollectiveTimeout {
                    pipe_id,
                    waited_ms: started.elapsed().as_millis() as u64,
                }
                .into());
            }
        }
        let (guard, _) = self
            .changed
            .wait_timeout(guard, self.config.retransmit_timeout())
            .unwrap_or_else(|e| e.into_inner());
        Ok(guard)
    }

    /// Hand a datagram to the transport; loss is the transport's business.
    fn transmit(&self, to: usize, datagram: &[u8]) {
        if let Err(e) = self.transport.send_to(to, datagram) {
            debug!(to, error = %e, "datagram send failed");
        }
    }

    fn send_control(&self, scratch: &mut Vec<u8>, to: usize, message: &ControlMessage) {
        wire::encode_control(message, scratch);
        self.transmit(to, scratch);
    }

    fn run_io(&self) {
        let mut buf = vec![0u8; self.config.max_datagram_size()];
        let tick = (self.config.retransmit_timeout().min(self.config.heartbeat_interval()) / 2)
            .max(Duration::from_millis(1));
        let mut last_tick = Instant::now();

        while !self.stopping.load(Ordering::SeqCst) {
            match self.transport.recv_timeout(&mut buf, tick) {
                Ok(Some((from, n))) => self.handle_datagram(from, &buf[..n]),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "transport receive failed");
                    std::thread::sleep(tick);
                }
            }

            if last_tick.elapsed() >= tick {
                self.on_tick();
                last_tick = Instant::now();
            }
        }
    }

    fn handle_datagram(&self, from: usize, bytes: &[u8]) {
        let config = &self.config;
        if from >= config.num_nodes || from == config.node_index {
            trace!(from, "ignoring datagram from unexpected node");
            return;
        }

        let mut state = self.lock_state();
        let datagram = match wire::decode(bytes, self.max_packet_size) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(from, error = %e, "dropping malformed datagram");
                state.stats.datagrams_invalid += 1;
                return;
            }
        };
        state.peers[from].last_heard = Instant::now();

        match datagram {
            Datagram::Data {
                pipe_id,
                stream_pos,
                payload,
            } if !config.is_master() && from == 0 => {
                self.handle_data(&mut state, pipe_id, stream_pos, payload);
            }
            Datagram::Control(ControlMessage::Ack { pipe_id, next_pos }) if config.is_master() => {
                state.stats.acks_received += 1;
                let State { pipes, peers, .. } = &mut *state;
                if let Some(master) = pipes.get_mut(&pipe_id).and_then(PipeState::master_mut) {
                    if pos_before(master.acked[from], next_pos) {
                        master.acked[from] = next_pos;
                    }
                    self.release_acked(master, peers);
                }
            }
            Datagram::Control(ControlMessage::Heartbeat) => {}
            Datagram::Control(ControlMessage::Arrive {
                pipe_id,
                seq,
                value,
            }) if config.is_master() && !state.is_retired(pipe_id) => {
                let State { pipes, scratch, .. } = &mut *state;
                let pipe = pipes
                    .entry(pipe_id)
                    .or_insert_with(|| PipeState::new(config));
                if let Some(master) = pipe.master_mut() {
                    if seq == master.seq {
                        master.arrivals[from] = Some(value);
                    } else if let Some((released, result)) = master.last_release {
                        if released == seq {
                            let release = ControlMessage::Release {
                                pipe_id,
                                seq,
                                value: result,
                            };
                            self.send_control(scratch, from, &release);
                        }
                    }
                }
            }
            Datagram::Control(ControlMessage::Release {
                pipe_id,
                seq,
                value,
            }) if !config.is_master() && from == 0 => {
                if let Some(slave) = state.pipes.get_mut(&pipe_id).and_then(PipeState::slave_mut) {
                    if seq == slave.seq {
                        slave.release = Some((seq, value));
                    }
                }
            }
            Datagram::Control(ControlMessage::Abort { lost_node }) if from == 0 => {
                if state.fatal.is_none() {
                    error!(lost_node, "master reported a lost node");
                    state.fatal = Some((lost_node as usize, "reported lost by the master".into()));
                }
            }
            Datagram::Control(ControlMessage::Leave) => {
                if !state.peers[from].departed {
                    info!(node = from, "peer left the cluster");
                }
                state.peers[from].departed = true;
                if from == 0 && state.fatal.is_none() {
                    state.fatal = Some((0, "master shut down".into()));
                }
                if config.is_master() {
                    let State { pipes, peers, .. } = &mut *state;
                    for master in pipes.values_mut().filter_map(PipeState::master_mut) {
                        self.release_acked(master, peers);
                    }
                }
            }
            other => trace!(from, ?other, "ignoring datagram"),
        }

        self.changed.notify_all();
    }

    fn handle_data(&self, state: &mut State, pipe_id: u32, stream_pos: u32, payload: &[u8]) {
        if state.is_retired(pipe_id) {
            // Late re-send for a pipe this node is done with: acknowledge the
            // whole packet so the master stops re-sending it
            let ack = ControlMessage::Ack {
                pipe_id,
                next_pos: stream_pos.wrapping_add(payload.len() as u32),
            };
            self.send_control(&mut state.scratch, 0, &ack);
            state.stats.acks_sent += 1;
            return;
        }

        let mut packet = self.pool.acquire();
        packet.append(payload);
        packet.set_route(pipe_id, stream_pos);
        state.stats.packets_received += 1;

        let State {
            pipes,
            stats,
            scratch,
            ..
        } = state;
        let pipe = pipes
            .entry(pipe_id)
            .or_insert_with(|| PipeState::new(&self.config));
        let closed = pipe.is_closed();
        let Some(slave) = pipe.slave_mut() else {
            self.pool.release(packet);
            return;
        };

        match slave.inbound.insert(packet) {
            InsertOutcome::Delivered(_) => {}
            InsertOutcome::Buffered => stats.packets_reordered += 1,
            InsertOutcome::Duplicate(packet) => {
                stats.packets_duplicate += 1;
                self.pool.release(packet);
            }
            InsertOutcome::Overflow(packet) => {
                stats.packets_overflowed += 1;
                self.pool.release(packet);
            }
        }

        if closed {
            while let Some(packet) = slave.inbound.pop_ready() {
                self.pool.release(packet);
            }
        }

        let ack = ControlMessage::Ack {
            pipe_id,
            next_pos: slave.inbound.next_pos(),
        };
        self.send_control(scratch, 0, &ack);
        stats.acks_sent += 1;
    }

    /// Recycle packets at the head of the in-flight queue that every
    /// remaining slave has acknowledged.
    fn release_acked(&self, master: &mut MasterPipe, peers: &[Peer]) {
        while let Some(front) = master.in_flight.front() {
            let all_acked = peers
                .iter()
                .enumerate()
                .skip(1)
                .all(|(node, peer)| peer.departed || !pos_before(master.acked[node], front.end_pos));
            if !all_acked {
                break;
            }
            if let Some(flight) = master.in_flight.pop_front() {
                self.pool.release(flight.packet);
            }
        }
    }

    fn on_tick(&self) {
        let config = &self.config;
        let now = Instant::now();
        let mut state = self.lock_state();
        if state.fatal.is_some() || state.shut_down {
            return;
        }
        state.retire_closed(config.node_timeout());

        if now.duration_since(state.last_heartbeat) >= config.heartbeat_interval() {
            state.last_heartbeat = now;
            let State {
                peers,
                scratch,
                stats,
                ..
            } = &mut *state;
            for (node, peer) in peers.iter().enumerate() {
                let is_peer = if config.is_master() { node != 0 } else { node == 0 };
                if is_peer && !peer.departed {
                    self.send_control(scratch, node, &ControlMessage::Heartbeat);
                    stats.heartbeats_sent += 1;
                }
            }
        }

        let silent = state
            .peers
            .iter()
            .enumerate()
            .find(|(node, peer)| {
                let watched = if config.is_master() { *node != 0 } else { *node == 0 };
                watched && !peer.departed && now.duration_since(peer.last_heard) > config.node_timeout()
            })
            .map(|(node, _)| node);
        if let Some(node) = silent {
            let reason = format!("no datagrams for more than {}ms", config.node_timeout_ms);
            self.declare_lost(&mut state, node, reason);
            return;
        }

        if config.is_master() {
            if let Some((node, reason)) = self.retransmit(&mut state, now) {
                self.declare_lost(&mut state, node, reason);
            }
        }
    }

    /// Re-send overdue packets; returns a node that exhausted its re-sends.
    fn retransmit(&self, state: &mut State, now: Instant) -> Option<(usize, String)> {
        let config = &self.config;
        let timeout = config.retransmit_timeout();
        let State {
            pipes,
            peers,
            stats,
            scratch,
            ..
        } = state;

        for (&pipe_id, pipe) in pipes.iter_mut() {
            let Some(MasterPipe {
                in_flight, acked, ..
            }) = pipe.master_mut()
            else {
                continue;
            };
            for flight in in_flight.iter_mut() {
                if now.duration_since(flight.last_sent) < timeout {
                    continue;
                }
                let laggards: Vec<usize> = (1..config.num_nodes)
                    .filter(|&node| {
                        !peers[node].departed && pos_before(acked[node], flight.end_pos)
                    })
                    .collect();
                let Some(&first) = laggards.first() else {
                    continue;
                };
                if flight.resends >= config.max_retransmits {
                    return Some((
                        first,
                        format!(
                            "pipe {} position {} unacknowledged after {} re-sends",
                            pipe_id,
                            flight.packet.stream_pos(),
                            flight.resends
                        ),
                    ));
                }

                wire::encode_data(pipe_id, flight.packet.stream_pos(), flight.packet.payload(), scratch);
                for &node in &laggards {
                    self.transmit(node, scratch);
                }
                flight.resends += 1;
                flight.last_sent = now;
                stats.packets_retransmitted += 1;
                debug!(
                    pipe_id,
                    stream_pos = flight.packet.stream_pos(),
                    resends = flight.resends,
                    laggards = laggards.len(),
                    "re-sent packet"
                );
            }
        }
        None
    }

    fn declare_lost(&self, state: &mut State, node: usize, reason: String) {
        if state.fatal.is_some() {
            return;
        }
        error!(node, %reason, "cluster node lost");

        if self.config.is_master() {
            let abort = ControlMessage::Abort {
                lost_node: node as u32,
            };
            let State { peers, scratch, .. } = &mut *state;
            for _ in 0..LEAVE_REPEATS {
                for (other, peer) in peers.iter().enumerate().skip(1) {
                    if other != node && !peer.departed {
                        self.send_control(scratch, other, &abort);
                    }
                }
            }
        }

        state.fatal = Some((node, reason));
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::network::{LoopbackNetwork, NetworkConfig};

    /// Nodes of an in-process cluster; slaves leave before the master.
    struct TestCluster(Vec<Arc<Multiplexer>>);

    impl std::ops::Deref for TestCluster {
        type Target = [Arc<Multiplexer>];

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl Drop for TestCluster {
        fn drop(&mut self) {
            while let Some(node) = self.0.pop() {
                drop(node);
            }
        }
    }

    fn cluster(num_nodes: usize, network: NetworkConfig) -> TestCluster {
        let net = LoopbackNetwork::new(num_nodes, network);
        TestCluster(
            (0..num_nodes)
                .map(|node| {
                    Multiplexer::new(ClusterConfig::for_node(num_nodes, node), net.endpoint(node))
                        .unwrap()
                })
                .collect(),
        )
    }

    #[test]
    fn test_topology_queries() {
        let nodes = cluster(3, NetworkConfig::perfect(1));
        assert!(nodes[0].is_master());
        assert!(!nodes[2].is_master());
        assert_eq!(nodes[1].num_nodes(), 3);
        assert_eq!(nodes[2].node_index(), 2);
        assert_eq!(nodes[0].max_packet_size(), 1464);
    }

    #[test]
    fn test_pipe_ids_follow_open_order() {
        let nodes = cluster(2, NetworkConfig::perfect(1));
        for node in nodes.iter() {
            assert_eq!(node.open_pipe().unwrap(), 1);
            assert_eq!(node.open_pipe().unwrap(), 2);
        }
    }

    #[test]
    fn test_send_and_receive_in_order() {
        let nodes = cluster(2, NetworkConfig::perfect(7));
        let pipe = nodes[0].open_pipe().unwrap();
        assert_eq!(nodes[1].open_pipe().unwrap(), pipe);

        for i in 0..10u8 {
            let mut packet = nodes[0].new_packet();
            packet.append(&[i; 100]);
            nodes[0].send_packet(pipe, packet).unwrap();
        }

        for i in 0..10u8 {
            let packet = nodes[1].receive_packet(pipe).unwrap();
            assert_eq!(packet.payload(), &[i; 100][..]);
            assert_eq!(packet.stream_pos(), i as u32 * 100);
            nodes[1].delete_packet(packet);
        }
    }

    #[test]
    fn test_role_checks() {
        let nodes = cluster(2, NetworkConfig::perfect(1));
        let pipe = nodes[0].open_pipe().unwrap();
        nodes[1].open_pipe().unwrap();

        let packet = nodes[1].new_packet();
        assert!(matches!(
            nodes[1].send_packet(pipe, packet),
            Err(Error::Pipe(PipeError::MasterOnly(_)))
        ));
        assert!(matches!(
            nodes[0].receive_packet(pipe),
            Err(Error::Pipe(PipeError::SlaveOnly(_)))
        ));
    }

    #[test]
    fn test_send_on_unknown_pipe() {
        let nodes = cluster(1, NetworkConfig::perfect(1));
        let mut packet = nodes[0].new_packet();
        packet.append(b"x");
        assert!(matches!(
            nodes[0].send_packet(42, packet),
            Err(Error::Pipe(PipeError::UnknownPipe(42)))
        ));
    }

    #[test]
    fn test_single_node_recycles_immediately() {
        let nodes = cluster(1, NetworkConfig::perfect(1));
        let pipe = nodes[0].open_pipe().unwrap();
        for _ in 0..5 {
            let mut packet = nodes[0].new_packet();
            packet.append(b"solo");
            nodes[0].send_packet(pipe, packet).unwrap();
        }
        assert_eq!(nodes[0].pool_stats().allocated, 1);
        assert_eq!(nodes[0].gather(pipe, 9u32, GatherOp::Sum).unwrap(), 9);
        nodes[0].barrier(pipe).unwrap();
    }

    #[test]
    fn test_loss_is_recovered() {
        let network = NetworkConfig {
            base_latency_ms: 1,
            jitter_ms: 1,
            loss_rate: 0.2,
            seed: 3,
        };
        let nodes = cluster(2, network);
        let pipe = nodes[0].open_pipe().unwrap();
        nodes[1].open_pipe().unwrap();

        let master = Arc::clone(&nodes[0]);
        let sender = std::thread::spawn(move || {
            for i in 0..200u32 {
                let mut packet = master.new_packet();
                packet.writer().write(i).unwrap();
                master.send_packet(pipe, packet).unwrap();
            }
        });

        for i in 0..200u32 {
            let packet = nodes[1].receive_packet(pipe).unwrap();
            assert_eq!(packet.reader().read::<u32>().unwrap(), i);
            nodes[1].delete_packet(packet);
        }
        sender.join().unwrap();
        assert!(nodes[0].stats().packets_retransmitted > 0);
    }

    #[test]
    fn test_unsupported_gather_fails_before_sending() {
        let nodes = cluster(1, NetworkConfig::perfect(1));
        let pipe = nodes[0].open_pipe().unwrap();
        assert!(matches!(
            nodes[0].gather(pipe, 1.0f64, GatherOp::Xor),
            Err(Error::Pipe(PipeError::UnsupportedGatherOp { .. }))
        ));
    }

    #[test]
    fn test_collective_timeout_is_diagnostic() {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(1));
        let config = ClusterConfig {
            collective_timeout_ms: Some(50),
            ..ClusterConfig::for_node(2, 0)
        };
        let master = Multiplexer::new(config, net.endpoint(0)).unwrap();
        let _slave = Multiplexer::new(ClusterConfig::for_node(2, 1), net.endpoint(1)).unwrap();
        let pipe = master.open_pipe().unwrap();

        // The slave never arrives
        assert!(matches!(
            master.barrier(pipe),
            Err(Error::Transport(TransportError::CollectiveTimeout { .. }))
        ));
    }

    #[test]
    fn test_send_fails_once_a_slave_left() {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(1));
        let config = ClusterConfig {
            send_window: 8,
            ..ClusterConfig::for_node(2, 0)
        };
        let master = Multiplexer::new(config, net.endpoint(0)).unwrap();
        let slave = Multiplexer::new(ClusterConfig::for_node(2, 1), net.endpoint(1)).unwrap();
        let pipe = master.open_pipe().unwrap();
        slave.open_pipe().unwrap();
        drop(slave);

        // More packets than the window holds: without the departure check
        // this would block forever
        let result = (0..100u8).try_for_each(|i| {
            let mut packet = master.new_packet();
            packet.append(&[i]);
            master.send_packet(pipe, packet)
        });
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::NodeLost { node: 1, .. }))
        ));
    }

    #[test]
    fn test_closed_pipes_are_retired() {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(2));
        let config = ClusterConfig {
            heartbeat_interval_ms: 20,
            node_timeout_ms: 200,
            ..ClusterConfig::for_node(2, 0)
        };
        let nodes = TestCluster(vec![
            Multiplexer::new(config, net.endpoint(0)).unwrap(),
            Multiplexer::new(ClusterConfig::for_node(2, 1), net.endpoint(1)).unwrap(),
        ]);
        let pipe = nodes[0].open_pipe().unwrap();
        nodes[1].open_pipe().unwrap();

        let mut packet = nodes[0].new_packet();
        packet.append(b"last");
        nodes[0].send_packet(pipe, packet).unwrap();
        let packet = nodes[1].receive_packet(pipe).unwrap();
        nodes[1].delete_packet(packet);

        // A slave has nothing left to deliver once closed
        nodes[1].close_pipe(pipe);
        assert!(nodes[1].shared.lock_state().pipes.is_empty());
        assert!(matches!(
            nodes[1].receive_packet(pipe),
            Err(Error::Pipe(PipeError::UnknownPipe(_)))
        ));

        // The master keeps its tombstone for the grace period
        nodes[0].close_pipe(pipe);
        assert!(nodes[0].shared.lock_state().pipes.contains_key(&pipe));
        let deadline = Instant::now() + Duration::from_secs(3);
        while !nodes[0].shared.lock_state().pipes.is_empty() {
            assert!(Instant::now() < deadline, "master tombstone never retired");
            std::thread::sleep(Duration::from_millis(20));
        }

        // IDs are never reused
        assert_eq!(nodes[0].open_pipe().unwrap(), pipe + 1);
        assert_eq!(nodes[1].open_pipe().unwrap(), pipe + 1);
    }

    #[test]
    fn test_operations_fail_after_shutdown() {
        let nodes = cluster(1, NetworkConfig::perfect(1));
        nodes[0].shutdown();
        assert!(matches!(
            nodes[0].open_pipe(),
            Err(Error::Transport(TransportError::ShutDown))
        ));
    }
}
