//! Datagram transports.
//!
//! The multiplexer talks to the rest of the cluster through the `Transport`
//! trait: unreliable, unordered datagrams addressed by node index. Reliability
//! and ordering are layered on top by the multiplexer, so a transport may drop,
//! delay, duplicate or reorder datagrams freely.
//!
//! Two transports are provided:
//!
//! - `UdpTransport`: one UDP socket per node, addresses from `ClusterConfig`
//! - `LoopbackNetwork`: an in-process network connecting several nodes that
//!   run as threads of one process, with simulated latency, jitter and loss
//!
//! # Determinism
//!
//! Loopback randomness comes from a seeded ChaCha8 RNG. Given the same seed
//! and the same send order, the same datagrams are dropped and delayed.

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Unreliable datagram delivery between cluster nodes.
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to node `to`. Success does not imply delivery.
    fn send_to(&self, to: usize, datagram: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for the next datagram and copy it into `buf`.
    ///
    /// # Returns
    /// `Some((sender, length))`, or `None` if nothing arrived in time.
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, usize)>>;
}

/// Configuration for network simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkConfig {
    /// Base latency in milliseconds
    pub base_latency_ms: u64,

    /// Jitter range in milliseconds (uniform ±jitter)
    pub jitter_ms: u64,

    /// Datagram loss probability [0.0, 1.0]
    pub loss_rate: f64,

    /// Random seed for determinism
    pub seed: u64,
}

impl NetworkConfig {
    /// Create a configuration with no impairments (perfect network).
    pub fn perfect(seed: u64) -> Self {
        Self {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.0,
            seed,
        }
    }

    /// Create a default configuration with moderate impairments.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            base_latency_ms: 2,
            jitter_ms: 2,
            loss_rate: 0.01, // 1% loss
            seed,
        }
    }
}

/// A datagram with scheduled delivery time.
#[derive(Debug)]
struct ScheduledDatagram {
    from: usize,
    data: Vec<u8>,
    delivery_time: Instant,
    /// Tie-breaker so equal delivery times keep send order
    seq: u64,
}

// Implement ordering for the heap (min-heap: earliest delivery first)
impl PartialEq for ScheduledDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.delivery_time == other.delivery_time && self.seq == other.seq
    }
}

impl Eq for ScheduledDatagram {}

impl PartialOrd for ScheduledDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledDatagram {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earlier time = higher priority)
        other
            .delivery_time
            .cmp(&self.delivery_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<BinaryHeap<ScheduledDatagram>>,
    arrived: Condvar,
}

#[derive(Debug)]
struct Hub {
    config: NetworkConfig,
    rng: Mutex<ChaCha8Rng>,
    mailboxes: Vec<Mailbox>,
    connected: Vec<AtomicBool>,
    next_seq: AtomicU64,
    stats: Mutex<NetworkStats>,
}

/// In-process network connecting the nodes of a simulated cluster.
///
/// Each node gets its own endpoint via `endpoint`; endpoints are cheap handles
/// onto one shared hub and can be moved to the node's thread.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Hub>,
}

impl LoopbackNetwork {
    /// Create a network for `num_nodes` nodes.
    pub fn new(num_nodes: usize, config: NetworkConfig) -> Self {
        let hub = Hub {
            config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.seed)),
            mailboxes: (0..num_nodes).map(|_| Mailbox::default()).collect(),
            connected: (0..num_nodes).map(|_| AtomicBool::new(true)).collect(),
            next_seq: AtomicU64::new(0),
            stats: Mutex::new(NetworkStats::default()),
        };
        Self { hub: Arc::new(hub) }
    }

    /// Number of nodes attached to the network.
    pub fn num_nodes(&self) -> usize {
        self.hub.mailboxes.len()
    }

    /// Transport handle for node `node`.
    ///
    /// # Panics
    /// If `node` is not a node of this network.
    pub fn endpoint(&self, node: usize) -> LoopbackTransport {
        assert!(node < self.num_nodes(), "node {node} not on this network");
        LoopbackTransport {
            hub: Arc::clone(&self.hub),
            node,
        }
    }

    /// Cut node `node` off: everything it sends or should receive is dropped.
    ///
    /// Simulates a crashed node or a pulled cable.
    pub fn disconnect(&self, node: usize) {
        if let Some(flag) = self.hub.connected.get(node) {
            flag.store(false, Ordering::SeqCst);
        }
        if let Some(mailbox) = self.hub.mailboxes.get(node) {
            lock(&mailbox.queue).clear();
        }
    }

    /// Get statistics about network behavior.
    pub fn stats(&self) -> NetworkStats {
        *lock(&self.hub.stats)
    }
}

impl Hub {
    fn is_connected(&self, node: usize) -> bool {
        self.connected
            .get(node)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Decide the fate of one datagram: `None` if dropped, else its delay.
    fn schedule(&self) -> Option<Duration> {
        let mut rng = lock(&self.rng);

        if self.config.loss_rate > 0.0 {
            let roll: f64 = rng.gen();
            if roll < self.config.loss_rate {
                return None;
            }
        }

        let base = self.config.base_latency_ms;
        if self.config.jitter_ms == 0 {
            return Some(Duration::from_millis(base));
        }

        // Uniform jitter: base ± jitter_ms
        let jitter_range = self.config.jitter_ms * 2;
        let jitter = rng.gen_range(0..=jitter_range);
        let jitter_offset = jitter as i64 - self.config.jitter_ms as i64;

        Some(Duration::from_millis((base as i64 + jitter_offset).max(0) as u64))
    }
}

/// One node's handle onto a `LoopbackNetwork`.
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: Arc<Hub>,
    node: usize,
}

impl LoopbackTransport {
    pub fn node(&self) -> usize {
        self.node
    }
}

impl Transport for LoopbackTransport {
    fn send_to(&self, to: usize, datagram: &[u8]) -> io::Result<()> {
        let mailbox = self.hub.mailboxes.get(to).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no node {to}"))
        })?;

        lock(&self.hub.stats).datagrams_sent += 1;

        if !self.hub.is_connected(self.node) || !self.hub.is_connected(to) {
            lock(&self.hub.stats).datagrams_dropped += 1;
            return Ok(());
        }

        let Some(delay) = self.hub.schedule() else {
            trace!(from = self.node, to, "loopback dropped datagram");
            lock(&self.hub.stats).datagrams_dropped += 1;
            return Ok(());
        };

        let scheduled = ScheduledDatagram {
            from: self.node,
            data: datagram.to_vec(),
            delivery_time: Instant::now() + delay,
            seq: self.hub.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        lock(&mailbox.queue).push(scheduled);
        mailbox.arrived.notify_one();
        Ok(())
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, usize)>> {
        let mailbox = &self.hub.mailboxes[self.node];
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&mailbox.queue);

        loop {
            let now = Instant::now();
            let next_due = queue.peek().map(|top| top.delivery_time);
            let wake_at = match next_due {
                Some(due) if due <= now => {
                    if let Some(scheduled) = queue.pop() {
                        drop(queue);
                        lock(&self.hub.stats).datagrams_delivered += 1;
                        let n = scheduled.data.len().min(buf.len());
                        buf[..n].copy_from_slice(&scheduled.data[..n]);
                        return Ok(Some((scheduled.from, n)));
                    }
                    continue;
                }
                Some(due) => due.min(deadline),
                None => deadline,
            };

            if now >= deadline {
                return Ok(None);
            }

            queue = mailbox
                .arrived
                .wait_timeout(queue, wake_at.saturating_duration_since(now))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

/// Statistics about loopback network behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams handed to the network
    pub datagrams_sent: u64,

    /// Datagrams dropped by simulated loss or disconnection
    pub datagrams_dropped: u64,

    /// Datagrams handed to a receiver
    pub datagrams_delivered: u64,
}

impl NetworkStats {
    /// Compute datagram loss rate.
    pub fn loss_rate(&self) -> f64 {
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.datagrams_dropped as f64 / self.datagrams_sent as f64
        }
    }
}

/// UDP transport: one socket per node, peers addressed by node index.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    by_addr: HashMap<SocketAddr, usize>,
}

impl UdpTransport {
    /// Bind this node's address from `config.nodes`.
    ///
    /// # Errors
    /// - `Error::Config` if no address list is configured
    /// - `Error::Io` if the socket cannot be bound
    pub fn bind(config: &ClusterConfig) -> Result<Self> {
        let local = *config.nodes.get(config.node_index).ok_or_else(|| {
            Error::Config(format!(
                "no UDP address configured for node {}",
                config.node_index
            ))
        })?;
        let socket = UdpSocket::bind(local)?;
        let by_addr = config
            .nodes
            .iter()
            .enumerate()
            .map(|(index, addr)| (*addr, index))
            .collect();

        Ok(Self {
            socket,
            peers: config.nodes.clone(),
            by_addr,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, to: usize, datagram: &[u8]) -> io::Result<()> {
        let addr = self.peers.get(to).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no node {to}"))
        })?;
        self.socket.send_to(datagram, addr)?;
        Ok(())
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, usize)>> {
        // A zero timeout would mean "block forever" to the OS
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match self.socket.recv_from(buf) {
            Ok((n, addr)) => match self.by_addr.get(&addr) {
                Some(&node) => Ok(Some((node, n))),
                None => {
                    trace!(%addr, "ignoring datagram from unknown address");
                    Ok(None)
                }
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv(transport: &LoopbackTransport, timeout_ms: u64) -> Option<(usize, Vec<u8>)> {
        let mut buf = [0u8; 64];
        transport
            .recv_timeout(&mut buf, Duration::from_millis(timeout_ms))
            .unwrap()
            .map(|(from, n)| (from, buf[..n].to_vec()))
    }

    #[test]
    fn test_perfect_network() {
        let network = LoopbackNetwork::new(2, NetworkConfig::perfect(42));
        let a = network.endpoint(0);
        let b = network.endpoint(1);

        a.send_to(1, b"hello").unwrap();
        assert_eq!(recv(&b, 100), Some((0, b"hello".to_vec())));

        let stats = network.stats();
        assert_eq!(stats.datagrams_sent, 1);
        assert_eq!(stats.datagrams_dropped, 0);
        assert_eq!(stats.datagrams_delivered, 1);
    }

    #[test]
    fn test_latency() {
        let config = NetworkConfig {
            base_latency_ms: 30,
            jitter_ms: 0,
            loss_rate: 0.0,
            seed: 42,
        };
        let network = LoopbackNetwork::new(2, config);
        let a = network.endpoint(0);
        let b = network.endpoint(1);

        let start = Instant::now();
        a.send_to(1, b"late").unwrap();

        // Should not be available immediately
        assert!(recv(&b, 0).is_none());

        assert!(recv(&b, 200).is_some());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_datagram_loss() {
        let config = NetworkConfig {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.5, // 50% loss
            seed: 42,
        };
        let network = LoopbackNetwork::new(2, config);
        let a = network.endpoint(0);

        for i in 0..100u8 {
            a.send_to(1, &[i]).unwrap();
        }

        let stats = network.stats();
        assert_eq!(stats.datagrams_sent, 100);
        // Allow 30-70% range due to randomness
        assert!(stats.datagrams_dropped >= 30 && stats.datagrams_dropped <= 70);
        assert!(stats.loss_rate() > 0.3 && stats.loss_rate() < 0.7);
    }

    #[test]
    fn test_determinism() {
        let config = NetworkConfig {
            loss_rate: 0.2,
            ..NetworkConfig::default_with_seed(12345)
        };
        let first = LoopbackNetwork::new(2, config);
        let second = LoopbackNetwork::new(2, config);

        for i in 0..50u8 {
            first.endpoint(0).send_to(1, &[i]).unwrap();
            second.endpoint(0).send_to(1, &[i]).unwrap();
        }

        assert_eq!(first.stats().datagrams_dropped, second.stats().datagrams_dropped);
    }

    #[test]
    fn test_jitter_reorders() {
        let config = NetworkConfig {
            base_latency_ms: 10,
            jitter_ms: 8,
            loss_rate: 0.0,
            seed: 99,
        };
        let network = LoopbackNetwork::new(2, config);
        let a = network.endpoint(0);
        let b = network.endpoint(1);

        for i in 0..20u8 {
            a.send_to(1, &[i]).unwrap();
        }

        let mut received = Vec::new();
        while let Some((_, data)) = recv(&b, 100) {
            received.push(data[0]);
            if received.len() == 20 {
                break;
            }
        }

        assert_eq!(received.len(), 20);
        assert!(
            received.windows(2).any(|w| w[1] < w[0]),
            "expected some reordering with large jitter"
        );
    }

    #[test]
    fn test_disconnect_drops_traffic() {
        let network = LoopbackNetwork::new(3, NetworkConfig::perfect(1));
        let a = network.endpoint(0);
        let c = network.endpoint(2);

        a.send_to(2, b"before").unwrap();
        network.disconnect(2);
        a.send_to(2, b"after").unwrap();
        c.send_to(0, b"ghost").unwrap();

        assert!(recv(&c, 20).is_none());
        assert!(recv(&a, 20).is_none());
        assert_eq!(network.stats().datagrams_dropped, 2);
    }

    #[test]
    fn test_udp_transport_round_trip() {
        let probe_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let probe_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let nodes = vec![probe_a.local_addr().unwrap(), probe_b.local_addr().unwrap()];
        drop(probe_a);
        drop(probe_b);

        let config_a = ClusterConfig {
            nodes: nodes.clone(),
            ..ClusterConfig::for_node(2, 0)
        };
        let config_b = ClusterConfig {
            nodes,
            ..ClusterConfig::for_node(2, 1)
        };
        let a = UdpTransport::bind(&config_a).unwrap();
        let b = UdpTransport::bind(&config_b).unwrap();

        a.send_to(1, b"udp").unwrap();
        let mut buf = [0u8; 16];
        let (from, n) = b
            .recv_timeout(&mut buf, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(from, 0);
        assert_eq!(&buf[..n], b"udp");
    }
}
