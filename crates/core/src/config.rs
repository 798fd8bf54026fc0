//! Cluster configuration.
//!
//! Topology (node count, own index, UDP addresses) and the three size
//! constants that determine the maximum packet payload are deployment
//! configuration: every node of one cluster must use identical values.
//!
//! # Packet Size
//!
//! ```text
//! max_packet_size = mtu - ip_header_size - udp_header_size - HEADER_SIZE
//! ```
//!
//! With the defaults (1500, 20, 8) a packet carries 1464 payload bytes.

use crate::error::{Error, Result};
use crate::wire::HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Smallest payload we accept; resource records need a few bytes of framing.
pub const MIN_PACKET_SIZE: usize = 64;

/// Complete configuration for one cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    // === Topology ===
    /// Number of nodes in the cluster (master included)
    pub num_nodes: usize,

    /// Index of this node; 0 is the master
    pub node_index: usize,

    /// UDP addresses of all nodes, indexed by node index (UDP transport only)
    pub nodes: Vec<SocketAddr>,

    // === Packet sizing ===
    /// Link MTU in bytes
    pub mtu: usize,

    /// IP header size in bytes
    pub ip_header_size: usize,

    /// UDP header size in bytes
    pub udp_header_size: usize,

    // === Reliability ===
    /// Milliseconds before an unacknowledged packet is re-sent
    pub retransmit_timeout_ms: u64,

    /// Re-sends of a single packet before its receiver is declared lost
    pub max_retransmits: u32,

    /// Milliseconds between heartbeats
    pub heartbeat_interval_ms: u64,

    /// Milliseconds of silence before a peer is declared lost
    pub node_timeout_ms: u64,

    /// Maximum unacknowledged packets per pipe before `send_packet` blocks
    pub send_window: usize,

    /// Maximum out-of-order packets a slave buffers per pipe
    pub reorder_window: usize,

    /// Optional diagnostic limit for barrier/gather waits
    pub collective_timeout_ms: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            node_index: 0,
            nodes: Vec::new(),
            mtu: 1500,
            ip_header_size: 20,
            udp_header_size: 8,
            retransmit_timeout_ms: 20,
            max_retransmits: 200,
            heartbeat_interval_ms: 100,
            node_timeout_ms: 5000,
            send_window: 512,
            reorder_window: 4096,
            collective_timeout_ms: None,
        }
    }
}

impl ClusterConfig {
    /// Configuration for node `node_index` of an `num_nodes`-node cluster.
    pub fn for_node(num_nodes: usize, node_index: usize) -> Self {
        Self {
            num_nodes,
            node_index,
            ..Self::default()
        }
    }

    /// Bytes of payload a single packet can carry.
    pub fn max_packet_size(&self) -> usize {
        self.mtu
            .saturating_sub(self.ip_header_size)
            .saturating_sub(self.udp_header_size)
            .saturating_sub(HEADER_SIZE)
    }

    /// Largest datagram this configuration produces (header included).
    pub fn max_datagram_size(&self) -> usize {
        self.max_packet_size() + HEADER_SIZE
    }

    pub fn is_master(&self) -> bool {
        self.node_index == 0
    }

    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn collective_timeout(&self) -> Option<Duration> {
        self.collective_timeout_ms.map(Duration::from_millis)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(Error::Config("num_nodes must be at least 1".into()));
        }
        if self.node_index >= self.num_nodes {
            return Err(Error::Config(format!(
                "node_index {} out of range for {} nodes",
                self.node_index, self.num_nodes
            )));
        }
        if self.max_packet_size() < MIN_PACKET_SIZE {
            return Err(Error::Config(format!(
                "mtu {} leaves {} payload bytes, need at least {}",
                self.mtu,
                self.max_packet_size(),
                MIN_PACKET_SIZE
            )));
        }
        if self.max_packet_size() > u16::MAX as usize {
            return Err(Error::Config(format!("mtu {} is too large", self.mtu)));
        }
        if !self.nodes.is_empty() && self.nodes.len() != self.num_nodes {
            return Err(Error::Config(format!(
                "{} node addresses given for {} nodes",
                self.nodes.len(),
                self.num_nodes
            )));
        }
        if self.retransmit_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "retransmit timeout and heartbeat interval must be non-zero".into(),
            ));
        }
        if self.node_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::Config(
                "node_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.send_window == 0 || self.reorder_window == 0 {
            return Err(Error::Config("windows must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_packet_size() {
        let config = ClusterConfig::default();
        assert_eq!(config.max_packet_size(), 1500 - 20 - 8 - 8);
        assert_eq!(config.max_datagram_size(), 1500 - 20 - 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_index_out_of_range() {
        let config = ClusterConfig::for_node(3, 3);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_tiny_mtu_rejected() {
        let config = ClusterConfig {
            mtu: 80,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_count_must_match() {
        let config = ClusterConfig {
            num_nodes: 2,
            nodes: vec!["127.0.0.1:7000".parse().unwrap()],
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collective_timeout_optional() {
        let mut config = ClusterConfig::default();
        assert_eq!(config.collective_timeout(), None);
        config.collective_timeout_ms = Some(250);
        assert_eq!(config.collective_timeout(), Some(Duration::from_millis(250)));
    }
}
