//! Multiplexer statistics.
//!
//! Counters are updated under the multiplexer's state lock and copied out as
//! a `MultiplexerStats` snapshot, so reading them never races with the
//! background thread.

use std::fmt;

/// Counters for one multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    // === Data ===
    /// Data packets handed to `send_packet` and transmitted (master)
    pub packets_sent: u64,

    /// Payload bytes of those packets
    pub bytes_sent: u64,

    /// Individual re-sends of unacknowledged packets (master)
    pub packets_retransmitted: u64,

    /// Data datagrams received (slave)
    pub packets_received: u64,

    /// Received packets that were already delivered or parked
    pub packets_duplicate: u64,

    /// Received packets that arrived ahead of a gap
    pub packets_reordered: u64,

    /// Early packets refused because the reorder window was full
    pub packets_overflowed: u64,

    /// Datagrams that failed to decode
    pub datagrams_invalid: u64,

    // === Control ===
    /// Acknowledgments sent (slave)
    pub acks_sent: u64,

    /// Acknowledgments received (master)
    pub acks_received: u64,

    /// Heartbeats sent
    pub heartbeats_sent: u64,

    // === Collectives ===
    /// Completed barriers
    pub barriers: u64,

    /// Completed gathers (barriers not included)
    pub gathers: u64,
}

impl MultiplexerStats {
    /// Fraction of sent packets that needed at least one re-send.
    pub fn retransmit_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_retransmitted as f64 / self.packets_sent as f64
        }
    }

    /// Fraction of received packets that were duplicates.
    pub fn duplicate_rate(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.packets_duplicate as f64 / self.packets_received as f64
        }
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self, node_index: usize) {
        println!("=== Node {} ===", node_index);
        println!("{}", self);
    }
}

impl fmt::Display for MultiplexerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Packets sent: {} ({} bytes), retransmitted: {} ({:.2}%)",
            self.packets_sent,
            self.bytes_sent,
            self.packets_retransmitted,
            self.retransmit_rate() * 100.0
        )?;
        writeln!(
            f,
            "Packets received: {}, duplicate: {} ({:.2}%), reordered: {}, overflowed: {}",
            self.packets_received,
            self.packets_duplicate,
            self.duplicate_rate() * 100.0,
            self.packets_reordered,
            self.packets_overflowed
        )?;
        writeln!(
            f,
            "Acks sent: {}, received: {}; heartbeats sent: {}; invalid datagrams: {}",
            self.acks_sent, self.acks_received, self.heartbeats_sent, self.datagrams_invalid
        )?;
        write!(f, "Barriers: {}, gathers: {}", self.barriers, self.gathers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_handle_zero() {
        let stats = MultiplexerStats::default();
        assert_eq!(stats.retransmit_rate(), 0.0);
        assert_eq!(stats.duplicate_rate(), 0.0);
    }

    #[test]
    fn test_rates() {
        let stats = MultiplexerStats {
            packets_sent: 200,
            packets_retransmitted: 10,
            packets_received: 50,
            packets_duplicate: 5,
            ..MultiplexerStats::default()
        };
        assert!((stats.retransmit_rate() - 0.05).abs() < 1e-9);
        assert!((stats.duplicate_rate() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_display_mentions_collectives() {
        let stats = MultiplexerStats {
            barriers: 3,
            gathers: 2,
            ..MultiplexerStats::default()
        };
        assert!(stats.to_string().contains("Barriers: 3, gathers: 2"));
    }
}
