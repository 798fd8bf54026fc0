//! In-order packet delivery for one pipe on a slave.
//!
//! The master stamps every packet with the byte offset of its payload in the
//! pipe's stream. A slave hands packets to the consumer strictly in offset
//! order: a packet that arrives early is parked until its predecessors show
//! up, and a packet whose bytes were already delivered is a duplicate caused
//! by retransmission.
//!
//! # Design
//!
//! - **Bounded window**: at most `max_pending` out-of-order packets are parked;
//!   beyond that, early packets are refused and the master's retransmission
//!   brings them back later
//! - **Wrapping positions**: offsets are `u32` and compared with wrapping
//!   arithmetic, so a stream may carry more than 4 GiB
//! - **No errors**: duplicates and overflow are normal events on a lossy
//!   network, reported through `InsertOutcome` so the caller can recycle the
//!   packet
//!
//! # Thread Safety
//!
//! Not thread-safe; the multiplexer keeps one buffer per pipe inside its
//! locked state.

use crate::packet::Packet;
use std::collections::{HashMap, VecDeque};

/// Returns true if stream position `a` lies before `b`.
pub fn pos_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// What happened to an inserted packet.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The packet (and this many packets in total, counting parked
    /// successors) became ready for the consumer
    Delivered(usize),

    /// The packet arrived early and is parked
    Buffered,

    /// The packet's bytes were already delivered or are already parked
    Duplicate(Packet),

    /// The packet arrived early but the window is full
    Overflow(Packet),
}

/// Per-pipe reorder buffer.
#[derive(Debug)]
pub struct ReorderBuffer {
    /// Stream position of the next byte the consumer expects
    next_pos: u32,

    /// Early packets keyed by stream position
    pending: HashMap<u32, Packet>,

    /// Packets ready for the consumer, in stream order
    ready: VecDeque<Packet>,

    /// Maximum number of parked packets
    max_pending: usize,
}

impl ReorderBuffer {
    /// Create a buffer expecting position 0 first.
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_pos: 0,
            pending: HashMap::new(),
            ready: VecDeque::new(),
            max_pending,
        }
    }

    /// Position of the first byte not yet received in order.
    ///
    /// This is the value a slave acknowledges.
    pub fn next_pos(&self) -> u32 {
        self.next_pos
    }

    /// Insert a packet whose `stream_pos` has been stamped.
    pub fn insert(&mut self, packet: Packet) -> InsertOutcome {
        let pos = packet.stream_pos();

        if pos_before(pos, self.next_pos) || self.pending.contains_key(&pos) {
            return InsertOutcome::Duplicate(packet);
        }

        if pos != self.next_pos {
            if self.pending.len() >= self.max_pending {
                return InsertOutcome::Overflow(packet);
            }
            self.pending.insert(pos, packet);
            return InsertOutcome::Buffered;
        }

        self.push_ready(packet);
        let mut delivered = 1;

        // Release parked successors that are now in order
        while let Some(next) = self.pending.remove(&self.next_pos) {
            self.push_ready(next);
            delivered += 1;
        }

        InsertOutcome::Delivered(delivered)
    }

    fn push_ready(&mut self, packet: Packet) {
        self.next_pos = self.next_pos.wrapping_add(packet.len() as u32);
        self.ready.push_back(packet);
    }

    /// Take the next packet for the consumer.
    pub fn pop_ready(&mut self) -> Option<Packet> {
        self.ready.pop_front()
    }

    /// Remove every packet held, ready or parked, for recycling.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self.ready.drain(..).collect();
        packets.extend(self.pending.drain().map(|(_, packet)| packet));
        packets
    }

    /// Check if nothing is held, ready or parked.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(pos: u32, len: usize) -> Packet {
        let mut packet = Packet::with_capacity(64);
        packet.append(&vec![pos as u8; len]);
        packet.set_route(1, pos);
        packet
    }

    fn ready_positions(buffer: &mut ReorderBuffer) -> Vec<u32> {
        std::iter::from_fn(|| buffer.pop_ready())
            .map(|p| p.stream_pos())
            .collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = ReorderBuffer::new(8);
        assert!(matches!(buffer.insert(make_packet(0, 10)), InsertOutcome::Delivered(1)));
        assert!(matches!(buffer.insert(make_packet(10, 5)), InsertOutcome::Delivered(1)));
        assert_eq!(buffer.next_pos(), 15);
        assert_eq!(ready_positions(&mut buffer), vec![0, 10]);
    }

    #[test]
    fn test_out_of_order_packets() {
        let mut buffer = ReorderBuffer::new(8);
        assert!(matches!(buffer.insert(make_packet(20, 10)), InsertOutcome::Buffered));
        assert!(matches!(buffer.insert(make_packet(10, 10)), InsertOutcome::Buffered));
        assert!(!buffer.is_idle());
        assert!(buffer.pop_ready().is_none());
        assert_eq!(buffer.next_pos(), 0);

        // Filling the gap releases everything parked behind it
        assert!(matches!(buffer.insert(make_packet(0, 10)), InsertOutcome::Delivered(3)));
        assert_eq!(ready_positions(&mut buffer), vec![0, 10, 20]);
        assert!(buffer.is_idle());
    }

    #[test]
    fn test_duplicate_packet() {
        let mut buffer = ReorderBuffer::new(8);
        buffer.insert(make_packet(0, 4));
        buffer.insert(make_packet(8, 4));

        // Already delivered
        assert!(matches!(buffer.insert(make_packet(0, 4)), InsertOutcome::Duplicate(_)));
        // Already parked
        assert!(matches!(buffer.insert(make_packet(8, 4)), InsertOutcome::Duplicate(_)));
    }

    #[test]
    fn test_window_full() {
        let mut buffer = ReorderBuffer::new(2);
        buffer.insert(make_packet(10, 10));
        buffer.insert(make_packet(20, 10));

        let result = buffer.insert(make_packet(30, 10));
        assert!(matches!(result, InsertOutcome::Overflow(_)));

        // The in-order packet is always accepted
        assert!(matches!(buffer.insert(make_packet(0, 10)), InsertOutcome::Delivered(3)));
    }

    #[test]
    fn test_wrapping_positions() {
        assert!(pos_before(u32::MAX - 1, 2));
        assert!(!pos_before(2, u32::MAX - 1));

        let mut buffer = ReorderBuffer::new(4);
        buffer.next_pos = u32::MAX - 3;
        assert!(matches!(buffer.insert(make_packet(u32::MAX - 3, 8)), InsertOutcome::Delivered(1)));
        assert_eq!(buffer.next_pos(), 4);
        assert!(matches!(buffer.insert(make_packet(u32::MAX - 3, 8)), InsertOutcome::Duplicate(_)));
    }

    #[test]
    fn test_drain_returns_everything() {
        let mut buffer = ReorderBuffer::new(4);
        buffer.insert(make_packet(0, 4));
        buffer.insert(make_packet(12, 4));
        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_idle());
    }
}
