//! Packet pool.
//!
//! Packets are allocated lazily and recycled through a free stack, so the hot
//! path never allocates once the pool has warmed up. Packets are only freed
//! when the pool itself is dropped.

use crate::packet::Packet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Free stack of recycled packets, all of the same capacity.
#[derive(Debug)]
pub struct PacketPool {
    capacity: usize,
    free: Mutex<Vec<Packet>>,
    allocated: AtomicUsize,
}

impl PacketPool {
    /// Create an empty pool handing out packets of `capacity` payload bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Payload capacity of every packet from this pool.
    pub fn packet_capacity(&self) -> usize {
        self.capacity
    }

    /// Take a packet off the free stack, growing the pool when it is empty.
    pub fn acquire(&self) -> Packet {
        let recycled = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match recycled {
            Some(packet) => packet,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Packet::with_capacity(self.capacity)
            }
        }
    }

    /// Return a packet to the free stack.
    ///
    /// Packets of a foreign capacity are dropped instead of recycled.
    pub fn release(&self, mut packet: Packet) {
        if packet.capacity() != self.capacity {
            return;
        }
        packet.reset();
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(packet);
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.lock().unwrap_or_else(|e| e.into_inner()).len();
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            free,
        }
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Packets created over the pool's lifetime
    pub allocated: usize,

    /// Packets currently on the free stack
    pub free: usize,
}

impl PoolStats {
    /// Packets currently owned by someone other than the pool.
    pub fn in_use(&self) -> usize {
        self.allocated.saturating_sub(self.free)
    }
}
