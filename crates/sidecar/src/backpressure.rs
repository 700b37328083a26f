//! Bounded packet queue for the binary ingress socket.
//!
//! Packets only land here while the socket is refusing writes. Which
//! packets give way when the queue is full is an [`EvictionPolicy`];
//! audio prefers fresh data, so the default is [`DropOldest`].

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::warn;

/// Packet count and byte limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCaps {
    pub max_packets: usize,
    pub max_bytes: usize,
}

/// What a policy decided for one incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Evict this many packets from the front, then append.
    Admit { evict: usize },
    /// Drop the incoming packet.
    Reject,
}

pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    fn admit(
        &self,
        queued: &VecDeque<Bytes>,
        queued_bytes: usize,
        incoming: usize,
        caps: QueueCaps,
    ) -> Admission;
}

/// How many front packets must go for `incoming` bytes to fit.
///
/// Rejects only when the packet could never fit, even in an empty queue.
pub fn drop_oldest(
    queued: &VecDeque<Bytes>,
    queued_bytes: usize,
    incoming: usize,
    caps: QueueCaps,
) -> Admission {
    if caps.max_packets == 0 || incoming > caps.max_bytes {
        return Admission::Reject;
    }

    let mut evict = 0;
    let mut bytes = queued_bytes;
    let mut packets = queued.len();
    while packets + 1 > caps.max_packets || bytes + incoming > caps.max_bytes {
        let Some(oldest) = queued.get(evict) else {
            break;
        };
        bytes -= oldest.len();
        packets -= 1;
        evict += 1;
    }
    Admission::Admit { evict }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DropOldest;

impl EvictionPolicy for DropOldest {
    fn admit(
        &self,
        queued: &VecDeque<Bytes>,
        queued_bytes: usize,
        incoming: usize,
        caps: QueueCaps,
    ) -> Admission {
        drop_oldest(queued, queued_bytes, incoming, caps)
    }
}

/// Keeps what is queued and refuses new packets once full.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropNewest;

impl EvictionPolicy for DropNewest {
    fn admit(
        &self,
        queued: &VecDeque<Bytes>,
        queued_bytes: usize,
        incoming: usize,
        caps: QueueCaps,
    ) -> Admission {
        if queued.len() < caps.max_packets && queued_bytes + incoming <= caps.max_bytes {
            Admission::Admit { evict: 0 }
        } else {
            Admission::Reject
        }
    }
}

/// FIFO of encoded packets under [`QueueCaps`].
#[derive(Debug)]
pub struct IngressQueue {
    packets: VecDeque<Bytes>,
    bytes: usize,
    caps: QueueCaps,
    policy: Box<dyn EvictionPolicy>,
    dropped: u64,
    drop_log_interval: u64,
}

impl IngressQueue {
    pub fn new(caps: QueueCaps, drop_log_interval: u64) -> Self {
        Self::with_policy(caps, drop_log_interval, Box::new(DropOldest))
    }

    pub fn with_policy(
        caps: QueueCaps,
        drop_log_interval: u64,
        policy: Box<dyn EvictionPolicy>,
    ) -> Self {
        Self {
            packets: VecDeque::with_capacity(caps.max_packets),
            bytes: 0,
            caps,
            policy,
            dropped: 0,
            drop_log_interval: drop_log_interval.max(1),
        }
    }

    /// Queue a packet. Returns how many packets were dropped to make room
    /// (the incoming one included, if it was refused).
    pub fn push(&mut self, packet: Bytes) -> usize {
        match self
            .policy
            .admit(&self.packets, self.bytes, packet.len(), self.caps)
        {
            Admission::Admit { evict } => {
                for _ in 0..evict {
                    if let Some(old) = self.packets.pop_front() {
                        self.bytes -= old.len();
                    }
                }
                self.bytes += packet.len();
                self.packets.push_back(packet);
                self.count_drops(evict);
                evict
            }
            Admission::Reject => {
                self.count_drops(1);
                1
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        let packet = self.packets.pop_front()?;
        self.bytes -= packet.len();
        Some(packet)
    }

    /// Put a packet back at the head after a write was refused.
    ///
    /// Caps are not re-checked: the packet was already admitted once.
    pub fn restore_front(&mut self, packet: Bytes) {
        self.bytes += packet.len();
        self.packets.push_front(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn caps(&self) -> QueueCaps {
        self.caps
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.bytes = 0;
    }

    fn count_drops(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let before = self.dropped;
        self.dropped += n as u64;
        if before / self.drop_log_interval != self.dropped / self.drop_log_interval {
            warn!(
                "Binary ingress backpressured: {} packets dropped so far ({} queued, {} bytes)",
                self.dropped,
                self.packets.len(),
                self.bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CAPS: QueueCaps = QueueCaps {
        max_packets: 24,
        max_bytes: 512 * 1024,
    };

    fn packet(len: usize, tag: u8) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    fn tags(queue: &mut IngressQueue) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(p) = queue.pop_front() {
            out.push(p[0]);
        }
        out
    }

    #[test]
    fn packet_cap_evicts_oldest() {
        let mut queue = IngressQueue::new(CAPS, 25);
        for tag in 0..24 {
            assert_eq!(queue.push(packet(100, tag)), 0);
        }
        assert_eq!(queue.push(packet(100, 24)), 1);
        assert_eq!(queue.len(), 24);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(tags(&mut queue), (1..=24).collect::<Vec<_>>());
    }

    #[test]
    fn byte_cap_evicts_until_it_fits() {
        let mut queue = IngressQueue::new(CAPS, 25);
        for tag in 0..4 {
            queue.push(packet(128 * 1024, tag));
        }
        assert_eq!(queue.bytes(), 512 * 1024);

        // Needs 200 KiB: two 128 KiB packets must go.
        assert_eq!(queue.push(packet(200 * 1024, 9)), 2);
        assert!(queue.bytes() <= CAPS.max_bytes);
        assert_eq!(tags(&mut queue), vec![2, 3, 9]);
    }

    #[test]
    fn caps_hold_under_any_mix() {
        let mut queue = IngressQueue::new(CAPS, 25);
        for i in 0..500usize {
            let len = (i * 7919) % (96 * 1024) + 1;
            queue.push(packet(len, (i % 251) as u8));
            assert!(queue.len() <= CAPS.max_packets);
            assert!(queue.bytes() <= CAPS.max_bytes);
        }
    }

    #[test]
    fn oversized_packet_is_refused() {
        let mut queue = IngressQueue::new(CAPS, 25);
        queue.push(packet(10, 1));
        assert_eq!(queue.push(packet(CAPS.max_bytes + 1, 2)), 1);
        assert_eq!(tags(&mut queue), vec![1]);
    }

    #[test]
    fn drop_oldest_is_pure() {
        let queued: VecDeque<Bytes> = (0..3).map(|t| packet(10, t)).collect();
        let caps = QueueCaps {
            max_packets: 3,
            max_bytes: 25,
        };
        assert_eq!(drop_oldest(&queued, 30, 5, caps), Admission::Admit { evict: 1 });
        assert_eq!(drop_oldest(&queued, 30, 6, caps), Admission::Admit { evict: 2 });
        assert_eq!(drop_oldest(&queued, 30, 26, caps), Admission::Reject);
        assert_eq!(queued.len(), 3);
    }

    #[test]
    fn drop_newest_keeps_backlog() {
        let caps = QueueCaps {
            max_packets: 2,
            max_bytes: 1024,
        };
        let mut queue = IngressQueue::with_policy(caps, 25, Box::new(DropNewest));
        queue.push(packet(10, 1));
        queue.push(packet(10, 2));
        assert_eq!(queue.push(packet(10, 3)), 1);
        assert_eq!(tags(&mut queue), vec![1, 2]);
    }

    #[test]
    fn restore_front_keeps_order_and_bytes() {
        let mut queue = IngressQueue::new(CAPS, 25);
        queue.push(packet(10, 1));
        queue.push(packet(20, 2));
        let head = queue.pop_front().unwrap();
        assert_eq!(queue.bytes(), 20);
        queue.restore_front(head);
        assert_eq!(queue.bytes(), 30);
        assert_eq!(tags(&mut queue), vec![1, 2]);
    }
}
