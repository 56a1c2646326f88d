//! Retransmit-limited broadcast queue
//!
//! Each queued message is handed out on successive gossip rounds until it
//! has been transmitted `retransmit_mult * ceil(log10(n + 1))` times for a
//! cluster of `n` members, then retired.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// A message queued for dissemination
pub trait Broadcast: Send + Sync {
    /// Whether this broadcast supersedes `other` (which is then dropped)
    fn invalidates(&self, other: &dyn Broadcast) -> bool;

    /// Payload to transmit
    fn message(&self) -> &[u8];

    /// Called once the broadcast is retired or invalidated
    fn finished(&self) {}
}

struct Queued {
    broadcast: Box<dyn Broadcast>,
    transmits: usize,
    id: u64,
}

/// Queue handing out least-transmitted broadcasts first
pub struct BroadcastQueue {
    queue: Mutex<Vec<Queued>>,
    retransmit_mult: usize,
    num_nodes: AtomicUsize,
    next_id: AtomicUsize,
}

impl BroadcastQueue {
    /// Create a queue for a cluster that initially holds only the local node
    pub fn new(retransmit_mult: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            retransmit_mult: retransmit_mult.max(1),
            num_nodes: AtomicUsize::new(1),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Update the estimated cluster size
    pub fn set_num_nodes(&self, n: usize) {
        self.num_nodes.store(n.max(1), Ordering::Relaxed);
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes.load(Ordering::Relaxed)
    }

    /// Transmissions before a broadcast is retired
    pub fn retransmit_limit(&self) -> usize {
        retransmit_limit(self.retransmit_mult, self.num_nodes())
    }

    /// Queue a broadcast, dropping any queued broadcasts it invalidates
    pub fn queue(&self, broadcast: Box<dyn Broadcast>) {
        let mut queue = self.queue.lock();

        queue.retain(|queued| {
            if broadcast.invalidates(queued.broadcast.as_ref()) {
                queued.broadcast.finished();
                false
            } else {
                true
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        queue.push(Queued {
            broadcast,
            transmits: 0,
            id,
        });
    }

    /// Take broadcasts for one gossip round.
    ///
    /// Messages are chosen least-transmitted first (oldest first on ties)
    /// while `overhead + len` fits in the remaining `limit`. A message that
    /// can never fit in `limit` is retired at once.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let transmit_limit = self.retransmit_limit();
        let mut queue = self.queue.lock();
        queue.sort_by_key(|q| (q.transmits, q.id));

        let mut used = 0;
        let mut out = Vec::new();
        for queued in queue.iter_mut() {
            let cost = overhead + queued.broadcast.message().len();
            if cost > limit {
                warn!(
                    bytes = cost,
                    limit, "Broadcast exceeds gossip limit, left to push/pull"
                );
                queued.transmits = transmit_limit;
                continue;
            }
            if used + cost > limit {
                continue;
            }
            used += cost;
            out.push(queued.broadcast.message().to_vec());
            queued.transmits += 1;
        }

        queue.retain(|queued| {
            if queued.transmits >= transmit_limit {
                debug!(transmits = queued.transmits, "Retiring broadcast");
                queued.broadcast.finished();
                false
            } else {
                true
            }
        });

        out
    }

    /// Number of queued broadcasts
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued
    pub fn reset(&self) {
        for queued in self.queue.lock().drain(..) {
            queued.broadcast.finished();
        }
    }
}

/// `mult * ceil(log10(n + 1))`
pub fn retransmit_limit(mult: usize, num_nodes: usize) -> usize {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    mult * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Plain(Vec<u8>);

    impl Broadcast for Plain {
        fn invalidates(&self, _other: &dyn Broadcast) -> bool {
            false
        }

        fn message(&self) -> &[u8] {
            &self.0
        }
    }

    struct Keyed {
        payload: Vec<u8>,
        finished: Arc<AtomicUsize>,
    }

    impl Broadcast for Keyed {
        fn invalidates(&self, other: &dyn Broadcast) -> bool {
            other.message().first() == self.payload.first()
        }

        fn message(&self) -> &[u8] {
            &self.payload
        }

        fn finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_retransmit_limit_scales() {
        assert_eq!(retransmit_limit(3, 1), 3);
        assert_eq!(retransmit_limit(3, 9), 3);
        assert_eq!(retransmit_limit(3, 10), 6);
        assert_eq!(retransmit_limit(3, 100), 9);
    }

    #[test]
    fn test_retired_after_limit() {
        let queue = BroadcastQueue::new(3);
        queue.queue(Box::new(Plain(vec![1, 2, 3])));

        for _ in 0..3 {
            assert_eq!(queue.get_broadcasts(0, 1024), vec![vec![1, 2, 3]]);
        }
        assert!(queue.is_empty());
        assert!(queue.get_broadcasts(0, 1024).is_empty());
    }

    #[test]
    fn test_no_supersede_for_plain() {
        let queue = BroadcastQueue::new(1);
        queue.queue(Box::new(Plain(vec![1])));
        queue.queue(Box::new(Plain(vec![1])));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_invalidated_broadcast_dropped() {
        let finished = Arc::new(AtomicUsize::new(0));
        let queue = BroadcastQueue::new(1);
        queue.queue(Box::new(Keyed { payload: vec![7, 1], finished: finished.clone() }));
        queue.queue(Box::new(Keyed { payload: vec![7, 2], finished: finished.clone() }));

        assert_eq!(queue.len(), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get_broadcasts(0, 1024), vec![vec![7, 2]]);
    }

    #[test]
    fn test_byte_limit_and_fairness() {
        let queue = BroadcastQueue::new(10);
        queue.queue(Box::new(Plain(vec![0; 8])));
        queue.queue(Box::new(Plain(vec![1; 8])));

        // Only one fits per round; the least transmitted goes next
        let first = queue.get_broadcasts(2, 12);
        let second = queue.get_broadcasts(2, 12);
        assert_eq!(first, vec![vec![0; 8]]);
        assert_eq!(second, vec![vec![1; 8]]);
    }

    #[test]
    fn test_oversized_broadcast_retired() {
        let finished = Arc::new(AtomicUsize::new(0));
        let queue = BroadcastQueue::new(3);
        queue.queue(Box::new(Keyed { payload: vec![5; 70 * 1024], finished: finished.clone() }));
        queue.queue(Box::new(Plain(vec![1, 2, 3])));

        // The small one still goes out in the same round
        assert_eq!(queue.get_broadcasts(5, 64 * 1024), vec![vec![1, 2, 3]]);
        assert_eq!(queue.len(), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cluster_growth_extends_lifetime() {
        let queue = BroadcastQueue::new(1);
        queue.set_num_nodes(10);
        queue.queue(Box::new(Plain(vec![9])));

        queue.get_broadcasts(0, 64);
        assert_eq!(queue.len(), 1);
        queue.get_broadcasts(0, 64);
        assert!(queue.is_empty());
    }
}
