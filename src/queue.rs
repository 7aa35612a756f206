//! Pull-side packet queue
//!
//! A work queue: every packet goes to exactly one puller. Unbounded unless
//! asked otherwise, in which case the oldest packet is thrown away to make
//! room for the newest.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::trace;

use crate::DecryptedPacket;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueMode {
    #[default]
    Unbounded,
    /// Keep at most this many packets, discarding the oldest when full
    DropOldest(usize),
}

/// Nothing arrived before the pull timeout
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no packet available")]
pub struct Empty;

/// Cloning gives another handle on the same queue
#[derive(Clone, Debug)]
pub struct PacketQueue {
    tx: Sender<DecryptedPacket>,
    rx: Receiver<DecryptedPacket>,
    mode: QueueMode,
    dropped: Arc<AtomicU64>,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(QueueMode::Unbounded)
    }
}

impl PacketQueue {
    pub fn new(mode: QueueMode) -> Self {
        let (tx, rx, mode) = match mode {
            QueueMode::Unbounded => {
                let (tx, rx) = unbounded();
                (tx, rx, mode)
            }
            QueueMode::DropOldest(capacity) => {
                // A zero capacity crossbeam channel is a rendezvous channel, which
                // would never accept a try_send
                let capacity = capacity.max(1);
                let (tx, rx) = bounded(capacity);
                (tx, rx, QueueMode::DropOldest(capacity))
            }
        };
        Self {
            tx,
            rx,
            mode,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Never blocks
    pub fn push(&self, packet: DecryptedPacket) {
        let mut packet = packet;
        loop {
            match self.tx.try_send(packet) {
                Ok(()) => return,
                Err(TrySendError::Full(p)) => {
                    // Someone else may have pulled in the meantime, in which case
                    // there's room now and nothing needs dropping
                    if let Ok(old) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(sequence = old.sequence, "Queue full, dropped oldest packet");
                    }
                    packet = p;
                }
                // We hold a receiver ourselves, so this can't happen
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Wait up to `timeout` for the next packet
    pub fn pull(&self, timeout: Duration) -> Result<DecryptedPacket, Empty> {
        self.rx.recv_timeout(timeout).map_err(|_| Empty)
    }

    pub fn try_pull(&self) -> Result<DecryptedPacket, Empty> {
        self.rx.try_recv().map_err(|_| Empty)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Packets discarded by the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::{collections::HashSet, thread};

    fn packet(sequence: u64) -> DecryptedPacket {
        DecryptedPacket {
            data: [sequence as u8; 32],
            sequence,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_fifo() {
        let q = PacketQueue::default();
        for i in 0..10 {
            q.push(packet(i));
        }
        assert_eq!(q.len(), 10);
        for i in 0..10 {
            assert_eq!(q.pull(Duration::from_millis(10)).unwrap().sequence, i);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_pull_times_out() {
        let q = PacketQueue::default();
        let start = std::time::Instant::now();
        assert_eq!(q.pull(Duration::from_millis(20)), Err(Empty));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(q.try_pull(), Err(Empty));
    }

    #[test]
    fn test_pull_wakes_on_push() {
        let q = PacketQueue::default();
        let producer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(packet(42));
        });
        assert_eq!(q.pull(Duration::from_secs(5)).unwrap().sequence, 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_drop_oldest() {
        let q = PacketQueue::new(QueueMode::DropOldest(3));
        for i in 0..5 {
            q.push(packet(i));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 2);
        let seqs: Vec<_> = std::iter::from_fn(|| q.try_pull().ok())
            .map(|p| p.sequence)
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let q = PacketQueue::new(QueueMode::DropOldest(0));
        assert_eq!(q.mode(), QueueMode::DropOldest(1));
        q.push(packet(0));
        q.push(packet(1));
        assert_eq!(q.try_pull().unwrap().sequence, 1);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn test_each_packet_delivered_once() {
        let q = PacketQueue::default();
        const N: u64 = 2000;
        for i in 0..N {
            q.push(packet(i));
        }
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Ok(p) = q.pull(Duration::from_millis(50)) {
                        seen.push(p.sequence);
                    }
                    seen
                })
            })
            .collect();
        let mut all = HashSet::new();
        let mut total = 0;
        for c in consumers {
            let seen = c.join().unwrap();
            // Each consumer sees its share in order
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            total += seen.len();
            all.extend(seen);
        }
        assert_eq!(total as u64, N);
        assert_eq!(all.len() as u64, N);
    }
}
