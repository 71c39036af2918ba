//! Data queues feeding device-queue data sources.
//!
//! A queue holds whole batches (one host tensor per source output). The
//! data source dequeues one batch per iteration; an empty queue means the
//! input stream is exhausted and the run ends at the next iteration boundary.
//!
//! Queues have any number of producers and exactly one consumer. The graph
//! compiler rejects graphs in which two device-queue sources share a queue.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::types::HostTensor;

/// One iteration's worth of source data, one tensor per output.
pub type Batch = Vec<HostTensor>;

/// Statistics for a data queue.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Total batches enqueued.
    pub enqueued: u64,
    /// Total batches dequeued.
    pub dequeued: u64,
    /// Batches rejected because the queue was full.
    pub dropped: u64,
    /// Current queue depth.
    pub depth: u64,
    /// Maximum queue depth observed.
    pub max_depth: u64,
}

/// Trait for data queue implementations.
///
/// `try_dequeue` is only ever called by one data source actor at a time;
/// implementations may rely on that.
pub trait DataQueue: Send + Sync {
    /// Get the queue capacity.
    fn capacity(&self) -> usize;

    /// Get current queue size.
    fn len(&self) -> usize;

    /// Check if queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if queue is full.
    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Try to enqueue a batch.
    fn try_enqueue(&self, batch: Batch) -> Result<()>;

    /// Try to dequeue a batch. Fails with [`EngineError::QueueEmpty`].
    fn try_dequeue(&self) -> Result<Batch>;

    /// Get queue statistics.
    fn stats(&self) -> QueueStats;

    /// Reset queue statistics.
    fn reset_stats(&self);
}

/// Ring buffer of batches with atomic head and tail.
///
/// Producers serialize on a lock; the consumer side is lock-free apart from
/// the slot it takes. There must be a single consumer: two concurrent
/// `try_dequeue` calls can read the same tail and lose a batch.
pub struct RingDataQueue {
    buffer: Vec<Mutex<Option<Batch>>>,
    capacity: usize,
    mask: usize,
    head: AtomicU64,
    tail: AtomicU64,
    producer_lock: Mutex<()>,
    stats: QueueStatsInner,
}

#[derive(Default)]
struct QueueStatsInner {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    max_depth: AtomicU64,
}

impl RingDataQueue {
    /// Create a new queue. Capacity is rounded up to the next power of 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            buffer: (0..capacity).map(|_| Mutex::new(None)).collect(),
            capacity,
            mask: capacity - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            producer_lock: Mutex::new(()),
            stats: QueueStatsInner::default(),
        }
    }

    /// Create a queue pre-filled with `batches`.
    pub fn from_batches(batches: impl IntoIterator<Item = Batch>) -> Result<Self> {
        let batches: Vec<Batch> = batches.into_iter().collect();
        let queue = Self::new(batches.len());
        for batch in batches {
            queue.try_enqueue(batch)?;
        }
        Ok(queue)
    }

    fn depth(&self) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    fn update_max_depth(&self) {
        self.stats.max_depth.fetch_max(self.depth(), Ordering::Relaxed);
    }

}

impl DataQueue for RingDataQueue {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.depth() as usize
    }

    fn try_enqueue(&self, batch: Batch) -> Result<()> {
        let _guard = self.producer_lock.lock();
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.capacity as u64 {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }

        *self.buffer[(head as usize) & self.mask].lock() = Some(batch);
        self.head.store(head.wrapping_add(1), Ordering::Release);

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.update_max_depth();
        Ok(())
    }

    fn try_dequeue(&self) -> Result<Batch> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return Err(EngineError::QueueEmpty);
        }

        let batch = self.buffer[(tail as usize) & self.mask]
            .lock()
            .take()
            .ok_or(EngineError::QueueEmpty)?;
        self.tail.store(tail.wrapping_add(1), Ordering::Release);

        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Ok(batch)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            depth: self.depth(),
            max_depth: self.stats.max_depth.load(Ordering::Relaxed),
        }
    }

    fn reset_stats(&self) {
        self.stats.enqueued.store(0, Ordering::Relaxed);
        self.stats.dequeued.store(0, Ordering::Relaxed);
        self.stats.dropped.store(0, Ordering::Relaxed);
        self.stats.max_depth.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn batch(v: f32) -> Batch {
        vec![HostTensor::from_f32(&[v])]
    }

    #[test]
    fn test_ring_fifo() {
        let queue = RingDataQueue::new(4);
        assert!(queue.is_empty());

        queue.try_enqueue(batch(1.0)).unwrap();
        queue.try_enqueue(batch(2.0)).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_dequeue().unwrap()[0].to_vec::<f32>(), vec![1.0]);
        assert_eq!(queue.try_dequeue().unwrap()[0].to_vec::<f32>(), vec![2.0]);
        assert!(matches!(queue.try_dequeue(), Err(EngineError::QueueEmpty)));
    }

    #[test]
    fn test_ring_full() {
        let queue = RingDataQueue::new(3);
        assert_eq!(queue.capacity(), 4);
        for i in 0..4 {
            queue.try_enqueue(batch(i as f32)).unwrap();
        }
        assert!(queue.is_full());
        assert!(matches!(
            queue.try_enqueue(batch(9.0)),
            Err(EngineError::QueueFull { capacity: 4 })
        ));
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_stats() {
        let queue = RingDataQueue::from_batches((0..10).map(|i| batch(i as f32))).unwrap();
        for _ in 0..5 {
            queue.try_dequeue().unwrap();
        }
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 10);
        assert_eq!(stats.dequeued, 5);
        assert_eq!(stats.depth, 5);
        assert_eq!(stats.max_depth, 10);

        queue.reset_stats();
        assert_eq!(queue.stats().enqueued, 0);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(RingDataQueue::new(512));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        q.try_enqueue(batch(i as f32)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.stats().enqueued, 400);
        assert_eq!(queue.len(), 400);
    }
}
