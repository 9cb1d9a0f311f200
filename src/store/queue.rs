//! Asynchronous operation queue
//!
//! Items carry a priority (1 = high, 3 = low); ties drain in enqueue order.
//! The queue is bounded: enqueue on a full queue is rejected immediately.
//! A single worker owned by the store drains items sequentially; callers
//! that want the outcome attach a reply channel per item.

use super::{BatchResult, StoredChunk};
use crate::error::{Result, StoreError};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Operations that can be queued for background execution
pub enum QueueOperation {
    BatchInsert(Vec<StoredChunk>),
    BatchDelete(Vec<Uuid>),
    CollectionCleanup,
}

impl QueueOperation {
    pub fn name(&self) -> &'static str {
        match self {
            QueueOperation::BatchInsert(_) => "batch_insert",
            QueueOperation::BatchDelete(_) => "batch_delete",
            QueueOperation::CollectionCleanup => "collection_cleanup",
        }
    }
}

pub(crate) struct QueueItem {
    pub op: QueueOperation,
    pub priority: u8,
    pub seq: u64,
    pub reply: Option<flume::Sender<BatchResult>>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the maximum: lower priority number and earlier
        // sequence must compare greater
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue with a wakeup channel for the worker
pub struct OperationQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
    signal_tx: flume::Sender<()>,
    signal_rx: flume::Receiver<()>,
    max_size: usize,
    seq: AtomicU64,
    depth: AtomicUsize,
}

impl OperationQueue {
    pub fn new(max_size: usize) -> Self {
        let (signal_tx, signal_rx) = flume::unbounded();
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            signal_tx,
            signal_rx,
            max_size,
            seq: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    /// Enqueue an operation; rejected immediately when the queue is full
    pub fn enqueue(
        &self,
        op: QueueOperation,
        priority: u8,
        reply: Option<flume::Sender<BatchResult>>,
    ) -> Result<()> {
        let mut heap = self.heap.lock().unwrap();
        if heap.len() >= self.max_size {
            return Err(StoreError::QueueFull.into());
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        debug!("Queued {} (priority {})", op.name(), priority);
        heap.push(QueueItem {
            op,
            priority,
            seq,
            reply,
        });
        self.depth.store(heap.len(), Ordering::SeqCst);
        drop(heap);

        let _ = self.signal_tx.send(());
        Ok(())
    }

    /// Current queue depth
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub(crate) fn pop(&self) -> Option<QueueItem> {
        let mut heap = self.heap.lock().unwrap();
        let item = heap.pop();
        self.depth.store(heap.len(), Ordering::SeqCst);
        item
    }

    pub(crate) fn signal_receiver(&self) -> flume::Receiver<()> {
        self.signal_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleanup_item() -> QueueOperation {
        QueueOperation::CollectionCleanup
    }

    #[test]
    fn test_priority_ordering() {
        let queue = OperationQueue::new(10);
        queue.enqueue(cleanup_item(), 3, None).unwrap();
        queue.enqueue(cleanup_item(), 1, None).unwrap();
        queue.enqueue(cleanup_item(), 2, None).unwrap();

        assert_eq!(queue.pop().unwrap().priority, 1);
        assert_eq!(queue.pop().unwrap().priority, 2);
        assert_eq!(queue.pop().unwrap().priority, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = OperationQueue::new(10);
        queue
            .enqueue(QueueOperation::BatchDelete(vec![]), 2, None)
            .unwrap();
        queue.enqueue(QueueOperation::CollectionCleanup, 2, None).unwrap();

        assert_eq!(queue.pop().unwrap().op.name(), "batch_delete");
        assert_eq!(queue.pop().unwrap().op.name(), "collection_cleanup");
    }

    #[test]
    fn test_bounded_rejects_when_full() {
        let queue = OperationQueue::new(2);
        queue.enqueue(cleanup_item(), 2, None).unwrap();
        queue.enqueue(cleanup_item(), 2, None).unwrap();

        let result = queue.enqueue(cleanup_item(), 2, None);
        assert!(matches!(
            result,
            Err(crate::error::RagError::Store(StoreError::QueueFull))
        ));
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_depth_tracking() {
        let queue = OperationQueue::new(10);
        assert_eq!(queue.depth(), 0);
        queue.enqueue(cleanup_item(), 2, None).unwrap();
        assert_eq!(queue.depth(), 1);
        queue.pop();
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_signal_on_enqueue() {
        let queue = OperationQueue::new(10);
        let rx = queue.signal_receiver();
        queue.enqueue(cleanup_item(), 2, None).unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
