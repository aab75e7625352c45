//! Priority queue of pending agent utterances
//!
//! Higher priority dequeues first; FIFO breaks ties. `clear()` is atomic
//! with respect to `get_next()`, which is what barge-in relies on to
//! guarantee nothing queued speaks over the caller.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// One queued utterance
#[derive(Debug, Clone)]
pub struct SpeechItem {
    /// Monotonically assigned id
    pub id: u64,
    pub text: String,
    /// Higher speaks first
    pub priority: i32,
    pub queued_at: Instant,
}

#[derive(Debug)]
struct HeapEntry {
    item: SpeechItem,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.item.priority == other.item.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier sequence
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

/// Pending speech, ordered by `(priority desc, enqueue order)`
#[derive(Debug, Default)]
pub struct SpeechQueue {
    inner: Mutex<QueueInner>,
}

impl SpeechQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an utterance; returns its id.
    pub fn add(&self, text: impl Into<String>, priority: i32) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let item = SpeechItem {
            id: seq,
            text: text.into(),
            priority,
            queued_at: Instant::now(),
        };
        inner.heap.push(HeapEntry { item, seq });

        tracing::debug!(speech_id = seq, queue_size = inner.heap.len(), "Speech queued");
        seq
    }

    pub fn get_next(&self) -> Option<SpeechItem> {
        self.inner.lock().heap.pop().map(|e| e.item)
    }

    /// Drop everything pending; returns how many items were cleared.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let cleared = inner.heap.len();
        inner.heap.clear();
        if cleared > 0 {
            tracing::info!(cleared, "Speech queue cleared");
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_with_fifo_ties() {
        let queue = SpeechQueue::new();
        queue.add("low", 0);
        queue.add("high", 5);
        queue.add("also low", 0);

        assert_eq!(queue.get_next().unwrap().text, "high");
        assert_eq!(queue.get_next().unwrap().text, "low");
        assert_eq!(queue.get_next().unwrap().text, "also low");
        assert!(queue.get_next().is_none());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let queue = SpeechQueue::new();
        let a = queue.add("a", 0);
        let b = queue.add("b", 0);
        assert!(b > a);
    }

    #[test]
    fn test_clear() {
        let queue = SpeechQueue::new();
        queue.add("a", 0);
        queue.add("b", 1);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.clear(), 0);
    }
}
