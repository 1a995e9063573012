//! Bounded top-K selection.
//!
//! [`BoundedTopK`] keeps the `k` candidates with the smallest keys seen so
//! far. It backs every nearest-neighbor search in the crate: the CPU strategy
//! keeps one per point, the accelerated strategy one per score-matrix row, and
//! single-point queries one in total.
//!
//! Internally it is a max-heap ordered by key, so the worst retained candidate
//! sits at the root. Once the structure is full, a candidate that is not
//! strictly better than the root is rejected without touching the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A retained candidate. `seq` records insertion order so equal keys keep a
/// stable order when drained.
#[derive(Debug)]
struct Entry<T> {
    key: f32,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Fixed-capacity structure holding the `k` smallest-key payloads offered.
#[derive(Debug)]
pub struct BoundedTopK<T> {
    capacity: usize,
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> BoundedTopK<T> {
    /// Creates an empty structure retaining at most `k` candidates.
    pub fn new(k: usize) -> Self {
        Self {
            capacity: k,
            heap: BinaryHeap::with_capacity(k),
            next_seq: 0,
        }
    }

    /// Offers a candidate.
    ///
    /// While fewer than `k` candidates are held the payload is always kept.
    /// Afterwards it replaces the current worst candidate only if `key` is
    /// strictly smaller than [`largest_key`](Self::largest_key).
    pub fn offer(&mut self, key: f32, payload: T) {
        if self.capacity == 0 {
            return;
        }

        if self.heap.len() >= self.capacity {
            match self.heap.peek() {
                Some(worst) if key.total_cmp(&worst.key) == Ordering::Less => {}
                _ => return,
            }
            self.heap.pop();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { key, seq, payload });
    }

    /// Number of candidates currently retained.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if nothing has been retained.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Maximum number of retained candidates.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The worst retained key, or `None` while the structure is not yet full.
    ///
    /// Callers use this as an early-exit threshold: no candidate with a larger
    /// key can enter once a bound exists.
    pub fn largest_key(&self) -> Option<f32> {
        if self.capacity == 0 || self.heap.len() < self.capacity {
            return None;
        }
        self.heap.peek().map(|entry| entry.key)
    }

    /// Consumes the structure, returning payloads in ascending key order.
    pub fn into_sorted_vec(self) -> Vec<T> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| entry.payload)
            .collect()
    }

    /// Consumes the structure, returning `(key, payload)` pairs in ascending
    /// key order.
    pub fn into_sorted_pairs(self) -> Vec<(f32, T)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| (entry.key, entry.payload))
            .collect()
    }
}
