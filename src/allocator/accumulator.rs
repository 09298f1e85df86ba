//! Broadcast Heap
//!
//! A min-priority queue over `(key, value)` pairs with an O(1) bulk shift of every
//! stored value. The shift is kept as a single `base` offset instead of rewriting
//! each element, which is what keeps the water-filling loops in the allocators
//! near-linear.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
pub struct PriorityAccumulator<K: Ord> {
    heap: BinaryHeap<Reverse<(i64, K)>>,
    base: i64,
}

impl<K: Ord> PriorityAccumulator<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            base: 0,
        }
    }

    pub fn push(&mut self, key: K, value: i64) {
        self.heap.push(Reverse((value - self.base, key)));
    }

    /// Removes the entry with the smallest value. Equal values come out in key order.
    pub fn pop(&mut self) -> Option<(K, i64)> {
        self.heap
            .pop()
            .map(|Reverse((stored, key))| (key, stored + self.base))
    }

    pub fn min_val(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse((stored, _))| stored + self.base)
    }

    /// Shifts every stored value by `delta`.
    pub fn add_to_all(&mut self, delta: i64) {
        self.base += delta;
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains the remaining entries with their reconstructed values.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, i64)> + '_ {
        let base = self.base;
        self.heap
            .drain()
            .map(move |Reverse((stored, key))| (key, stored + base))
    }
}

impl<K: Ord> Default for PriorityAccumulator<K> {
    fn default() -> Self {
        Self::new()
    }
}
