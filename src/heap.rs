// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A binary min-heap keyed by `i64`, used by the timer thread to order
//! deadline-bearing tasks.
//!
//! Elements are addressed by an opaque [`HeapRef`] rather than by index or
//! raw pointer. `remove` and `update` locate the element's current slot with
//! a linear scan over the heap's order array; this mirrors the original
//! `Heap::Remove`/`Heap::Update`, which also scan rather than keep a
//! back-pointer into the array. Timer populations in this framework are
//! small enough that this has never needed to change.

use std::sync::atomic::{AtomicU64, Ordering};

use slab::Slab;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Restricts which direction [`MinHeap::update`] is allowed to move an
/// element, so a caller certain of the direction of change doesn't pay for
/// a wasted comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDirection {
    /// The new value may have moved in either direction.
    Either,
    /// The new value is expected to be smaller; only sift up.
    ExpectUp,
    /// The new value is expected to be larger; only sift down.
    ExpectDown,
}

/// An opaque handle to an element previously inserted into a [`MinHeap`].
///
/// Using a `HeapRef` minted by one heap against a different heap, or after
/// the element has already been extracted, is always rejected rather than
/// silently operating on an unrelated element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRef {
    heap_id: u64,
    slot: usize,
    generation: u64,
}

struct Entry<T> {
    value: i64,
    generation: u64,
    payload: T,
}

/// A binary min-heap over `(i64, T)` pairs.
pub struct MinHeap<T> {
    id: u64,
    next_generation: u64,
    storage: Slab<Entry<T>>,
    // 1-indexed; `order[0]` is an unused sentinel so child/parent index
    // arithmetic matches the textbook `2*i` / `i/2` relations.
    order: Vec<usize>,
}

impl<T> Default for MinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MinHeap<T> {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            next_generation: 0,
            storage: Slab::new(),
            order: vec![usize::MAX],
        }
    }

    /// Number of elements currently in the heap.
    pub fn len(&self) -> usize {
        self.order.len() - 1
    }

    /// True if the heap holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value at the root of the heap, if any.
    pub fn peek_min(&self) -> Option<i64> {
        self.order.get(1).map(|&key| self.storage[key].value)
    }

    /// Inserts `payload` keyed by `value`, returning a handle that can later
    /// be passed to [`MinHeap::remove`] or [`MinHeap::update`].
    pub fn insert(&mut self, value: i64, payload: T) -> HeapRef {
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = self.storage.insert(Entry {
            value,
            generation,
            payload,
        });
        self.order.push(slot);
        let idx = self.order.len() - 1;
        self.sift_up(idx);

        HeapRef {
            heap_id: self.id,
            slot,
            generation,
        }
    }

    /// Removes and returns the minimum element, if the heap is non-empty.
    pub fn extract_min(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let top = self.order[1];
        let last = self.order.pop().expect("non-empty heap has a last slot");
        if self.order.len() > 1 {
            self.order[1] = last;
            self.sift_down(1);
        }

        Some(self.storage.remove(top).payload)
    }

    /// Removes a specific element by its handle. Returns `None` if the
    /// handle belongs to a different heap or the element is no longer
    /// present (already extracted or removed).
    pub fn remove(&mut self, handle: &HeapRef) -> Option<T> {
        if handle.heap_id != self.id {
            return None;
        }

        let pos = self.locate(handle)?;
        Some(self.extract_at(pos))
    }

    /// Changes the key of a previously-inserted element and restores heap
    /// order. `direction` may restrict the relocation to a single direction
    /// when the caller already knows it; this is a pure optimization hint
    /// and `Either` is always correct.
    pub fn update(&mut self, handle: &HeapRef, new_value: i64, direction: UpdateDirection) -> bool {
        if handle.heap_id != self.id {
            return false;
        }

        let Some(pos) = self.locate(handle) else {
            return false;
        };

        self.storage[self.order[pos]].value = new_value;

        match direction {
            UpdateDirection::Either => {
                let before = self.sift_up(pos);
                if before == pos {
                    self.sift_down(pos);
                }
            }
            UpdateDirection::ExpectUp => {
                self.sift_up(pos);
            }
            UpdateDirection::ExpectDown => {
                self.sift_down(pos);
            }
        }

        true
    }

    /// Linear scan for the current array index of `handle`'s slot,
    /// validating the generation stamp so a reused slab slot can't alias
    /// an unrelated element.
    fn locate(&self, handle: &HeapRef) -> Option<usize> {
        match self.storage.get(handle.slot) {
            Some(entry) if entry.generation == handle.generation => {
                self.order.iter().position(|&key| key == handle.slot)
            }
            _ => None,
        }
    }

    fn extract_at(&mut self, pos: usize) -> T {
        let key = self.order[pos];
        let last_idx = self.order.len() - 1;

        if pos != last_idx {
            self.order[pos] = self.order[last_idx];
            self.order.pop();
            let moved_before = self.sift_up(pos);
            if moved_before == pos {
                self.sift_down(pos);
            }
        } else {
            self.order.pop();
        }

        self.storage.remove(key).payload
    }

    fn value_at(&self, idx: usize) -> i64 {
        self.storage[self.order[idx]].value
    }

    /// Sifts the element at `idx` up toward the root while it is smaller
    /// than its parent. Returns the index it ends up settling into.
    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 1 {
            let parent = idx / 2;
            if self.value_at(idx) < self.value_at(parent) {
                self.order.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
        idx
    }

    /// Sifts the element at `idx` down toward the leaves while a child is
    /// smaller. Returns the index it ends up settling into.
    fn sift_down(&mut self, mut idx: usize) -> usize {
        let len = self.order.len() - 1;
        loop {
            let left = idx * 2;
            let right = left + 1;
            let mut smallest = idx;

            if left <= len && self.value_at(left) < self.value_at(smallest) {
                smallest = left;
            }
            if right <= len && self.value_at(right) < self.value_at(smallest) {
                smallest = right;
            }

            if smallest == idx {
                break;
            }

            self.order.swap(idx, smallest);
            idx = smallest;
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Insert/extract-min ordering over a growing and shrinking heap.
    ///
    /// Mirrors the first half of `Heap::Test()`: elements are inserted in
    /// varying orders and must always extract in ascending key order.
    #[test]
    fn s1_insert_extract_min_ordering() {
        let mut heap = MinHeap::new();
        assert_eq!(heap.extract_min(), None);

        let e1 = heap.insert(100, "elem1");
        assert_eq!(heap.extract_min(), Some("elem1"));
        assert_eq!(heap.extract_min(), None);
        drop(e1);

        let mut heap = MinHeap::new();
        heap.insert(100, "elem1");
        heap.insert(80, "elem2");
        assert_eq!(heap.extract_min(), Some("elem2"));
        assert_eq!(heap.extract_min(), Some("elem1"));
        assert_eq!(heap.extract_min(), None);

        let mut heap = MinHeap::new();
        heap.insert(80, "elem2");
        heap.insert(100, "elem1");
        assert_eq!(heap.extract_min(), Some("elem2"));
        assert_eq!(heap.extract_min(), Some("elem1"));

        let mut heap = MinHeap::new();
        heap.insert(70, "elem3");
        heap.insert(100, "elem1");
        heap.insert(80, "elem2");
        heap.insert(60, "elem4");
        assert_eq!(heap.extract_min(), Some("elem4"));
        assert_eq!(heap.extract_min(), Some("elem3"));
        assert_eq!(heap.extract_min(), Some("elem2"));
        assert_eq!(heap.extract_min(), Some("elem1"));

        let mut heap = MinHeap::new();
        heap.insert(50, "elem5");
        heap.insert(70, "elem3");
        heap.insert(100, "elem1");
        assert_eq!(heap.extract_min(), Some("elem5"));
        heap.insert(60, "elem4");
        heap.insert(80, "elem2");
        assert_eq!(heap.extract_min(), Some("elem4"));
        assert_eq!(heap.extract_min(), Some("elem3"));
        heap.insert(80, "elem2");
        assert_eq!(heap.extract_min(), Some("elem2"));
        heap.insert(80, "elem2");
        heap.insert(40, "elem6");
        assert_eq!(heap.extract_min(), Some("elem6"));
        heap.insert(40, "elem6");
        heap.insert(70, "elem3");
        heap.insert(60, "elem4");
        heap.insert(50, "elem5");
        assert_eq!(heap.extract_min(), Some("elem6"));
        assert_eq!(heap.extract_min(), Some("elem5"));
        heap.insert(20, "elem8");
        assert_eq!(heap.extract_min(), Some("elem8"));
        assert_eq!(heap.extract_min(), Some("elem4"));
        heap.insert(50, "elem5");
        heap.insert(60, "elem4");
        heap.insert(10, "elem9");
        heap.insert(30, "elem7");
        heap.insert(20, "elem8");
        heap.insert(40, "elem6");
        assert_eq!(heap.extract_min(), Some("elem9"));
        assert_eq!(heap.extract_min(), Some("elem8"));
        assert_eq!(heap.extract_min(), Some("elem7"));
        assert_eq!(heap.extract_min(), Some("elem6"));
        assert_eq!(heap.extract_min(), Some("elem5"));
        assert_eq!(heap.extract_min(), Some("elem4"));
        assert_eq!(heap.extract_min(), Some("elem3"));
        assert_eq!(heap.extract_min(), Some("elem2"));
        assert_eq!(heap.extract_min(), Some("elem2"));
        assert_eq!(heap.extract_min(), Some("elem1"));
        assert_eq!(heap.extract_min(), None);
    }

    /// Mixed insert/remove-by-handle/extract-min sequence.
    ///
    /// Mirrors the second half of `Heap::Test()`.
    #[test]
    fn s2_insert_remove_mixed_sequence() {
        let mut heap = MinHeap::new();
        let r1 = heap.insert(100, "elem1");
        let r2 = heap.insert(80, "elem2");
        let r3 = heap.insert(70, "elem3");
        let r4 = heap.insert(60, "elem4");
        let r5 = heap.insert(50, "elem5");
        let r6 = heap.insert(40, "elem6");
        let r7 = heap.insert(30, "elem7");
        let r8 = heap.insert(20, "elem8");
        let r9 = heap.insert(10, "elem9");

        assert_eq!(heap.remove(&r7), Some("elem7"));
        assert_eq!(heap.remove(&r9), Some("elem9"));
        assert_eq!(heap.extract_min(), Some("elem8"));
        assert_eq!(heap.remove(&r2), Some("elem2"));
        assert_eq!(heap.remove(&r2), None);
        assert_eq!(heap.remove(&r8), None);
        assert_eq!(heap.remove(&r5), Some("elem5"));
        assert_eq!(heap.remove(&r6), Some("elem6"));
        assert_eq!(heap.remove(&r1), Some("elem1"));
        assert_eq!(heap.extract_min(), Some("elem4"));
        assert_eq!(heap.remove(&r1), None);

        drop(r3);
        drop(r4);
    }

    #[test]
    fn heap_order_invariant_holds_after_random_ops() {
        let mut heap = MinHeap::new();
        let values = [42, 17, 99, 3, 56, 8, 71, 29, 64, 1, 23];
        for &v in &values {
            heap.insert(v, v);
        }

        let mut out = Vec::new();
        while let Some(v) = heap.extract_min() {
            out.push(v);
        }

        let mut expected = values.to_vec();
        expected.sort_unstable();
        assert_eq!(out, expected);
    }

    #[test]
    fn handle_from_other_heap_is_rejected() {
        let mut a = MinHeap::new();
        let mut b: MinHeap<&str> = MinHeap::new();
        let handle = a.insert(1, "only-in-a");

        assert_eq!(b.remove(&handle), None);
    }
}
