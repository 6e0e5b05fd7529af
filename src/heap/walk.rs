//! Transitive object graph walks.
//!
//! [`ReachableObjects`] visits every object reachable from a set of roots exactly once,
//! breadth first. The walk uses an explicit worklist, so arbitrarily deep object graphs
//! (long linked lists, deep trees) cannot exhaust the stack.

use std::collections::{HashSet, VecDeque};

use crate::{
    heap::{ClrObject, Heap},
    target::reader::MemoryReader,
};

/// Iterator over objects reachable from a root set, returned by [`Heap::reachable_from`].
///
/// Roots and references that point outside every segment, or at memory whose type
/// cannot be resolved, are skipped.
pub struct ReachableObjects<'heap> {
    heap: &'heap Heap,
    reader: MemoryReader,
    pending: VecDeque<u64>,
    visited: HashSet<u64>,
    carefully: bool,
}

impl<'heap> ReachableObjects<'heap> {
    pub(crate) fn new<I>(heap: &'heap Heap, roots: I, carefully: bool) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        ReachableObjects {
            heap,
            reader: heap.heap_reader(),
            pending: roots.into_iter().collect(),
            visited: HashSet::new(),
            carefully,
        }
    }

    /// Number of distinct addresses seen so far, including skipped ones.
    #[must_use]
    pub fn visited(&self) -> usize {
        self.visited.len()
    }
}

impl<'heap> Iterator for ReachableObjects<'heap> {
    type Item = ClrObject<'heap>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(address) = self.pending.pop_front() {
            if !self.visited.insert(address) {
                continue;
            }
            if self.heap.segment_for_address(address).is_none() {
                continue;
            }
            let Some(ty) = self.heap.object_type_with(&mut self.reader, address) else {
                continue;
            };

            let visited = &self.visited;
            let pending = &mut self.pending;
            self.heap.walk_object_references(
                &mut self.reader,
                address,
                &ty,
                self.carefully,
                |target, _| {
                    if !visited.contains(&target) {
                        pending.push_back(target);
                    }
                },
            );

            return Some(ClrObject::new(self.heap, address, ty));
        }
        None
    }
}
