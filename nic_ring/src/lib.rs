//! The descriptor arena and the index-linked lists built on top of it.
//!
//! A NIC owns a fixed pool of transfer descriptors, allocated once when the
//! adapter is brought up and never individually freed; only the *ownership*
//! of each descriptor cycles between the driver and the device. This crate
//! provides that pool as a [`DescriptorArena`] indexed by small integer
//! [`SlotId`] handles, plus [`SlotList`], a FIFO linked through the arena's
//! intrusive `next` indices. The receive ring, the transmit free list, and
//! the transmit active/completed chains are all `SlotList`s over the same
//! arena, so moving a descriptor between them is an index swap with no
//! allocation and no use-after-free risk.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

/// Index of one descriptor slot within a [`DescriptorArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u16);

impl SlotId {
    /// The slot's index into its arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// The single owner of a descriptor slot at any point in time.
///
/// Each slot belongs to exactly one owner, and transitions follow the
/// descriptor lifecycle in one direction only: a slot is acquired by
/// software, armed and handed to the device, completed by the device, and
/// finally released (or re-armed, for recycled receive descriptors).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OwnerTag {
    /// On the arena's free list.
    Free,
    /// Acquired by software and being populated, or awaiting cleanup.
    SoftwarePending,
    /// Handed to the device; the device will write its completion status.
    ArmedForDevice,
    /// The device has finished with it; software has not yet reclaimed it.
    CompletedByDevice,
}

fn transition_allowed(from: OwnerTag, to: OwnerTag) -> bool {
    use OwnerTag::*;
    matches!(
        (from, to),
        (Free, SoftwarePending)
            | (SoftwarePending, ArmedForDevice)
            | (SoftwarePending, Free)
            | (ArmedForDevice, CompletedByDevice)
            | (CompletedByDevice, ArmedForDevice)
            | (CompletedByDevice, Free)
    )
}

struct Entry<T> {
    item: T,
    owner: OwnerTag,
    next: Option<SlotId>,
}

/// A fixed pool of descriptors with an embedded free list.
///
/// All operations are O(1) and non-blocking; the caller is expected to hold
/// the adapter lock, so the arena itself needs no interior synchronization.
pub struct DescriptorArena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlotId>,
    free_tail: Option<SlotId>,
    free_len: usize,
}

impl<T> DescriptorArena<T> {
    /// Allocates an arena of `count` slots, all initially free, with each
    /// slot's item produced by `init(index)`.
    pub fn new<F: FnMut(usize) -> T>(count: usize, mut init: F) -> DescriptorArena<T> {
        assert!(
            count > 0 && count <= u16::MAX as usize,
            "invalid descriptor arena size: {}",
            count
        );
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            entries.push(Entry {
                item: init(i),
                owner: OwnerTag::Free,
                next: if i + 1 < count {
                    Some(SlotId((i + 1) as u16))
                } else {
                    None
                },
            });
        }
        DescriptorArena {
            entries,
            free_head: Some(SlotId(0)),
            free_tail: Some(SlotId((count - 1) as u16)),
            free_len: count,
        }
    }

    /// Total number of slots, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of slots currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free_len
    }

    /// Pops one slot off the free list, transferring it to
    /// [`OwnerTag::SoftwarePending`]. Returns `None` if none are free.
    pub fn try_acquire_free(&mut self) -> Option<SlotId> {
        let id = self.free_head?;
        let entry = &mut self.entries[id.index()];
        self.free_head = entry.next.take();
        if self.free_head.is_none() {
            self.free_tail = None;
        }
        self.free_len -= 1;
        assert_eq!(
            entry.owner,
            OwnerTag::Free,
            "{:?} was on the free list but not tagged free",
            id
        );
        entry.owner = OwnerTag::SoftwarePending;
        Some(id)
    }

    /// Returns a slot to the free list.
    pub fn release(&mut self, id: SlotId) {
        self.set_owner(id, OwnerTag::Free);
        self.entries[id.index()].next = None;
        match self.free_tail {
            Some(tail) => self.entries[tail.index()].next = Some(id),
            None => self.free_head = Some(id),
        }
        self.free_tail = Some(id);
        self.free_len += 1;
    }

    /// The current owner of `id`.
    pub fn owner(&self, id: SlotId) -> OwnerTag {
        self.entries[id.index()].owner
    }

    /// Moves `id` to a new owner. An out-of-order transition indicates a
    /// bookkeeping bug that would corrupt the hardware descriptor chain, so
    /// it is fatal rather than recoverable.
    pub fn set_owner(&mut self, id: SlotId, to: OwnerTag) {
        let entry = &mut self.entries[id.index()];
        assert!(
            transition_allowed(entry.owner, to),
            "illegal ownership transition for {:?}: {:?} -> {:?}",
            id,
            entry.owner,
            to
        );
        entry.owner = to;
    }

    pub fn get(&self, id: SlotId) -> &T {
        &self.entries[id.index()].item
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut T {
        &mut self.entries[id.index()].item
    }

    fn next(&self, id: SlotId) -> Option<SlotId> {
        self.entries[id.index()].next
    }

    fn set_next(&mut self, id: SlotId, next: Option<SlotId>) {
        self.entries[id.index()].next = next;
    }
}

/// A FIFO of descriptor slots, linked through the arena's intrusive `next`
/// indices.
///
/// The list itself stores only head/tail/length; the links live in the arena,
/// so a slot can be on at most one list at a time.
pub struct SlotList {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl SlotList {
    pub const fn new() -> SlotList {
        SlotList {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The next slot to examine, without removing it.
    pub fn peek_head(&self) -> Option<SlotId> {
        self.head
    }

    /// The most recently appended slot.
    pub fn tail(&self) -> Option<SlotId> {
        self.tail
    }

    /// Appends `id` at the tail.
    pub fn push_tail<T>(&mut self, arena: &mut DescriptorArena<T>, id: SlotId) {
        arena.set_next(id, None);
        match self.tail {
            Some(tail) => arena.set_next(tail, Some(id)),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Removes and returns the head slot.
    ///
    /// Popping an empty list is a contract violation: callers maintain in-use
    /// counts precisely so that this cannot happen, and continuing would
    /// corrupt the descriptor chain, so this panics instead of recovering.
    pub fn pop_head<T>(&mut self, arena: &mut DescriptorArena<T>) -> SlotId {
        let id = self.head.expect("pop_head() on an empty slot list");
        self.head = arena.next(id);
        if self.head.is_none() {
            self.tail = None;
        }
        arena.set_next(id, None);
        self.len -= 1;
        id
    }
}

impl Default for SlotList {
    fn default() -> SlotList {
        SlotList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{DescriptorArena, OwnerTag, SlotList};

    fn arena(count: usize) -> DescriptorArena<usize> {
        DescriptorArena::new(count, |i| i)
    }

    #[test]
    fn acquire_exhausts_free_list() {
        let mut a = arena(4);
        assert_eq!(a.free_count(), 4);
        for _ in 0..4 {
            assert!(a.try_acquire_free().is_some());
        }
        assert_eq!(a.free_count(), 0);
        assert!(a.try_acquire_free().is_none());
    }

    #[test]
    fn release_recycles_in_fifo_order() {
        let mut a = arena(3);
        let first = a.try_acquire_free().unwrap();
        let second = a.try_acquire_free().unwrap();
        let third = a.try_acquire_free().unwrap();
        a.release(second);
        a.release(first);
        a.release(third);
        assert_eq!(a.try_acquire_free(), Some(second));
        assert_eq!(a.try_acquire_free(), Some(first));
        assert_eq!(a.try_acquire_free(), Some(third));
    }

    #[test]
    fn slot_list_preserves_fifo_order() {
        let mut a = arena(5);
        let mut list = SlotList::new();
        let ids: Vec<_> = (0..5).map(|_| a.try_acquire_free().unwrap()).collect();
        for &id in &ids {
            list.push_tail(&mut a, id);
        }
        assert_eq!(list.len(), 5);
        assert_eq!(list.peek_head(), Some(ids[0]));
        assert_eq!(list.tail(), Some(ids[4]));
        for &id in &ids {
            assert_eq!(list.pop_head(&mut a), id);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn slots_move_between_lists() {
        let mut a = arena(2);
        let mut pending = SlotList::new();
        let mut done = SlotList::new();
        let id = a.try_acquire_free().unwrap();
        pending.push_tail(&mut a, id);
        let id = pending.pop_head(&mut a);
        done.push_tail(&mut a, id);
        assert!(pending.is_empty());
        assert_eq!(done.pop_head(&mut a), id);
    }

    #[test]
    fn ownership_cycle() {
        let mut a = arena(1);
        let id = a.try_acquire_free().unwrap();
        assert_eq!(a.owner(id), OwnerTag::SoftwarePending);
        a.set_owner(id, OwnerTag::ArmedForDevice);
        a.set_owner(id, OwnerTag::CompletedByDevice);
        a.release(id);
        assert_eq!(a.owner(id), OwnerTag::Free);
    }

    #[test]
    fn recycled_descriptor_rearms_directly() {
        let mut a = arena(1);
        let id = a.try_acquire_free().unwrap();
        a.set_owner(id, OwnerTag::ArmedForDevice);
        a.set_owner(id, OwnerTag::CompletedByDevice);
        a.set_owner(id, OwnerTag::ArmedForDevice);
    }

    #[test]
    #[should_panic(expected = "empty slot list")]
    fn pop_empty_list_is_fatal() {
        let mut a = arena(1);
        let mut list = SlotList::new();
        list.pop_head(&mut a);
    }

    #[test]
    #[should_panic(expected = "illegal ownership transition")]
    fn skipping_device_ownership_is_fatal() {
        let mut a = arena(1);
        let id = a.try_acquire_free().unwrap();
        a.set_owner(id, OwnerTag::CompletedByDevice);
    }
}
