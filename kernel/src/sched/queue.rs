//! Intrusive ready queues for a single runqueue
//!
//! Entities live in a fixed-capacity [`EntitySlab`] owned by the runqueue.
//! Queues never allocate: each entity carries a [`QueueLink`] with the slot
//! ids of its neighbours, so push, pop and removal of an arbitrary member
//! are O(1). Deadline-ordered insertion walks from the tail, which is O(1)
//! for the common case of monotonically increasing deadlines.

use alloc::vec::Vec;

use super::{
    config::MLFQ_LEVELS,
    task::{SchedEntity, TaskId},
};
use crate::error::{SchedError, SchedResult};

/// Index of an entity inside its runqueue's slab
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One ready band of a runqueue, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Band {
    /// Gaming FIFO
    Gaming,
    /// Earliest-deadline-first real-time queue
    RealTime,
    /// MLFQ level `0..MLFQ_LEVELS`
    Mlfq(u8),
}

/// Number of bands per runqueue.
pub const BAND_COUNT: usize = 2 + MLFQ_LEVELS;

impl Band {
    /// All bands, highest priority first.
    pub const ALL: [Band; BAND_COUNT] = [
        Band::Gaming,
        Band::RealTime,
        Band::Mlfq(0),
        Band::Mlfq(1),
        Band::Mlfq(2),
        Band::Mlfq(3),
        Band::Mlfq(4),
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Band::Gaming => 0,
            Band::RealTime => 1,
            Band::Mlfq(level) => 2 + (level as usize).min(MLFQ_LEVELS - 1),
        }
    }
}

/// Link fields stored inside each entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLink {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    /// Band the entity is listed in, `None` when not queued
    band: Option<Band>,
}

impl QueueLink {
    #[inline]
    pub fn band(&self) -> Option<Band> {
        self.band
    }

    /// Successor in the same band
    #[inline]
    pub fn next(&self) -> Option<SlotId> {
        self.next
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.band.is_some()
    }
}

/// An entity that could not be stored, handed back with the reason
#[derive(Debug)]
pub struct Rejected {
    pub error: SchedError,
    pub entity: SchedEntity,
}

/// Fixed-capacity entity storage for one runqueue
#[derive(Debug)]
pub struct EntitySlab {
    slots: Vec<Option<SchedEntity>>,
    free: Vec<SlotId>,
}

impl EntitySlab {
    /// Preallocate `capacity` slots. This is the only allocation the slab
    /// ever makes.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        // Reverse so the lowest slot is handed out first
        let free = (0..capacity as u32).rev().map(SlotId).collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot the next [`insert`](Self::insert) will use.
    pub fn next_free(&self) -> Option<SlotId> {
        self.free.last().copied()
    }

    /// Store an entity. When every slot is taken it comes back unchanged.
    pub fn insert(&mut self, mut entity: SchedEntity) -> Result<SlotId, Rejected> {
        let Some(slot) = self.free.pop() else {
            return Err(Rejected {
                error: SchedError::OutOfCapacity {
                    resource: "runqueue entity slots",
                },
                entity,
            });
        };
        entity.link = QueueLink::default();
        self.slots[slot.index()] = Some(entity);
        Ok(slot)
    }

    /// Release a slot. The entity must already be unlinked.
    pub fn take(&mut self, slot: SlotId) -> Option<SchedEntity> {
        let entity = self.slots.get_mut(slot.index())?.take()?;
        debug_assert!(!entity.link.is_linked(), "taking a queued entity");
        self.free.push(slot);
        Some(entity)
    }

    #[inline]
    pub fn get(&self, slot: SlotId) -> Option<&SchedEntity> {
        self.slots.get(slot.index())?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut SchedEntity> {
        self.slots.get_mut(slot.index())?.as_mut()
    }

    /// Occupied slots in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &SchedEntity)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (SlotId(i as u32), e)))
    }

    fn link(&self, slot: SlotId) -> SchedResult<QueueLink> {
        self.get(slot).map(|e| e.link).ok_or(SchedError::Corrupted {
            what: "queue references an empty slot",
        })
    }

    fn link_mut(&mut self, slot: SlotId) -> SchedResult<&mut QueueLink> {
        self.get_mut(slot)
            .map(|e| &mut e.link)
            .ok_or(SchedError::Corrupted {
                what: "queue references an empty slot",
            })
    }
}

/// Task id to slot lookup for one runqueue.
///
/// A sorted vector sized like the slab up front, so inserting and
/// removing never reallocate.
#[derive(Debug)]
pub struct TaskIndex {
    entries: Vec<(TaskId, SlotId)>,
}

impl TaskIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, task: TaskId) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&task, |&(t, _)| t)
    }

    pub fn get(&self, task: TaskId) -> Option<SlotId> {
        self.search(task).ok().map(|i| self.entries[i].1)
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.search(task).is_ok()
    }

    /// Record `task` at `slot`. Fails if the task is already indexed or
    /// the preallocated capacity is used up.
    pub fn insert(&mut self, task: TaskId, slot: SlotId) -> SchedResult<()> {
        let Err(at) = self.search(task) else {
            return Err(SchedError::Corrupted {
                what: "task indexed twice",
            });
        };
        if self.entries.len() == self.entries.capacity() {
            return Err(SchedError::OutOfCapacity {
                resource: "runqueue task index",
            });
        }
        self.entries.insert(at, (task, slot));
        Ok(())
    }

    pub fn remove(&mut self, task: TaskId) -> Option<SlotId> {
        let at = self.search(task).ok()?;
        Some(self.entries.remove(at).1)
    }
}

/// Doubly-linked list threaded through the entities of one slab
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntrusiveList {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl IntrusiveList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn front(&self) -> Option<SlotId> {
        self.head
    }

    #[inline]
    pub fn back(&self) -> Option<SlotId> {
        self.tail
    }

    /// Append at the tail.
    pub fn push_back(&mut self, slab: &mut EntitySlab, slot: SlotId, band: Band) -> SchedResult<()> {
        let tail = self.tail;
        self.link_between(slab, slot, band, tail, None)
    }

    /// Insert keeping `(deadline, enqueue_seq)` ascending. Equal deadlines
    /// keep insertion order.
    pub fn insert_by_deadline(
        &mut self,
        slab: &mut EntitySlab,
        slot: SlotId,
        band: Band,
    ) -> SchedResult<()> {
        let key = deadline_key(slab, slot)?;
        let mut after = self.tail;
        while let Some(cur) = after {
            if deadline_key(slab, cur)? <= key {
                break;
            }
            after = slab.link(cur)?.prev;
        }
        let before = match after {
            Some(prev) => slab.link(prev)?.next,
            None => self.head,
        };
        self.link_between(slab, slot, band, after, before)
    }

    fn link_between(
        &mut self,
        slab: &mut EntitySlab,
        slot: SlotId,
        band: Band,
        prev: Option<SlotId>,
        next: Option<SlotId>,
    ) -> SchedResult<()> {
        let link = slab.link_mut(slot)?;
        debug_assert!(!link.is_linked(), "entity enqueued twice");
        if link.is_linked() {
            return Err(SchedError::Corrupted {
                what: "entity already queued",
            });
        }
        *link = QueueLink {
            prev,
            next,
            band: Some(band),
        };
        match prev {
            Some(p) => slab.link_mut(p)?.next = Some(slot),
            None => self.head = Some(slot),
        }
        match next {
            Some(n) => slab.link_mut(n)?.prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.len += 1;
        Ok(())
    }

    /// Remove and return the head.
    pub fn pop_front(&mut self, slab: &mut EntitySlab) -> SchedResult<Option<SlotId>> {
        match self.head {
            Some(slot) => self.remove(slab, slot).map(|()| Some(slot)),
            None => Ok(None),
        }
    }

    /// Unlink an arbitrary member in O(1). The caller guarantees `slot`
    /// belongs to this list.
    pub fn remove(&mut self, slab: &mut EntitySlab, slot: SlotId) -> SchedResult<()> {
        let link = slab.link(slot)?;
        debug_assert!(link.is_linked(), "removing an entity that is not queued");
        if !link.is_linked() || self.len == 0 {
            return Err(SchedError::Corrupted {
                what: "entity not queued",
            });
        }
        match link.prev {
            Some(p) => slab.link_mut(p)?.next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => slab.link_mut(n)?.prev = link.prev,
            None => self.tail = link.prev,
        }
        *slab.link_mut(slot)? = QueueLink::default();
        self.len -= 1;
        Ok(())
    }

    /// Walk head to tail
    pub fn iter<'a>(&self, slab: &'a EntitySlab) -> Cursor<'a> {
        Cursor {
            slab,
            at: self.head,
            forward: true,
        }
    }

    /// Walk tail to head
    pub fn iter_rev<'a>(&self, slab: &'a EntitySlab) -> Cursor<'a> {
        Cursor {
            slab,
            at: self.tail,
            forward: false,
        }
    }
}

fn deadline_key(slab: &EntitySlab, slot: SlotId) -> SchedResult<(u64, u64)> {
    let entity = slab.get(slot).ok_or(SchedError::Corrupted {
        what: "queue references an empty slot",
    })?;
    Ok((entity.deadline().unwrap_or(u64::MAX), entity.enqueue_seq))
}

/// Iterator over the slots of one list
pub struct Cursor<'a> {
    slab: &'a EntitySlab,
    at: Option<SlotId>,
    forward: bool,
}

impl Iterator for Cursor<'_> {
    type Item = SlotId;

    fn next(&mut self) -> Option<SlotId> {
        let slot = self.at?;
        let link = self.slab.get(slot)?.link;
        self.at = if self.forward { link.next } else { link.prev };
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::sched::task::{RtParams, SchedAttrs, TaskId};

    fn normal(slab: &mut EntitySlab, id: u64) -> SlotId {
        slab.insert(SchedEntity::new(TaskId(id), &SchedAttrs::default(), 4, 0))
            .unwrap()
    }

    fn rt(slab: &mut EntitySlab, id: u64, deadline: u64, seq: u64) -> SlotId {
        let attrs = SchedAttrs::real_time(RtParams::new(1, deadline));
        let mut e = SchedEntity::new(TaskId(id), &attrs, 4, 0);
        e.enqueue_seq = seq;
        slab.insert(e).unwrap()
    }

    fn ids(list: &IntrusiveList, slab: &EntitySlab) -> Vec<u64> {
        list.iter(slab)
            .map(|s| slab.get(s).unwrap().task().0)
            .collect()
    }

    #[test]
    fn test_band_order() {
        assert!(Band::Gaming < Band::RealTime);
        assert!(Band::RealTime < Band::Mlfq(0));
        assert!(Band::Mlfq(0) < Band::Mlfq(4));
        for (i, band) in Band::ALL.iter().enumerate() {
            assert_eq!(band.index(), i);
        }
    }

    #[test]
    fn test_slab_capacity() {
        let mut slab = EntitySlab::with_capacity(2);
        let a = normal(&mut slab, 1);
        let _b = normal(&mut slab, 2);
        assert_eq!(slab.next_free(), None);
        let rejected = slab
            .insert(SchedEntity::new(TaskId(3), &SchedAttrs::default(), 4, 0))
            .unwrap_err();
        assert!(matches!(rejected.error, SchedError::OutOfCapacity { .. }));
        assert_eq!(rejected.entity.task(), TaskId(3));
        assert_eq!(slab.take(a).map(|e| e.task()), Some(TaskId(1)));
        assert_eq!(slab.len(), 1);
        assert!(slab.take(a).is_none());
        normal(&mut slab, 4);
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn test_task_index_stays_within_capacity() {
        let mut slab = EntitySlab::with_capacity(2);
        let (a, b) = (normal(&mut slab, 1), normal(&mut slab, 2));
        let mut index = TaskIndex::with_capacity(2);
        index.insert(TaskId(9), a).unwrap();
        index.insert(TaskId(3), b).unwrap();
        assert!(matches!(
            index.insert(TaskId(3), b),
            Err(SchedError::Corrupted { .. })
        ));
        assert!(matches!(
            index.insert(TaskId(5), b),
            Err(SchedError::OutOfCapacity { .. })
        ));
        assert_eq!(index.get(TaskId(9)), Some(a));
        assert_eq!(index.get(TaskId(3)), Some(b));
        assert_eq!(index.remove(TaskId(9)), Some(a));
        assert_eq!(index.remove(TaskId(9)), None);
        assert!(!index.contains(TaskId(9)));
        index.insert(TaskId(1), a).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries.capacity(), 2);
    }

    #[test]
    fn test_fifo_order_and_remove() {
        let mut slab = EntitySlab::with_capacity(8);
        let mut list = IntrusiveList::new();
        let slots: Vec<SlotId> = (1..=4).map(|id| normal(&mut slab, id)).collect();
        for &s in &slots {
            list.push_back(&mut slab, s, Band::Mlfq(2)).unwrap();
        }
        assert_eq!(ids(&list, &slab), [1, 2, 3, 4]);

        list.remove(&mut slab, slots[1]).unwrap();
        assert_eq!(ids(&list, &slab), [1, 3, 4]);
        list.remove(&mut slab, slots[3]).unwrap();
        assert_eq!(list.back(), Some(slots[2]));
        assert_eq!(list.pop_front(&mut slab).unwrap(), Some(slots[0]));
        assert_eq!(ids(&list, &slab), [3]);
        assert_eq!(list.len(), 1);
        assert!(!slab.get(slots[0]).unwrap().link.is_linked());
    }

    #[test]
    fn test_push_then_remove_restores_state() {
        let mut slab = EntitySlab::with_capacity(4);
        let mut list = IntrusiveList::new();
        let a = normal(&mut slab, 1);
        let b = normal(&mut slab, 2);
        list.push_back(&mut slab, a, Band::Mlfq(1)).unwrap();
        let before = list;
        list.push_back(&mut slab, b, Band::Mlfq(1)).unwrap();
        list.remove(&mut slab, b).unwrap();
        assert_eq!(list, before);
        assert_eq!(slab.get(a).unwrap().link.next, None);
    }

    #[test]
    fn test_deadline_order_with_fifo_ties() {
        let mut slab = EntitySlab::with_capacity(8);
        let mut list = IntrusiveList::new();
        let entries = [(1, 30, 0), (2, 10, 1), (3, 20, 2), (4, 10, 3), (5, 40, 4)];
        for (id, deadline, seq) in entries {
            let s = rt(&mut slab, id, deadline, seq);
            list.insert_by_deadline(&mut slab, s, Band::RealTime).unwrap();
        }
        assert_eq!(ids(&list, &slab), [2, 4, 3, 1, 5]);
        let rev: Vec<u64> = list
            .iter_rev(&slab)
            .map(|s| slab.get(s).unwrap().task().0)
            .collect();
        assert_eq!(rev, [5, 1, 3, 4, 2]);
    }
}
