use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Generation-checked reference to a queued item. A handle goes stale once its item is popped
/// or removed, even if the underlying slot is reused later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    slot: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    stamp: u64,
    entry: Option<(f64, T)>,
}

const COMPACT_SLACK: usize = 16;

#[derive(Debug)]
struct HeapEntry {
    t: f64,
    seq: u64,
    slot: u32,
}

// BinaryHeap is a max-heap, the earliest (t, seq) has to compare greatest
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.t.total_cmp(&other.t) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            ord => ord,
        }
        .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

/// Time-ordered event queue. Items with equal time come out in insertion order. Moving an item
/// counts as a fresh insertion for tie-breaking purposes.
#[derive(Debug)]
pub struct EventQueue<T> {
    heap: BinaryHeap<HeapEntry>,
    slots: Vec<Slot<T>>,
    free_slots: Vec<u32>,
    next_seq: u64,
    len: usize,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            next_seq: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, t: f64, value: T) -> QueueHandle {
        let seq = self.next_seq();

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    stamp: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let target = &mut self.slots[slot as usize];
        target.stamp = seq;
        target.entry = Some((t, value));
        self.heap.push(HeapEntry { t, seq, slot });
        self.len += 1;

        QueueHandle {
            slot,
            generation: target.generation,
        }
    }

    pub fn get(&self, handle: QueueHandle) -> Option<(f64, &T)> {
        self.live_slot(handle)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(t, value)| (*t, value))
    }

    pub fn contains(&self, handle: QueueHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: QueueHandle) -> Option<(f64, T)> {
        self.live_slot(handle)?;
        let removed = self.release(handle.slot);
        self.compact_if_sparse();
        removed
    }

    /// Relocates a pending item to `t`. Returns false for stale handles.
    pub fn update(&mut self, handle: QueueHandle, t: f64) -> bool {
        if self.live_slot(handle).is_none() {
            return false;
        }

        let seq = self.next_seq();
        let slot = &mut self.slots[handle.slot as usize];
        slot.stamp = seq;
        if let Some(entry) = slot.entry.as_mut() {
            entry.0 = t;
        }
        self.heap.push(HeapEntry {
            t,
            seq,
            slot: handle.slot,
        });
        self.compact_if_sparse();
        true
    }

    pub fn peek_time(&mut self) -> Option<f64> {
        self.discard_stale();
        self.heap.peek().map(|top| top.t)
    }

    pub fn pop(&mut self) -> Option<(f64, T)> {
        self.discard_stale();
        let top = self.heap.pop()?;
        self.release(top.slot)
    }

    /// Removes the earliest item if it is due at or before `t_max`.
    pub fn pop_until(&mut self, t_max: f64) -> Option<(f64, T)> {
        match self.peek_time() {
            Some(t) if t <= t_max => self.pop(),
            _ => None,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn live_slot(&self, handle: QueueHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            let slot = &self.slots[top.slot as usize];
            if slot.entry.is_some() && slot.stamp == top.seq {
                break;
            }
            self.heap.pop();
        }
    }

    /// Drops superseded heap entries once they clearly outnumber the live items, so that
    /// repeatedly moved or removed items keep the heap within `2 * len + COMPACT_SLACK`.
    fn compact_if_sparse(&mut self) {
        if self.heap.len() <= 2 * self.len + COMPACT_SLACK {
            return;
        }

        let slots = &self.slots;
        self.heap.retain(|entry| {
            let slot = &slots[entry.slot as usize];
            slot.entry.is_some() && slot.stamp == entry.seq
        });
    }

    fn release(&mut self, slot_idx: u32) -> Option<(f64, T)> {
        let slot = &mut self.slots[slot_idx as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(slot_idx);
        self.len -= 1;
        Some(entry)
    }
}
