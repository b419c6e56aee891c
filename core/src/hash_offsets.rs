//! A compact, open-addressed multimap from `(column, key hash)` to the ordered
//! list of mixed offsets a key's records have been seen at.
//!
//! Entries are never removed from the table itself. A remove only appends a
//! tombstone's offset to the list like any other write, so the probe
//! sequence never has to skip tombstoned slots.
//!
//! Each key's offset list is a singly linked chain threaded through one
//! shared `arena: Vec<OffsetNode>`, rather than a separate heap allocation
//! per key. A slot only stores the index of its newest node; growing the
//! slot array on rehash moves `Slot` values (three `Copy` fields) without
//! touching the arena at all.

const LOAD_FACTOR: f64 = 0.7;
const GROW_FACTOR: usize = 2;
const INITIAL_CAPACITY: usize = 16;

/// A node in a key's offset chain. `prev` points at the next-older node in
/// the shared arena, or `-1` if this is the oldest entry for its key.
#[derive(Clone, Copy)]
struct OffsetNode {
    value: i32,
    prev: i32,
}

#[derive(Clone, Copy)]
struct Slot {
    col: u32,
    hash: i32,
    head: i32,
}

/// Multimap partitioned by column, backed by a single flat open-addressed
/// array shared across every column.
pub struct HashOffsets {
    slots: Vec<Option<Slot>>,
    arena: Vec<OffsetNode>,
    occupied: usize,
}

impl HashOffsets {
    pub fn new() -> Self {
        Self {
            slots: vec![None; INITIAL_CAPACITY],
            arena: Vec::new(),
            occupied: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_hash(col: usize, hash: i32) -> usize {
        let mut h = (hash as u32 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        h ^= (col as u64).wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        h ^= h >> 33;
        h as usize
    }

    /// Finds the slot index for `(col, hash)`: either the slot that already
    /// holds it, or the first empty slot on its probe sequence.
    fn probe(&self, col: usize, hash: i32) -> usize {
        let cap = self.capacity();
        let mut idx = Self::slot_hash(col, hash) % cap;
        loop {
            match &self.slots[idx] {
                None => return idx,
                Some(slot) if slot.col == col as u32 && slot.hash == hash => return idx,
                _ => idx = (idx + 1) % cap,
            }
        }
    }

    fn grow_if_needed(&mut self) {
        if self.occupied as f64 + 1.0 < self.capacity() as f64 * LOAD_FACTOR {
            return;
        }

        let new_capacity = self.capacity() * GROW_FACTOR;
        let old_slots = std::mem::replace(&mut self.slots, vec![None; new_capacity]);
        self.occupied = 0;
        for slot in old_slots.into_iter().flatten() {
            let idx = self.probe(slot.col as usize, slot.hash);
            self.slots[idx] = Some(slot);
            self.occupied += 1;
        }
    }

    /// Pushes `mixed` as the newest node of `(col, hash)`'s chain, creating
    /// the slot if absent. Returns the arena index of the new node.
    fn push_node(&mut self, prev: i32, mixed: i32) -> i32 {
        let node_idx = self.arena.len() as i32;
        self.arena.push(OffsetNode { value: mixed, prev });
        node_idx
    }

    /// Appends `mixed` to the offset list at `(col, hash)`, creating the entry
    /// if absent. Duplicates are permitted; insertion order is preserved.
    pub fn put(&mut self, hash: i32, mixed: i32, col: usize) {
        self.grow_if_needed();
        let idx = self.probe(col, hash);
        let prev = self.slots[idx].map_or(-1, |slot| slot.head);
        let node_idx = self.push_node(prev, mixed);
        match &mut self.slots[idx] {
            Some(slot) => slot.head = node_idx,
            None => {
                self.slots[idx] = Some(Slot {
                    col: col as u32,
                    hash,
                    head: node_idx,
                });
                self.occupied += 1;
            }
        }
    }

    /// Substitutes `old_mixed` with `new_mixed` in place within the list at
    /// `(col, hash)`, preserving order. Falls back to `put` if `old_mixed` is
    /// not present in the (possibly nonexistent) list.
    pub fn replace(&mut self, hash: i32, old_mixed: i32, new_mixed: i32, col: usize) {
        self.grow_if_needed();
        let idx = self.probe(col, hash);
        let head = self.slots[idx].map(|slot| slot.head);

        let Some(mut cursor) = head else {
            self.put(hash, new_mixed, col);
            return;
        };
        while cursor != -1 {
            let node = &mut self.arena[cursor as usize];
            if node.value == old_mixed {
                node.value = new_mixed;
                return;
            }
            cursor = node.prev;
        }
        self.put(hash, new_mixed, col);
    }

    /// Returns the current offset list for `(col, hash)`, oldest-first, or
    /// `None` if the key hash has never been seen in this column.
    pub fn get(&self, hash: i32, col: usize) -> Option<Vec<i32>> {
        let idx = self.probe(col, hash);
        let slot = self.slots[idx]?;

        let mut offsets = Vec::new();
        let mut cursor = slot.head;
        while cursor != -1 {
            let node = self.arena[cursor as usize];
            offsets.push(node.value);
            cursor = node.prev;
        }
        offsets.reverse();
        Some(offsets)
    }

    /// Count of distinct `(col, hash)` keys across all columns.
    pub fn size(&self) -> usize {
        self.occupied
    }
}

impl Default for HashOffsets {
    fn default() -> Self {
        Self::new()
    }
}
