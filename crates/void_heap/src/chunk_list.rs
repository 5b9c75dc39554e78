//! ChunkList - slot storage with an index-linked list threaded through it
//!
//! Chunks get stable generational ids; list order is most recently mapped
//! first. Unlinking a chunk frees its slot for reuse.

use alloc::vec::Vec;

const NIL: u32 = u32::MAX;

/// Stable handle to a chunk
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    index: u32,
    generation: u32,
}

impl ChunkId {
    #[inline]
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index, also written into block headers as the parent tag
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl core::fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ChunkId({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
    prev: u32,
    next: u32,
}

/// Doubly linked chunk list over a slot vector
pub struct ChunkList<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    head: u32,
    len: usize,
}

impl<T> ChunkList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            head: NIL,
            len: 0,
        }
    }

    /// Build a value that knows its own id and link it at the head
    pub fn push_front_with(&mut self, make: impl FnOnce(ChunkId) -> T) -> ChunkId {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    value: None,
                    generation: 0,
                    prev: NIL,
                    next: NIL,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let id = ChunkId::new(index, self.slots[index as usize].generation);
        let old_head = self.head;

        let slot = &mut self.slots[index as usize];
        slot.value = Some(make(id));
        slot.prev = NIL;
        slot.next = old_head;

        if old_head != NIL {
            self.slots[old_head as usize].prev = index;
        }
        self.head = index;
        self.len += 1;

        id
    }

    /// Remove a chunk from the list, returning its value
    pub fn unlink(&mut self, id: ChunkId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.value.is_none() {
            return None;
        }

        let value = slot.value.take();
        let (prev, next) = (slot.prev, slot.next);
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = NIL;
        slot.next = NIL;

        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }

        self.free_list.push(id.index);
        self.len -= 1;
        value
    }

    /// Remove and return the head chunk
    pub fn pop_front(&mut self) -> Option<T> {
        let id = self.head_id()?;
        self.unlink(id)
    }

    pub fn get(&self, id: ChunkId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Id of the most recently linked chunk
    pub fn head_id(&self) -> Option<ChunkId> {
        (self.head != NIL).then(|| ChunkId::new(self.head, self.slots[self.head as usize].generation))
    }

    /// First chunk, in list order, satisfying `pred`
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<(ChunkId, &T)> {
        self.iter().find(|&(_, value)| pred(value))
    }

    /// Iterate in list order
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
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
}

impl<T> Default for ChunkList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// List-order iterator
pub struct Iter<'a, T> {
    list: &'a ChunkList<T>,
    cursor: u32,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (ChunkId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor != NIL {
            let index = self.cursor;
            let slot = &self.list.slots[index as usize];
            self.cursor = slot.next;
            if let Some(value) = slot.value.as_ref() {
                return Some((ChunkId::new(index, slot.generation), value));
            }
        }
        None
    }
}
