//! Arena storage with typed indices, shared by every heap object kind.

use crate::table::Table;
use crate::value::TValue;
use std::any::Any;
use std::marker::PhantomData;

/// A typed index into an arena.
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> std::fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GcIdx").field(&self.0).field(&self.1).finish()
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> GcIdx<T> {
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Sub-tags for GC objects (stored in bits 44-46 of payload).
pub const GC_SUB_TABLE: u64 = 0;
pub const GC_SUB_CLOSURE: u64 = 1;
pub const GC_SUB_NATIVE: u64 = 2;
pub const GC_SUB_STRING: u64 = 3;
pub const GC_SUB_USERDATA: u64 = 4;
pub const GC_SUB_THREAD: u64 = 5;

/// Bits used for sub-tag within the 47-bit payload.
pub const GC_SUB_SHIFT: u64 = 44;
pub const GC_SUB_MASK: u64 = 0x7;
/// Mask for the index within the payload (lower 44 bits).
pub const GC_INDEX_MASK: u64 = (1u64 << 44) - 1;

/// A slab of optional slots with a free list. Freed slots are reused LIFO.
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    /// Mark bits, sized with `slots` and only meaningful during a collection.
    marks: Vec<bool>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn alloc(&mut self, value: T) -> GcIdx<T> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(value);
            GcIdx::new(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(value));
            self.marks.push(false);
            GcIdx::new(idx)
        }
    }

    #[inline]
    pub fn get(&self, idx: GcIdx<T>) -> Option<&T> {
        self.slots.get(idx.0 as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: GcIdx<T>) -> Option<&mut T> {
        self.slots.get_mut(idx.0 as usize).and_then(Option::as_mut)
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Set the mark bit. Returns true if the object was not already marked.
    pub fn mark(&mut self, idx: GcIdx<T>) -> bool {
        match self.marks.get_mut(idx.0 as usize) {
            Some(m) if !*m => {
                *m = true;
                true
            }
            _ => false,
        }
    }

    /// Free every unmarked live slot and clear all marks. Returns the count freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !self.marks[i] {
                *slot = None;
                self.free.push(i as u32);
                freed += 1;
            }
            self.marks[i] = false;
        }
        freed
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcIdx<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (GcIdx::new(i as u32), v)))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Full userdata: an opaque host payload with a metatable and environment.
pub struct Userdata {
    pub payload: Box<dyn Any>,
    pub metatable: Option<GcIdx<Table>>,
    pub env: Option<GcIdx<Table>>,
}

impl std::fmt::Debug for Userdata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "userdata(mt={:?})", self.metatable.map(|m| m.0))
    }
}

/// An upvalue: either open (aliasing a stack slot of some thread) or closed.
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

/// Where an upvalue's value lives.
#[derive(Clone, Copy, Debug)]
pub enum UpValLocation {
    /// Aliases `slot` on the register stack of thread `thread` (raw arena index).
    Open { thread: u32, slot: usize },
    /// The owning frame has returned; the cell holds its own copy.
    Closed(TValue),
}

impl UpVal {
    pub fn is_open(&self) -> bool {
        matches!(self.location, UpValLocation::Open { .. })
    }
}
