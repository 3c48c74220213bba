// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity slot storage addressed by generation-tagged handles.
//!
//! Every record the core keeps (power nodes, devices, subsystems and the
//! requirement edges between them) lives in an `Arena`. Records refer to each
//! other by `Handle`, which stays valid for as long as the record does. If a
//! slot is ever vacated and reused, its generation is bumped, so a handle
//! left over from the previous occupant no longer resolves.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

pub struct Handle<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn index(self) -> u16 {
        self.index
    }

    pub fn generation(self) -> u16 {
        self.generation
    }
}

// These are written out by hand because deriving them would require `T` to
// implement them as well.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

pub struct Arena<T, const N: usize> {
    slots: heapless::Vec<Slot<T>, N>,
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Arena<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
        }
    }

    /// Stores `value`, reusing a vacated slot if there is one. Hands the value
    /// back if the arena is full.
    pub fn alloc(&mut self, value: T) -> Result<Handle<T>, T> {
        if let Some((index, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.is_none())
        {
            slot.value = Some(value);
            return Ok(Handle {
                index: index as u16,
                generation: slot.generation,
                _marker: PhantomData,
            });
        }

        let index = self.slots.len();
        match self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        }) {
            Ok(()) => Ok(Handle {
                index: index as u16,
                generation: 0,
                _marker: PhantomData,
            }),
            Err(slot) => match slot.value {
                Some(v) => Err(v),
                // We just put it there.
                None => unreachable!(),
            },
        }
    }

    /// Vacates the slot named by `handle`, returning its contents. Any other
    /// copies of `handle` stop resolving.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(usize::from(handle.index))?;
        if slot.generation == handle.generation {
            slot.value.as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation == handle.generation {
            slot.value.as_mut()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as u16,
                        generation: s.generation,
                        _marker: PhantomData,
                    },
                    v,
                )
            })
        })
    }

    /// Snapshot of every live handle, for walks that need to mutate the
    /// arena as they go.
    pub fn handles(&self) -> heapless::Vec<Handle<T>, N> {
        // Can't overflow: there are at most N slots.
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle<T>> {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, const N: usize> Index<Handle<T>> for Arena<T, N> {
    type Output = T;

    /// Panics if `handle` is stale. Handles held inside the registry are
    /// never stale, so this indicates corrupted bookkeeping.
    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(v) => v,
            None => panic!("stale handle {handle:?}"),
        }
    }
}

impl<T, const N: usize> IndexMut<Handle<T>> for Arena<T, N> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.get_mut(handle) {
            Some(v) => v,
            None => panic!("stale handle {handle:?}"),
        }
    }
}
