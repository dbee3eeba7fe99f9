//! Fixed-slot buffer arena for expensive buffers (GPU textures, encoder
//! surfaces).
//!
//! Slots are allocated once and addressed by generation-tagged handles.
//! Releasing bumps the slot's generation, so a handle kept past its release
//! is detected on the next access instead of aliasing whoever reacquired the
//! slot.

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Handle to one acquired arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}@{}", self.index, self.generation)
    }
}

struct Slot<T> {
    value: T,
    generation: u32,
    in_use: bool,
}

/// Arena of physically distinct buffers handed out round-robin.
pub struct BufferArena<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
}

impl<T> BufferArena<T> {
    pub fn new(buffers: impl IntoIterator<Item = T>) -> Self {
        let slots: Vec<Slot<T>> = buffers
            .into_iter()
            .map(|value| Slot {
                value,
                generation: 0,
                in_use: false,
            })
            .collect();
        let free = (0..slots.len() as u32).collect();
        Self { slots, free }
    }

    /// Arena of `count` slots built by `make`.
    pub fn with_slots(count: usize, make: impl FnMut(usize) -> T) -> Self {
        Self::new((0..count).map(make))
    }

    /// Take the least recently released slot.
    pub fn acquire(&mut self) -> Option<BufferHandle> {
        let index = self.free.pop_front()?;
        let slot = &mut self.slots[index as usize];
        slot.in_use = true;
        Some(BufferHandle {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: BufferHandle) -> PipelineResult<&Slot<T>> {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => Ok(slot),
            _ => Err(PipelineError::StaleBuffer(handle.to_string())),
        }
    }

    pub fn get(&self, handle: BufferHandle) -> PipelineResult<&T> {
        self.slot(handle).map(|s| &s.value)
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> PipelineResult<&mut T> {
        self.slot(handle)?;
        Ok(&mut self.slots[handle.index as usize].value)
    }

    /// Return a slot. Releasing the same handle twice is an error.
    pub fn release(&mut self, handle: BufferHandle) -> PipelineResult<()> {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return Err(PipelineError::StaleBuffer(handle.to_string()));
        };
        if slot.generation == handle.generation && slot.in_use {
            slot.in_use = false;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push_back(handle.index);
            Ok(())
        } else if slot.generation == handle.generation.wrapping_add(1) {
            Err(PipelineError::DoubleRelease(handle.to_string()))
        } else {
            Err(PipelineError::StaleBuffer(handle.to_string()))
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}
