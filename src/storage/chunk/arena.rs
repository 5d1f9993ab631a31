//! Slab arena holding memo chunk values.
//!
//! Values live in slots addressed by an [`ArenaHandle`] (index plus
//! generation), so freed slots are recycled by index and a stale handle can
//! never read a reused slot. Slot capacities are rounded to power-of-two size
//! classes; small allocations are padded up to the running average
//! allocation size so overwrites of similar-sized values stay in place and
//! freed slots are interchangeable.

use crate::error::{Error, Result};

const MIN_CLASS_SHIFT: u32 = 4; // 16 bytes
const MAX_CLASS_SHIFT: u32 = 20; // 1 MiB, larger values get exact-size slots
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Freed buffers kept per size class before they are released to the allocator.
const MAX_FREE_PER_CLASS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    buf: Vec<u8>,
    len: usize,
    live: bool,
}

#[derive(Debug)]
pub struct Arena {
    slots: Vec<Slot>,
    /// Vacant slot indexes whose buffer capacity matches the class.
    free: Vec<Vec<u32>>,
    /// Vacant slot indexes without a pooled buffer.
    vacant: Vec<u32>,
    reserved_bytes: usize,
    live_bytes: usize,
    allocations: u64,
    allocated_bytes: u64,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

fn class_of(capacity: usize) -> Option<usize> {
    let size = capacity.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
    let shift = size.trailing_zeros();
    (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
}

fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

impl Arena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            vacant: Vec::new(),
            reserved_bytes: 0,
            live_bytes: 0,
            allocations: 0,
            allocated_bytes: 0,
        }
    }

    /// Bytes reserved by slot buffers, live or pooled.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Bytes of live values.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    fn average_allocation(&self) -> usize {
        if self.allocations == 0 {
            0
        } else {
            (self.allocated_bytes / self.allocations) as usize
        }
    }

    /// Capacity reserved for a value of `len` bytes.
    fn target_capacity(&self, len: usize) -> usize {
        let wanted = len.max(self.average_allocation().min(len.saturating_mul(2)));
        match class_of(wanted) {
            Some(class) => class_size(class),
            None => len,
        }
    }

    pub fn allocate(&mut self, data: &[u8]) -> Result<ArenaHandle> {
        self.allocations += 1;
        self.allocated_bytes += data.len() as u64;

        let capacity = self.target_capacity(data.len());
        let pooled = class_of(capacity)
            .filter(|_| capacity >= data.len())
            .and_then(|class| self.free.get_mut(class).and_then(Vec::pop));

        let index = match pooled {
            Some(index) => index,
            None => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(capacity)
                    .map_err(|_| Error::OutOfMemory(capacity))?;
                self.reserved_bytes += buf.capacity();
                match self.vacant.pop() {
                    Some(index) => {
                        self.slots[index as usize].buf = buf;
                        index
                    }
                    None => {
                        self.slots.push(Slot {
                            generation: 0,
                            buf,
                            len: 0,
                            live: false,
                        });
                        (self.slots.len() - 1) as u32
                    }
                }
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.buf.clear();
        slot.buf.extend_from_slice(data);
        slot.len = data.len();
        slot.live = true;
        self.live_bytes += data.len();
        Ok(ArenaHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Replaces the value behind `handle`, in place when it still fits.
    pub fn overwrite(&mut self, handle: ArenaHandle, data: &[u8]) -> Result<ArenaHandle> {
        let slot = self.slot_mut(handle)?;
        if data.len() <= slot.buf.capacity() {
            let old_len = slot.len;
            slot.buf.clear();
            slot.buf.extend_from_slice(data);
            slot.len = data.len();
            self.live_bytes = self.live_bytes - old_len + data.len();
            return Ok(handle);
        }
        self.free(handle)?;
        self.allocate(data)
    }

    pub fn free(&mut self, handle: ArenaHandle) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        let len = slot.len;
        slot.len = 0;
        let capacity = slot.buf.capacity();
        self.live_bytes -= len;

        match class_of(capacity).filter(|class| class_size(*class) == capacity) {
            Some(class) if self.free[class].len() < MAX_FREE_PER_CLASS => {
                self.free[class].push(handle.index);
            }
            _ => {
                let slot = &mut self.slots[handle.index as usize];
                self.reserved_bytes -= slot.buf.capacity();
                slot.buf = Vec::new();
                self.vacant.push(handle.index);
            }
        }
        Ok(())
    }

    pub fn get(&self, handle: ArenaHandle) -> Option<&[u8]> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.live && slot.generation == handle.generation)
            .map(|slot| &slot.buf[..slot.len])
    }

    fn slot_mut(&mut self, handle: ArenaHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.live && slot.generation == handle.generation)
            .ok_or_else(|| Error::InvalidState(format!("stale arena handle {:?}", handle)))
    }
}
