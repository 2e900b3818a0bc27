//! Arena of reusable read buffers for in-flight transfers.
//!
//! Each slot carries a generation counter. A [`TransferHandle`] names a slot
//! and the generation it was issued for, so a completion or cancel that
//! arrives after the slot has been reused is recognised as stale instead of
//! touching the wrong transfer.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    slot: u32,
    generation: u32,
}

impl TransferHandle {
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    in_flight: bool,
    /// Buffer parked while the slot is idle.
    spare: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct TransferPool {
    slots: Vec<Slot>,
    buffer_size: usize,
}

impl TransferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let mut pool = Self::default();
        pool.reset(count, buffer_size);
        pool
    }

    /// Resize for a new acquisition.
    ///
    /// Generations keep counting up so handles from an earlier acquisition
    /// never match. Buffers of the right size are kept.
    pub fn reset(&mut self, count: usize, buffer_size: usize) {
        if buffer_size != self.buffer_size {
            for slot in &mut self.slots {
                slot.spare = None;
            }
        }
        self.buffer_size = buffer_size;
        self.slots.resize_with(count, Slot::default);
        for slot in &mut self.slots {
            slot.generation = slot.generation.wrapping_add(1);
            slot.in_flight = false;
            if slot.spare.is_none() {
                slot.spare = Some(vec![0; buffer_size]);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Transfers submitted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.in_flight).count()
    }

    /// Take an idle slot and its buffer for submission.
    pub fn acquire(&mut self) -> Option<(TransferHandle, Vec<u8>)> {
        let buffer_size = self.buffer_size;
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.in_flight)?;

        slot.in_flight = true;
        let buffer = slot
            .spare
            .take()
            .unwrap_or_else(|| vec![0; buffer_size]);
        Some((
            TransferHandle {
                slot: index as u32,
                generation: slot.generation,
            },
            buffer,
        ))
    }

    pub fn is_in_flight(&self, handle: TransferHandle) -> bool {
        self.slots
            .get(handle.slot())
            .is_some_and(|s| s.in_flight && s.generation == handle.generation)
    }

    /// Return a completed transfer's buffer to its slot.
    ///
    /// Returns `false` and drops nothing into the pool if the handle is stale.
    pub fn finish(&mut self, handle: TransferHandle, mut buffer: Vec<u8>) -> bool {
        if !self.is_in_flight(handle) {
            return false;
        }
        buffer.resize(self.buffer_size, 0);
        let slot = &mut self.slots[handle.slot()];
        slot.in_flight = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.spare = Some(buffer);
        true
    }

    /// Free a slot whose buffer was lost with a failed submission.
    pub fn abandon(&mut self, handle: TransferHandle) {
        if self.is_in_flight(handle) {
            let slot = &mut self.slots[handle.slot()];
            slot.in_flight = false;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// Forget every in-flight transfer, e.g. when the device can no longer
    /// report completions.
    pub fn abandon_all(&mut self) {
        for handle in self.in_flight() {
            self.abandon(handle);
        }
    }

    pub fn in_flight(&self) -> Vec<TransferHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_flight)
            .map(|(index, s)| TransferHandle {
                slot: index as u32,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let mut pool = TransferPool::new(2, 16);
        let (a, buffer) = pool.acquire().unwrap();
        assert_eq!(buffer.len(), 16);
        let (b, _) = pool.acquire().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_finish_reuses_buffer() {
        let mut pool = TransferPool::new(1, 8);
        let (handle, mut buffer) = pool.acquire().unwrap();
        buffer[0] = 42;
        let pointer = buffer.as_ptr();
        assert!(pool.finish(handle, buffer));
        assert_eq!(pool.outstanding(), 0);

        let (next, buffer) = pool.acquire().unwrap();
        assert_eq!(next.slot(), handle.slot());
        assert_ne!(next.generation(), handle.generation());
        assert_eq!(buffer.as_ptr(), pointer);
    }

    #[test]
    fn test_stale_handles_are_rejected() {
        let mut pool = TransferPool::new(1, 8);
        let (handle, buffer) = pool.acquire().unwrap();
        assert!(pool.finish(handle, buffer));
        let (_current, _) = pool.acquire().unwrap();

        assert!(!pool.is_in_flight(handle));
        assert!(!pool.finish(handle, vec![0; 8]));
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_reset_invalidates_previous_acquisition() {
        let mut pool = TransferPool::new(2, 8);
        let (old, _) = pool.acquire().unwrap();
        pool.reset(3, 8);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.outstanding(), 0);
        assert!(!pool.is_in_flight(old));
    }

    #[test]
    fn test_abandon_frees_slot() {
        let mut pool = TransferPool::new(2, 4);
        let (a, _) = pool.acquire().unwrap();
        let (_b, _) = pool.acquire().unwrap();
        pool.abandon(a);
        assert_eq!(pool.outstanding(), 1);
        let (c, buffer) = pool.acquire().unwrap();
        assert_eq!(c.slot(), a.slot());
        assert_eq!(buffer.len(), 4);

        pool.abandon_all();
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.in_flight().is_empty());
    }
}
