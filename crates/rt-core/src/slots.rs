//! Stream Slot Allocation
//!
//! Every tunneled TCP connection of a listening session occupies one numbered
//! slot in `[1, capacity]`. The slot number names the data channel carrying it.

use std::collections::BTreeSet;

/// Default number of concurrent streams per session
pub const DEFAULT_TUNNEL_LIMIT: usize = 1000;

/// Lowest-free-first allocator for stream slots
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    capacity: usize,
    in_use: BTreeSet<u32>,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.in_use.len() >= self.capacity
    }

    /// Take the lowest free slot, or `None` when at capacity
    pub fn acquire(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        // Slot numbers are u32; larger capacities are capped
        let highest = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let slot = (1..=highest).find(|slot| !self.in_use.contains(slot))?;
        self.in_use.insert(slot);
        Some(slot)
    }

    /// Free `slot`; returns false if it was not in use
    pub fn release(&mut self, slot: u32) -> bool {
        self.in_use.remove(&slot)
    }

    pub fn in_use(&self) -> Vec<u32> {
        self.in_use.iter().copied().collect()
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_TUNNEL_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation_starts_at_one() {
        let mut slots = SlotAllocator::new(3);
        assert_eq!(slots.acquire(), Some(1));
        assert_eq!(slots.acquire(), Some(2));
        assert_eq!(slots.acquire(), Some(3));
        assert!(slots.is_full());
        assert_eq!(slots.acquire(), None);
    }

    #[test]
    fn test_lowest_free_slot_is_reused() {
        let mut slots = SlotAllocator::new(10);
        for _ in 0..5 {
            slots.acquire();
        }
        assert!(slots.release(2));
        assert!(slots.release(4));
        assert_eq!(slots.acquire(), Some(2));
        assert_eq!(slots.acquire(), Some(4));
        assert_eq!(slots.acquire(), Some(6));
    }

    #[test]
    fn test_release_unknown_slot() {
        let mut slots = SlotAllocator::new(2);
        assert!(!slots.release(1));
        slots.acquire();
        assert!(slots.release(1));
        assert!(!slots.release(1));
        assert!(slots.is_empty());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_capacity_beyond_u32_still_allocates() {
        let mut slots = SlotAllocator::new(u32::MAX as usize + 2);
        assert_eq!(slots.acquire(), Some(1));
        assert_eq!(slots.acquire(), Some(2));
        assert!(!slots.is_full());
    }

    #[test]
    fn test_zero_capacity_never_allocates() {
        let mut slots = SlotAllocator::new(0);
        assert!(slots.is_full());
        assert_eq!(slots.acquire(), None);
    }
}
