//! Bounded bitmap allocator for fids and tags.
//!
//! Always hands out the lowest free id. A full pool answers `None` after
//! one pass over the bitmap words, never by spinning.

/// Fixed-capacity set of small integer ids.
#[derive(Debug, Clone)]
pub struct IdPool {
    words: Vec<u64>,
    capacity: u32,
    in_use: usize,
}

impl IdPool {
    /// Pool managing ids `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Self {
            words: vec![0; words],
            capacity,
            in_use: 0,
        }
    }

    /// Allocate the lowest free id.
    pub fn alloc(&mut self) -> Option<u32> {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let id = index as u64 * 64 + bit as u64;
            if id >= self.capacity as u64 {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(id as u32);
        }
        None
    }

    /// Mark a specific id as used. Returns false if it was taken or out of range.
    pub fn reserve(&mut self, id: u32) -> bool {
        if id >= self.capacity || self.contains(id) {
            return false;
        }
        self.words[id as usize / 64] |= 1 << (id % 64);
        self.in_use += 1;
        true
    }

    /// Return an id to the pool. Returns false if it was not allocated.
    pub fn release(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.words[id as usize / 64] &= !(1 << (id % 64));
        self.in_use -= 1;
        true
    }

    /// Whether `id` is currently allocated.
    pub fn contains(&self, id: u32) -> bool {
        id < self.capacity && self.words[id as usize / 64] & (1 << (id % 64)) != 0
    }

    /// Number of allocated ids.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of ids this pool can hand out.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
