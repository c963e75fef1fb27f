use std::collections::BTreeSet;

/// Smallest-free-integer allocator, scoped to `[1, 65535]` to fit the 16-bit wire `tid` field.
///
/// One allocator lives per socket epoch: every reconnect gets a fresh one, since tids don't
/// cross epochs (see [`crate::transaction::TransactionTable::rebind_all`]).
#[derive(Debug, Default)]
pub struct IdAllocator {
    allocated: BTreeSet<u16>,
}

/// The allocator has handed out every id in `[1, 65535]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no free transaction ids in [1, 65535]")]
pub struct NoFreeIds;

impl IdAllocator {
    pub const START_AT: u16 = 1;
    pub const MAX: u16 = u16::MAX;

    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the smallest id `>= START_AT` not currently allocated.
    pub fn allocate(&mut self) -> Result<u16, NoFreeIds> {
        let mut candidate = Self::START_AT;
        for &taken in &self.allocated {
            if taken != candidate {
                break;
            }
            candidate = candidate.checked_add(1).ok_or(NoFreeIds)?;
        }
        if candidate == 0 {
            return Err(NoFreeIds);
        }
        self.allocated.insert(candidate);
        Ok(candidate)
    }

    /// Release `id` back to the pool.
    ///
    /// # Panics
    /// Freeing an id that isn't currently allocated is a programming error.
    pub fn free(&mut self, id: u16) {
        if !self.allocated.remove(&id) {
            panic!("double free of transaction id {id}");
        }
    }

    pub fn is_allocated(&self, id: u16) -> bool {
        self.allocated.contains(&id)
    }
}
