//! Checkpointed free-set oracle.
//!
//! The repair queue must stay coherent with the superblock's free-set: a
//! block that has been freed must never be repaired, and a block that is
//! *released* (staged to become free at the next checkpoint) must be retired
//! from the queue at the checkpoint boundary.
//!
//! The queue itself only ever reads the free-set, through [`FreeSetView`].
//! [`CheckpointFreeSet`] is the concrete two-bitmap implementation used by
//! the replica's superblock and by tests: `free` tracks unallocated
//! addresses, `released` tracks addresses staged for release. The two sets
//! are disjoint; `advance_checkpoint` drains `released` into `free`.

use olivine_types::BlockAddress;

// ============================================================================
// Free-Set View
// ============================================================================

/// Read-only queries over the current checkpoint's view of the free-set.
///
/// Both queries are pure: calling them never changes free-set state.
pub trait FreeSetView {
    /// Returns true if `address` is unallocated.
    fn is_free(&self, address: BlockAddress) -> bool;

    /// Returns true if `address` is staged to become free at the next
    /// checkpoint.
    fn is_released(&self, address: BlockAddress) -> bool;
}

// ============================================================================
// Checkpoint Free-Set
// ============================================================================

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-size free-set over a grid of `block_count` addresses.
///
/// Addresses are 1-based (address 0 is reserved as a null sentinel by the
/// grid). All storage is allocated at construction; the set never grows.
#[derive(Debug, Clone)]
pub struct CheckpointFreeSet {
    block_count: usize,

    /// Bit set = address is unallocated.
    free: Vec<u64>,

    /// Bit set = address is staged for release at the next checkpoint.
    released: Vec<u64>,
}

impl CheckpointFreeSet {
    /// Creates a free-set in which every address starts free.
    pub fn new(block_count: usize) -> Self {
        assert!(block_count > 0, "free-set must cover at least one block");

        let words = block_count.div_ceil(WORD_BITS);
        Self {
            block_count,
            free: vec![u64::MAX; words],
            released: vec![0u64; words],
        }
    }

    /// Returns the number of addresses this set covers.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    fn slot(&self, address: BlockAddress) -> (usize, u64) {
        let index = address.as_usize();
        assert!(
            index < self.block_count,
            "address {} out of grid range {}",
            address,
            self.block_count
        );
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    /// Allocates `address`: marks it as in use.
    ///
    /// # Panics
    ///
    /// Panics if the address is not free or is staged for release.
    pub fn acquire(&mut self, address: BlockAddress) {
        let (word, mask) = self.slot(address);
        assert!(
            self.free[word] & mask != 0,
            "acquire of non-free address {address}"
        );
        assert!(
            self.released[word] & mask == 0,
            "acquire of released address {address}"
        );
        self.free[word] &= !mask;
    }

    /// Stages `address` to become free at the next checkpoint.
    ///
    /// The address stays allocated until [`Self::advance_checkpoint`]; reads
    /// and in-flight writes for it remain legal until then.
    ///
    /// # Panics
    ///
    /// Panics if the address is already free or already released.
    pub fn release(&mut self, address: BlockAddress) {
        let (word, mask) = self.slot(address);
        assert!(
            self.free[word] & mask == 0,
            "release of free address {address}"
        );
        assert!(
            self.released[word] & mask == 0,
            "double release of address {address}"
        );
        self.released[word] |= mask;
    }

    /// Advances the checkpoint: every released address becomes free.
    pub fn advance_checkpoint(&mut self) {
        let mut released_count = 0usize;
        for word in 0..self.free.len() {
            released_count += self.released[word].count_ones() as usize;
            self.free[word] |= self.released[word];
            self.released[word] = 0;
        }

        tracing::debug!(released = released_count, "free-set checkpoint advanced");
    }
}

impl FreeSetView for CheckpointFreeSet {
    fn is_free(&self, address: BlockAddress) -> bool {
        let (word, mask) = self.slot(address);
        self.free[word] & mask != 0
    }

    fn is_released(&self, address: BlockAddress) -> bool {
        let (word, mask) = self.slot(address);
        self.released[word] & mask != 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_then_checkpoint() {
        let mut free_set = CheckpointFreeSet::new(128);
        let address = BlockAddress::new(10);

        assert!(free_set.is_free(address));
        assert!(!free_set.is_released(address));

        free_set.acquire(address);
        assert!(!free_set.is_free(address));
        assert!(!free_set.is_released(address));

        free_set.release(address);
        assert!(!free_set.is_free(address));
        assert!(free_set.is_released(address));

        free_set.advance_checkpoint();
        assert!(free_set.is_free(address));
        assert!(!free_set.is_released(address));
    }

    #[test]
    fn addresses_start_free() {
        let free_set = CheckpointFreeSet::new(100);
        for i in 0..100 {
            assert!(free_set.is_free(BlockAddress::new(i)));
        }
    }

    #[test]
    fn word_boundary_addresses() {
        let mut free_set = CheckpointFreeSet::new(130);
        for raw in [0u64, 63, 64, 127, 128, 129] {
            let address = BlockAddress::new(raw);
            free_set.acquire(address);
            assert!(!free_set.is_free(address));
        }
        free_set.release(BlockAddress::new(64));
        assert!(free_set.is_released(BlockAddress::new(64)));
        assert!(!free_set.is_released(BlockAddress::new(63)));
        assert!(!free_set.is_released(BlockAddress::new(65)));
    }

    #[test]
    #[should_panic(expected = "acquire of non-free address")]
    fn double_acquire_panics() {
        let mut free_set = CheckpointFreeSet::new(8);
        free_set.acquire(BlockAddress::new(1));
        free_set.acquire(BlockAddress::new(1));
    }

    #[test]
    #[should_panic(expected = "release of free address")]
    fn release_of_free_panics() {
        let mut free_set = CheckpointFreeSet::new(8);
        free_set.release(BlockAddress::new(1));
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_panics() {
        let mut free_set = CheckpointFreeSet::new(8);
        free_set.acquire(BlockAddress::new(1));
        free_set.release(BlockAddress::new(1));
        free_set.release(BlockAddress::new(1));
    }

    #[test]
    #[should_panic(expected = "out of grid range")]
    fn out_of_range_panics() {
        let free_set = CheckpointFreeSet::new(8);
        let _ = free_set.is_free(BlockAddress::new(8));
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        /// Property: free and released are always disjoint.
        #[test]
        fn prop_free_released_disjoint(
            acquires in proptest::collection::btree_set(0u64..256, 0..64),
            release_every in 1usize..4,
        ) {
            let mut free_set = CheckpointFreeSet::new(256);
            for (i, &raw) in acquires.iter().enumerate() {
                let address = BlockAddress::new(raw);
                free_set.acquire(address);
                if i % release_every == 0 {
                    free_set.release(address);
                }
            }
            for raw in 0..256u64 {
                let address = BlockAddress::new(raw);
                prop_assert!(!(free_set.is_free(address) && free_set.is_released(address)));
            }
            free_set.advance_checkpoint();
            for raw in 0..256u64 {
                prop_assert!(!free_set.is_released(BlockAddress::new(raw)));
            }
        }
    }
}
