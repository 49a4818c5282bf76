//! Indexed associative store for faulty blocks.
//!
//! The repair queue needs two access paths over its outstanding faults:
//! O(1) lookup by block address (enqueue, commence, complete) and cheap
//! positional walks for the request cycler's round-robin tour. [`FaultMap`]
//! provides both: a dense entry array walked by ordinal, paired with an
//! address-to-ordinal hash index.
//!
//! Removal is swap-with-last, so only the moved entry's ordinal changes;
//! the cycler tolerates this by clamping its position after each mutation.
//!
//! Capacity is reserved once at construction and never grows. Inserting past
//! capacity is a caller contract violation (callers gate standalone inserts
//! on `RepairQueue::enqueue_blocks_available`; the table path is bounded by
//! `tables_max`).

use std::collections::HashMap;

use olivine_types::BlockAddress;

use crate::GridError;
use crate::repair_queue::FaultyBlock;

// ============================================================================
// Get-Or-Put
// ============================================================================

/// Result of [`FaultMap::get_or_put`].
///
/// An `Inserted` entry holds default fields; the caller must initialize it
/// before the next public operation.
pub(crate) enum GetOrPut<'a> {
    Found(&'a mut FaultyBlock),
    Inserted(&'a mut FaultyBlock),
}

// ============================================================================
// Fault Map
// ============================================================================

/// Fixed-capacity map from block address to fault record, with by-ordinal
/// positional access.
#[derive(Debug)]
pub(crate) struct FaultMap {
    /// Dense entry storage; ordinals are positions in this array.
    entries: Vec<(BlockAddress, FaultyBlock)>,

    /// Address -> ordinal index into `entries`.
    index: HashMap<BlockAddress, usize>,

    capacity: usize,
}

impl FaultMap {
    /// Creates a map with room for exactly `capacity` faults.
    ///
    /// # Errors
    ///
    /// [`GridError::OutOfMemory`] if the reservation fails. This is the only
    /// fallible path in the map; every later operation is infallible.
    pub(crate) fn init(capacity: usize) -> Result<Self, GridError> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(capacity)?;
        let mut index = HashMap::new();
        index.try_reserve(capacity)?;

        Ok(Self {
            entries,
            index,
            capacity,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn contains(&self, address: BlockAddress) -> bool {
        self.index.contains_key(&address)
    }

    pub(crate) fn get(&self, address: BlockAddress) -> Option<&FaultyBlock> {
        self.index.get(&address).map(|&i| &self.entries[i].1)
    }

    pub(crate) fn get_mut(&mut self, address: BlockAddress) -> Option<&mut FaultyBlock> {
        match self.index.get(&address) {
            Some(&i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    /// Looks up `address`, inserting a default-initialized fault if absent.
    ///
    /// # Panics
    ///
    /// Panics if an insert would exceed the fixed capacity.
    pub(crate) fn get_or_put(&mut self, address: BlockAddress) -> GetOrPut<'_> {
        if let Some(&i) = self.index.get(&address) {
            return GetOrPut::Found(&mut self.entries[i].1);
        }

        assert!(
            self.entries.len() < self.capacity,
            "fault map full: {} faults at capacity {}",
            self.entries.len(),
            self.capacity
        );

        let ordinal = self.entries.len();
        self.entries.push((address, FaultyBlock::default()));
        self.index.insert(address, ordinal);
        GetOrPut::Inserted(&mut self.entries[ordinal].1)
    }

    /// Removes and returns the fault at `address` by swapping with the last
    /// entry. Only the moved entry's ordinal changes.
    ///
    /// # Panics
    ///
    /// Panics if no fault exists at `address`.
    pub(crate) fn swap_remove(&mut self, address: BlockAddress) -> FaultyBlock {
        let ordinal = self
            .index
            .remove(&address)
            .unwrap_or_else(|| panic!("swap_remove of absent address {address}"));

        let (removed_address, removed) = self.entries.swap_remove(ordinal);
        assert!(removed_address == address, "index/entry address mismatch");

        // Re-point the entry that was swapped into the vacated ordinal.
        if ordinal < self.entries.len() {
            let moved_address = self.entries[ordinal].0;
            *self.index.get_mut(&moved_address).unwrap() = ordinal;
        }

        removed
    }

    /// Returns the entry at the given ordinal position.
    pub(crate) fn entry_at(&self, ordinal: usize) -> (BlockAddress, &FaultyBlock) {
        let (address, fault) = &self.entries[ordinal];
        (*address, fault)
    }

    /// Returns the entry at the given ordinal position, mutably.
    pub(crate) fn entry_at_mut(&mut self, ordinal: usize) -> (BlockAddress, &mut FaultyBlock) {
        let (address, fault) = &mut self.entries[ordinal];
        (*address, fault)
    }

    /// Iterates over all entries in ordinal order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockAddress, &FaultyBlock)> {
        self.entries.iter().map(|(address, fault)| (*address, fault))
    }

    /// Removes every entry, retaining capacity.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use olivine_types::Checksum;

    use super::*;
    use crate::repair_queue::{FaultProgress, FaultState};

    fn fault(checksum: u128) -> FaultyBlock {
        FaultyBlock {
            checksum: Checksum::new(checksum),
            state: FaultState::Waiting,
            progress: FaultProgress::Block,
        }
    }

    fn map_with(addresses: &[u64]) -> FaultMap {
        let mut map = FaultMap::init(16).unwrap();
        for &raw in addresses {
            match map.get_or_put(BlockAddress::new(raw)) {
                GetOrPut::Inserted(slot) => *slot = fault(u128::from(raw)),
                GetOrPut::Found(_) => panic!("duplicate address in fixture"),
            }
        }
        map
    }

    #[test]
    fn insert_and_lookup() {
        let map = map_with(&[1, 2, 3]);

        assert_eq!(map.len(), 3);
        assert!(map.contains(BlockAddress::new(2)));
        assert_eq!(
            map.get(BlockAddress::new(2)).unwrap().checksum,
            Checksum::new(2)
        );
        assert!(map.get(BlockAddress::new(9)).is_none());
    }

    #[test]
    fn get_or_put_finds_existing() {
        let mut map = map_with(&[5]);
        match map.get_or_put(BlockAddress::new(5)) {
            GetOrPut::Found(existing) => assert_eq!(existing.checksum, Checksum::new(5)),
            GetOrPut::Inserted(_) => panic!("expected existing entry"),
        }
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn swap_remove_moves_last_entry() {
        let mut map = map_with(&[1, 2, 3, 4]);

        let removed = map.swap_remove(BlockAddress::new(2));
        assert_eq!(removed.checksum, Checksum::new(2));
        assert_eq!(map.len(), 3);

        // Entry 4 was swapped into ordinal 1; lookups still resolve.
        assert_eq!(map.entry_at(1).0, BlockAddress::new(4));
        assert_eq!(
            map.get(BlockAddress::new(4)).unwrap().checksum,
            Checksum::new(4)
        );
        assert!(!map.contains(BlockAddress::new(2)));
    }

    #[test]
    fn swap_remove_last_entry() {
        let mut map = map_with(&[1, 2]);
        let removed = map.swap_remove(BlockAddress::new(2));
        assert_eq!(removed.checksum, Checksum::new(2));
        assert_eq!(map.entry_at(0).0, BlockAddress::new(1));
    }

    #[test]
    fn clear_retains_capacity() {
        let mut map = map_with(&[1, 2, 3]);
        map.clear();
        assert_eq!(map.len(), 0);
        assert_eq!(map.capacity(), 16);
        assert!(!map.contains(BlockAddress::new(1)));
    }

    #[test]
    #[should_panic(expected = "fault map full")]
    fn insert_past_capacity_panics() {
        let mut map = FaultMap::init(1).unwrap();
        let GetOrPut::Inserted(slot) = map.get_or_put(BlockAddress::new(1)) else {
            panic!("expected insert");
        };
        *slot = fault(1);
        let _ = map.get_or_put(BlockAddress::new(2));
    }

    #[test]
    #[should_panic(expected = "swap_remove of absent address")]
    fn remove_absent_panics() {
        let mut map = map_with(&[1]);
        let _ = map.swap_remove(BlockAddress::new(7));
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        /// Property: after arbitrary insert/remove interleavings, the hash
        /// index and the dense array agree on every ordinal.
        #[test]
        fn prop_index_and_entries_consistent(
            ops in proptest::collection::vec((any::<bool>(), 0u64..32), 1..128),
        ) {
            let mut map = FaultMap::init(32).unwrap();
            for (insert, raw) in ops {
                let address = BlockAddress::new(raw);
                if insert {
                    if !map.contains(address) && map.len() < map.capacity() {
                        if let GetOrPut::Inserted(slot) = map.get_or_put(address) {
                            *slot = fault(u128::from(raw));
                        }
                    }
                } else if map.contains(address) {
                    let removed = map.swap_remove(address);
                    prop_assert_eq!(removed.checksum, Checksum::new(u128::from(raw)));
                }

                for ordinal in 0..map.len() {
                    let (address, fault) = map.entry_at(ordinal);
                    prop_assert_eq!(fault.checksum, Checksum::new(u128::from(address.as_u64())));
                    prop_assert_eq!(
                        map.get(address).unwrap().checksum,
                        fault.checksum
                    );
                }
            }
        }
    }
}
