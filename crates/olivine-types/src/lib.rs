//! # olivine-types: Core types for `OlivineDB`
//!
//! This crate contains the shared identity types of the grid, the replica's
//! fixed-size on-disk block address space:
//! - Block identity ([`BlockAddress`], [`Checksum`])
//! - Block references ([`BlockReference`])
//!
//! Every grid block is identified by a `(address, checksum)` pair: the
//! address names the slot, the checksum pins the exact content expected in
//! that slot. All types here are cheap `Copy` values.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

// ============================================================================
// Block Identity - All Copy (cheap scalar values)
// ============================================================================

/// A slot in the grid's on-disk block address space.
///
/// Addresses are dense 64-bit block numbers assigned by the free-set; an
/// address says nothing about the content stored in the slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockAddress(u64);

impl BlockAddress {
    pub const ZERO: BlockAddress = BlockAddress(0);

    pub fn new(address: u64) -> Self {
        Self(address)
    }

    /// Returns the address as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the address as a `usize` for bitmap indexing.
    ///
    /// # Panics
    ///
    /// Panics on 32-bit platforms if the address exceeds `usize::MAX`.
    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).expect("block address exceeds usize")
    }
}

impl Display for BlockAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockAddress {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BlockAddress> for u64 {
    fn from(address: BlockAddress) -> Self {
        address.0
    }
}

/// 128-bit content hash carried alongside every block reference.
///
/// A fault record pins a specific `(address, checksum)` pair: a repaired
/// block is only accepted if its content hashes to exactly this value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Checksum(u128);

impl Checksum {
    pub fn new(checksum: u128) -> Self {
        Self(checksum)
    }

    /// Returns the checksum as a `u128`.
    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for Checksum {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<Checksum> for u128 {
    fn from(checksum: Checksum) -> Self {
        checksum.0
    }
}

// ============================================================================
// Block References
// ============================================================================

/// The `(address, checksum)` pair identifying one specific version of a
/// grid block.
///
/// This is the unit of a repair request: the transport asks peer replicas
/// for the block at `address` whose content hashes to `checksum`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockReference {
    pub address: BlockAddress,
    pub checksum: Checksum,
}

impl BlockReference {
    pub fn new(address: BlockAddress, checksum: Checksum) -> Self {
        Self { address, checksum }
    }
}

impl Display for BlockReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.checksum)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn block_address_roundtrip() {
        let address = BlockAddress::new(42);
        assert_eq!(address.as_u64(), 42);
        assert_eq!(u64::from(address), 42);
        assert_eq!(BlockAddress::from(42), address);
    }

    #[test]
    fn block_address_ordering() {
        assert!(BlockAddress::new(1) < BlockAddress::new(2));
        assert_eq!(BlockAddress::ZERO, BlockAddress::new(0));
    }

    #[test_case(0, "0")]
    #[test_case(7, "7")]
    #[test_case(u64::MAX, "18446744073709551615")]
    fn block_address_display(raw: u64, expected: &str) {
        assert_eq!(BlockAddress::new(raw).to_string(), expected);
    }

    #[test]
    fn checksum_display_is_padded_hex() {
        assert_eq!(
            Checksum::new(0xAB).to_string(),
            "000000000000000000000000000000ab"
        );
    }

    #[test]
    fn checksum_roundtrip() {
        let checksum = Checksum::new(0xDEAD_BEEF);
        assert_eq!(checksum.as_u128(), 0xDEAD_BEEF);
        assert_eq!(u128::from(checksum), 0xDEAD_BEEF);
    }

    #[test]
    fn block_reference_display() {
        let reference = BlockReference::new(BlockAddress::new(9), Checksum::new(0x01));
        assert_eq!(
            reference.to_string(),
            "9#00000000000000000000000000000001"
        );
    }

    #[test]
    fn serde_roundtrip() {
        let reference = BlockReference::new(BlockAddress::new(1234), Checksum::new(0xFEED));
        let json = serde_json::to_string(&reference).unwrap();
        let back: BlockReference = serde_json::from_str(&json).unwrap();
        assert_eq!(reference, back);
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        /// Property: address conversions are lossless.
        #[test]
        fn prop_block_address_conversion_lossless(raw in any::<u64>()) {
            let address = BlockAddress::new(raw);
            prop_assert_eq!(address.as_u64(), raw);
            prop_assert_eq!(BlockAddress::from(u64::from(address)), address);
        }

        /// Property: checksum display is always 32 hex characters.
        #[test]
        fn prop_checksum_display_width(raw in any::<u128>()) {
            let rendered = Checksum::new(raw).to_string();
            prop_assert_eq!(rendered.len(), 32);
            prop_assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
