//! Grid block model and wire format.
//!
//! Every grid block carries a self-describing header so that a block read
//! back from disk (or received from a peer) identifies itself: which slot it
//! belongs to, what its content hashes to, and whether it is an LSM index
//! block or plain data.
//!
//! # Block Format
//!
//! ```text
//! [BLOCK_MAGIC:u32][version:u8][kind:u8][reserved:2B][address:u64][checksum:u128][length:u32][payload:bytes]
//!       4B              1B        1B        2B            8B            16B          4B         variable
//! ```
//!
//! All integers are little-endian. `checksum` is the BLAKE3 hash of the
//! payload truncated to 128 bits, so decoding re-verifies content integrity
//! without a separate CRC.
//!
//! # Index Blocks
//!
//! A [`BlockKind::TableIndex`] payload is the LSM table schema:
//!
//! ```text
//! [content_count:u32] then content_count x [address:u64][checksum:u128]
//! ```
//!
//! [`IndexBlockView`] exposes this schema without copying; it is how the
//! repair queue discovers a table's content blocks when the index block's
//! write completes.

use bytes::{Bytes, BytesMut};
use olivine_types::{BlockAddress, BlockReference, Checksum};

use crate::GridError;

// ============================================================================
// Format Constants
// ============================================================================

/// Magic bytes identifying a grid block ("OGRB" in little-endian).
const BLOCK_MAGIC: u32 = u32::from_le_bytes(*b"OGRB");

/// Current block format version.
const BLOCK_VERSION: u8 = 0x01;

// Byte sizes - typed constants prevent mismatch bugs between header fields
const MAGIC_SIZE: usize = 4;
const VERSION_SIZE: usize = 1;
const KIND_SIZE: usize = 1;
const RESERVED_SIZE: usize = 2;
const ADDRESS_SIZE: usize = 8; // u64
const CHECKSUM_SIZE: usize = 16; // u128
const LENGTH_SIZE: usize = 4; // u32

/// Header size: magic(4) + version(1) + kind(1) + reserved(2) + address(8)
/// + checksum(16) + length(4) = 36 bytes.
const HEADER_SIZE: usize = MAGIC_SIZE
    + VERSION_SIZE
    + KIND_SIZE
    + RESERVED_SIZE
    + ADDRESS_SIZE
    + CHECKSUM_SIZE
    + LENGTH_SIZE;

// Index payload sizes: count(4) then entries of address(8) + checksum(16).
const CONTENT_COUNT_SIZE: usize = 4;
const CONTENT_ENTRY_SIZE: usize = ADDRESS_SIZE + CHECKSUM_SIZE;

/// Maximum number of content blocks an LSM table index may reference.
///
/// This bound sizes the per-table received bitset and the worst-case
/// reservation a table claims in the repair queue's fault map.
pub const LSM_TABLE_CONTENT_BLOCKS_MAX: usize = 64;

// ============================================================================
// Block Kind
// ============================================================================

/// Discriminates what a grid block's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Application or LSM content data.
    Data = 0x00,

    /// An LSM table index block listing the table's content blocks.
    TableIndex = 0x01,
}

impl BlockKind {
    /// Returns the kind as its wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a kind from its wire byte.
    pub fn from_byte(byte: u8) -> Result<Self, GridError> {
        match byte {
            0x00 => Ok(BlockKind::Data),
            0x01 => Ok(BlockKind::TableIndex),
            other => Err(GridError::UnknownBlockKind { kind: other }),
        }
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// Computes the content checksum of a block payload.
///
/// BLAKE3 truncated to the first 128 bits, little-endian.
pub fn checksum_of(payload: &[u8]) -> Checksum {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload);
    let hash = hasher.finalize();
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&hash.as_bytes()[..16]);
    Checksum::new(u128::from_le_bytes(truncated))
}

// ============================================================================
// Block
// ============================================================================

/// A fully-described grid block: header identity plus payload.
///
/// Constructors compute the content checksum; [`Block::from_bytes`]
/// re-verifies it, so a decoded `Block` is always internally consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    address: BlockAddress,
    checksum: Checksum,
    kind: BlockKind,
    payload: Bytes,
}

impl Block {
    /// Creates a data block at the given address.
    pub fn data(address: BlockAddress, payload: Bytes) -> Self {
        let checksum = checksum_of(&payload);
        Self {
            address,
            checksum,
            kind: BlockKind::Data,
            payload,
        }
    }

    /// Creates a table index block listing the given content blocks.
    ///
    /// # Panics
    ///
    /// Panics if `content` is empty or exceeds
    /// [`LSM_TABLE_CONTENT_BLOCKS_MAX`] entries.
    pub fn table_index(address: BlockAddress, content: &[BlockReference]) -> Self {
        assert!(
            !content.is_empty() && content.len() <= LSM_TABLE_CONTENT_BLOCKS_MAX,
            "index block must reference 1..={} content blocks, got {}",
            LSM_TABLE_CONTENT_BLOCKS_MAX,
            content.len()
        );

        let mut payload =
            BytesMut::with_capacity(CONTENT_COUNT_SIZE + content.len() * CONTENT_ENTRY_SIZE);
        payload.extend_from_slice(&(content.len() as u32).to_le_bytes());
        for reference in content {
            payload.extend_from_slice(&reference.address.as_u64().to_le_bytes());
            payload.extend_from_slice(&reference.checksum.as_u128().to_le_bytes());
        }
        let payload = payload.freeze();

        let checksum = checksum_of(&payload);
        Self {
            address,
            checksum,
            kind: BlockKind::TableIndex,
            payload,
        }
    }

    /// Returns the grid address this block belongs to.
    pub fn address(&self) -> BlockAddress {
        self.address
    }

    /// Returns the content checksum carried in the header.
    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Returns the block kind.
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Returns the payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the `(address, checksum)` reference identifying this block.
    pub fn reference(&self) -> BlockReference {
        BlockReference::new(self.address, self.checksum)
    }

    /// Returns a schema view over an index block's payload.
    ///
    /// # Panics
    ///
    /// Panics if this is not a [`BlockKind::TableIndex`] block.
    pub fn index_view(&self) -> IndexBlockView<'_> {
        assert!(
            self.kind == BlockKind::TableIndex,
            "index_view on {:?} block at address {}",
            self.kind,
            self.address
        );
        IndexBlockView {
            payload: &self.payload,
        }
    }

    /// Serializes the block to bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());

        buf.extend_from_slice(&BLOCK_MAGIC.to_le_bytes());
        buf.extend_from_slice(&[BLOCK_VERSION]);
        buf.extend_from_slice(&[self.kind.as_byte()]);
        buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
        buf.extend_from_slice(&self.address.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.checksum.as_u128().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        buf.freeze()
    }

    /// Deserializes and validates a block.
    ///
    /// # Errors
    ///
    /// - [`GridError::TruncatedBlock`] if the bytes are shorter than the
    ///   header or the declared payload length
    /// - [`GridError::BadMagic`] / [`GridError::UnsupportedVersion`] /
    ///   [`GridError::UnknownBlockKind`] on a malformed header
    /// - [`GridError::ChecksumMismatch`] if the payload does not hash to the
    ///   header checksum
    /// - [`GridError::ContentCountExceeded`] if an index block's schema is
    ///   malformed
    pub fn from_bytes(data: &Bytes) -> Result<Self, GridError> {
        if data.len() < HEADER_SIZE {
            return Err(GridError::TruncatedBlock {
                actual: data.len(),
                required: HEADER_SIZE,
            });
        }

        // magic (bytes 0..4)
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != BLOCK_MAGIC {
            return Err(GridError::BadMagic { actual: magic });
        }

        // version (byte 4)
        if data[4] != BLOCK_VERSION {
            return Err(GridError::UnsupportedVersion { version: data[4] });
        }

        // kind (byte 5), reserved (bytes 6..8) skipped
        let kind = BlockKind::from_byte(data[5])?;

        // address (bytes 8..16)
        let address = BlockAddress::new(u64::from_le_bytes(data[8..16].try_into().unwrap()));

        // checksum (bytes 16..32)
        let checksum = Checksum::new(u128::from_le_bytes(data[16..32].try_into().unwrap()));

        // length (bytes 32..36)
        let length = u32::from_le_bytes(data[32..36].try_into().unwrap()) as usize;
        if data.len() < HEADER_SIZE + length {
            return Err(GridError::TruncatedBlock {
                actual: data.len(),
                required: HEADER_SIZE + length,
            });
        }

        let payload = data.slice(HEADER_SIZE..HEADER_SIZE + length);

        let computed = checksum_of(&payload);
        if computed != checksum {
            return Err(GridError::ChecksumMismatch {
                address,
                expected: checksum,
                actual: computed,
            });
        }

        let block = Self {
            address,
            checksum,
            kind,
            payload,
        };

        // An index block must carry a well-formed schema.
        if kind == BlockKind::TableIndex {
            block.validate_index_payload()?;
        }

        Ok(block)
    }

    fn validate_index_payload(&self) -> Result<(), GridError> {
        if self.payload.len() < CONTENT_COUNT_SIZE {
            return Err(GridError::TruncatedBlock {
                actual: self.payload.len(),
                required: CONTENT_COUNT_SIZE,
            });
        }
        let count =
            u32::from_le_bytes(self.payload[0..CONTENT_COUNT_SIZE].try_into().unwrap()) as usize;
        if count == 0 || count > LSM_TABLE_CONTENT_BLOCKS_MAX {
            return Err(GridError::ContentCountExceeded {
                address: self.address,
                count,
            });
        }
        let required = CONTENT_COUNT_SIZE + count * CONTENT_ENTRY_SIZE;
        if self.payload.len() < required {
            return Err(GridError::TruncatedBlock {
                actual: self.payload.len(),
                required,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Index Block Schema
// ============================================================================

/// Schema view over an index block's payload.
///
/// The view borrows the payload; entries are decoded on access. The payload
/// was validated at [`Block::from_bytes`] (or built by
/// [`Block::table_index`]), so accessors assert rather than return errors.
#[derive(Debug, Clone, Copy)]
pub struct IndexBlockView<'a> {
    payload: &'a [u8],
}

impl IndexBlockView<'_> {
    /// Returns the number of content blocks this table references.
    pub fn content_blocks_used(&self) -> u32 {
        u32::from_le_bytes(self.payload[0..CONTENT_COUNT_SIZE].try_into().unwrap())
    }

    /// Returns the reference of the content block at ordinal `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= content_blocks_used()`.
    pub fn content_block(&self, index: u32) -> BlockReference {
        assert!(
            index < self.content_blocks_used(),
            "content block index {} out of range {}",
            index,
            self.content_blocks_used()
        );
        let offset = CONTENT_COUNT_SIZE + index as usize * CONTENT_ENTRY_SIZE;
        let address = BlockAddress::new(u64::from_le_bytes(
            self.payload[offset..offset + ADDRESS_SIZE].try_into().unwrap(),
        ));
        let checksum = Checksum::new(u128::from_le_bytes(
            self.payload[offset + ADDRESS_SIZE..offset + CONTENT_ENTRY_SIZE]
                .try_into()
                .unwrap(),
        ));
        BlockReference::new(address, checksum)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn content_refs(count: u64) -> Vec<BlockReference> {
        (0..count)
            .map(|i| {
                BlockReference::new(
                    BlockAddress::new(100 + i),
                    Checksum::new(u128::from(i) + 1),
                )
            })
            .collect()
    }

    #[test]
    fn data_block_roundtrip() {
        let block = Block::data(BlockAddress::new(7), Bytes::from_static(b"hello grid"));
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.kind(), BlockKind::Data);
        assert_eq!(decoded.address(), BlockAddress::new(7));
        assert_eq!(decoded.checksum(), checksum_of(b"hello grid"));
    }

    #[test]
    fn index_block_schema() {
        let refs = content_refs(3);
        let block = Block::table_index(BlockAddress::new(200), &refs);
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();

        let view = decoded.index_view();
        assert_eq!(view.content_blocks_used(), 3);
        for (i, reference) in refs.iter().enumerate() {
            assert_eq!(view.content_block(i as u32), *reference);
        }
    }

    #[test]
    fn reference_matches_header() {
        let block = Block::data(BlockAddress::new(3), Bytes::from_static(b"x"));
        assert_eq!(
            block.reference(),
            BlockReference::new(block.address(), block.checksum())
        );
    }

    #[test]
    fn truncated_header_rejected() {
        let err = Block::from_bytes(&Bytes::from_static(b"OGRB")).unwrap_err();
        assert!(matches!(err, GridError::TruncatedBlock { .. }));
    }

    #[test]
    fn bad_magic_rejected() {
        let block = Block::data(BlockAddress::new(1), Bytes::from_static(b"payload"));
        let mut bytes = block.to_bytes().to_vec();
        bytes[0] ^= 0xFF;
        let err = Block::from_bytes(&Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, GridError::BadMagic { .. }));
    }

    #[test]
    fn corrupt_payload_rejected() {
        let block = Block::data(BlockAddress::new(1), Bytes::from_static(b"payload"));
        let mut bytes = block.to_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = Block::from_bytes(&Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, GridError::ChecksumMismatch { .. }));
    }

    #[test]
    fn unknown_kind_rejected() {
        let block = Block::data(BlockAddress::new(1), Bytes::from_static(b"payload"));
        let mut bytes = block.to_bytes().to_vec();
        bytes[5] = 0x7F;
        let err = Block::from_bytes(&Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, GridError::UnknownBlockKind { kind: 0x7F }));
    }

    /// Raw index-block bytes whose schema declares `content_count` entries
    /// but carries none. Built by hand: `Block::table_index` refuses to
    /// construct such a block, while a corrupt disk will not.
    fn index_block_bytes_with_count(content_count: u32) -> Bytes {
        let payload = content_count.to_le_bytes();
        let checksum = checksum_of(&payload);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&BLOCK_MAGIC.to_le_bytes());
        bytes.push(BLOCK_VERSION);
        bytes.push(BlockKind::TableIndex.as_byte());
        bytes.extend_from_slice(&[0u8; RESERVED_SIZE]);
        bytes.extend_from_slice(&9u64.to_le_bytes());
        bytes.extend_from_slice(&checksum.as_u128().to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Bytes::from(bytes)
    }

    #[test_case(0; "zero content blocks")]
    #[test_case(LSM_TABLE_CONTENT_BLOCKS_MAX as u32 + 1; "one past the limit")]
    #[test_case(u32::MAX; "absurd count")]
    fn invalid_content_count_rejected(content_count: u32) {
        let bytes = index_block_bytes_with_count(content_count);
        let err = Block::from_bytes(&bytes).unwrap_err();
        match err {
            GridError::ContentCountExceeded { address, count } => {
                assert_eq!(address, BlockAddress::new(9));
                assert_eq!(count, content_count as usize);
            }
            other => panic!("expected ContentCountExceeded, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_rejected() {
        let block = Block::data(BlockAddress::new(1), Bytes::from_static(b"payload"));
        let bytes = block.to_bytes();
        let short = bytes.slice(0..bytes.len() - 2);
        let err = Block::from_bytes(&short).unwrap_err();
        assert!(matches!(err, GridError::TruncatedBlock { .. }));
    }

    #[test]
    #[should_panic(expected = "index block must reference")]
    fn empty_index_block_panics() {
        let _ = Block::table_index(BlockAddress::new(1), &[]);
    }

    #[test]
    #[should_panic(expected = "index_view")]
    fn index_view_on_data_block_panics() {
        let block = Block::data(BlockAddress::new(1), Bytes::from_static(b"payload"));
        let _ = block.index_view();
    }

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        assert_eq!(checksum_of(b"abc"), checksum_of(b"abc"));
        assert_ne!(checksum_of(b"abc"), checksum_of(b"abd"));
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        /// Property: encode/decode is lossless for arbitrary data payloads.
        #[test]
        fn prop_data_block_roundtrip(address in any::<u64>(), payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let block = Block::data(BlockAddress::new(address), Bytes::from(payload));
            let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
            prop_assert_eq!(decoded, block);
        }

        /// Property: a single flipped payload byte is always detected.
        #[test]
        fn prop_bit_flip_detected(flip in 36_usize..100, payload in proptest::collection::vec(any::<u8>(), 64..128)) {
            let block = Block::data(BlockAddress::new(1), Bytes::from(payload));
            let mut bytes = block.to_bytes().to_vec();
            let index = flip % bytes.len();
            // Header corruption surfaces as a different error; flip payload only.
            let index = index.max(36);
            bytes[index] ^= 0x01;
            prop_assert!(Block::from_bytes(&Bytes::from(bytes)).is_err());
        }
    }
}
