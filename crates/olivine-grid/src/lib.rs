//! # olivine-grid: Grid block repair queue for `OlivineDB`
//!
//! The grid is the replica's address space of fixed-size on-disk blocks.
//! This crate implements the repair queue that retires corrupt-or-missing
//! blocks by fetching them from peer replicas:
//!
//! - [`RepairQueue`]: the queue itself -- fault lifecycle, request cycler,
//!   table repairs, checkpoint coordination, cancel
//! - [`Block`] / [`IndexBlockView`]: the grid block wire format and the LSM
//!   index-block schema
//! - [`FreeSetView`] / [`CheckpointFreeSet`]: the checkpointed free-set
//!   oracle the queue stays coherent with
//!
//! The queue is a single-threaded, cooperatively-scheduled structure owned
//! by the grid: all storage is reserved at init, every public operation runs
//! to completion, and contract violations are deterministic assertion
//! failures rather than recoverable errors.

use std::collections::TryReserveError;

use olivine_types::{BlockAddress, Checksum};

mod block;
mod fault_map;
mod free_set;
mod repair_queue;


pub use block::{
    Block, BlockKind, IndexBlockView, LSM_TABLE_CONTENT_BLOCKS_MAX, checksum_of,
};
pub use free_set::{CheckpointFreeSet, FreeSetView};
pub use repair_queue::{
    FaultState, RepairQueue, RepairQueueOptions, RepairTable, TableRepairCallback,
    TableRepairResult,
};

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the grid.
///
/// Only two surfaces are fallible: reserving queue storage at init, and
/// decoding block bytes that may be corrupt. Everything else in this crate
/// treats misuse as a contract violation and asserts.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// Reserving the queue's fixed capacity failed at init.
    #[error("out of memory reserving repair queue capacity")]
    OutOfMemory(#[from] TryReserveError),

    /// Block bytes are shorter than the header or declared payload.
    #[error("truncated block: {actual} bytes, need {required}")]
    TruncatedBlock { actual: usize, required: usize },

    /// Block bytes do not start with the grid block magic.
    #[error("bad block magic {actual:#010x}")]
    BadMagic { actual: u32 },

    /// Block format version is not understood.
    #[error("unsupported block version {version:#04x}")]
    UnsupportedVersion { version: u8 },

    /// Block kind byte is not a known kind.
    #[error("unknown block kind {kind:#04x}")]
    UnknownBlockKind { kind: u8 },

    /// Payload does not hash to the checksum carried in the header.
    #[error("block {address} checksum mismatch: header {expected}, computed {actual}")]
    ChecksumMismatch {
        address: BlockAddress,
        expected: Checksum,
        actual: Checksum,
    },

    /// Index block schema declares an invalid content-block count.
    #[error("index block {address} declares {count} content blocks")]
    ContentCountExceeded { address: BlockAddress, count: usize },
}
