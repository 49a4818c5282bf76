//! Grid block repair queue.
//!
//! When the replica reads a grid block and finds it corrupt or missing --
//! from local media fault, recovery, or superblock-driven state sync -- the
//! block must be fetched from peer replicas and written locally before the
//! replica may treat it as present. This module owns the queue of those
//! outstanding repairs.
//!
//! # Design
//!
//! Two fault granularities share one fault map:
//!
//! - **Single blocks**: repaired independently, no completion callback.
//! - **Tables**: an LSM index block plus the content blocks it references,
//!   repaired as a unit with a per-table terminal callback. Content faults
//!   are seeded only when the index block's *write completes*, which keeps
//!   the upgrade path safe for a standalone fault already mid-write when the
//!   table enqueue arrives.
//!
//! The request cycler walks the fault map round-robin, emitting batches of
//! `(address, checksum)` requests for the transport and advancing by entries
//! examined so small batches cannot starve later faults.
//!
//! Retirement of released blocks is coordinated with checkpointing in two
//! phases: `checkpoint_commence` removes released waiting faults and marks
//! released in-flight writes as aborting; `checkpoint_complete` reports when
//! every aborted write has drained.
//!
//! All storage is reserved at init. The queue is single-threaded; every
//! branch that cannot happen is an assertion, not a fallback -- the replica
//! runs as one deterministic state machine and must fail fast on invariant
//! violation.
//!
//! # Fault lifecycle
//!
//! ```text
//!           waiting ──repair_commence──▶ writing ──repair_complete──▶ (removed)
//!              │                            │
//!              │ checkpoint_commence        │ checkpoint_commence
//!              │ (released)                 │ (released)
//!              ▼                            ▼
//!           (removed)                    aborting ──repair_complete──▶ (removed)
//! ```

use olivine_types::{BlockAddress, BlockReference, Checksum};

use crate::GridError;
use crate::block::{Block, LSM_TABLE_CONTENT_BLOCKS_MAX};
use crate::fault_map::{FaultMap, GetOrPut};
use crate::free_set::FreeSetView;

// ============================================================================
// Fault Records
// ============================================================================

/// Lifecycle state of a single faulty block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// Known faulty; a request will be (re-)emitted each cycler tour.
    Waiting,

    /// A repair reply arrived and the grid is writing the block to disk.
    Writing,

    /// The block was released by a checkpoint while its write was in
    /// flight; the write is merely being drained.
    Aborting,
}

/// What a fault repairs: a standalone block, or one piece of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultProgress {
    /// Standalone single-block repair.
    Block,

    /// The index block of a table repair; its arrival seeds the table's
    /// content-block enqueues.
    TableIndex { table: TableSlot },

    /// One content block of a table repair, at a known ordinal within the
    /// table's index schema.
    TableContent { table: TableSlot, index: u32 },
}

/// One outstanding fault in the map.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FaultyBlock {
    pub(crate) checksum: Checksum,
    pub(crate) state: FaultState,
    pub(crate) progress: FaultProgress,
}

impl Default for FaultyBlock {
    fn default() -> Self {
        Self {
            checksum: Checksum::default(),
            state: FaultState::Waiting,
            progress: FaultProgress::Block,
        }
    }
}

// ============================================================================
// Table Records
// ============================================================================

/// Terminal outcome of a table repair, delivered exactly once per enqueued
/// table through its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRepairResult {
    /// Every block of the table was repaired and written.
    Repaired,

    /// The queue was canceled before the table completed.
    Canceled,

    /// The table's index block was released by a checkpoint.
    Released,
}

/// Terminal callback for a table repair. Fires synchronously inside the
/// queue operation that retires the table, after the table has been unlinked
/// from every queue structure. Callbacks must not re-enter the queue.
pub type TableRepairCallback = Box<dyn FnOnce(&RepairTable, TableRepairResult)>;

/// Arena slot index of a table record.
pub(crate) type TableSlot = usize;

/// Progress record for one in-flight table repair.
pub struct RepairTable {
    index_address: BlockAddress,
    index_checksum: Checksum,

    /// Bitset over content-block ordinals whose repair write has commenced.
    content_blocks_received: u64,

    /// Count of writes completed (index + content).
    table_blocks_written: u32,

    /// `None` until the index block arrives; then `1 + content_blocks_used`.
    table_blocks_total: Option<u32>,

    callback: Option<TableRepairCallback>,

    /// Intrusive FIFO link (arena slot of the next table).
    next: Option<TableSlot>,
}

impl RepairTable {
    /// Returns the address of the table's index block.
    pub fn index_address(&self) -> BlockAddress {
        self.index_address
    }

    /// Returns the checksum of the table's index block.
    pub fn index_checksum(&self) -> Checksum {
        self.index_checksum
    }

    /// Returns the number of block writes completed for this table.
    pub fn blocks_written(&self) -> u32 {
        self.table_blocks_written
    }

    /// Returns the total block count, known once the index block arrives.
    pub fn blocks_total(&self) -> Option<u32> {
        self.table_blocks_total
    }
}

impl std::fmt::Debug for RepairTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairTable")
            .field("index_address", &self.index_address)
            .field("index_checksum", &self.index_checksum)
            .field("table_blocks_written", &self.table_blocks_written)
            .field("table_blocks_total", &self.table_blocks_total)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Table Arena + Intrusive FIFO
// ============================================================================

/// Fixed arena of table slots. Slots are reserved at init; the free list
/// makes allocation O(1) and allocation-free.
#[derive(Debug)]
struct TableArena {
    slots: Vec<Option<RepairTable>>,
    free: Vec<TableSlot>,
}

impl TableArena {
    fn init(tables_max: usize) -> Result<Self, GridError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(tables_max)?;
        slots.resize_with(tables_max, || None);

        let mut free = Vec::new();
        free.try_reserve_exact(tables_max)?;
        // Reversed so slots are handed out in ascending order.
        free.extend((0..tables_max).rev());

        Ok(Self { slots, free })
    }

    fn insert(&mut self, table: RepairTable) -> TableSlot {
        let slot = self
            .free
            .pop()
            .unwrap_or_else(|| panic!("table arena full: all {} slots in use", self.slots.len()));
        assert!(self.slots[slot].is_none(), "free slot {slot} is occupied");
        self.slots[slot] = Some(table);
        slot
    }

    fn get(&self, slot: TableSlot) -> &RepairTable {
        self.slots[slot]
            .as_ref()
            .unwrap_or_else(|| panic!("table slot {slot} is vacant"))
    }

    fn get_mut(&mut self, slot: TableSlot) -> &mut RepairTable {
        self.slots[slot]
            .as_mut()
            .unwrap_or_else(|| panic!("table slot {slot} is vacant"))
    }

    fn take(&mut self, slot: TableSlot) -> RepairTable {
        let table = self.slots[slot]
            .take()
            .unwrap_or_else(|| panic!("table slot {slot} is vacant"));
        self.free.push(slot);
        table
    }

    fn is_occupied(&self, slot: TableSlot) -> bool {
        self.slots[slot].is_some()
    }
}

/// Singly-linked FIFO threaded through the arena's intrusive `next` links.
#[derive(Debug)]
struct TableFifo {
    head: Option<TableSlot>,
    tail: Option<TableSlot>,
    count: usize,
}

impl TableFifo {
    fn new() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
        }
    }

    fn push(&mut self, slot: TableSlot, arena: &mut TableArena) {
        arena.get_mut(slot).next = None;
        match self.tail {
            Some(tail) => arena.get_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.count += 1;
    }

    fn pop(&mut self, arena: &mut TableArena) -> Option<TableSlot> {
        let head = self.head?;
        self.head = arena.get_mut(head).next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.count -= 1;
        Some(head)
    }

    /// Unlinks an arbitrary slot from the FIFO, preserving the order of the
    /// rest. Table completion order is not FIFO order.
    fn remove(&mut self, slot: TableSlot, arena: &mut TableArena) {
        let mut previous: Option<TableSlot> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == slot {
                let next = arena.get_mut(current).next.take();
                match previous {
                    Some(previous) => arena.get_mut(previous).next = next,
                    None => self.head = next,
                }
                if self.tail == Some(current) {
                    self.tail = previous;
                }
                self.count -= 1;
                return;
            }
            previous = cursor;
            cursor = arena.get(current).next;
        }
        panic!("table slot {slot} not linked in FIFO");
    }
}

// ============================================================================
// Repair Queue
// ============================================================================

/// Sizing options for the repair queue.
#[derive(Debug, Clone, Copy)]
pub struct RepairQueueOptions {
    /// Fault-map slack reserved for standalone block repairs.
    pub blocks_max: usize,

    /// Maximum concurrent table repairs. Each permitted table reserves
    /// [`LSM_TABLE_CONTENT_BLOCKS_MAX`] fault-map entries up front, which is
    /// how `tables_max` bounds the map without dynamic growth.
    pub tables_max: usize,
}

#[derive(Debug)]
struct Checkpointing {
    /// Released in-flight writes not yet drained by `repair_complete`.
    aborting: usize,
}

/// The grid's queue of outstanding block repairs.
///
/// Owned by the grid and serialized through the replica's event loop: every
/// public operation runs to completion without suspension, and callbacks
/// fire synchronously inside the operation that retires their table.
#[derive(Debug)]
pub struct RepairQueue {
    options: RepairQueueOptions,

    faulty_blocks: FaultMap,

    /// The request cycler's position in the fault map.
    faulty_blocks_repair_index: usize,

    // Accounting partition of the fault map: the two counters always sum to
    // the map's length.
    enqueued_blocks_single: usize,
    enqueued_blocks_table: usize,

    tables: TableArena,
    faulty_tables: TableFifo,

    checkpointing: Option<Checkpointing>,
    canceling: bool,
}

impl RepairQueue {
    /// Creates a repair queue with all storage reserved up front.
    ///
    /// Fault-map capacity is
    /// `blocks_max + tables_max * LSM_TABLE_CONTENT_BLOCKS_MAX`.
    ///
    /// # Errors
    ///
    /// [`GridError::OutOfMemory`] if the reservation fails; this is the only
    /// failure any queue operation can surface.
    pub fn init(options: RepairQueueOptions) -> Result<Self, GridError> {
        let capacity = options.blocks_max + options.tables_max * LSM_TABLE_CONTENT_BLOCKS_MAX;
        let queue = Self {
            options,
            faulty_blocks: FaultMap::init(capacity)?,
            faulty_blocks_repair_index: 0,
            enqueued_blocks_single: 0,
            enqueued_blocks_table: 0,
            tables: TableArena::init(options.tables_max)?,
            faulty_tables: TableFifo::new(),
            checkpointing: None,
            canceling: false,
        };

        tracing::debug!(
            blocks_max = options.blocks_max,
            tables_max = options.tables_max,
            capacity,
            "repair queue initialized"
        );
        Ok(queue)
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Returns the slack available for standalone-block enqueues.
    ///
    /// The worst-case footprint of all permitted tables is reserved off the
    /// top, so a standalone enqueue can never starve a table repair.
    pub fn enqueue_blocks_available(&self) -> usize {
        self.faulty_blocks.capacity()
            - self.enqueued_blocks_single
            - self.options.tables_max * LSM_TABLE_CONTENT_BLOCKS_MAX
    }

    /// Records a standalone block fault. Re-enqueueing the same
    /// `(address, checksum)` pair is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the queue is canceling, if `enqueue_blocks_available() == 0`,
    /// or if a fault already exists at `address` with a different checksum.
    pub fn enqueue_block(&mut self, address: BlockAddress, checksum: Checksum) {
        assert!(!self.canceling, "enqueue_block while canceling");
        assert!(
            self.enqueue_blocks_available() > 0,
            "standalone repair capacity exhausted ({} single faults)",
            self.enqueued_blocks_single
        );

        match self.faulty_blocks.get_or_put(address) {
            GetOrPut::Found(fault) => {
                // Duplicate enqueue; the caller holds the same authoritative
                // reference we already pinned.
                assert!(
                    fault.checksum == checksum,
                    "fault at {} pinned to {} but re-enqueued as {}",
                    address,
                    fault.checksum,
                    checksum
                );
            }
            GetOrPut::Inserted(fault) => {
                *fault = FaultyBlock {
                    checksum,
                    state: FaultState::Waiting,
                    progress: FaultProgress::Block,
                };
                self.enqueued_blocks_single += 1;
                tracing::trace!(%address, %checksum, "block fault enqueued");
            }
        }

        self.check_invariants();
    }

    /// Records a table fault: the index block at `(address, checksum)` plus,
    /// once that index block is repaired, every content block it references.
    ///
    /// `callback` fires exactly once with the table's terminal result.
    ///
    /// If a standalone fault already exists for the index block (the
    /// scrubber got there first), it is upgraded in place; an in-flight
    /// write keeps counting toward the table.
    ///
    /// # Panics
    ///
    /// Panics if the queue is canceling, if `tables_max` repairs are already
    /// in flight, or if a table with the same index address is still linked.
    pub fn enqueue_table(
        &mut self,
        callback: TableRepairCallback,
        address: BlockAddress,
        checksum: Checksum,
    ) {
        assert!(!self.canceling, "enqueue_table while canceling");
        assert!(
            self.faulty_tables.count < self.options.tables_max,
            "table repairs at capacity {}",
            self.options.tables_max
        );

        // A table may be enqueued only once while its record is linked.
        let mut cursor = self.faulty_tables.head;
        while let Some(slot) = cursor {
            let table = self.tables.get(slot);
            assert!(
                table.index_address != address,
                "table at {address} already enqueued"
            );
            cursor = table.next;
        }

        let slot = self.tables.insert(RepairTable {
            index_address: address,
            index_checksum: checksum,
            content_blocks_received: 0,
            table_blocks_written: 0,
            table_blocks_total: None,
            callback: Some(callback),
            next: None,
        });
        self.faulty_tables.push(slot, &mut self.tables);

        match self.faulty_blocks.get_or_put(address) {
            GetOrPut::Found(fault) => {
                assert!(
                    fault.checksum == checksum,
                    "fault at {} pinned to {} but table enqueued as {}",
                    address,
                    fault.checksum,
                    checksum
                );
                assert!(
                    fault.progress == FaultProgress::Block,
                    "index block {address} already belongs to a table"
                );
                assert!(
                    fault.state != FaultState::Aborting,
                    "index block {address} was released"
                );
                fault.progress = FaultProgress::TableIndex { table: slot };
                self.enqueued_blocks_single -= 1;
                self.enqueued_blocks_table += 1;
                tracing::trace!(%address, "standalone fault upgraded to table index");
            }
            GetOrPut::Inserted(fault) => {
                *fault = FaultyBlock {
                    checksum,
                    state: FaultState::Waiting,
                    progress: FaultProgress::TableIndex { table: slot },
                };
                self.enqueued_blocks_table += 1;
                tracing::trace!(%address, %checksum, "table index fault enqueued");
            }
        }

        self.check_invariants();
    }

    // ========================================================================
    // Request Cycler
    // ========================================================================

    /// Fills `requests` with `(address, checksum)` pairs for waiting faults,
    /// returning the number of records populated.
    ///
    /// Starting from the cycler's position, walks up to the whole fault set
    /// in circular order, skipping faults already writing or aborting, and
    /// breaking early once the slice fills. The position then advances by
    /// the number of entries *examined*, so successive calls tour the entire
    /// set even when the slice is smaller than the fault set.
    pub fn next_batch_of_block_requests(&mut self, requests: &mut [BlockReference]) -> usize {
        assert!(!self.canceling, "next_batch_of_block_requests while canceling");

        let count = self.faulty_blocks.len();
        if count == 0 {
            assert!(self.faulty_blocks_repair_index == 0, "cycler index off empty map");
            return 0;
        }

        let mut examined = 0;
        let mut emitted = 0;
        while examined < count && emitted < requests.len() {
            let ordinal = (self.faulty_blocks_repair_index + examined) % count;
            let (address, fault) = self.faulty_blocks.entry_at(ordinal);
            examined += 1;

            if fault.state == FaultState::Waiting {
                requests[emitted] = BlockReference::new(address, fault.checksum);
                emitted += 1;
            }
        }

        self.faulty_blocks_repair_index = (self.faulty_blocks_repair_index + examined) % count;

        tracing::trace!(emitted, examined, faults = count, "repair request batch");
        self.check_invariants();
        emitted
    }

    // ========================================================================
    // Repair Write Path
    // ========================================================================

    /// Returns true iff a fault exists at `address` with matching checksum
    /// in [`FaultState::Waiting`]. The gate the grid checks before beginning
    /// a repair write.
    pub fn repair_waiting(&self, address: BlockAddress, checksum: Checksum) -> bool {
        assert!(!self.canceling, "repair_waiting while canceling");

        match self.faulty_blocks.get(address) {
            Some(fault) => fault.checksum == checksum && fault.state == FaultState::Waiting,
            None => false,
        }
    }

    /// Transitions a waiting fault to writing.
    ///
    /// For a table content fault, records the content-block ordinal in the
    /// table's received bitset; receiving the same ordinal twice is an
    /// assertion error.
    ///
    /// # Panics
    ///
    /// Panics if no waiting fault exists at `(address, checksum)`.
    pub fn repair_commence(&mut self, address: BlockAddress, checksum: Checksum) {
        assert!(!self.canceling, "repair_commence while canceling");

        let fault = self
            .faulty_blocks
            .get_mut(address)
            .unwrap_or_else(|| panic!("commence of unknown fault at {address}"));
        assert!(
            fault.checksum == checksum,
            "commence at {} with checksum {} but fault pinned to {}",
            address,
            checksum,
            fault.checksum
        );
        assert!(
            fault.state == FaultState::Waiting,
            "commence of {:?} fault at {address}",
            fault.state
        );
        fault.state = FaultState::Writing;
        let progress = fault.progress;

        if let FaultProgress::TableContent { table: slot, index } = progress {
            let table = self.tables.get_mut(slot);
            let bit = 1u64 << index;
            assert!(
                table.content_blocks_received & bit == 0,
                "content block {} of table at {} received twice",
                index,
                table.index_address
            );
            table.content_blocks_received |= bit;
        }

        tracing::trace!(%address, ?progress, "repair write commenced");
        self.check_invariants();
    }

    /// Retires a fault whose repair write has finished.
    ///
    /// The block header supplies the authoritative address and checksum; the
    /// fault must be writing or aborting.
    ///
    /// - Aborting faults only drain the checkpoint's aborting count; the
    ///   block was released and counts toward no table.
    /// - An index block's arrival fixes the table's total and enqueues a
    ///   content fault for every referenced block. A content enqueue that
    ///   replaces a fault already writing pre-sets its received bit.
    /// - Table faults advance `table_blocks_written`; the table's callback
    ///   fires with [`TableRepairResult::Repaired`] when the last block
    ///   lands.
    pub fn repair_complete(&mut self, block: &Block) {
        assert!(!self.canceling, "repair_complete while canceling");

        let address = block.address();
        let checksum = block.checksum();

        let fault = self.faulty_blocks.swap_remove(address);
        self.clamp_repair_index();
        match fault.progress {
            FaultProgress::Block => self.enqueued_blocks_single -= 1,
            FaultProgress::TableIndex { .. } | FaultProgress::TableContent { .. } => {
                self.enqueued_blocks_table -= 1;
            }
        }
        assert!(
            fault.checksum == checksum,
            "completed block at {} has checksum {} but fault pinned {}",
            address,
            checksum,
            fault.checksum
        );

        match fault.state {
            FaultState::Waiting => unreachable!("complete of waiting fault at {address}"),
            FaultState::Aborting => {
                // Write drain for a block released by the checkpoint.
                match &mut self.checkpointing {
                    Some(checkpointing) => {
                        assert!(
                            checkpointing.aborting > 0,
                            "aborting fault at {address} but aborting count is zero"
                        );
                        checkpointing.aborting -= 1;
                        tracing::trace!(
                            %address,
                            aborting = checkpointing.aborting,
                            "aborted repair write drained"
                        );
                    }
                    None => unreachable!("aborting fault at {address} outside of checkpoint"),
                }
            }
            FaultState::Writing => match fault.progress {
                FaultProgress::Block => {
                    tracing::trace!(%address, "block repaired");
                }
                FaultProgress::TableIndex { table: slot } => {
                    self.table_index_repaired(slot, block);
                    self.table_block_written(slot);
                }
                FaultProgress::TableContent { table: slot, index } => {
                    let table = self.tables.get(slot);
                    let bit = 1u64 << index;
                    assert!(
                        table.content_blocks_received & bit != 0,
                        "content block {} of table at {} completed but never received",
                        index,
                        table.index_address
                    );
                    self.table_block_written(slot);
                }
            },
        }

        self.check_invariants();
    }

    /// Seeds a table's content-block faults from its freshly-written index
    /// block.
    fn table_index_repaired(&mut self, slot: TableSlot, block: &Block) {
        let view = block.index_view();
        let content_blocks_used = view.content_blocks_used();
        assert!(
            (1..=LSM_TABLE_CONTENT_BLOCKS_MAX as u32).contains(&content_blocks_used),
            "index block at {} references {} content blocks (limit {})",
            block.address(),
            content_blocks_used,
            LSM_TABLE_CONTENT_BLOCKS_MAX
        );

        {
            let table = self.tables.get_mut(slot);
            assert!(
                table.table_blocks_total.is_none(),
                "index block arrived twice for table at {}",
                table.index_address
            );
            table.table_blocks_total = Some(1 + content_blocks_used);
        }

        for index in 0..content_blocks_used {
            let reference = view.content_block(index);
            let replaced_writing = match self.faulty_blocks.get_or_put(reference.address) {
                GetOrPut::Inserted(fault) => {
                    *fault = FaultyBlock {
                        checksum: reference.checksum,
                        state: FaultState::Waiting,
                        progress: FaultProgress::TableContent { table: slot, index },
                    };
                    self.enqueued_blocks_table += 1;
                    false
                }
                GetOrPut::Found(existing) => {
                    // The scrubber queued this content block standalone;
                    // fold it into the table.
                    assert!(
                        existing.checksum == reference.checksum,
                        "content block at {} pinned to {} but index lists {}",
                        reference.address,
                        existing.checksum,
                        reference.checksum
                    );
                    assert!(
                        existing.progress == FaultProgress::Block,
                        "content block {} already belongs to a table",
                        reference.address
                    );
                    assert!(
                        existing.state != FaultState::Aborting,
                        "content block {} released while its table is live",
                        reference.address
                    );
                    existing.progress = FaultProgress::TableContent { table: slot, index };
                    self.enqueued_blocks_single -= 1;
                    self.enqueued_blocks_table += 1;
                    existing.state == FaultState::Writing
                }
            };

            // A replaced fault already mid-write has already "received" its
            // content block.
            if replaced_writing {
                self.tables.get_mut(slot).content_blocks_received |= 1u64 << index;
            }
        }

        tracing::trace!(
            address = %block.address(),
            content_blocks = content_blocks_used,
            "table index repaired; content faults enqueued"
        );
    }

    /// Advances a table's write count, retiring the table when the last
    /// block lands.
    fn table_block_written(&mut self, slot: TableSlot) {
        let (written, total) = {
            let table = self.tables.get_mut(slot);
            table.table_blocks_written += 1;
            let total = match table.table_blocks_total {
                Some(total) => total,
                None => unreachable!(
                    "table at {} completed a write before its index arrived",
                    table.index_address
                ),
            };
            assert!(
                table.table_blocks_written <= total,
                "table at {} wrote {} of {} blocks",
                table.index_address,
                table.table_blocks_written,
                total
            );
            (table.table_blocks_written, total)
        };

        if written == total {
            self.faulty_tables.remove(slot, &mut self.tables);
            let mut table = self.tables.take(slot);
            let Some(callback) = table.callback.take() else {
                unreachable!("table at {} callback already fired", table.index_address)
            };
            tracing::debug!(
                address = %table.index_address,
                blocks = total,
                "table repaired"
            );
            callback(&table, TableRepairResult::Repaired);
        }
    }

    // ========================================================================
    // Checkpoint Coordination
    // ========================================================================

    /// Reconciles the queue against a newly-staged free-set at the boundary
    /// between the current checkpoint and the next.
    ///
    /// Released waiting faults are removed outright; released in-flight
    /// writes transition to aborting and must drain through
    /// [`Self::repair_complete`] before [`Self::checkpoint_complete`]
    /// reports true. Released tables fire their callbacks with
    /// [`TableRepairResult::Released`]; survivors keep FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if a checkpoint is already in progress, or if any queued
    /// fault's address is free (coherence violation).
    pub fn checkpoint_commence(&mut self, free_set: &impl FreeSetView) {
        assert!(!self.canceling, "checkpoint_commence while canceling");
        assert!(self.checkpointing.is_none(), "checkpoint already in progress");

        let mut aborting = 0;
        let mut removed = 0;
        let mut ordinal = 0;
        while ordinal < self.faulty_blocks.len() {
            let (address, fault) = self.faulty_blocks.entry_at(ordinal);
            let state = fault.state;
            assert!(
                !free_set.is_free(address),
                "faulty block {address} is free"
            );

            if !free_set.is_released(address) {
                ordinal += 1;
                continue;
            }

            match state {
                FaultState::Waiting => {
                    // Swap-remove pulls a new entry into this ordinal;
                    // re-examine it rather than advancing.
                    let removed_fault = self.faulty_blocks.swap_remove(address);
                    match removed_fault.progress {
                        FaultProgress::Block => self.enqueued_blocks_single -= 1,
                        FaultProgress::TableIndex { .. } | FaultProgress::TableContent { .. } => {
                            self.enqueued_blocks_table -= 1;
                        }
                    }
                    removed += 1;
                    tracing::trace!(%address, "released waiting fault removed");
                }
                FaultState::Writing => {
                    let (_, fault) = self.faulty_blocks.entry_at_mut(ordinal);
                    fault.state = FaultState::Aborting;
                    aborting += 1;
                    ordinal += 1;
                    tracing::trace!(%address, "released in-flight write aborting");
                }
                FaultState::Aborting => {
                    unreachable!("aborting fault at {address} before checkpoint commence")
                }
            }
        }
        self.clamp_repair_index();

        // Released tables fire callbacks; survivors are re-linked in order.
        let mut survivors = TableFifo::new();
        let mut released_tables = 0;
        while let Some(slot) = self.faulty_tables.pop(&mut self.tables) {
            if free_set.is_released(self.tables.get(slot).index_address) {
                let mut table = self.tables.take(slot);
                let Some(callback) = table.callback.take() else {
                    unreachable!("table at {} callback already fired", table.index_address)
                };
                released_tables += 1;
                tracing::debug!(address = %table.index_address, "table released at checkpoint");
                callback(&table, TableRepairResult::Released);
            } else {
                survivors.push(slot, &mut self.tables);
            }
        }
        self.faulty_tables = survivors;

        // Aborting faults may outlive their table; live faults may not.
        for (address, fault) in self.faulty_blocks.iter() {
            if fault.state == FaultState::Aborting {
                continue;
            }
            if let FaultProgress::TableIndex { table }
            | FaultProgress::TableContent { table, .. } = fault.progress
            {
                assert!(
                    self.tables.is_occupied(table),
                    "live fault at {address} references a released table"
                );
            }
        }

        self.checkpointing = Some(Checkpointing { aborting });
        tracing::debug!(
            aborting,
            removed,
            released_tables,
            faults = self.faulty_blocks.len(),
            tables = self.faulty_tables.count,
            "checkpoint commenced"
        );
        self.check_invariants();
    }

    /// Returns true iff every write aborted by [`Self::checkpoint_commence`]
    /// has drained, clearing the checkpoint state. Otherwise returns false;
    /// the caller polls again after each subsequent `repair_complete`.
    ///
    /// # Panics
    ///
    /// Panics if called without a checkpoint in progress.
    pub fn checkpoint_complete(&mut self) -> bool {
        assert!(!self.canceling, "checkpoint_complete while canceling");

        let aborting = match &self.checkpointing {
            Some(checkpointing) => checkpointing.aborting,
            None => panic!("checkpoint_complete without checkpoint_commence"),
        };
        if aborting > 0 {
            return false;
        }

        self.checkpointing = None;
        for (address, fault) in self.faulty_blocks.iter() {
            assert!(
                fault.state != FaultState::Aborting,
                "aborting fault at {address} survived checkpoint"
            );
        }
        tracing::debug!(faults = self.faulty_blocks.len(), "checkpoint completed");
        self.check_invariants();
        true
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    /// Cancels every outstanding repair.
    ///
    /// Fires each linked table's callback with
    /// [`TableRepairResult::Canceled`] in FIFO order, empties the fault map
    /// (retaining capacity), and latches `canceling`: every subsequent
    /// public operation is a contract violation until the queue is
    /// re-initialized.
    pub fn cancel(&mut self) {
        assert!(!self.canceling, "cancel while already canceling");
        // Latched before the callbacks fire so none of them can re-enter an
        // enqueue path.
        self.canceling = true;

        let mut canceled = 0;
        while let Some(slot) = self.faulty_tables.pop(&mut self.tables) {
            let mut table = self.tables.take(slot);
            let Some(callback) = table.callback.take() else {
                unreachable!("table at {} callback already fired", table.index_address)
            };
            canceled += 1;
            callback(&table, TableRepairResult::Canceled);
        }

        self.faulty_blocks.clear();
        self.enqueued_blocks_single = 0;
        self.enqueued_blocks_table = 0;
        self.faulty_blocks_repair_index = 0;
        self.checkpointing = None;

        tracing::debug!(tables = canceled, "repair queue canceled");
        self.check_invariants();
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Returns the number of outstanding faulty blocks.
    pub fn fault_count(&self) -> usize {
        self.faulty_blocks.len()
    }

    /// Returns the number of in-flight table repairs.
    pub fn table_count(&self) -> usize {
        self.faulty_tables.count
    }

    /// Returns the state of the fault at `address`, if one exists (for
    /// instrumentation and tests).
    pub fn fault_state(&self, address: BlockAddress) -> Option<FaultState> {
        self.faulty_blocks.get(address).map(|fault| fault.state)
    }

    /// Returns the number of aborted writes still draining, or `None` when
    /// no checkpoint is in progress.
    pub fn checkpoint_aborting(&self) -> Option<usize> {
        self.checkpointing
            .as_ref()
            .map(|checkpointing| checkpointing.aborting)
    }

    /// Returns true once a checkpoint has commenced and not yet completed.
    pub fn is_checkpointing(&self) -> bool {
        self.checkpointing.is_some()
    }

    /// Returns true once [`Self::cancel`] has latched the queue.
    pub fn is_canceling(&self) -> bool {
        self.canceling
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    fn clamp_repair_index(&mut self) {
        let count = self.faulty_blocks.len();
        if count == 0 {
            self.faulty_blocks_repair_index = 0;
        } else {
            self.faulty_blocks_repair_index %= count;
        }
    }

    /// Cheap structural invariants, re-checked at the exit of every public
    /// mutating operation.
    fn check_invariants(&self) {
        assert!(
            self.faulty_blocks.len() == self.enqueued_blocks_single + self.enqueued_blocks_table,
            "accounting split: {} faults != {} single + {} table",
            self.faulty_blocks.len(),
            self.enqueued_blocks_single,
            self.enqueued_blocks_table
        );
        assert!(
            self.enqueued_blocks_table
                <= self.options.tables_max * LSM_TABLE_CONTENT_BLOCKS_MAX,
            "table faults {} exceed reservation",
            self.enqueued_blocks_table
        );
        assert!(
            self.faulty_tables.count <= self.options.tables_max,
            "table count {} exceeds tables_max {}",
            self.faulty_tables.count,
            self.options.tables_max
        );
        if self.faulty_blocks.len() > 0 {
            assert!(
                self.faulty_blocks_repair_index < self.faulty_blocks.len(),
                "cycler index {} out of range {}",
                self.faulty_blocks_repair_index,
                self.faulty_blocks.len()
            );
        } else {
            assert!(self.faulty_blocks_repair_index == 0, "cycler index off empty map");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
