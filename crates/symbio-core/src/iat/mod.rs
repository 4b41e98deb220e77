//! IPC attribution table.
//!
//! Per-process-group cycle and retired-instruction accounting driven by
//! context-switch events, with a lock-free snapshot protocol for readers.
//!
//! Layout of the module:
//! - [`table`]: the slot array, pgid lookup, free list, per-CPU switch
//!   state, and the switch-path attribution algorithm.
//! - [`shm`]: the shared, page-aligned snapshot region readers map; the
//!   seqlock writer/reader protocol and the active mask live here.

pub mod shm;
pub mod table;

/// Capacity of the attribution table.
pub const MAX_SLOTS: usize = 4096;

pub use shm::{RegionLayout, SharedRegion, SnapshotReader, SnapshotRecord};
pub use table::{AttributionTable, IatError};
