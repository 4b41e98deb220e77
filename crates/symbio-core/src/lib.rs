//! # symbio-core
//!
//! **Compatible workloads belong on sibling hyperthreads.**
//!
//! `symbio-core` is the core library of the symbio pair scheduler: it
//! attributes cycles and retired instructions to long-running process
//! groups, turns offline contention profiles into pairwise compatibility
//! scores, and places the best-scoring pairs on SMT sibling threads —
//! then checks its own work by measuring throughput across candidate
//! assignments and committing the empirical winner.
//!
//! ## Architecture
//!
//! Switch events → attribution table → snapshots
//! Profiles → score engine → score map
//! Snapshots + scores → pair scheduler → affinity masks
//!
//! - [`iat`]: per-process-group IPC attribution driven by context
//!   switches, with a seqlock-protected shared snapshot region.
//! - [`counters`] / [`monitor`] / [`perf`]: per-CPU hardware counter pairs
//!   and the `sched_switch` tracepoint feed.
//! - [`watchdog`]: detects long-running groups, requests profiling, and
//!   gates attribution registration on the profiling acknowledgement.
//! - [`notify`] / [`control`] / [`loader`]: the wire between the watchdog
//!   and the user-space profile loader, and the loader itself.
//! - [`catalog`] / [`store`] / [`profile`] / [`model`] / [`score`]: the
//!   resource catalog, measurement documents, characteristic vectors, the
//!   trained slowdown model, and pairwise scoring.
//! - [`topology`] / [`sched`]: sibling-core discovery and the
//!   select → 2-opt → pack → validate → commit pipeline.

pub mod catalog;
pub mod control;
pub mod counters;
pub mod iat;
pub mod loader;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod perf;
pub mod profile;
pub mod sched;
pub mod score;
pub mod store;
pub mod topology;
pub mod watchdog;

pub use catalog::{Resource, ResourceCatalog, ResourceKind};
pub use iat::{AttributionTable, IatError, MAX_SLOTS, SnapshotRecord};
pub use model::SlowdownModel;
pub use profile::WorkloadProfile;
pub use sched::{PairScheduler, SchedulerConfig};
pub use score::{ScoreEngine, ScoreMap};
pub use topology::Topology;
pub use watchdog::{Watchdog, WatchdogConfig};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
