//! Pair scheduler.
//!
//! Turns live attribution snapshots plus the score map into a committed
//! per-process-group CPU affinity assignment:
//!
//! 1. discover targets (and pad with a sentinel so empty sibling threads
//!    are modeled explicitly)        — [`select`]
//! 2. enumerate and score pairs     — [`select`]
//! 3. greedy selection under worker budgets — [`select`]
//! 4. 2-opt local search            — [`select`]
//! 5. pack pairs onto physical cores — [`pack`]
//! 6. empirical A/B across candidates by measured throughput — [`validate`]
//! 7. commit the winner's affinity masks — [`affinity`]

pub mod affinity;
pub mod pack;
pub mod select;
pub mod validate;

use std::time::Duration;

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::iat::SnapshotRecord;
use crate::score::ScoreMap;
use crate::topology::Topology;

pub use affinity::{AffinityCommitter, ProcAffinity, RecordingCommitter};
pub use pack::Placement;
pub use select::{SelectedPair, Target};
pub use validate::{MeasuredStp, ThroughputProbe, stp_of_snapshots};

/// Process-group id of the sentinel filler workload.
pub const SENTINEL_PGID: i32 = -1;

/// One side of a selected pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub pgid: i32,
    pub job_id: i32,
}

impl Member {
    pub fn is_sentinel(&self) -> bool {
        self.pgid == SENTINEL_PGID
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Settling time before each throughput measurement.
    ///
    /// **Default:** 20 seconds.
    pub settle: Duration,
    /// Rotation candidates (and random baselines) per cycle.
    ///
    /// **Default:** `3`.
    pub candidates: usize,
    /// Seed for the baseline shuffles; `None` seeds from the OS.
    ///
    /// **Default:** `None`.
    pub shuffle_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(20),
            candidates: 3,
            shuffle_seed: None,
        }
    }
}

/// The assignment engine: selection, packing, validation, commitment.
pub struct PairScheduler<C: AffinityCommitter, P: ThroughputProbe> {
    topology: Topology,
    config: SchedulerConfig,
    committer: C,
    probe: P,
    rng: StdRng,
}

impl<C: AffinityCommitter, P: ThroughputProbe> PairScheduler<C, P> {
    pub fn new(topology: Topology, config: SchedulerConfig, committer: C, probe: P) -> Self {
        let rng = match config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            topology,
            config,
            committer,
            probe,
            rng,
        }
    }

    /// The throughput probe, for refreshing baselines between cycles.
    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// The affinity committer.
    pub fn committer(&self) -> &C {
        &self.committer
    }

    /// Run one full assignment cycle. Returns the committed placement, or
    /// `None` when there is nothing to schedule.
    pub fn run_cycle(
        &mut self,
        snapshots: &[SnapshotRecord],
        scores: &ScoreMap,
    ) -> Option<Placement> {
        let logical = self.topology.logical_count();
        let targets = select::discover_targets(snapshots, logical);
        if targets.is_empty() {
            debug!("scheduler: no live process groups, nothing to do");
            return None;
        }

        let candidates = validate::generate_candidates(
            &targets,
            scores,
            &self.topology,
            self.config.candidates,
            &mut self.rng,
        );
        if candidates.is_empty() {
            debug!("scheduler: no feasible candidate assignments");
            return None;
        }
        info!(
            "scheduler: evaluating {} candidate assignments over {} targets",
            candidates.len(),
            targets.len()
        );

        let winner = validate::empirical_best(
            candidates,
            &mut self.committer,
            &mut self.probe,
            self.config.settle,
        )?;
        self.committer.commit(&winner.affinities());
        Some(winner)
    }
}
