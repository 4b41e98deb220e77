//! Empirical candidate validation.
//!
//! The score model is imperfect, so the scheduler does not trust a single
//! assignment: it generates a few candidates (rotations of the sorted pair
//! list to break ties differently, plus shuffled baselines of the best
//! selection), commits each, lets the system settle, and measures System
//! Throughput from the attribution snapshots. The candidate with the
//! highest measured STP wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;
use rand::seq::SliceRandom;

use super::affinity::AffinityCommitter;
use super::pack::{Placement, pack};
use super::select::{Target, enumerate_pairs, greedy_select, two_opt};
use crate::iat::{AttributionTable, SnapshotRecord};
use crate::score::ScoreMap;
use crate::topology::Topology;

/// Measures system throughput for the currently committed assignment.
pub trait ThroughputProbe {
    /// Reset accounting, wait out the settling interval, return STP.
    fn measure(&mut self, settle: Duration) -> f64;
}

/// STP over attribution snapshots: `Σ observed_IPC / single_ipc`, skipping
/// slots with no attributed cycles or no solo baseline.
pub fn stp_of_snapshots(snapshots: &[SnapshotRecord], single_ipc: &HashMap<i32, f64>) -> f64 {
    snapshots
        .iter()
        .filter_map(|s| {
            let ipc = s.ipc()?;
            let solo = single_ipc.get(&s.job_id)?;
            if *solo <= 0.0 {
                return None;
            }
            Some(ipc / solo)
        })
        .sum()
}

/// The real probe: reset the table, sleep, read the snapshots.
pub struct MeasuredStp {
    table: Arc<AttributionTable>,
    single_ipc: HashMap<i32, f64>,
}

impl MeasuredStp {
    pub fn new(table: Arc<AttributionTable>, single_ipc: HashMap<i32, f64>) -> Self {
        Self { table, single_ipc }
    }

    /// Refresh the solo-IPC baselines (jobs appear as they are profiled).
    pub fn set_baselines(&mut self, single_ipc: HashMap<i32, f64>) {
        self.single_ipc = single_ipc;
    }
}

impl ThroughputProbe for MeasuredStp {
    fn measure(&mut self, settle: Duration) -> f64 {
        self.table.reset_all();
        std::thread::sleep(settle);
        stp_of_snapshots(&self.table.snapshots(), &self.single_ipc)
    }
}

/// Step 6a: distinct candidate assignments.
///
/// Candidate `r` rotates the sorted pair list left by `r` before the greedy
/// pass, then re-runs 2-opt and packing. On top come up to `k` random
/// baselines: shuffles of the best selection, packed as-is. Duplicates
/// (by resulting affinity masks) are dropped.
pub fn generate_candidates(
    targets: &[Target],
    scores: &ScoreMap,
    topology: &Topology,
    k: usize,
    rng: &mut impl Rng,
) -> Vec<Placement> {
    let base_pairs = enumerate_pairs(targets, scores);
    if base_pairs.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<Placement> = Vec::new();
    let mut push_unique = |candidates: &mut Vec<Placement>, p: Placement| {
        if !candidates.iter().any(|c| c.affinities() == p.affinities()) {
            candidates.push(p);
        }
    };

    let mut best_selection = None;
    for rot in 0..k.max(1) {
        let mut rotated = base_pairs.clone();
        let rotated_len = rotated.len();
        rotated.rotate_left(rot % rotated_len);
        let selected = greedy_select(targets, &rotated);
        if selected.is_empty() {
            continue;
        }
        let improved = two_opt(selected, scores);
        if best_selection.is_none() {
            best_selection = Some(improved.clone());
        }
        push_unique(&mut candidates, pack(&improved, topology, scores));
    }

    if let Some(best) = best_selection {
        for _ in 0..k {
            let mut shuffled = best.clone();
            shuffled.shuffle(rng);
            push_unique(&mut candidates, pack(&shuffled, topology, scores));
        }
    }

    candidates
}

/// Step 6b: commit each candidate, measure, keep the best.
///
/// The winner is returned uncommitted; the caller re-commits it (the last
/// candidate measured is otherwise the one left applied).
pub fn empirical_best<C: AffinityCommitter, P: ThroughputProbe>(
    candidates: Vec<Placement>,
    committer: &mut C,
    probe: &mut P,
    settle: Duration,
) -> Option<Placement> {
    let mut best: Option<(f64, Placement)> = None;
    for (i, placement) in candidates.into_iter().enumerate() {
        committer.commit(&placement.affinities());
        let stp = probe.measure(settle);
        debug!("scheduler: candidate {i} measured STP {stp:.3}");
        if best.as_ref().is_none_or(|(top, _)| stp > *top) {
            best = Some((stp, placement));
        }
    }
    if let Some((stp, _)) = &best {
        info!("scheduler: winning candidate STP {stp:.3}");
    }
    best.map(|(_, placement)| placement)
}
