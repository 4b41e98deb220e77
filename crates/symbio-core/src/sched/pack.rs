//! Core packing.
//!
//! Selected pairs land on physical cores through a min-priority queue keyed
//! by `(stacked pair count, total score)`, so load spreads before quality
//! concentrates. Within a core, the pair's two elements go to whichever
//! sibling threads score better against the runqueues already there.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};

use super::select::SelectedPair;
use super::Member;
use crate::score::ScoreMap;
use crate::topology::Topology;

/// Runqueue members considered when evaluating a placement.
const RUNQUEUE_EVAL_CAP: usize = 5;

/// A computed assignment: per logical thread, the ordered sequence of pair
/// members intended to share it.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    /// Indexed by logical CPU id.
    threads: HashMap<usize, Vec<Member>>,
    /// The selection that produced this placement, in packing order.
    pairs: Vec<SelectedPair>,
}

impl Placement {
    /// Logical-CPU sets per process group, sentinel entries skipped.
    pub fn affinities(&self) -> HashMap<i32, Vec<usize>> {
        let mut map: HashMap<i32, Vec<usize>> = HashMap::new();
        for (&cpu, members) in &self.threads {
            for m in members {
                if m.is_sentinel() {
                    continue;
                }
                let cpus = map.entry(m.pgid).or_default();
                if !cpus.contains(&cpu) {
                    cpus.push(cpu);
                }
            }
        }
        for cpus in map.values_mut() {
            cpus.sort_unstable();
        }
        map
    }

    /// The runqueue of one logical thread.
    pub fn runqueue(&self, cpu: usize) -> &[Member] {
        self.threads.get(&cpu).map_or(&[], Vec::as_slice)
    }

    /// The pairs this placement realizes, in packing order.
    pub fn pairs(&self) -> &[SelectedPair] {
        &self.pairs
    }

    /// Sum of selected pair scores, for diagnostics.
    pub fn selection_score(&self) -> f64 {
        self.pairs.iter().map(|p| p.score).sum()
    }
}

/// Heap key: least-loaded core first, then lowest accumulated score, then
/// core id for determinism.
struct CoreKey {
    thread_count: u32,
    total_score: f64,
    core_idx: usize,
}

impl PartialEq for CoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for CoreKey {}

impl PartialOrd for CoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for CoreKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the least-loaded core
        // on top.
        other
            .thread_count
            .cmp(&self.thread_count)
            .then_with(|| other.total_score.total_cmp(&self.total_score))
            .then_with(|| other.core_idx.cmp(&self.core_idx))
    }
}

/// Sum of scores between `job` and the first few members of a runqueue.
fn evaluate_runqueue(rq: &[Member], job: i32, scores: &ScoreMap) -> f64 {
    rq.iter()
        .take(RUNQUEUE_EVAL_CAP)
        .map(|m| scores.get(job, m.job_id).unwrap_or(0.0))
        .sum()
}

/// Step 5: pack pairs onto physical cores, best pairs first.
pub fn pack(selected: &[SelectedPair], topology: &Topology, scores: &ScoreMap) -> Placement {
    let cores = topology.cores();
    let mut runqueues: Vec<[Vec<Member>; 2]> = cores.iter().map(|_| [Vec::new(), Vec::new()]).collect();
    let mut heap: BinaryHeap<CoreKey> = (0..cores.len())
        .map(|core_idx| CoreKey {
            thread_count: 0,
            total_score: 0.0,
            core_idx,
        })
        .collect();

    for pair in selected {
        let Some(mut key) = heap.pop() else { break };
        let rq = &mut runqueues[key.core_idx];

        // Try both orientations of the pair across the two siblings.
        let straight = evaluate_runqueue(&rq[0], pair.a.job_id, scores)
            + evaluate_runqueue(&rq[1], pair.b.job_id, scores);
        let flipped = evaluate_runqueue(&rq[0], pair.b.job_id, scores)
            + evaluate_runqueue(&rq[1], pair.a.job_id, scores);
        if straight >= flipped {
            rq[0].push(pair.a);
            rq[1].push(pair.b);
        } else {
            rq[0].push(pair.b);
            rq[1].push(pair.a);
        }

        key.thread_count += 1;
        key.total_score += pair.score;
        heap.push(key);
    }

    let mut threads = HashMap::new();
    for (core, rq) in cores.iter().zip(runqueues) {
        let [rq0, rq1] = rq;
        threads.insert(core.threads.0, rq0);
        threads.insert(core.threads.1, rq1);
    }
    Placement {
        threads,
        pairs: selected.to_vec(),
    }
}
