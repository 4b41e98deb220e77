//! Target discovery, pair enumeration, greedy selection, 2-opt.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use super::{Member, SENTINEL_PGID};
use crate::iat::SnapshotRecord;
use crate::score::{SENTINEL_JOB, ScoreMap};

/// A schedulable process group (or the sentinel filler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub pgid: i32,
    pub job_id: i32,
    pub workers: i32,
}

impl Target {
    fn member(&self) -> Member {
        Member {
            pgid: self.pgid,
            job_id: self.job_id,
        }
    }
}

/// A selected pair instance with its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectedPair {
    pub a: Member,
    pub b: Member,
    pub score: f64,
}

/// An enumerated candidate pair over target indices.
#[derive(Debug, Clone, Copy)]
pub struct PairCandidate {
    pub i: usize,
    pub j: usize,
    pub score: f64,
}

/// Step 1: read live identities and pad to a whole number of sibling pairs.
///
/// `remain = (L - (n mod L)) mod L` empty thread slots are modeled by one
/// sentinel target so the rounded total is even and divisible by the
/// logical-CPU count.
pub fn discover_targets(snapshots: &[SnapshotRecord], logical_cpus: usize) -> Vec<Target> {
    let mut targets: Vec<Target> = snapshots
        .iter()
        .filter(|s| s.worker_num > 0)
        .map(|s| Target {
            pgid: s.pgid,
            job_id: s.job_id,
            workers: s.worker_num,
        })
        .collect();
    if targets.is_empty() {
        return targets;
    }
    // Deterministic input order for the greedy tie-break.
    targets.sort_by_key(|t| t.pgid);

    let n: i32 = targets.iter().map(|t| t.workers).sum();
    let l = logical_cpus as i32;
    let remain = if l > 0 { (l - n.rem_euclid(l)).rem_euclid(l) } else { 0 };
    if remain > 0 {
        targets.push(Target {
            pgid: SENTINEL_PGID,
            job_id: SENTINEL_JOB,
            workers: remain,
        });
    }
    targets
}

/// Step 2: every unordered pair of targets, scored and sorted descending.
///
/// Self-pairs require at least two workers. Pairs without a score entry are
/// excluded here with a warning; the rest of the cycle proceeds without
/// them (the affected group degrades to whatever placement remains).
pub fn enumerate_pairs(targets: &[Target], scores: &ScoreMap) -> Vec<PairCandidate> {
    let mut pairs = Vec::new();
    for i in 0..targets.len() {
        for j in i..targets.len() {
            if i == j && targets[i].workers < 2 {
                continue;
            }
            match scores.get(targets[i].job_id, targets[j].job_id) {
                Some(score) => pairs.push(PairCandidate { i, j, score }),
                None => warn!(
                    "scheduler: no score for jobs ({}, {}); excluding pair",
                    targets[i].job_id, targets[j].job_id
                ),
            }
        }
    }
    // Stable sort keeps input order among equals: deterministic tie-break.
    pairs.sort_by(|a, b| b.score.total_cmp(&a.score));
    pairs
}

/// Step 3: greedy selection under job-level and pgid-level worker budgets.
pub fn greedy_select(targets: &[Target], candidates: &[PairCandidate]) -> Vec<SelectedPair> {
    let total: i32 = targets.iter().map(|t| t.workers).sum();
    let goal = (total / 2) as usize;

    let mut job_budget: HashMap<i32, i32> = HashMap::new();
    for t in targets {
        *job_budget.entry(t.job_id).or_insert(0) += t.workers;
    }
    let mut pgid_remaining: Vec<i32> = targets.iter().map(|t| t.workers).collect();

    let mut selected = Vec::with_capacity(goal);
    for cand in candidates {
        if selected.len() >= goal {
            break;
        }
        let (ti, tj) = (targets[cand.i], targets[cand.j]);
        let same_job = ti.job_id == tj.job_id;

        let k = if cand.i == cand.j {
            // Self-pair on one pgid: both sides draw from the same budgets.
            let jobs = job_budget[&ti.job_id];
            (jobs / 2).min(pgid_remaining[cand.i] / 2)
        } else if same_job {
            // Same job across two pgids: the job budget covers both sides.
            let jobs = job_budget[&ti.job_id];
            (jobs / 2)
                .min(pgid_remaining[cand.i])
                .min(pgid_remaining[cand.j])
        } else {
            job_budget[&ti.job_id]
                .min(job_budget[&tj.job_id])
                .min(pgid_remaining[cand.i])
                .min(pgid_remaining[cand.j])
        };
        let k = (k as usize).min(goal - selected.len()) as i32;
        if k <= 0 {
            continue;
        }

        if cand.i == cand.j {
            *job_budget.get_mut(&ti.job_id).unwrap() -= 2 * k;
            pgid_remaining[cand.i] -= 2 * k;
        } else if same_job {
            *job_budget.get_mut(&ti.job_id).unwrap() -= 2 * k;
            pgid_remaining[cand.i] -= k;
            pgid_remaining[cand.j] -= k;
        } else {
            *job_budget.get_mut(&ti.job_id).unwrap() -= k;
            *job_budget.get_mut(&tj.job_id).unwrap() -= k;
            pgid_remaining[cand.i] -= k;
            pgid_remaining[cand.j] -= k;
        }

        for _ in 0..k {
            selected.push(SelectedPair {
                a: ti.member(),
                b: tj.member(),
                score: cand.score,
            });
        }
    }

    if selected.len() < goal {
        debug!(
            "scheduler: selection short of goal ({}/{goal} pairs)",
            selected.len()
        );
    }
    selected
}

/// Step 4: two passes of pairwise 2-opt.
///
/// For each pair of selected pairs, compare keeping them, swapping their
/// first elements, and re-pairing crosswise; apply the best. Pairs whose
/// "keep" won in the first pass are remembered and skipped in the second.
/// The result is sorted by score, best first.
pub fn two_opt(mut selected: Vec<SelectedPair>, scores: &ScoreMap) -> Vec<SelectedPair> {
    let pair_score = |a: Member, b: Member| scores.get(a.job_id, b.job_id);
    let mut keep_won: HashSet<u64> = HashSet::new();

    for _pass in 0..2 {
        for i in 0..selected.len() {
            for j in (i + 1)..selected.len() {
                let key = ((i as u64) << 32) | j as u64;
                if keep_won.contains(&key) {
                    continue;
                }
                let (pi, pj) = (selected[i], selected[j]);
                let keep = pi.score + pj.score;

                // Swap first elements: (aj, bi) and (ai, bj).
                let first = pair_score(pj.a, pi.b).zip(pair_score(pi.a, pj.b));
                // Crosswise: (ai, aj) and (bi, bj).
                let cross = pair_score(pi.a, pj.a).zip(pair_score(pi.b, pj.b));

                let first_sum = first.map_or(f64::NEG_INFINITY, |(x, y)| x + y);
                let cross_sum = cross.map_or(f64::NEG_INFINITY, |(x, y)| x + y);

                if keep >= first_sum && keep >= cross_sum {
                    keep_won.insert(key);
                } else if first_sum >= cross_sum {
                    let (si, sj) = first.unwrap();
                    selected[i] = SelectedPair {
                        a: pj.a,
                        b: pi.b,
                        score: si,
                    };
                    selected[j] = SelectedPair {
                        a: pi.a,
                        b: pj.b,
                        score: sj,
                    };
                } else {
                    let (si, sj) = cross.unwrap();
                    selected[i] = SelectedPair {
                        a: pi.a,
                        b: pj.a,
                        score: si,
                    };
                    selected[j] = SelectedPair {
                        a: pi.b,
                        b: pj.b,
                        score: sj,
                    };
                }
            }
        }
    }

    selected.sort_by(|a, b| b.score.total_cmp(&a.score));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(pgid: i32, job_id: i32, workers: i32) -> SnapshotRecord {
        SnapshotRecord {
            slot: pgid as usize,
            pgid,
            job_id,
            worker_num: workers,
            cycles: 1000,
            instructions: 1500,
        }
    }

    fn scores(entries: &[(i32, i32, f64)]) -> ScoreMap {
        let mut map = ScoreMap::default();
        for &(a, b, s) in entries {
            map.insert(a, b, s);
        }
        map
    }

    #[test]
    fn no_snapshots_no_targets() {
        assert!(discover_targets(&[], 8).is_empty());
    }

    #[test]
    fn sentinel_fills_to_logical_count() {
        let targets = discover_targets(&[snap(1001, 7, 3)], 8);
        assert_eq!(targets.len(), 2);
        let sentinel = targets.last().unwrap();
        assert_eq!(sentinel.pgid, SENTINEL_PGID);
        assert_eq!(sentinel.workers, 5);
        let total: i32 = targets.iter().map(|t| t.workers).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn exact_fit_needs_no_sentinel() {
        let targets = discover_targets(&[snap(1001, 7, 4), snap(1002, 9, 4)], 4);
        // 8 workers mod 4 logical cpus = 0.
        assert!(targets.iter().all(|t| t.pgid != SENTINEL_PGID));
        let total: i32 = targets.iter().map(|t| t.workers).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn rounded_total_is_always_even() {
        for workers in 1..=9 {
            let targets = discover_targets(&[snap(1, 7, workers)], 4);
            let total: i32 = targets.iter().map(|t| t.workers).sum();
            assert_eq!(total % 2, 0, "workers={workers}");
            assert_eq!(total % 4, 0, "workers={workers}");
        }
    }

    #[test]
    fn self_pair_needs_two_workers() {
        let targets = discover_targets(&[snap(1, 7, 1), snap(2, 9, 1)], 2);
        let map = scores(&[(7, 7, 1.0), (9, 9, 1.0), (7, 9, 0.5)]);
        let pairs = enumerate_pairs(&targets, &map);
        assert!(
            pairs
                .iter()
                .all(|p| p.i != p.j || targets[p.i].workers >= 2)
        );
    }

    #[test]
    fn pairs_sorted_descending() {
        let targets = discover_targets(&[snap(1, 7, 2), snap(2, 9, 2)], 4);
        let map = scores(&[(7, 7, 0.3), (9, 9, 0.9), (7, 9, 0.6)]);
        let pairs = enumerate_pairs(&targets, &map);
        let got: Vec<f64> = pairs.iter().map(|p| p.score).collect();
        let mut sorted = got.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(got, sorted);
    }

    #[test]
    fn missing_score_excludes_pair_only() {
        let targets = discover_targets(&[snap(1, 7, 2), snap(2, 9, 2)], 4);
        // No entry for (7, 9): the mixed pair disappears, self-pairs stay.
        let map = scores(&[(7, 7, 0.3), (9, 9, 0.9)]);
        let pairs = enumerate_pairs(&targets, &map);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.i == p.j));
    }

    /// Scenario: two compatible jobs pair with each other rather than with
    /// themselves.
    #[test]
    fn compatible_jobs_pair_up() {
        let targets = discover_targets(&[snap(1, 3, 2), snap(2, 9, 2)], 4);
        let map = scores(&[(3, 3, 0.4), (9, 9, 0.5), (3, 9, 1.2)]);
        let pairs = enumerate_pairs(&targets, &map);
        let selected = greedy_select(&targets, &pairs);
        assert_eq!(selected.len(), 2);
        for p in &selected {
            assert_ne!(p.a.job_id, p.b.job_id);
            assert_eq!((p.a.job_id, p.b.job_id), (3, 9));
        }
    }

    /// Scenario: one lone group self-pairs onto everything.
    #[test]
    fn single_group_self_pairs() {
        let targets = discover_targets(&[snap(1001, 7, 4)], 4);
        let map = scores(&[(7, 7, 0.8)]);
        let pairs = enumerate_pairs(&targets, &map);
        let selected = greedy_select(&targets, &pairs);
        assert_eq!(selected.len(), 2);
        for p in &selected {
            assert_eq!(p.a.pgid, 1001);
            assert_eq!(p.b.pgid, 1001);
        }
    }

    #[test]
    fn budgets_cap_pair_instances() {
        // Job 7 has 2 workers; job 9 has 6. Only two (7,9) pairs fit, the
        // remaining job-9 workers must self-pair.
        let targets = discover_targets(&[snap(1, 7, 2), snap(2, 9, 6)], 8);
        let map = scores(&[(7, 7, 0.1), (9, 9, 0.5), (7, 9, 2.0)]);
        let pairs = enumerate_pairs(&targets, &map);
        let selected = greedy_select(&targets, &pairs);
        assert_eq!(selected.len(), 4);
        let mixed = selected
            .iter()
            .filter(|p| p.a.job_id != p.b.job_id)
            .count();
        assert_eq!(mixed, 2);
    }

    #[test]
    fn same_job_two_pgids_does_not_overdraw() {
        let targets = discover_targets(&[snap(1, 7, 2), snap(2, 7, 2)], 4);
        let map = scores(&[(7, 7, 1.0)]);
        let pairs = enumerate_pairs(&targets, &map);
        let selected = greedy_select(&targets, &pairs);
        assert_eq!(selected.len(), 2);
        // Four workers total; each appears exactly once.
        let mut per_pgid: HashMap<i32, i32> = HashMap::new();
        for p in &selected {
            *per_pgid.entry(p.a.pgid).or_insert(0) += 1;
            *per_pgid.entry(p.b.pgid).or_insert(0) += 1;
        }
        assert!(per_pgid.values().all(|&c| c == 2));
    }

    #[test]
    fn two_opt_improves_bad_matching() {
        // Pairs (A,B) and (C,D) score 0.1 each, but (A,C) and (B,D) score
        // 1.0 each: 2-opt must re-pair them.
        let a = Member { pgid: 1, job_id: 1 };
        let b = Member { pgid: 2, job_id: 2 };
        let c = Member { pgid: 3, job_id: 3 };
        let d = Member { pgid: 4, job_id: 4 };
        let map = scores(&[
            (1, 2, 0.1),
            (3, 4, 0.1),
            (1, 3, 1.0),
            (2, 4, 1.0),
            (1, 4, 0.2),
            (2, 3, 0.2),
        ]);
        let selected = vec![
            SelectedPair { a, b, score: 0.1 },
            SelectedPair {
                a: c,
                b: d,
                score: 0.1,
            },
        ];
        let improved = two_opt(selected, &map);
        let total: f64 = improved.iter().map(|p| p.score).sum();
        assert!((total - 2.0).abs() < 1e-12);
    }

    #[test]
    fn two_opt_keeps_good_matching() {
        let a = Member { pgid: 1, job_id: 1 };
        let b = Member { pgid: 2, job_id: 2 };
        let c = Member { pgid: 3, job_id: 3 };
        let d = Member { pgid: 4, job_id: 4 };
        let map = scores(&[
            (1, 2, 1.0),
            (3, 4, 1.0),
            (1, 3, 0.1),
            (2, 4, 0.1),
            (1, 4, 0.1),
            (2, 3, 0.1),
        ]);
        let selected = vec![
            SelectedPair { a, b, score: 1.0 },
            SelectedPair {
                a: c,
                b: d,
                score: 1.0,
            },
        ];
        let kept = two_opt(selected.clone(), &map);
        assert_eq!(kept, selected);
    }
}
