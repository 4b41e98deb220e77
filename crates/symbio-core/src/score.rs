//! Pairwise compatibility scoring.
//!
//! For two jobs A and B sharing a physical core, the model predicts A's
//! slowdown from A's sensitivities, B's intensities, and the activation of
//! their combined usage on each resource. `compat_A(B)` rescales the
//! predicted surviving throughput by A's CMP scale factor; the symmetric
//! score is the sum of both directions. Scores live in a map keyed by
//! unordered job pairs, so symmetry holds by construction.

use std::collections::HashMap;

use log::{debug, warn};

use crate::catalog::{ResourceCatalog, activation};
use crate::model::SlowdownModel;
use crate::profile::WorkloadProfile;

/// Job id of the sentinel "empty sibling thread" workload.
pub const SENTINEL_JOB: i32 = -1;

/// Symmetric sparse score map keyed by unordered job pairs.
#[derive(Debug, Default, Clone)]
pub struct ScoreMap {
    scores: HashMap<(i32, i32), f64>,
}

impl ScoreMap {
    fn key(a: i32, b: i32) -> (i32, i32) {
        (a.min(b), a.max(b))
    }

    pub fn insert(&mut self, a: i32, b: i32, score: f64) {
        self.scores.insert(Self::key(a, b), score);
    }

    /// Score for an unordered pair. Pairs involving the sentinel job score
    /// zero: an empty sibling neither helps nor harms, and the empirical
    /// step arbitrates.
    pub fn get(&self, a: i32, b: i32) -> Option<f64> {
        if a == SENTINEL_JOB || b == SENTINEL_JOB {
            return Some(0.0);
        }
        self.scores.get(&Self::key(a, b)).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(i32, i32), &f64)> {
        self.scores.iter()
    }
}

/// Converts workload profiles into pairwise compatibility scores.
pub struct ScoreEngine {
    catalog: ResourceCatalog,
    model: SlowdownModel,
    profiles: HashMap<i32, WorkloadProfile>,
    scores: ScoreMap,
}

impl ScoreEngine {
    pub fn new(catalog: ResourceCatalog, model: SlowdownModel) -> Self {
        Self {
            catalog,
            model,
            profiles: HashMap::new(),
            scores: ScoreMap::default(),
        }
    }

    /// Admit a workload: store its profile and score it against every known
    /// job, itself included.
    pub fn add_workload(&mut self, profile: WorkloadProfile) {
        let job_id = profile.job_id;
        if profile.single_ipc <= 0.0 {
            // Still scored and placed; only its STP contribution is zero.
            warn!("job {job_id} has no usable solo IPC baseline");
        }
        self.profiles.insert(job_id, profile);

        let others: Vec<i32> = self.profiles.keys().copied().collect();
        for other in others {
            let a = &self.profiles[&job_id];
            let b = &self.profiles[&other];
            let score = self.pair_score(a, b);
            self.scores.insert(job_id, other, score);
            debug!("score({job_id},{other}) = {score:.4}");
        }
    }

    /// Forget a workload. Its score entries stay in the map; stale entries
    /// are harmless because lookups are driven by live slot identities.
    pub fn remove_workload(&mut self, job_id: i32) {
        self.profiles.remove(&job_id);
    }

    pub fn profile(&self, job_id: i32) -> Option<&WorkloadProfile> {
        self.profiles.get(&job_id)
    }

    pub fn scores(&self) -> &ScoreMap {
        &self.scores
    }

    /// Map of job id to solo IPC, for throughput normalization.
    pub fn single_ipc_map(&self) -> HashMap<i32, f64> {
        self.profiles
            .iter()
            .filter(|(_, p)| p.single_ipc > 0.0)
            .map(|(&id, p)| (id, p.single_ipc))
            .collect()
    }

    /// `compat_A(B)`: A's surviving throughput fraction when co-located
    /// with B, clamped to [0, 1].
    fn compat(&self, a: &WorkloadProfile, b: &WorkloadProfile) -> f64 {
        let predicted = self.model.predict(a.min_base_slowdown(), |r| {
            let kind = self
                .catalog
                .get(r)
                .expect("model validated against this catalog")
                .kind;
            a.sensitivity[r] * b.intensity[r] * activation(kind, a.usage[r], b.usage[r])
        });
        (a.scale_factor * (1.0 - predicted)).clamp(0.0, 1.0)
    }

    fn pair_score(&self, a: &WorkloadProfile, b: &WorkloadProfile) -> f64 {
        self.compat(a, b) + self.compat(b, a)
    }

    /// Render the score map for diagnostics, best pairs first.
    pub fn scoreboard(&self) -> String {
        let mut rows: Vec<(&(i32, i32), &f64)> = self.scores.iter().collect();
        rows.sort_by(|x, y| y.1.total_cmp(x.1));
        let mut out = String::from("job_a  job_b  score\n");
        for (&(a, b), s) in rows {
            out.push_str(&format!("{a:>5}  {b:>5}  {s:.4}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_support::uniform_profile;
    use crate::store::ModelDoc;

    fn engine() -> ScoreEngine {
        let catalog = ResourceCatalog::default_catalog();
        let names: Vec<String> = std::iter::once("base".to_string())
            .chain(catalog.iter().map(|r| r.name.clone()))
            .collect();
        let doc = ModelDoc {
            coefficients: vec![0.3; names.len()],
            feature_list: names,
            intercept: 0.05,
        };
        let model = SlowdownModel::from_doc(&doc, &catalog).unwrap();
        ScoreEngine::new(catalog, model)
    }

    fn profile(job: i32, usage: f64) -> WorkloadProfile {
        let catalog = ResourceCatalog::default_catalog();
        uniform_profile(job, &catalog, 0.2, 0.3, usage, 1.5)
    }

    #[test]
    fn self_score_exists() {
        let mut e = engine();
        e.add_workload(profile(1, 0.4));
        assert!(e.scores().get(1, 1).is_some());
    }

    #[test]
    fn scores_are_symmetric() {
        let mut e = engine();
        for job in 1..=4 {
            e.add_workload(profile(job, 0.2 * job as f64));
        }
        for a in 1..=4 {
            for b in 1..=4 {
                assert_eq!(
                    e.scores().get(a, b),
                    e.scores().get(b, a),
                    "score({a},{b}) != score({b},{a})"
                );
            }
        }
    }

    #[test]
    fn lighter_partner_scores_higher() {
        let mut e = engine();
        e.add_workload(profile(1, 0.9));
        e.add_workload(profile(2, 0.9));
        e.add_workload(profile(3, 0.1));
        let heavy = e.scores().get(1, 2).unwrap();
        let light = e.scores().get(1, 3).unwrap();
        assert!(
            light > heavy,
            "pairing with a light partner should score higher ({light} <= {heavy})"
        );
    }

    #[test]
    fn sentinel_scores_zero() {
        let mut e = engine();
        e.add_workload(profile(1, 0.4));
        assert_eq!(e.scores().get(1, SENTINEL_JOB), Some(0.0));
        assert_eq!(e.scores().get(SENTINEL_JOB, SENTINEL_JOB), Some(0.0));
    }

    #[test]
    fn missing_pair_is_none() {
        let e = engine();
        assert_eq!(e.scores().get(5, 6), None);
    }

    #[test]
    fn compat_is_clamped() {
        let mut e = engine();
        // Saturated usage and intensity drive predicted slowdown above 1;
        // compat must clamp at zero rather than go negative.
        let catalog = ResourceCatalog::default_catalog();
        let mut p = uniform_profile(1, &catalog, 5.0, 5.0, 1.0, 1.0);
        p.scale_factor = 1.0;
        e.add_workload(p);
        let s = e.scores().get(1, 1).unwrap();
        assert!((0.0..=2.0).contains(&s));
    }

    #[test]
    fn zero_single_ipc_still_scored() {
        let mut e = engine();
        e.add_workload(profile(1, 0.4));
        let mut dead = profile(2, 0.4);
        dead.single_ipc = 0.0;
        e.add_workload(dead);
        assert!(e.scores().get(1, 2).is_some());
        assert!(!e.single_ipc_map().contains_key(&2));
        assert!(e.single_ipc_map().contains_key(&1));
    }

    #[test]
    fn scoreboard_lists_all_pairs() {
        let mut e = engine();
        e.add_workload(profile(1, 0.4));
        e.add_workload(profile(2, 0.5));
        let board = e.scoreboard();
        // Pairs (1,1), (1,2), (2,2).
        assert_eq!(board.lines().count(), 4);
    }
}
