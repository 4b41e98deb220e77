//! Workload characteristic vectors.
//!
//! A [`WorkloadProfile`] condenses a job's measurement rows into the
//! per-resource quantities the score model consumes: sensitivity, intensity,
//! usage, base slowdown, plus the solo-IPC baseline and the CMP scale
//! factor. Vector order follows the resource catalog.

use serde::{Deserialize, Serialize};

use crate::catalog::ResourceCatalog;
use crate::store::{FEATURE_L3_CORUN, FEATURE_SINGLE, MeasurementDoc, RunType, StoreError};

/// Per-job characteristic vector, catalog-ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadProfile {
    pub job_id: i32,
    /// IPC drop of the workload from low to high injector pressure, per
    /// resource. Unitless, >= 0.
    pub sensitivity: Vec<f64>,
    /// Degradation the workload inflicts on a low-pressure injector, per
    /// resource. Unitless, >= 0.
    pub intensity: Vec<f64>,
    /// Fraction of each resource's capacity the workload occupies, in [0, 1].
    pub usage: Vec<f64>,
    /// Slowdown under minimal contention, per resource.
    pub base_slowdown: Vec<f64>,
    /// Solo IPC baseline. 0 when the baseline run is unusable; such jobs are
    /// excluded from throughput normalization but still placed.
    pub single_ipc: f64,
    /// Co-run IPC under an L3-stress companion over `single_ipc`. Captures
    /// CMP-level contention the SMT pair model does not.
    pub scale_factor: f64,
}

impl WorkloadProfile {
    /// Derive a profile from one job's measurement rows.
    ///
    /// Required rows per catalog resource: workload runs at two or more
    /// pressure levels, an injector solo baseline (pressure 0), and injector
    /// co-run rows. A `"single"` workload row and an `"l3_corun"` row are
    /// required once per job. Any gap fails with [`StoreError::NotFound`];
    /// the caller excludes the job from pair selection.
    pub fn derive(
        job_id: i32,
        catalog: &ResourceCatalog,
        docs: &[MeasurementDoc],
    ) -> Result<Self, StoreError> {
        let single_ipc = solo_baseline(docs).ok_or(StoreError::NotFound(job_id))?;

        let scale_factor = docs
            .iter()
            .find(|d| d.run_type == RunType::Workload && d.feature == FEATURE_L3_CORUN)
            .map(|d| {
                if single_ipc > 0.0 {
                    (d.ipc / single_ipc).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            })
            .ok_or(StoreError::NotFound(job_id))?;

        let n = catalog.len();
        let mut sensitivity = Vec::with_capacity(n);
        let mut intensity = Vec::with_capacity(n);
        let mut usage = Vec::with_capacity(n);
        let mut base_slowdown = Vec::with_capacity(n);

        for resource in catalog.iter() {
            let series = ResourceSeries::collect(docs, &resource.name)
                .ok_or(StoreError::NotFound(job_id))?;
            sensitivity.push(series.sensitivity());
            intensity.push(series.intensity());
            usage.push(series.usage());
            base_slowdown.push(series.base_slowdown(single_ipc));
        }

        Ok(Self {
            job_id,
            sensitivity,
            intensity,
            usage,
            base_slowdown,
            single_ipc,
            scale_factor,
        })
    }

    /// Smallest per-resource base slowdown; the model's `base` feature.
    pub fn min_base_slowdown(&self) -> f64 {
        if self.base_slowdown.is_empty() {
            return 0.0;
        }
        self.base_slowdown
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }
}

/// Mean IPC of the solo workload runs, if present.
fn solo_baseline(docs: &[MeasurementDoc]) -> Option<f64> {
    let solo: Vec<f64> = docs
        .iter()
        .filter(|d| d.run_type == RunType::Workload && d.feature == FEATURE_SINGLE)
        .map(|d| d.ipc)
        .collect();
    if solo.is_empty() {
        return None;
    }
    Some(solo.iter().sum::<f64>() / solo.len() as f64)
}

/// Pressure-ordered workload and injector rows for one resource.
struct ResourceSeries {
    /// (pressure, workload IPC), ascending pressure, pressure > 0.
    workload: Vec<(u32, f64)>,
    /// (pressure, injector IPC) co-run rows, ascending pressure, pressure > 0.
    injector: Vec<(u32, f64)>,
    /// Injector solo IPC (the pressure-0 injector row).
    injector_solo: f64,
}

impl ResourceSeries {
    fn collect(docs: &[MeasurementDoc], feature: &str) -> Option<Self> {
        let mut workload = Vec::new();
        let mut injector = Vec::new();
        let mut injector_solo = None;
        for d in docs.iter().filter(|d| d.feature == feature) {
            match d.run_type {
                RunType::Workload => workload.push((d.pressure, d.ipc)),
                RunType::Injector if d.pressure == 0 => injector_solo = Some(d.ipc),
                RunType::Injector => injector.push((d.pressure, d.ipc)),
            }
        }
        workload.sort_by_key(|&(p, _)| p);
        injector.sort_by_key(|&(p, _)| p);
        if workload.len() < 2 || injector.is_empty() {
            return None;
        }
        let injector_solo = injector_solo?;
        Some(Self {
            workload,
            injector,
            injector_solo,
        })
    }

    /// Relative workload IPC drop from lowest to highest pressure.
    fn sensitivity(&self) -> f64 {
        let (_, low) = self.workload[0];
        let (_, high) = self.workload[self.workload.len() - 1];
        if low <= 0.0 {
            return 0.0;
        }
        ((low - high) / low).max(0.0)
    }

    /// Relative drop the workload inflicts on the lowest-pressure injector.
    fn intensity(&self) -> f64 {
        let (_, co) = self.injector[0];
        if self.injector_solo <= 0.0 {
            return 0.0;
        }
        ((self.injector_solo - co) / self.injector_solo).max(0.0)
    }

    /// Relative drop of the highest-pressure injector, clamped to [0, 1].
    /// A saturating injector consumes whatever capacity the workload left,
    /// so its loss approximates the workload's occupancy.
    fn usage(&self) -> f64 {
        let (_, co) = self.injector[self.injector.len() - 1];
        if self.injector_solo <= 0.0 {
            return 0.0;
        }
        ((self.injector_solo - co) / self.injector_solo).clamp(0.0, 1.0)
    }

    /// Workload slowdown at the lowest pressure level.
    fn base_slowdown(&self, single_ipc: f64) -> f64 {
        let (_, low) = self.workload[0];
        if single_ipc <= 0.0 {
            return 0.0;
        }
        (1.0 - low / single_ipc).max(0.0)
    }
}
