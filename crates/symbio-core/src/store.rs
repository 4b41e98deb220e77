//! Document database client.
//!
//! The offline profiling server stores per-workload measurements and the
//! trained slowdown model in a document database with two logical
//! collections: `measurement` (read at runtime) and `combination` (pairwise
//! runs, consumed only by the offline trainer). This module defines the
//! document shapes, the [`DocumentStore`] access trait, and [`DirStore`],
//! a directory-of-JSON-lines implementation used as the runtime backend.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Feature name of the solo (no-injector) baseline run.
pub const FEATURE_SINGLE: &str = "single";

/// Feature name of the dedicated L3 co-run probe used for `scale_factor`.
pub const FEATURE_L3_CORUN: &str = "l3_corun";

/// Which side of a co-run a measurement row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// IPC of the workload under test.
    Workload,
    /// IPC of the injector co-running with the workload. Pressure 0 rows
    /// carry the injector's solo baseline.
    Injector,
}

/// One row of the `measurement` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementDoc {
    /// Machine the measurement was taken on.
    pub node_name: String,
    /// Stable application identity of the measured workload.
    pub job_id: i32,
    /// Resource name from the catalog, or `"single"` / `"l3_corun"`.
    pub feature: String,
    /// Catalog index of `feature` at measurement time (-1 for baselines).
    pub feature_id: i32,
    /// Activation class label of `feature` (empty for baselines).
    pub feature_type: String,
    /// Injector pressure level. 0 on injector rows means solo baseline.
    pub pressure: u32,
    /// Which side of the co-run this row measures.
    pub run_type: RunType,
    /// Instructions per cycle observed for that side.
    #[serde(rename = "IPC")]
    pub ipc: f64,
    /// Seconds since the epoch when the row was recorded.
    pub timestamp: u64,
}

/// Trained linear slowdown model as stored by the offline trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDoc {
    /// Feature names in coefficient order; `feature_list[0]` is `"base"`.
    pub feature_list: Vec<String>,
    /// One coefficient per feature-list entry.
    pub coefficients: Vec<f64>,
    /// Model intercept.
    pub intercept: f64,
}

/// Errors surfaced by store access.
///
/// `NotFound` is permanent (the data genuinely is not there); `Unavailable`
/// and `Malformed` are transient-or-operational and worth retrying or
/// surfacing to the operator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no documents for job {0}")]
    NotFound(i32),
    #[error("store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Read access to the document database.
pub trait DocumentStore: Send {
    /// All `measurement` rows for one job. Empty results are `NotFound`.
    fn measurements_for(&self, job_id: i32) -> Result<Vec<MeasurementDoc>, StoreError>;

    /// The trained slowdown model document.
    fn model_document(&self) -> Result<ModelDoc, StoreError>;
}

/// Directory-backed store: `measurement.jsonl` (one document per line) and
/// `model.json` under one directory.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn measurement_path(&self) -> PathBuf {
        self.dir.join("measurement.jsonl")
    }

    fn model_path(&self) -> PathBuf {
        self.dir.join("model.json")
    }
}

impl DocumentStore for DirStore {
    fn measurements_for(&self, job_id: i32) -> Result<Vec<MeasurementDoc>, StoreError> {
        let file = File::open(self.measurement_path())?;
        let reader = BufReader::new(file);
        let mut docs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: MeasurementDoc = serde_json::from_str(&line)?;
            if doc.job_id == job_id {
                docs.push(doc);
            }
        }
        if docs.is_empty() {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(docs)
    }

    fn model_document(&self) -> Result<ModelDoc, StoreError> {
        let file = File::open(self.model_path())?;
        let doc: ModelDoc = serde_json::from_reader(BufReader::new(file))?;
        Ok(doc)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixture helpers shared by store, profile, and loader tests.

    use super::*;
    use std::io::Write;

    /// Write `docs` as measurement.jsonl and an optional model.json into `dir`.
    pub fn write_fixture(dir: &std::path::Path, docs: &[MeasurementDoc], model: Option<&ModelDoc>) {
        let mut f = File::create(dir.join("measurement.jsonl")).unwrap();
        for d in docs {
            writeln!(f, "{}", serde_json::to_string(d).unwrap()).unwrap();
        }
        if let Some(m) = model {
            let mf = File::create(dir.join("model.json")).unwrap();
            serde_json::to_writer(mf, m).unwrap();
        }
    }

    /// A measurement row with the uninteresting fields defaulted.
    pub fn doc(
        job_id: i32,
        feature: &str,
        pressure: u32,
        run_type: RunType,
        ipc: f64,
    ) -> MeasurementDoc {
        MeasurementDoc {
            node_name: "testnode".to_string(),
            job_id,
            feature: feature.to_string(),
            feature_id: -1,
            feature_type: String::new(),
            pressure,
            run_type,
            ipc,
            timestamp: 1_700_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn dir_store_filters_by_job() {
        let tmp = tempfile::tempdir().unwrap();
        write_fixture(
            tmp.path(),
            &[
                doc(7, FEATURE_SINGLE, 0, RunType::Workload, 1.8),
                doc(9, FEATURE_SINGLE, 0, RunType::Workload, 1.1),
                doc(7, "l1d", 1, RunType::Workload, 1.5),
            ],
            None,
        );
        let store = DirStore::new(tmp.path());
        let docs = store.measurements_for(7).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.job_id == 7));
    }

    #[test]
    fn missing_job_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        write_fixture(
            tmp.path(),
            &[doc(7, FEATURE_SINGLE, 0, RunType::Workload, 1.8)],
            None,
        );
        let store = DirStore::new(tmp.path());
        assert!(matches!(
            store.measurements_for(404),
            Err(StoreError::NotFound(404))
        ));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path());
        assert!(matches!(
            store.measurements_for(1),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn model_document_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let model = ModelDoc {
            feature_list: vec!["base".to_string(), "l1d".to_string()],
            coefficients: vec![0.1, 0.4],
            intercept: 0.02,
        };
        write_fixture(tmp.path(), &[], Some(&model));
        let store = DirStore::new(tmp.path());
        let loaded = store.model_document().unwrap();
        assert_eq!(loaded.feature_list, model.feature_list);
        assert_eq!(loaded.coefficients, model.coefficients);
        assert_eq!(loaded.intercept, model.intercept);
    }

    #[test]
    fn garbage_line_is_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("measurement.jsonl"), "not json\n").unwrap();
        let store = DirStore::new(tmp.path());
        assert!(matches!(
            store.measurements_for(1),
            Err(StoreError::Malformed(_))
        ));
    }
}
