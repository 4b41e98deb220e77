//! CPU topology discovery.
//!
//! The pair scheduler needs the logical CPU count and the mapping from each
//! physical core to its ordered pair of sibling hardware threads. Discovery
//! reads sysfs; tests and non-Linux builds use synthetic topologies.
//! Machines without SMT are refused — sibling pairing is the whole point.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("cannot read cpu topology: {0}")]
    Sysfs(#[from] std::io::Error),
    #[error("unparsable sibling list \"{0}\"")]
    Parse(String),
    #[error("cpu {cpu} has {siblings} siblings; exactly 2-way SMT is required")]
    NotSmt { cpu: usize, siblings: usize },
}

/// Physical core with its two sibling logical threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Core {
    pub id: usize,
    pub threads: (usize, usize),
}

/// Immutable machine topology.
#[derive(Debug, Clone)]
pub struct Topology {
    cores: Vec<Core>,
}

impl Topology {
    /// Discover the topology from sysfs.
    pub fn discover() -> Result<Self, TopologyError> {
        Self::from_sysfs(Path::new("/sys/devices/system/cpu"))
    }

    /// Synthetic 2-way SMT topology with `n_cores` physical cores, sibling
    /// threads numbered `(2i, 2i + 1)`.
    pub fn synthetic(n_cores: usize) -> Self {
        let cores = (0..n_cores)
            .map(|i| Core {
                id: i,
                threads: (2 * i, 2 * i + 1),
            })
            .collect();
        Self { cores }
    }

    fn from_sysfs(root: &Path) -> Result<Self, TopologyError> {
        let mut by_first: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut cpu = 0usize;
        loop {
            let list = root
                .join(format!("cpu{cpu}/topology/thread_siblings_list"))
                .into_os_string();
            let Ok(text) = fs::read_to_string(&list) else {
                break;
            };
            let siblings = parse_cpu_list(text.trim())
                .ok_or_else(|| TopologyError::Parse(text.trim().to_string()))?;
            let first = *siblings.first().ok_or_else(|| TopologyError::Parse(text))?;
            by_first.entry(first).or_insert(siblings);
            cpu += 1;
        }
        if by_first.is_empty() {
            return Err(TopologyError::Sysfs(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no cpus found under sysfs",
            )));
        }

        let mut cores = Vec::with_capacity(by_first.len());
        for (id, (first, siblings)) in by_first.into_iter().enumerate() {
            if siblings.len() != 2 {
                return Err(TopologyError::NotSmt {
                    cpu: first,
                    siblings: siblings.len(),
                });
            }
            cores.push(Core {
                id,
                threads: (siblings[0], siblings[1]),
            });
        }
        Ok(Self { cores })
    }

    /// Number of logical CPUs.
    pub fn logical_count(&self) -> usize {
        self.cores.len() * 2
    }

    /// Number of physical cores.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Physical cores with their sibling threads.
    pub fn cores(&self) -> &[Core] {
        &self.cores
    }
}

/// Parse a sysfs cpu list like `"0,4"`, `"0-1"`, or `"2"`.
fn parse_cpu_list(text: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().ok()?;
                let hi: usize = hi.parse().ok()?;
                if hi < lo {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    if cpus.is_empty() { None } else { Some(cpus) }
}
