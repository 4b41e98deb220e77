//! Shared-resource catalog and per-type contention activation.
//!
//! The catalog is the fixed, ordered list of micro-architectural resources a
//! workload can contend on. It is produced offline by the diagnostic pipeline
//! and consumed here; a built-in default covers the usual SMT suspects so the
//! daemon can run without a catalog document. Order is fixed at load time:
//! profile vectors, model coefficients, and feature vectors all index into it.

use serde::{Deserialize, Serialize};

/// How a shared resource degrades under concurrent use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Queue-like resources (issue queues, uop cache): contention appears
    /// only once combined demand exceeds capacity.
    Sequential,
    /// Capacity-shared resources (caches, TLBs): collisions are
    /// probabilistic in both occupancies.
    Parallel,
    /// Execution ports: behave like sequential resources for activation.
    Port,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Port => write!(f, "port"),
        }
    }
}

/// One entry of the resource catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Stable identifier (e.g. `"l1d"`, `"iq_int"`).
    pub name: String,
    /// Activation class.
    pub kind: ResourceKind,
}

/// Ordered, immutable resource catalog.
///
/// Indices into the catalog are stable for the process lifetime and are the
/// only way the rest of the system refers to a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCatalog {
    resources: Vec<Resource>,
}

impl ResourceCatalog {
    /// Build a catalog from an explicit resource list.
    pub fn new(resources: Vec<Resource>) -> Self {
        Self { resources }
    }

    /// The built-in default catalog.
    ///
    /// Covers the resources the diagnostic binaries probe on current x86 SMT
    /// parts: issue queues and the uop cache (sequential), core-private and
    /// shared caches plus TLBs (parallel), and the main execution port
    /// groups (port).
    pub fn default_catalog() -> Self {
        let entry = |name: &str, kind: ResourceKind| Resource {
            name: name.to_string(),
            kind,
        };
        Self::new(vec![
            entry("iq_int", ResourceKind::Sequential),
            entry("iq_fp", ResourceKind::Sequential),
            entry("lq", ResourceKind::Sequential),
            entry("uop_cache", ResourceKind::Sequential),
            entry("l1d", ResourceKind::Parallel),
            entry("l1i", ResourceKind::Parallel),
            entry("l2", ResourceKind::Parallel),
            entry("dtlb", ResourceKind::Parallel),
            entry("itlb", ResourceKind::Parallel),
            entry("p06", ResourceKind::Port),
            entry("p23", ResourceKind::Port),
            entry("p4", ResourceKind::Port),
        ])
    }

    /// Number of resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True if the catalog has no resources.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resource at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Resource> {
        self.resources.get(idx)
    }

    /// Index of the resource named `name`, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.resources.iter().position(|r| r.name == name)
    }

    /// Iterate resources in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }
}

/// Effective contention weight for a resource given two usages.
///
/// Sequential-type resources only contend above combined capacity; parallel
/// types model probabilistic collisions weighted by the average occupancy.
/// Ports activate like sequential resources.
pub fn activation(kind: ResourceKind, usage_a: f64, usage_b: f64) -> f64 {
    match kind {
        ResourceKind::Sequential | ResourceKind::Port => (usage_a + usage_b - 1.0).max(0.0),
        ResourceKind::Parallel => usage_a * usage_b * (usage_a + usage_b) / 2.0,
    }
}
