//! Trained slowdown model.
//!
//! The offline trainer fits a linear model over contention features and
//! stores it as a JSON document (`feature_list`, `coefficients`,
//! `intercept`). The first feature is always `base` (minimum base slowdown
//! across resources); the remaining features must be an ordered subset of
//! the resource catalog. Validation happens once at load, so prediction is
//! a plain dot product.

use crate::catalog::ResourceCatalog;
use crate::store::ModelDoc;

/// Name of the mandatory leading feature.
pub const BASE_FEATURE: &str = "base";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model has no features")]
    Empty,
    #[error("first model feature must be \"base\", got \"{0}\"")]
    MissingBase(String),
    #[error("model feature \"{0}\" is not in the resource catalog")]
    UnknownFeature(String),
    #[error("model features must follow catalog order: \"{0}\" is out of order")]
    FeatureOrder(String),
    #[error("feature list has {features} entries but {coefficients} coefficients")]
    CoefficientMismatch { features: usize, coefficients: usize },
}

/// Validated linear slowdown model.
#[derive(Debug, Clone)]
pub struct SlowdownModel {
    intercept: f64,
    /// Coefficient for the `base` feature.
    base_coef: f64,
    /// (catalog index, coefficient) per resource feature, in catalog order.
    resource_coefs: Vec<(usize, f64)>,
}

impl SlowdownModel {
    /// Validate a model document against the catalog.
    pub fn from_doc(doc: &ModelDoc, catalog: &ResourceCatalog) -> Result<Self, ModelError> {
        if doc.feature_list.is_empty() {
            return Err(ModelError::Empty);
        }
        if doc.feature_list.len() != doc.coefficients.len() {
            return Err(ModelError::CoefficientMismatch {
                features: doc.feature_list.len(),
                coefficients: doc.coefficients.len(),
            });
        }
        if doc.feature_list[0] != BASE_FEATURE {
            return Err(ModelError::MissingBase(doc.feature_list[0].clone()));
        }

        let mut resource_coefs = Vec::with_capacity(doc.feature_list.len() - 1);
        let mut last_idx: Option<usize> = None;
        for (name, &coef) in doc.feature_list[1..]
            .iter()
            .zip(doc.coefficients[1..].iter())
        {
            let idx = catalog
                .index_of(name)
                .ok_or_else(|| ModelError::UnknownFeature(name.clone()))?;
            if last_idx.is_some_and(|prev| idx <= prev) {
                return Err(ModelError::FeatureOrder(name.clone()));
            }
            last_idx = Some(idx);
            resource_coefs.push((idx, coef));
        }

        Ok(Self {
            intercept: doc.intercept,
            base_coef: doc.coefficients[0],
            resource_coefs,
        })
    }

    /// Predicted slowdown for a feature vector.
    ///
    /// `base` is the caller's min-base-slowdown term; `resource_features`
    /// yields the contention feature for a catalog index (features for
    /// resources the model does not use are never requested).
    pub fn predict(&self, base: f64, mut resource_features: impl FnMut(usize) -> f64) -> f64 {
        let mut s = self.intercept + self.base_coef * base;
        for &(idx, coef) in &self.resource_coefs {
            s += coef * resource_features(idx);
        }
        s
    }

    /// Catalog indices the model actually uses.
    pub fn used_resources(&self) -> impl Iterator<Item = usize> + '_ {
        self.resource_coefs.iter().map(|&(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ResourceCatalog {
        ResourceCatalog::default_catalog()
    }

    fn doc(features: &[&str], coefs: &[f64], intercept: f64) -> ModelDoc {
        ModelDoc {
            feature_list: features.iter().map(|s| s.to_string()).collect(),
            coefficients: coefs.to_vec(),
            intercept,
        }
    }

    #[test]
    fn loads_ordered_subset() {
        let m = SlowdownModel::from_doc(
            &doc(&["base", "iq_int", "l1d", "p06"], &[0.5, 0.1, 0.2, 0.3], 0.01),
            &catalog(),
        )
        .unwrap();
        assert_eq!(m.used_resources().count(), 3);
    }

    #[test]
    fn rejects_missing_base() {
        let err = SlowdownModel::from_doc(&doc(&["l1d"], &[0.1], 0.0), &catalog()).unwrap_err();
        assert!(matches!(err, ModelError::MissingBase(_)));
    }

    #[test]
    fn rejects_unknown_feature() {
        let err = SlowdownModel::from_doc(&doc(&["base", "l9"], &[0.1, 0.2], 0.0), &catalog())
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownFeature(_)));
    }

    #[test]
    fn rejects_out_of_order_features() {
        // l1d comes after iq_int in the catalog, so this order is invalid.
        let err = SlowdownModel::from_doc(
            &doc(&["base", "l1d", "iq_int"], &[0.1, 0.2, 0.3], 0.0),
            &catalog(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::FeatureOrder(_)));
    }

    #[test]
    fn rejects_coefficient_mismatch() {
        let err =
            SlowdownModel::from_doc(&doc(&["base", "l1d"], &[0.1], 0.0), &catalog()).unwrap_err();
        assert!(matches!(err, ModelError::CoefficientMismatch { .. }));
    }

    #[test]
    fn predict_is_linear() {
        let cat = catalog();
        let l1d = cat.index_of("l1d").unwrap();
        let m = SlowdownModel::from_doc(&doc(&["base", "l1d"], &[2.0, 3.0], 0.5), &cat).unwrap();
        let s = m.predict(0.1, |idx| {
            assert_eq!(idx, l1d);
            0.25
        });
        assert!((s - (0.5 + 2.0 * 0.1 + 3.0 * 0.25)).abs() < 1e-12);
    }
}
