// SPDX-License-Identifier: Apache-2.0
//! Flattens a list of controls' declared dimensions into search axes plus
//! fixed parameters, and packs/unpacks sample vectors against them.

use std::collections::BTreeMap;

use threedb_proto::ParamValue;

/// One control's declared dimensions, as supplied by the config loader.
#[derive(Debug, Clone)]
pub struct ControlDecl {
    /// Qualified control type name (becomes part of `control_order`).
    pub name: String,
    /// Continuous dimensions: name → either a `(lo, hi)` range or a fixed scalar.
    pub continuous_dims: BTreeMap<String, ContinuousDim>,
    /// Discrete dimensions: name → candidate values (length 1 means fixed).
    pub discrete_dims: BTreeMap<String, Vec<ParamValue>>,
}

/// A declared continuous dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContinuousDim {
    /// Searched over `[lo, hi]`.
    Range {
        /// Lower bound, inclusive.
        lo: f64,
        /// Upper bound, inclusive.
        hi: f64,
    },
    /// Not searched; always resolves to this value.
    Fixed(f64),
}

/// Errors raised while building or unpacking a [`SearchSpace`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SearchSpaceError {
    /// A continuous range had `lo >= hi`.
    #[error("continuous dim {control}.{param} has an empty range [{lo}, {hi})")]
    InvalidRange {
        /// Owning control name.
        control: String,
        /// Dimension name.
        param: String,
        /// Declared lower bound.
        lo: f64,
        /// Declared upper bound.
        hi: f64,
    },
    /// A discrete dimension declared zero candidate values.
    #[error("discrete dim {control}.{param} has no candidate values")]
    EmptyDiscreteDim {
        /// Owning control name.
        control: String,
        /// Dimension name.
        param: String,
    },
    /// `unpack` was called with a vector of the wrong length.
    #[error("expected {expected} {axis} values, got {got}")]
    DimensionMismatch {
        /// Which axis kind mismatched.
        axis: &'static str,
        /// Expected vector length.
        expected: usize,
        /// Supplied vector length.
        got: usize,
    },
    /// A discrete index fell outside its axis's cardinality.
    #[error("discrete index {index} is out of bounds for axis of size {size}")]
    DiscreteIndexOutOfBounds {
        /// Supplied index.
        index: usize,
        /// Axis cardinality.
        size: usize,
    },
}

#[derive(Debug, Clone)]
struct ContinuousAxis {
    control: String,
    param: String,
    lo: f64,
    hi: f64,
}

#[derive(Debug, Clone)]
struct DiscreteAxis {
    control: String,
    param: String,
    values: Vec<ParamValue>,
}

/// Flattened description of a set of controls' dimensions.
///
/// Continuous and discrete dimensions with more than one possible value
/// become search axes; everything else is recorded as a fixed parameter
/// merged into every unpacked sample.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    continuous_axes: Vec<ContinuousAxis>,
    discrete_axes: Vec<DiscreteAxis>,
    fixed: Vec<(String, String, ParamValue)>,
    control_order: Vec<String>,
}

impl SearchSpace {
    /// Builds a search space from the given controls' declared dimensions.
    pub fn new(controls: Vec<ControlDecl>) -> Result<Self, SearchSpaceError> {
        let mut continuous_axes = Vec::new();
        let mut discrete_axes = Vec::new();
        let mut fixed = Vec::new();
        let mut control_order = Vec::with_capacity(controls.len());

        for control in controls {
            control_order.push(control.name.clone());

            for (param, dim) in control.continuous_dims {
                match dim {
                    ContinuousDim::Range { lo, hi } => {
                        if lo >= hi {
                            return Err(SearchSpaceError::InvalidRange {
                                control: control.name.clone(),
                                param,
                                lo,
                                hi,
                            });
                        }
                        continuous_axes.push(ContinuousAxis {
                            control: control.name.clone(),
                            param,
                            lo,
                            hi,
                        });
                    }
                    ContinuousDim::Fixed(value) => {
                        fixed.push((control.name.clone(), param, ParamValue::Float(value)));
                    }
                }
            }

            for (param, values) in control.discrete_dims {
                if values.is_empty() {
                    return Err(SearchSpaceError::EmptyDiscreteDim {
                        control: control.name.clone(),
                        param,
                    });
                }
                if values.len() == 1 {
                    fixed.push((
                        control.name.clone(),
                        param,
                        values.into_iter().next().unwrap_or(ParamValue::Bool(false)),
                    ));
                } else {
                    discrete_axes.push(DiscreteAxis {
                        control: control.name.clone(),
                        param,
                        values,
                    });
                }
            }
        }

        Ok(Self {
            continuous_axes,
            discrete_axes,
            fixed,
            control_order,
        })
    }

    /// `(continuous_dim_count, [discrete_axis_cardinality, ...])`, the
    /// contract a [`crate::Policy`] samples against.
    #[must_use]
    pub fn generate_description(&self) -> (usize, Vec<usize>) {
        (
            self.continuous_axes.len(),
            self.discrete_axes.iter().map(|a| a.values.len()).collect(),
        )
    }

    /// Ordered list of qualified control type names to re-instantiate.
    #[must_use]
    pub fn control_order(&self) -> &[String] {
        &self.control_order
    }

    /// Maps a packed sample to a `(control, param) -> value` argument map
    /// plus the ordered control type list.
    pub fn unpack(
        &self,
        packed_continuous: &[f64],
        packed_discrete: &[usize],
    ) -> Result<(BTreeMap<(String, String), ParamValue>, Vec<String>), SearchSpaceError> {
        if packed_continuous.len() != self.continuous_axes.len() {
            return Err(SearchSpaceError::DimensionMismatch {
                axis: "continuous",
                expected: self.continuous_axes.len(),
                got: packed_continuous.len(),
            });
        }
        if packed_discrete.len() != self.discrete_axes.len() {
            return Err(SearchSpaceError::DimensionMismatch {
                axis: "discrete",
                expected: self.discrete_axes.len(),
                got: packed_discrete.len(),
            });
        }

        let mut result = BTreeMap::new();

        for (axis, &c) in self.continuous_axes.iter().zip(packed_continuous) {
            let value = axis.lo + c * (axis.hi - axis.lo);
            result.insert(
                (axis.control.clone(), axis.param.clone()),
                ParamValue::Float(value),
            );
        }

        for (axis, &idx) in self.discrete_axes.iter().zip(packed_discrete) {
            let value = axis.values.get(idx).cloned().ok_or(
                SearchSpaceError::DiscreteIndexOutOfBounds {
                    index: idx,
                    size: axis.values.len(),
                },
            )?;
            result.insert((axis.control.clone(), axis.param.clone()), value);
        }

        for (control, param, value) in &self.fixed {
            result.insert((control.clone(), param.clone()), value.clone());
        }

        Ok((result, self.control_order.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_controls() -> Vec<ControlDecl> {
        let mut continuous = BTreeMap::new();
        continuous.insert(
            "distance".to_string(),
            ContinuousDim::Range { lo: 1.0, hi: 3.0 },
        );
        continuous.insert("fov".to_string(), ContinuousDim::Fixed(90.0));

        let mut discrete = BTreeMap::new();
        discrete.insert(
            "light".to_string(),
            vec![ParamValue::Str("sun".into()), ParamValue::Str("studio".into())],
        );
        discrete.insert("preset".to_string(), vec![ParamValue::Int(7)]);

        vec![ControlDecl {
            name: "Camera".to_string(),
            continuous_dims: continuous,
            discrete_dims: discrete,
        }]
    }

    #[test]
    fn description_counts_only_real_axes() {
        let space = SearchSpace::new(sample_controls()).expect("valid space");
        let (continuous_count, discrete_cards) = space.generate_description();
        assert_eq!(continuous_count, 1);
        assert_eq!(discrete_cards, vec![2]);
    }

    #[test]
    fn unpack_scales_continuous_and_resolves_discrete_and_fixed() {
        let space = SearchSpace::new(sample_controls()).expect("valid space");
        let (map, order) = space.unpack(&[0.5], &[1]).expect("unpack");

        assert_eq!(order, vec!["Camera".to_string()]);
        assert_eq!(
            map.get(&("Camera".to_string(), "distance".to_string())),
            Some(&ParamValue::Float(2.0))
        );
        assert_eq!(
            map.get(&("Camera".to_string(), "light".to_string())),
            Some(&ParamValue::Str("studio".into()))
        );
        assert_eq!(
            map.get(&("Camera".to_string(), "fov".to_string())),
            Some(&ParamValue::Float(90.0))
        );
        assert_eq!(
            map.get(&("Camera".to_string(), "preset".to_string())),
            Some(&ParamValue::Int(7))
        );
    }

    #[test]
    fn invalid_range_is_rejected_rather_than_silently_degenerate() {
        let mut continuous = BTreeMap::new();
        continuous.insert(
            "distance".to_string(),
            ContinuousDim::Range { lo: 3.0, hi: 1.0 },
        );
        let controls = vec![ControlDecl {
            name: "Camera".to_string(),
            continuous_dims: continuous,
            discrete_dims: BTreeMap::new(),
        }];
        assert!(matches!(
            SearchSpace::new(controls),
            Err(SearchSpaceError::InvalidRange { .. })
        ));
    }

    #[test]
    fn unpack_rejects_mismatched_vector_lengths() {
        let space = SearchSpace::new(sample_controls()).expect("valid space");
        assert!(matches!(
            space.unpack(&[], &[1]),
            Err(SearchSpaceError::DimensionMismatch { axis: "continuous", .. })
        ));
        assert!(matches!(
            space.unpack(&[0.5], &[]),
            Err(SearchSpaceError::DimensionMismatch { axis: "discrete", .. })
        ));
    }

    #[test]
    fn unpack_rejects_out_of_bounds_discrete_index() {
        let space = SearchSpace::new(sample_controls()).expect("valid space");
        assert!(matches!(
            space.unpack(&[0.5], &[5]),
            Err(SearchSpaceError::DiscreteIndexOutOfBounds { .. })
        ));
    }
}
