/////////////////////////////////////////////////////////////////////////////////////////////
//
// Declares model configuration switches for weighting, knot placement, and refinement.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Declares model configuration switches for weighting, knot placement, and refinement.

use serde::{Deserialize, Serialize};

/// Knot placement policy for the initial knot vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnotPolicy {
    /// Interior knots spaced uniformly over [0, 1].
    UniformSpacing,

    /// Interior knots averaged from the input parameters
    /// (Piegl & Tiller eqs. 9.68/9.69). Structured input only.
    CurveParams,
}

impl Default for KnotPolicy {
    fn default() -> Self {
        KnotPolicy::UniformSpacing
    }
}

/// Bounds and clamps used by the per-curve weight solver.
///
/// Weights are searched inside `[min_weight, max_weight]`; eigenvector
/// entries with magnitude below `min_eigenvector_value` are clamped to zero
/// before entering the linear program, which reduces numerical noise in the
/// constraint columns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightSolverParams {
    pub min_weight: f64,
    pub max_weight: f64,
    pub min_eigenvector_value: f64,
}

impl Default for WeightSolverParams {
    fn default() -> Self {
        WeightSolverParams {
            min_weight: 1.0,
            max_weight: 1.0e4,
            min_eigenvector_value: 1.0e-12,
        }
    }
}

#[doc = include_str!("../docs/model_config.md")]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Apply rational weights to every output coordinate instead of only the
    /// range (last) coordinate.
    pub weigh_all_dims: bool,

    /// Enable the hierarchical T-mesh refinement structure and its decoder
    /// path. When disabled, adaptive refinement keeps a single tensor product
    /// and every knot stays at level 0.
    pub use_tmesh: bool,

    /// Disable the weight solver entirely; all weights stay at 1. Required by
    /// the fast n-mode-product decoding paths.
    pub no_weights: bool,

    /// Permit single (non-repeated) knots at the ends of each knot vector.
    /// Rationalization then falls back to a denominator of 1 where the
    /// unclamped basis does not sum to one.
    pub unclamped_knots: bool,

    /// Placement policy for the initial knot vectors.
    pub knot_policy: KnotPolicy,

    /// Bounds for the per-curve weight solver.
    pub weight_params: WeightSolverParams,

    /// Cap on the number of curves examined per dimension by the
    /// curve-sampled refinement analysis.
    pub max_num_curves: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::builder().build()
    }
}

impl ModelConfig {
    /// Returns a new [`ModelConfigBuilder`] with defaults matching the
    /// clamped, range-weighted, single-tensor configuration.
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder::new()
    }
}

/// A convenience builder for constructing a [`ModelConfig`] instance.
///
/// The builder should be called via the [`ModelConfig::builder`] method.
///
/// See [`ModelConfig`] for details on each field.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfigBuilder {
    weigh_all_dims: bool,
    use_tmesh: bool,
    no_weights: bool,
    unclamped_knots: bool,
    knot_policy: KnotPolicy,
    weight_params: WeightSolverParams,
    max_num_curves: usize,
}

impl ModelConfigBuilder {
    fn new() -> Self {
        Self {
            weigh_all_dims: false,
            use_tmesh: false,
            no_weights: false,
            unclamped_knots: false,
            knot_policy: KnotPolicy::default(),
            weight_params: WeightSolverParams::default(),
            max_num_curves: 10_000,
        }
    }

    /// Applies rational weights to all output coordinates.
    pub fn weigh_all_dims(mut self, weigh_all_dims: bool) -> Self {
        self.weigh_all_dims = weigh_all_dims;
        self
    }

    /// Enables the hierarchical T-mesh refinement structure.
    pub fn use_tmesh(mut self, use_tmesh: bool) -> Self {
        self.use_tmesh = use_tmesh;
        self
    }

    /// Disables the weight solver.
    pub fn no_weights(mut self, no_weights: bool) -> Self {
        self.no_weights = no_weights;
        self
    }

    /// Permits single knots at the ends of each knot vector.
    pub fn unclamped_knots(mut self, unclamped_knots: bool) -> Self {
        self.unclamped_knots = unclamped_knots;
        self
    }

    /// Sets the knot placement policy.
    pub fn knot_policy(mut self, knot_policy: KnotPolicy) -> Self {
        self.knot_policy = knot_policy;
        self
    }

    /// Sets the weight solver bounds.
    pub fn weight_params(mut self, weight_params: WeightSolverParams) -> Self {
        self.weight_params = weight_params;
        self
    }

    /// Sets the curve-sampling cap for refinement analysis.
    pub fn max_num_curves(mut self, max_num_curves: usize) -> Self {
        self.max_num_curves = max_num_curves;
        self
    }

    /// Builds and returns a [`ModelConfig`] instance.
    pub fn build(self) -> ModelConfig {
        ModelConfig {
            weigh_all_dims: self.weigh_all_dims,
            use_tmesh: self.use_tmesh,
            no_weights: self.no_weights,
            unclamped_knots: self.unclamped_knots,
            knot_policy: self.knot_policy,
            weight_params: self.weight_params,
            max_num_curves: self.max_num_curves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_single_tensor_configuration() {
        let config = ModelConfig::default();
        assert!(!config.weigh_all_dims);
        assert!(!config.use_tmesh);
        assert!(!config.no_weights);
        assert!(!config.unclamped_knots);
        assert_eq!(config.knot_policy, KnotPolicy::UniformSpacing);
        assert_eq!(config.weight_params.min_weight, 1.0);
        assert_eq!(config.weight_params.max_weight, 1.0e4);
    }

    #[test]
    fn builder_overrides_stick() {
        let config = ModelConfig::builder()
            .weigh_all_dims(true)
            .use_tmesh(true)
            .knot_policy(KnotPolicy::CurveParams)
            .build();
        assert!(config.weigh_all_dims);
        assert!(config.use_tmesh);
        assert_eq!(config.knot_policy, KnotPolicy::CurveParams);
    }
}
