/////////////////////////////////////////////////////////////////////////////////////////////
//
// Exposes the public API and high-level documentation for multivariate functional approximation.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Multivariate Functional Approximation (MFA) with rational B-splines.
//!
//! Given a grid of scalar or vector samples over a d-dimensional parameter
//! cube, this crate fits a compact analytic surrogate - control points,
//! weights, and knot vectors of a rational tensor-product B-spline (NURBS)
//! hypervolume - from which the field and its derivatives can be evaluated
//! anywhere in parameter space.
//!
//! Three tightly coupled numerical subsystems form the core:
//!
//! - **Basis evaluation** - B-spline basis values and derivatives, span
//!   location, and the rational (weighted) reduction.
//! - **Encoding** - a separable least-squares solve across dimensions that
//!   yields control points, optionally with per-curve rational weights
//!   estimated through an eigenproblem with a linear-programming fallback.
//! - **Decoding** - tensor-product evaluation at arbitrary parameters,
//!   including fast n-mode-product variants for point values and gradients.
//!
//! Adaptive refinement orchestrates the three: encode, estimate per-span
//! error, insert knots (Boehm's algorithm generalized to n dimensions), and
//! re-encode until the fitted error drops below a caller-supplied bound.
//! Refinement can optionally maintain a hierarchical T-mesh of tensor-product
//! patches with per-knot refinement levels.
//!
//! Dense linear algebra is built on
//! [`faer`](https://docs.rs/faer/latest/faer/), and the independent curve
//! solves of each encoding dimension run data-parallel under the default
//! `parallel` feature (disable it for a single-threaded build).
//!
//! # Example
//!
//! ```
//! use faer::Mat;
//! use tessera_mfa::{Mfa, MfaData, ModelConfig};
//!
//! // 11 samples of y = sin(pi x) on [0, 1]
//! let n = 11;
//! let domain = Mat::from_fn(n, 2, |i, j| {
//!     let x = i as f64 / (n - 1) as f64;
//!     if j == 0 { x } else { (std::f64::consts::PI * x).sin() }
//! });
//!
//! let mfa = Mfa::new(1, vec![n], domain).unwrap();
//!
//! // cubic model with as many control points as samples: an interpolant
//! let mut model = MfaData::new(vec![3], Some(vec![n]), 0, 1, ModelConfig::default()).unwrap();
//! mfa.fixed_encode(&mut model, false).unwrap();
//!
//! // evaluate anywhere in parameter space
//! let pt = mfa.decode_point(&model, &[0.5]).unwrap();
//! assert!((pt[1] - 1.0).abs() < 1e-8);
//! ```
//!
//! # References
//! 1. Piegl, L., Tiller, W. The NURBS Book, 2nd ed. Springer, 1997.
//! 2. Ma, W., Kruth, J.-P. NURBS curve and surface fitting for reverse
//!    engineering. Int. J. Adv. Manuf. Technol. 14, 1998.
//! 3. Kolda, T., Bader, B. Tensor decompositions and applications. SIAM
//!    Review 51(3), 2009.

pub mod config;

pub mod progress;

mod error;

mod pointset;

mod vol_iterator;

mod tmesh;

mod model;

mod insertion;

mod simplex;

mod encode;

mod decode;

mod refine;

mod mfa;

mod test_functions;

pub use {
    config::{KnotPolicy, ModelConfig, ModelConfigBuilder, WeightSolverParams},
    decode::{DecodeInfo, Decoder, FastDecodeInfo},
    encode::Encoder,
    error::{MfaError, MfaResult},
    mfa::{Mfa, MfaBuilder},
    model::{BasisFunInfo, MfaData},
    pointset::{Params, PointSet},
    refine::{NewKnots, RefineOutcome},
    simplex::{BoundedSimplex, WeightLp},
    test_functions::{generate_random_params, MfaTestFunctions},
    tmesh::{KnotIdx, TensorProduct, Tmesh, NAW},
    vol_iterator::VolIterator,
};
