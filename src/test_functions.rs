/////////////////////////////////////////////////////////////////////////////////////////////
//
// Provides analytic test fields for validating and demonstrating MFA fitting quality.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Analytic scalar fields over grids of sample positions, used by the tests
//! and the documentation examples.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use faer::Mat;

/// Struct that implements analytic fields for generating values on input
/// grids when testing MFA encoding and decoding.
pub struct MfaTestFunctions;

impl MfaTestFunctions {
    /// `sin(freq * pi * x)` over the first column of `points`.
    pub fn sine_1d(points: &Mat<f64>, freq: f64) -> Mat<f64> {
        assert_eq!(points.ncols(), 1);
        Mat::from_fn(points.nrows(), 1, |i, _| {
            (freq * std::f64::consts::PI * points[(i, 0)]).sin()
        })
    }

    /// Paraboloid `x^2 + y^2`.
    pub fn paraboloid_2d(points: &Mat<f64>) -> Mat<f64> {
        assert_eq!(points.ncols(), 2);
        Mat::from_fn(points.nrows(), 1, |i, _| {
            points[(i, 0)] * points[(i, 0)] + points[(i, 1)] * points[(i, 1)]
        })
    }

    /// Bilinear product field `x * y`.
    pub fn product_2d(points: &Mat<f64>) -> Mat<f64> {
        assert_eq!(points.ncols(), 2);
        Mat::from_fn(points.nrows(), 1, |i, _| points[(i, 0)] * points[(i, 1)])
    }

    /// Radially symmetric sinc `sin(s r) / (s r)` with `r` measured from the
    /// domain center; a classic compressibility benchmark field.
    pub fn sinc_2d(points: &Mat<f64>, scale: f64) -> Mat<f64> {
        assert_eq!(points.ncols(), 2);
        Mat::from_fn(points.nrows(), 1, |i, _| {
            let x = points[(i, 0)] - 0.5;
            let y = points[(i, 1)] - 0.5;
            let r = scale * (x * x + y * y).sqrt();
            if r == 0.0 {
                1.0
            } else {
                r.sin() / r
            }
        })
    }
}

/// Generate a matrix of random parameter vectors in the unit hypercube.
///
/// With `Some(seed)` the sequence is deterministic across runs, which the
/// unstructured-input tests rely on.
pub fn generate_random_params(n: usize, d: usize, seed: Option<u64>) -> Mat<f64> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    Mat::from_fn(n, d, |_, _| rng.random_range(0.0..1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_params_are_reproducible() {
        let a = generate_random_params(20, 3, Some(7));
        let b = generate_random_params(20, 3, Some(7));
        for i in 0..20 {
            for j in 0..3 {
                assert_eq!(a[(i, j)], b[(i, j)]);
            }
        }
    }

    #[test]
    fn sinc_center_is_one() {
        let points = Mat::from_fn(1, 2, |_, _| 0.5);
        let v = MfaTestFunctions::sinc_2d(&points, 10.0);
        assert_eq!(v[(0, 0)], 1.0);
    }
}
