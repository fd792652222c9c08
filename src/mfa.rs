/////////////////////////////////////////////////////////////////////////////////////////////
//
// Exposes the top-level MFA facade: encode, adaptive encode, decode, and error queries.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use std::sync::Arc;

use faer::{Col, Mat};

use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::MfaResult;
use crate::model::MfaData;
use crate::pointset::PointSet;
use crate::progress::ProgressSink;

/// Convenience builder for constructing an [`Mfa`] instance.
///
/// The builder should be called via the [`Mfa::builder`] method.
pub struct MfaBuilder {
    dom_dim: usize,
    ndom_pts: Vec<usize>,
    domain: Mat<f64>,
    progress_callback: Option<Arc<dyn ProgressSink>>,
}

impl MfaBuilder {
    fn new(dom_dim: usize, ndom_pts: Vec<usize>, domain: Mat<f64>) -> Self {
        Self {
            dom_dim,
            ndom_pts,
            domain,
            progress_callback: None,
        }
    }

    /// Optional callback for reporting progress and numerical diagnostics.
    pub fn progress_callback(mut self, progress_callback: Arc<dyn ProgressSink>) -> Self {
        self.progress_callback = Some(progress_callback);
        self
    }

    /// Builds and returns the configured [`Mfa`].
    pub fn build(self) -> MfaResult<Mfa> {
        let input = PointSet::structured(self.dom_dim, self.ndom_pts, self.domain)?;
        Ok(Mfa {
            dom_dim: self.dom_dim,
            input,
            progress: self.progress_callback,
        })
    }
}

#[doc = include_str!("../docs/mfa.md")]
pub struct Mfa {
    dom_dim: usize,
    input: PointSet,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl Mfa {
    /// Creates an MFA over a structured input grid: `ndom_pts[k]` samples
    /// per dimension, `domain` holding one input point per row with
    /// dimension 0 varying fastest.
    pub fn new(dom_dim: usize, ndom_pts: Vec<usize>, domain: Mat<f64>) -> MfaResult<Self> {
        Mfa::builder(dom_dim, ndom_pts, domain).build()
    }

    /// Returns a new [`MfaBuilder`] for the given input grid.
    pub fn builder(dom_dim: usize, ndom_pts: Vec<usize>, domain: Mat<f64>) -> MfaBuilder {
        MfaBuilder::new(dom_dim, ndom_pts, domain)
    }

    /// Creates an MFA over an unstructured point list with explicit
    /// per-point parameters. Decoding only; the separable encoder requires a
    /// structured grid.
    pub fn from_unstructured(
        dom_dim: usize,
        domain: Mat<f64>,
        params: Mat<f64>,
    ) -> MfaResult<Self> {
        let input = PointSet::unstructured(dom_dim, domain, params)?;
        Ok(Mfa {
            dom_dim,
            input,
            progress: None,
        })
    }

    #[inline]
    pub fn dom_dim(&self) -> usize {
        self.dom_dim
    }

    #[inline]
    pub fn input(&self) -> &PointSet {
        &self.input
    }

    #[inline]
    pub fn ndom_pts(&self) -> &[usize] {
        &self.input.ndom_pts
    }

    /// Parameter sequences per dimension (structured input).
    pub fn params(&self) -> &[Vec<f64>] {
        self.input.param_grid()
    }

    /// Encodes `mfa_data` with its configured number of control points.
    ///
    /// Knot vectors and the first tensor product are created on first use.
    /// With `weighted`, per-curve rational weights are estimated during the
    /// last dimension of the separable sweep.
    pub fn fixed_encode(&self, mfa_data: &mut MfaData, weighted: bool) -> MfaResult<()> {
        self.ensure_knots(mfa_data)?;

        let nctrl_pts = mfa_data.tmesh.tensor_prods[0].nctrl_pts.clone();
        let (ctrl_pts, weights) = {
            let mut encoder = Encoder::new(mfa_data, &self.input, self.progress.clone());
            encoder.encode(&nctrl_pts, weighted)?
        };

        let t = &mut mfa_data.tmesh.tensor_prods[0];
        t.ctrl_pts = ctrl_pts;
        t.weights = weights;
        Ok(())
    }

    /// Adaptive encode: refines knot vectors until the normalized error at
    /// every refinable input point is below `err_limit`.
    ///
    /// `extents`, when given, normalizes the per-coordinate error (one entry
    /// per input column). `max_rounds` of 0 means unlimited.
    pub fn adaptive_encode(
        &self,
        mfa_data: &mut MfaData,
        err_limit: f64,
        weighted: bool,
        extents: Option<&[f64]>,
        max_rounds: usize,
    ) -> MfaResult<()> {
        self.ensure_knots(mfa_data)?;

        let mut encoder = Encoder::new(mfa_data, &self.input, self.progress.clone());
        encoder.adaptive_encode(err_limit, weighted, extents, max_rounds)
    }

    /// Decodes the model at every input point, writing columns
    /// `min_dim ..= max_dim` of `approx` (one row per input point).
    ///
    /// `saved_basis` reuses the basis matrices computed by the last encode;
    /// `derivs` selects a mixed partial derivative order per dimension.
    pub fn decode_domain(
        &self,
        mfa_data: &MfaData,
        approx: &mut Mat<f64>,
        min_dim: usize,
        max_dim: usize,
        saved_basis: bool,
        derivs: Option<&[usize]>,
    ) -> MfaResult<()> {
        let decoder = Decoder::new(mfa_data, self.progress.clone())?;
        decoder.decode_domain(
            &self.input,
            approx,
            min_dim,
            max_dim,
            saved_basis,
            derivs.unwrap_or(&[]),
        )
    }

    /// Decodes a single point at the given parameter vector.
    pub fn decode_point(&self, mfa_data: &MfaData, param: &[f64]) -> MfaResult<Col<f64>> {
        let decoder = Decoder::new(mfa_data, self.progress.clone())?;
        let tensor = &mfa_data.tmesh.tensor_prods[0];
        let mut cpt = Col::<f64>::zeros(tensor.ctrl_pts.ncols());

        if mfa_data.config.use_tmesh {
            decoder.vol_pt_tmesh(param, &mut cpt)?;
        } else {
            decoder.vol_pt(param, &mut cpt, tensor, &[])?;
        }
        Ok(cpt)
    }

    /// Absolute coordinate-wise error of the model at input point `idx`
    /// (not normalized by the data range).
    pub fn abs_coord_error(&self, mfa_data: &MfaData, idx: usize) -> MfaResult<Col<f64>> {
        let mut param = vec![0.0; self.dom_dim];
        self.input.pt_params(idx, &mut param);

        let cpt = self.decode_point(mfa_data, &param)?;

        let pt_dim = mfa_data.pt_dim();
        Ok(Col::from_fn(pt_dim, |i| {
            (cpt[i] - self.input.domain[(idx, mfa_data.min_dim + i)]).abs()
        }))
    }

    fn ensure_knots(&self, mfa_data: &mut MfaData) -> MfaResult<()> {
        if mfa_data.tmesh.tensor_prods.is_empty() {
            mfa_data.set_knots(&self.input)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::decode::FastDecodeInfo;
    use crate::test_functions::MfaTestFunctions;
    use crate::tmesh::Tmesh;

    const PI: f64 = std::f64::consts::PI;

    fn grid_1d(n: usize, f: impl Fn(f64) -> f64) -> Mat<f64> {
        Mat::from_fn(n, 2, |i, j| {
            let x = i as f64 / (n - 1) as f64;
            if j == 0 {
                x
            } else {
                f(x)
            }
        })
    }

    fn grid_2d(n: usize, f: impl Fn(f64, f64) -> f64) -> Mat<f64> {
        Mat::from_fn(n * n, 3, |idx, j| {
            let x = (idx % n) as f64 / (n - 1) as f64;
            let y = (idx / n) as f64 / (n - 1) as f64;
            match j {
                0 => x,
                1 => y,
                _ => f(x, y),
            }
        })
    }

    #[test]
    fn interpolating_encode_reproduces_sine_samples() {
        // as many control points as samples: the fit interpolates
        let n = 11;
        let domain = grid_1d(n, |x| (PI * x).sin());
        let mfa = Mfa::new(1, vec![n], domain).unwrap();

        let mut model =
            MfaData::new(vec![3], Some(vec![n]), 0, 1, ModelConfig::default()).unwrap();
        mfa.fixed_encode(&mut model, false).unwrap();

        let mut worst: f64 = 0.0;
        for idx in 0..n {
            let err = mfa.abs_coord_error(&model, idx).unwrap();
            worst = worst.max(err[1]);
        }
        assert!(worst < 1e-10, "max abs error = {}", worst);
    }

    #[test]
    fn interpolation_is_exact_regardless_of_weights() {
        let n = 11;
        let domain = grid_1d(n, |x| (PI * x).sin());
        let mfa = Mfa::new(1, vec![n], domain).unwrap();

        let mut model =
            MfaData::new(vec![3], Some(vec![n]), 0, 1, ModelConfig::default()).unwrap();
        mfa.fixed_encode(&mut model, true).unwrap();

        let mut worst: f64 = 0.0;
        for idx in 0..n {
            let err = mfa.abs_coord_error(&model, idx).unwrap();
            worst = worst.max(err[1]);
        }
        assert!(worst < 1e-10, "max abs error = {}", worst);
    }

    #[test]
    fn paraboloid_surface_fits_within_tolerance() {
        // f = x^2 + y^2 lies in the biquadratic spline space, so even a
        // compressing fit is tight
        let n = 9;
        let domain = grid_2d(n, |x, y| x * x + y * y);
        let mfa = Mfa::new(2, vec![n, n], domain).unwrap();

        let mut model =
            MfaData::new(vec![2, 2], Some(vec![5, 5]), 0, 2, ModelConfig::default()).unwrap();
        mfa.fixed_encode(&mut model, false).unwrap();

        // normalize by the range extent (max |f| = 2)
        let mut worst: f64 = 0.0;
        for idx in 0..n * n {
            let err = mfa.abs_coord_error(&model, idx).unwrap();
            worst = worst.max(err[2] / 2.0);
        }
        assert!(worst < 5e-3, "max relative error = {}", worst);
    }

    #[test]
    fn decode_domain_matches_per_point_errors() {
        let n = 9;
        let domain = grid_2d(n, |x, y| x * x + y * y);
        let mfa = Mfa::new(2, vec![n, n], domain.clone()).unwrap();

        let mut model =
            MfaData::new(vec![2, 2], Some(vec![5, 5]), 0, 2, ModelConfig::default()).unwrap();
        mfa.fixed_encode(&mut model, false).unwrap();

        let mut approx = Mat::<f64>::zeros(n * n, 3);
        mfa.decode_domain(&model, &mut approx, 0, 2, false, None).unwrap();

        let mut saved = Mat::<f64>::zeros(n * n, 3);
        mfa.decode_domain(&model, &mut saved, 0, 2, true, None).unwrap();

        for idx in 0..n * n {
            let err = mfa.abs_coord_error(&model, idx).unwrap();
            for c in 0..3 {
                assert!(((approx[(idx, c)] - domain[(idx, c)]).abs() - err[c]).abs() < 1e-12);
                assert!((approx[(idx, c)] - saved[(idx, c)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn fast_grad_of_product_field_at_center() {
        // g(x, y) = x * y fits exactly in the bicubic space; the gradient at
        // the center is (0.5, 0.5)
        let n = 8;
        let positions = Mat::from_fn(n * n, 2, |idx, j| {
            if j == 0 {
                (idx % n) as f64 / (n - 1) as f64
            } else {
                (idx / n) as f64 / (n - 1) as f64
            }
        });
        let values = MfaTestFunctions::product_2d(&positions);
        let domain = Mat::from_fn(n * n, 3, |idx, j| {
            if j < 2 {
                positions[(idx, j)]
            } else {
                values[(idx, 0)]
            }
        });

        let mfa = Mfa::new(2, vec![n, n], domain).unwrap();
        let config = ModelConfig::builder().no_weights(true).build();
        let mut model = MfaData::new(vec![3, 3], Some(vec![6, 6]), 2, 2, config).unwrap();
        mfa.fixed_encode(&mut model, false).unwrap();

        let decoder = Decoder::new(&model, None).unwrap();
        let tensor = &model.tmesh.tensor_prods[0];
        let mut di = FastDecodeInfo::new(&decoder);
        di.resize_ders(1);

        let mut grad = [0.0f64; 2];
        let mut val = 0.0f64;
        decoder
            .fast_grad(&[0.5, 0.5], &mut di, tensor, &mut grad, Some(&mut val))
            .unwrap();

        assert!((grad[0] - 0.5).abs() < 1e-9, "du = {}", grad[0]);
        assert!((grad[1] - 0.5).abs() < 1e-9, "dv = {}", grad[1]);
        assert!((val - 0.25).abs() < 1e-9, "value = {}", val);

        // the fast value path agrees
        let fast_val = decoder.fast_vol_pt(&[0.5, 0.5], &mut di, tensor).unwrap();
        assert!((fast_val - 0.25).abs() < 1e-9);
    }

    /// Classical 9-point quadratic rational circle: control points on the
    /// unit square corners and midpoints, weights alternating 1 and
    /// sqrt(2)/2, double interior knots at the quarter points.
    fn rational_circle(tmesh: &mut Tmesh) {
        let s = 0.5f64.sqrt();
        let pts: [[f64; 2]; 9] = [
            [1.0, 0.0],
            [1.0, 1.0],
            [0.0, 1.0],
            [-1.0, 1.0],
            [-1.0, 0.0],
            [-1.0, -1.0],
            [0.0, -1.0],
            [1.0, -1.0],
            [1.0, 0.0],
        ];
        let w: [f64; 9] = [1.0, s, 1.0, s, 1.0, s, 1.0, s, 1.0];

        tmesh.all_knots[0] = vec![
            0.0, 0.0, 0.0, 0.25, 0.25, 0.5, 0.5, 0.75, 0.75, 1.0, 1.0, 1.0,
        ];

        let t = &mut tmesh.tensor_prods[0];
        t.ctrl_pts = Mat::from_fn(9, 2, |i, j| pts[i][j]);
        t.weights = Col::from_fn(9, |i| w[i]);
    }

    #[test]
    fn weight_solver_recovers_the_rational_circle() {
        let config = ModelConfig::builder().weigh_all_dims(true).build();
        let m = 129;

        // sample the exact rational circle at uniform parameters
        let reference_domain = {
            let placeholder = grid_1d(m, |x| x);
            let input = PointSet::structured(1, vec![m], placeholder).unwrap();
            let mut reference = MfaData::new(vec![2], Some(vec![9]), 0, 1, config).unwrap();
            reference.set_knots(&input).unwrap();
            rational_circle(&mut reference.tmesh);

            let decoder = Decoder::new(&reference, None).unwrap();
            let tensor = &reference.tmesh.tensor_prods[0];
            let mut cpt = Col::<f64>::zeros(2);
            Mat::from_fn(m, 2, |i, j| {
                let u = i as f64 / (m - 1) as f64;
                decoder.vol_pt(&[u], &mut cpt, tensor, &[]).unwrap();
                cpt[j]
            })
        };

        // circle x-coordinates are not monotone, so parameters fall back to
        // the uniform sampling used above
        let mfa = Mfa::new(1, vec![m], reference_domain).unwrap();

        let mut model = MfaData::new(vec![2], Some(vec![9]), 0, 1, config).unwrap();
        model.set_knots(mfa.input()).unwrap();
        model.tmesh.all_knots[0] = vec![
            0.0, 0.0, 0.0, 0.25, 0.25, 0.5, 0.5, 0.75, 0.75, 1.0, 1.0, 1.0,
        ];

        mfa.fixed_encode(&mut model, true).unwrap();

        // recovered weights match the classical pattern up to common scaling
        let s = 0.5f64.sqrt();
        let expected: [f64; 9] = [1.0, s, 1.0, s, 1.0, s, 1.0, s, 1.0];
        let weights = &model.tmesh.tensor_prods[0].weights;
        for i in 0..9 {
            assert!(
                (weights[i] - expected[i]).abs() < 1e-5,
                "weight {}: {} vs {}",
                i,
                weights[i],
                expected[i]
            );
        }

        // decoded boundary lies on the unit circle
        for i in 0..=200 {
            let u = i as f64 / 200.0;
            let pt = mfa.decode_point(&model, &[u]).unwrap();
            let r2 = pt[0] * pt[0] + pt[1] * pt[1];
            assert!((r2 - 1.0).abs() < 1e-9, "u = {}: r^2 = {}", u, r2);
        }
    }
}
