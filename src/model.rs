/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements the per-model data bundle: knot construction, span lookup, and basis evaluation.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # model
//!
//! [`MfaData`] bundles everything one fitted model owns: polynomial degrees,
//! the [`Tmesh`] of knots and tensor products, the window of input coordinates
//! being fitted, and the basis matrices saved during encoding. It also hosts
//! the B-spline numerical kernels: span lookup, the Cox-de Boor basis
//! recurrence and its derivatives, and the rational (weighted) reduction of
//! the normal-equation matrix.
//!
//! There are two kinds of dimensionality: that of the tensor product
//! (`p.len()`: curve, surface, volume, ...) and that of an individual control
//! point (`ctrl_pts.ncols()`). The model fits columns `min_dim ..= max_dim`
//! of each input row.
//!
//! # References
//! 1. Piegl, L., Tiller, W. The NURBS Book, 2nd ed. Algorithms 2.1-2.4.

use faer::{Col, Mat, MatMut, MatRef};
use serde::{Deserialize, Serialize};

use crate::config::{KnotPolicy, ModelConfig};
use crate::error::{MfaError, MfaResult};
use crate::pointset::PointSet;
use crate::tmesh::{find_span_in, KnotIdx, TensorProduct, Tmesh};

/// Pre-allocated scratch space for basis function evaluation, sized for the
/// largest spline order among all dimensions.
///
/// One instance per worker thread; concurrent use of the same instance is a
/// data race.
#[derive(Debug, Clone)]
pub struct BasisFunInfo {
    /// Right parameter differences `knots[span + j] - u`.
    pub right: Vec<f64>,

    /// Left parameter differences `u - knots[span + 1 - j]`.
    pub left: Vec<f64>,

    /// Triangular storage for the derivative recurrence: upper triangle holds
    /// basis values, lower triangle reciprocals of knot differences.
    pub ndu: Vec<Vec<f64>>,

    /// Two alternating recurrence rows for high-order derivatives.
    pub a: [Vec<f64>; 2],

    /// Largest spline order `p + 1` among all dimensions.
    pub qmax: usize,
}

impl BasisFunInfo {
    pub fn new(q: &[usize]) -> Self {
        let qmax = q.iter().copied().max().unwrap_or(1);
        BasisFunInfo {
            right: vec![0.0; qmax],
            left: vec![0.0; qmax],
            ndu: vec![vec![0.0; qmax]; qmax],
            a: [vec![0.0; qmax], vec![0.0; qmax]],
            qmax,
        }
    }
}

/// The per-model parameter and knot bundle of one MFA model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaData {
    /// Number of domain dimensions.
    pub dom_dim: usize,

    /// First input coordinate fitted by this model.
    pub min_dim: usize,

    /// Last input coordinate fitted by this model.
    pub max_dim: usize,

    /// Polynomial degree per domain dimension.
    pub p: Vec<usize>,

    /// Knots, levels, and tensor products.
    pub tmesh: Tmesh,

    /// Model configuration switches.
    pub config: ModelConfig,

    /// Basis matrices per dimension, rows = input parameters, cols = control
    /// points. Populated during encoding and reusable for saved-basis
    /// decoding. Not serialized; re-encoding restores them.
    #[serde(skip, default)]
    pub basis: Vec<Mat<f64>>,

    /// Unnormalized absolute value of the maximum error from the last
    /// adaptive round.
    pub max_err: f64,
}

impl MfaData {
    /// Creates a model of degree `p` fitting input coordinates
    /// `min_dim ..= max_dim`.
    ///
    /// `nctrl_pts` of `None` means the minimum, `p + 1`, per dimension.
    pub fn new(
        p: Vec<usize>,
        nctrl_pts: Option<Vec<usize>>,
        min_dim: usize,
        max_dim: usize,
        config: ModelConfig,
    ) -> MfaResult<Self> {
        let dom_dim = p.len();
        let nctrl_pts = nctrl_pts.unwrap_or_else(|| p.iter().map(|&deg| deg + 1).collect());
        if nctrl_pts.len() != dom_dim {
            return Err(MfaError::DimMismatch {
                expected: dom_dim,
                got: nctrl_pts.len(),
            });
        }
        for dim in 0..dom_dim {
            if nctrl_pts[dim] <= p[dim] {
                return Err(MfaError::TooFewCtrlPts {
                    dim,
                    nctrl_pts: nctrl_pts[dim],
                    degree: p[dim],
                });
            }
        }

        let mut tmesh = Tmesh::new(dom_dim, p.clone());
        tmesh.init_knots(&nctrl_pts);

        Ok(MfaData {
            dom_dim,
            min_dim,
            max_dim,
            p,
            tmesh,
            config,
            basis: Vec::new(),
            max_err: 0.0,
        })
    }

    /// Dimensionality of the fitted control points.
    #[inline]
    pub fn pt_dim(&self) -> usize {
        self.max_dim - self.min_dim + 1
    }

    /// Places knot values for the given input, allocates the saved basis
    /// matrices, and appends the first tensor product covering the whole
    /// knot range.
    pub fn set_knots(&mut self, input: &PointSet) -> MfaResult<()> {
        if input.structured_grid() {
            self.basis = (0..self.dom_dim)
                .map(|dim| {
                    Mat::zeros(
                        input.ndom_pts[dim],
                        self.tmesh.all_knots[dim].len() - self.p[dim] - 1,
                    )
                })
                .collect();
        }

        match self.config.knot_policy {
            KnotPolicy::CurveParams => {
                if !input.structured_grid() {
                    return Err(MfaError::UnstructuredInput);
                }
                self.param_knots(input);
            }
            KnotPolicy::UniformSpacing => self.uniform_knots(input),
        }

        let knot_mins = vec![0; self.dom_dim];
        let knot_maxs: Vec<KnotIdx> = (0..self.dom_dim)
            .map(|dim| self.tmesh.all_knots[dim].len() - 1)
            .collect();
        self.tmesh.append_tensor(knot_mins, knot_maxs, 0);

        Ok(())
    }

    // ------------------------------------------------------------------
    // span lookup
    // ------------------------------------------------------------------

    /// Span index `i` such that `u` is in `[knots[i], knots[i + 1])`, for a
    /// model with `nctrl_pts` control points in dimension `dim`.
    pub fn find_span(&self, dim: usize, u: f64, nctrl_pts: usize) -> usize {
        find_span_in(&self.tmesh.all_knots[dim], self.p[dim], nctrl_pts, u)
    }

    /// Span lookup with the control point count derived from the global knot
    /// vector length.
    pub fn find_span_model(&self, dim: usize, u: f64) -> usize {
        let nctrl_pts = self.tmesh.all_knots[dim].len() - self.p[dim] - 1;
        self.find_span(dim, u, nctrl_pts)
    }

    /// T-mesh span lookup: the returned span is additionally walked leftward
    /// until its knot carries the tensor's level.
    pub fn find_span_tensor(&self, dim: usize, u: f64, tensor: &TensorProduct) -> MfaResult<usize> {
        let knots = &self.tmesh.all_knots[dim];
        let levels = &self.tmesh.all_knot_levels[dim];

        if u < knots[tensor.knot_mins[dim]] || u > knots[tensor.knot_maxs[dim]] {
            return Err(MfaError::ParamOutsideTensor { dim, param: u });
        }

        if u == knots[tensor.nctrl_pts[dim]] {
            if levels[tensor.nctrl_pts[dim]] != tensor.level {
                return Err(MfaError::SpanLevelMismatch {
                    dim,
                    span: tensor.nctrl_pts[dim],
                });
            }
            return Ok(tensor.nctrl_pts[dim] - 1);
        }

        let mut mid = find_span_in(knots, self.p[dim], tensor.nctrl_pts[dim], u);

        while levels[mid] > tensor.level && mid > 0 {
            mid -= 1;
        }
        if levels[mid] != tensor.level {
            return Err(MfaError::SpanLevelMismatch { dim, span: mid });
        }

        Ok(mid)
    }

    // ------------------------------------------------------------------
    // basis functions
    // ------------------------------------------------------------------

    /// The `p + 1` non-zero basis function values at `u`, written into
    /// columns `span - p ..= span` of row `row` of `n`; the rest of the row
    /// is zeroed. Algorithm 2.2 of [1].
    pub fn orig_basis_funs(&self, dim: usize, u: f64, span: usize, n: &mut MatMut<'_, f64>, row: usize) {
        let p = self.p[dim];
        let knots = &self.tmesh.all_knots[dim];

        for j in 0..n.ncols() {
            n[(row, j)] = 0.0;
        }

        let mut scratch = vec![0.0; p + 1];
        scratch[0] = 1.0;

        // left[j]  = u - knots[span + 1 - j]
        // right[j] = knots[span + j] - u
        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];

        for j in 1..=p {
            left[j] = u - knots[span + 1 - j];
            right[j] = knots[span + j] - u;

            let mut saved = 0.0;
            for r in 0..j {
                let temp = scratch[r] / (right[r + 1] + left[j - r]);
                scratch[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            scratch[j] = saved;
        }

        for j in 0..=p {
            n[(row, span - p + j)] = scratch[j];
        }
    }

    /// Same recurrence as [`MfaData::orig_basis_funs`], computed in place
    /// into a `p + 1` slice with pre-allocated scratch.
    pub fn fast_basis_funs(
        &self,
        dim: usize,
        u: f64,
        span: usize,
        n: &mut [f64],
        bfi: &mut BasisFunInfo,
    ) {
        let p = self.p[dim];
        let knots = &self.tmesh.all_knots[dim];

        // existing entries of n are always overwritten before being read
        n[0] = 1.0;

        for j in 1..=p {
            bfi.left[j] = u - knots[span + 1 - j];
            bfi.right[j] = knots[span + j] - u;

            let mut saved = 0.0;
            for r in 0..j {
                let temp = n[r] / (bfi.right[r + 1] + bfi.left[j - r]);
                n[r] = saved + bfi.right[r + 1] * temp;
                saved = bfi.left[j - r] * temp;
            }
            n[j] = saved;
        }
    }

    /// T-mesh variant that evaluates one basis function at a time from an
    /// explicit local knot vector sliced out of the global one.
    pub fn basis_funs(&self, dim: usize, u: f64, span: usize, n: &mut MatMut<'_, f64>, row: usize) {
        let p = self.p[dim];
        let knots = &self.tmesh.all_knots[dim];

        for j in 0..n.ncols() {
            n[(row, j)] = 0.0;
        }

        let mut loc_knots = vec![0.0; p + 2];
        for j in 0..=p {
            for i in 0..p + 2 {
                loc_knots[i] = knots[span - p + j + i];
            }
            n[(row, span - p + j)] = self.one_basis_fun_local(dim, u, &loc_knots);
        }
    }

    /// T-mesh variant of the recurrence: the `left`/`right` walks skip knots
    /// whose level differs from the tensor's level.
    pub fn tensor_basis_funs(
        &self,
        tensor: &TensorProduct,
        dim: usize,
        u: f64,
        span: usize,
        n: &mut MatMut<'_, f64>,
        row: usize,
    ) {
        let p = self.p[dim];
        let knots = &self.tmesh.all_knots[dim];
        let levels = &self.tmesh.all_knot_levels[dim];

        for j in 0..n.ncols() {
            n[(row, j)] = 0.0;
        }

        let mut scratch = vec![0.0; p + 1];
        scratch[0] = 1.0;

        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];

        // j_left and j_right track j but skip knots not at the tensor's level
        let mut j_left = 1usize;
        let mut j_right = 1usize;
        for j in 1..=p {
            while levels[span + 1 - j_left] != tensor.level {
                j_left += 1;
                debug_assert!(span + 1 >= j_left);
            }
            left[j] = u - knots[span + 1 - j_left];
            while levels[span + j_right] != tensor.level {
                j_right += 1;
                debug_assert!(span + j_right < levels.len());
            }
            right[j] = knots[span + j_right] - u;
            j_left += 1;
            j_right += 1;

            let mut saved = 0.0;
            for r in 0..j {
                let temp = scratch[r] / (right[r + 1] + left[j - r]);
                scratch[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            scratch[j] = saved;
        }

        for j in 0..=p {
            n[(row, span - p + j)] = scratch[j];
        }
    }

    /// One basis function value `N_{i,p}(u)` over the global knot vector.
    /// Algorithm 2.4 of [1].
    pub fn one_basis_fun(&self, dim: usize, u: f64, i: usize) -> f64 {
        let p = self.p[dim];
        let knots = &self.tmesh.all_knots[dim];

        // 1 at the edges of the global knot vector
        if (i == 0 && u == knots[0]) || (i == knots.len() - p - 2 && u == *knots.last().unwrap()) {
            return 1.0;
        }

        // zero outside the local support
        if u < knots[i] || u >= knots[i + p + 1] {
            return 0.0;
        }

        one_basis_fun_impl(p, u, &knots[i..=i + p + 1])
    }

    /// One basis function value over an explicit local knot vector of length
    /// `p + 2`. Based on algorithm 2.4 of [1].
    pub fn one_basis_fun_local(&self, dim: usize, u: f64, loc_knots: &[f64]) -> f64 {
        let p = self.p[dim];

        // corner case: 1 at the right edge of the local knot vector
        if u == 1.0 && loc_knots[1..=p + 1].iter().all(|&k| k == 1.0) {
            return 1.0;
        }

        if u < loc_knots[0] || u >= loc_knots[p + 1] {
            return 0.0;
        }

        one_basis_fun_impl(p, u, loc_knots)
    }

    /// Basis function derivatives at `u`: row `k` of `ders` receives the
    /// `k`-th derivative of each basis function, in columns
    /// `span - p ..= span`. `ders` must have `nders + 1` rows and one column
    /// per control point. Algorithm 2.3 of [1].
    pub fn der_basis_funs(
        &self,
        dim: usize,
        u: f64,
        span: usize,
        nders: usize,
        ders: &mut MatMut<'_, f64>,
    ) {
        let p = self.p[dim];
        let knots = &self.tmesh.all_knots[dim];

        // derivatives above the degree are identically zero
        let nders = nders.min(p);

        // upper triangle: basis values; lower triangle: knot differences
        let mut ndu = vec![vec![0.0; p + 1]; p + 1];
        ndu[0][0] = 1.0;

        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];

        for j in 1..=p {
            left[j] = u - knots[span + 1 - j];
            right[j] = knots[span + j] - u;

            let mut saved = 0.0;
            for r in 0..j {
                ndu[j][r] = right[r + 1] + left[j - r];
                let temp = ndu[r][j - 1] / ndu[j][r];
                ndu[r][j] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            ndu[j][j] = saved;
        }

        for i in 0..ders.nrows() {
            for j in 0..ders.ncols() {
                ders[(i, j)] = 0.0;
            }
        }
        for j in 0..=p {
            ders[(0, span - p + j)] = ndu[j][p];
        }

        // two most recently computed rows of the derivative recurrence
        let mut a = [vec![0.0; p + 1], vec![0.0; p + 1]];

        for r in 0..=p {
            let mut s1 = 0;
            let mut s2 = 1;
            a[0][0] = 1.0;

            for k in 1..=nders {
                let mut d = 0.0;
                let rk = r as isize - k as isize;
                let pk = p - k;

                if r >= k {
                    a[s2][0] = a[s1][0] / ndu[pk + 1][rk as usize];
                    d = a[s2][0] * ndu[rk as usize][pk];
                }

                let j1 = if rk >= -1 { 1 } else { (-rk) as usize };
                let j2 = if r as isize - 1 <= pk as isize {
                    k - 1
                } else {
                    p - r
                };

                for j in j1..=j2 {
                    a[s2][j] =
                        (a[s1][j] - a[s1][j - 1]) / ndu[pk + 1][(rk + j as isize) as usize];
                    d += a[s2][j] * ndu[(rk + j as isize) as usize][pk];
                }

                if r <= pk {
                    a[s2][k] = -a[s1][k - 1] / ndu[pk + 1][r];
                    d += a[s2][k] * ndu[r][pk];
                }

                ders[(k, span - p + r)] = d;
                std::mem::swap(&mut s1, &mut s2);
            }
        }

        // multiply through by the factors of eq. 2.10
        let mut factor = p as f64;
        for k in 1..=nders {
            for j in 0..ders.ncols() {
                ders[(k, j)] *= factor;
            }
            factor *= (p - k) as f64;
        }
    }

    /// Derivative recurrence into a `(nders + 1) x (p + 1)` table with
    /// pre-allocated scratch; stores reciprocals of knot differences to
    /// minimize divisions.
    pub fn fast_basis_funs_ders(
        &self,
        dim: usize,
        u: f64,
        span: usize,
        nders: usize,
        d: &mut [Vec<f64>],
        bfi: &mut BasisFunInfo,
    ) {
        if nders == 1 {
            return self.fast_basis_funs_der1(dim, u, span, d, bfi);
        }

        debug_assert!(d.len() == nders + 1);

        let p = self.p[dim];
        let nders = nders.min(p);
        let knots = &self.tmesh.all_knots[dim];

        bfi.ndu[0][0] = 1.0;

        for j in 1..=p {
            bfi.left[j] = u - knots[span + 1 - j];
            bfi.right[j] = knots[span + j] - u;

            let mut saved = 0.0;
            for r in 0..j {
                bfi.ndu[j][r] = 1.0 / (bfi.right[r + 1] + bfi.left[j - r]);
                let temp = bfi.ndu[r][j - 1] * bfi.ndu[j][r];
                bfi.ndu[r][j] = saved + bfi.right[r + 1] * temp;
                saved = bfi.left[j - r] * temp;
            }
            bfi.ndu[j][j] = saved;
        }

        for j in 0..=p {
            d[0][j] = bfi.ndu[j][p];
        }

        for r in 0..=p {
            let mut s1 = 0;
            let mut s2 = 1;
            bfi.a[0][0] = 1.0;

            for k in 1..=nders {
                let mut der = 0.0;
                let rk = r as isize - k as isize;
                let pk = p - k;

                if r >= k {
                    bfi.a[s2][0] = bfi.a[s1][0] * bfi.ndu[pk + 1][rk as usize];
                    der = bfi.a[s2][0] * bfi.ndu[rk as usize][pk];
                }

                let j1 = if rk >= -1 { 1 } else { (-rk) as usize };
                let j2 = if r as isize - 1 <= pk as isize {
                    k - 1
                } else {
                    p - r
                };

                for j in j1..=j2 {
                    bfi.a[s2][j] = (bfi.a[s1][j] - bfi.a[s1][j - 1])
                        * bfi.ndu[pk + 1][(rk + j as isize) as usize];
                    der += bfi.a[s2][j] * bfi.ndu[(rk + j as isize) as usize][pk];
                }

                if r <= pk {
                    bfi.a[s2][k] = -bfi.a[s1][k - 1] * bfi.ndu[pk + 1][r];
                    der += bfi.a[s2][k] * bfi.ndu[r][pk];
                }

                d[k][r] = der;
                std::mem::swap(&mut s1, &mut s2);
            }
        }

        let mut factor = p as f64;
        for k in 1..=nders {
            for i in 0..=p {
                d[k][i] *= factor;
            }
            factor *= (p - k) as f64;
        }
    }

    /// Specialization of the derivative recurrence for first derivatives.
    fn fast_basis_funs_der1(
        &self,
        dim: usize,
        u: f64,
        span: usize,
        d: &mut [Vec<f64>],
        bfi: &mut BasisFunInfo,
    ) {
        debug_assert!(d.len() == 2);

        let p = self.p[dim];
        let pk = p - 1;
        let knots = &self.tmesh.all_knots[dim];

        bfi.ndu[0][0] = 1.0;

        for j in 1..=p {
            bfi.left[j] = u - knots[span + 1 - j];
            bfi.right[j] = knots[span + j] - u;

            let mut saved = 0.0;
            for r in 0..j {
                bfi.ndu[j][r] = 1.0 / (bfi.right[r + 1] + bfi.left[j - r]);
                let temp = bfi.ndu[r][j - 1] * bfi.ndu[j][r];
                bfi.ndu[r][j] = saved + bfi.right[r + 1] * temp;
                saved = bfi.left[j - r] * temp;
            }
            bfi.ndu[j][j] = saved;
        }

        for j in 0..=p {
            d[0][j] = bfi.ndu[j][p];
        }

        d[1][0] = -bfi.ndu[0][pk] * bfi.ndu[p][0];
        d[1][p] = bfi.ndu[p - 1][pk] * bfi.ndu[p][p - 1];
        for r in 1..p {
            d[1][r] = bfi.ndu[r - 1][pk] * bfi.ndu[p][r - 1] - bfi.ndu[r][pk] * bfi.ndu[p][r];
        }

        for i in 0..=p {
            d[1][i] *= p as f64;
        }
    }

    // ------------------------------------------------------------------
    // rationalization
    // ------------------------------------------------------------------

    /// Rational (weighted) normal-equation matrix from an unweighted basis
    /// matrix: columns of `n` are scaled by their weight, rows normalized by
    /// the weighted row sum, and the result is `N_rat^T * N_rat`.
    pub fn rationalize(&self, weights: &Col<f64>, n: MatRef<'_, f64>) -> Mat<f64> {
        let mut n_rat = n.to_owned();

        for r in 0..n.nrows() {
            let mut denom = 0.0;
            for c in 0..n.ncols() {
                denom += n[(r, c)] * weights[c];
            }
            if self.config.unclamped_knots && denom == 0.0 {
                denom = 1.0;
            }
            for c in 0..n.ncols() {
                n_rat[(r, c)] = n[(r, c)] * weights[c] / denom;
            }
        }

        n_rat.transpose() * &n_rat
    }

    // ------------------------------------------------------------------
    // knot construction
    // ------------------------------------------------------------------

    /// Interior knots spaced uniformly; ends clamped with multiplicity
    /// `p + 1`, or single knots when the configuration is unclamped.
    fn uniform_knots(&mut self, input: &PointSet) {
        for dim in 0..self.dom_dim {
            let nctrl_pts = self.tmesh.all_knots[dim].len() - self.p[dim] - 1;
            let p = self.p[dim];
            let nknots = nctrl_pts + p + 1;

            if self.config.unclamped_knots {
                for j in 0..nknots {
                    self.tmesh.all_knots[dim][j] = j as f64 / (nknots - 1) as f64;
                }
            } else {
                for i in 0..=p {
                    self.tmesh.all_knots[dim][i] = 0.0;
                    self.tmesh.all_knots[dim][nknots - 1 - i] = 1.0;
                }
                let step = 1.0 / (nctrl_pts - p) as f64;
                for j in 1..=nctrl_pts - p - 1 {
                    self.tmesh.all_knots[dim][p + j] = self.tmesh.all_knots[dim][p + j - 1] + step;
                }
            }

            if input.structured_grid() {
                let params = input.param_grid()[dim].clone();
                self.index_knot_params(dim, &params);
            }
        }
    }

    /// Interior knots averaged from the input parameters; n-d version of
    /// eqs. 9.68/9.69 of [1], with the span ratio taken over input spans
    /// rather than input points.
    fn param_knots(&mut self, input: &PointSet) {
        for dim in 0..self.dom_dim {
            let nctrl_pts = self.tmesh.all_knots[dim].len() - self.p[dim] - 1;
            let p = self.p[dim];
            let nknots = nctrl_pts + p + 1;
            let params = input.param_grid()[dim].clone();

            // ratio of input spans to internal knot spans
            let d = (input.ndom_pts[dim] - 1) as f64 / (nctrl_pts - p) as f64;

            for j in 1..=nctrl_pts - p - 1 {
                let jd = j as f64 * d;
                let i = jd as usize;
                let a = jd - i as f64;
                self.tmesh.all_knots[dim][p + j] = (1.0 - a) * params[i] + a * params[i + 1];
            }

            for i in 0..=p {
                self.tmesh.all_knots[dim][i] = 0.0;
                self.tmesh.all_knots[dim][nknots - 1 - i] = 1.0;
            }

            self.index_knot_params(dim, &params);
        }
    }

    /// Rebuilds the parameter-index references for dimension `dim`: each knot
    /// maps to the last parameter index strictly less than it.
    fn index_knot_params(&mut self, dim: usize, params: &[f64]) {
        for j in 0..self.tmesh.all_knots[dim].len() {
            let knot = self.tmesh.all_knots[dim][j];
            self.tmesh.all_knot_param_idxs[dim][j] =
                params.partition_point(|&u| u < knot).saturating_sub(1);
        }
    }
}

/// Triangular-table evaluation of a single basis function over `p + 2`
/// consecutive knots `loc[0..=p+1]`, assuming `u` lies inside the support.
fn one_basis_fun_impl(p: usize, u: f64, loc: &[f64]) -> f64 {
    let mut n = vec![0.0; p + 1];

    // 0-th degree functions
    for j in 0..=p {
        n[j] = if u >= loc[j] && u < loc[j + 1] { 1.0 } else { 0.0 };
    }

    for k in 1..=p {
        let mut saved = if n[0] == 0.0 {
            0.0
        } else {
            ((u - loc[0]) * n[0]) / (loc[k] - loc[0])
        };
        for j in 0..p - k + 1 {
            let uleft = loc[j + 1];
            let uright = loc[j + k + 1];
            if n[j + 1] == 0.0 {
                n[j] = saved;
                saved = 0.0;
            } else {
                let temp = n[j + 1] / (uright - uleft);
                n[j] = saved + (uright - u) * temp;
                saved = (u - uleft) * temp;
            }
        }
    }
    n[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointset::PointSet;
    use faer::Mat;

    fn line_domain(n: usize) -> Mat<f64> {
        Mat::from_fn(n, 2, |i, j| {
            let x = i as f64 / (n - 1) as f64;
            if j == 0 {
                x
            } else {
                (std::f64::consts::PI * x).sin()
            }
        })
    }

    fn cubic_model(n: usize, nctrl: usize) -> (MfaData, PointSet) {
        let input = PointSet::structured(1, vec![n], line_domain(n)).unwrap();
        let mut mfa = MfaData::new(vec![3], Some(vec![nctrl]), 0, 1, ModelConfig::default()).unwrap();
        mfa.set_knots(&input).unwrap();
        (mfa, input)
    }

    #[test]
    fn too_few_ctrl_pts_is_rejected() {
        let err = MfaData::new(vec![3], Some(vec![3]), 0, 1, ModelConfig::default());
        assert!(matches!(err, Err(MfaError::TooFewCtrlPts { .. })));
    }

    #[test]
    fn uniform_knots_are_clamped_and_uniform_inside() {
        let (mfa, _) = cubic_model(11, 7);
        let knots = &mfa.tmesh.all_knots[0];
        assert_eq!(
            knots,
            &vec![0.0, 0.0, 0.0, 0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn partition_of_unity() {
        let (mfa, _) = cubic_model(11, 7);
        let nctrl = 7;
        let mut n = Mat::<f64>::zeros(1, nctrl);

        for i in 0..=100 {
            let u = i as f64 / 100.0;
            let span = mfa.find_span(0, u, nctrl);
            mfa.orig_basis_funs(0, u, span, &mut n.as_mut(), 0);
            let sum: f64 = (0..nctrl).map(|j| n[(0, j)]).sum();
            assert!((sum - 1.0).abs() < 1e-12, "u = {}: sum = {}", u, sum);
        }
    }

    #[test]
    fn local_support() {
        let (mfa, _) = cubic_model(11, 7);
        let knots = mfa.tmesh.all_knots[0].clone();

        for i in 0..7 {
            for j in 0..=100 {
                let u = j as f64 / 100.0;
                let val = mfa.one_basis_fun(0, u, i);
                if u < knots[i] || (u >= knots[i + 4] && u < 1.0) {
                    assert_eq!(val, 0.0, "N_{},3({}) should vanish", i, u);
                }
            }
        }
    }

    #[test]
    fn one_basis_fun_matches_full_recurrence() {
        let (mfa, _) = cubic_model(11, 7);
        let nctrl = 7;
        let mut n = Mat::<f64>::zeros(1, nctrl);

        for j in 0..=50 {
            let u = j as f64 / 50.0;
            let span = mfa.find_span(0, u, nctrl);
            mfa.orig_basis_funs(0, u, span, &mut n.as_mut(), 0);
            for i in 0..nctrl {
                let one = mfa.one_basis_fun(0, u, i);
                assert!(
                    (one - n[(0, i)]).abs() < 1e-12,
                    "u = {} i = {}: {} vs {}",
                    u,
                    i,
                    one,
                    n[(0, i)]
                );
            }
        }
    }

    #[test]
    fn fast_basis_matches_original() {
        let (mfa, _) = cubic_model(11, 7);
        let nctrl = 7;
        let mut n = Mat::<f64>::zeros(1, nctrl);
        let mut fast = vec![0.0; 4];
        let mut bfi = BasisFunInfo::new(&[4]);

        for j in 0..=20 {
            let u = j as f64 / 20.0;
            let span = mfa.find_span(0, u, nctrl);
            mfa.orig_basis_funs(0, u, span, &mut n.as_mut(), 0);
            mfa.fast_basis_funs(0, u, span, &mut fast, &mut bfi);
            for a in 0..=3 {
                assert!((fast[a] - n[(0, span - 3 + a)]).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn derivatives_agree_with_central_differences() {
        let (mfa, _) = cubic_model(11, 7);
        let nctrl = 7;
        let h = 1e-6;

        let mut ders = Mat::<f64>::zeros(2, nctrl);
        let mut lo = Mat::<f64>::zeros(1, nctrl);
        let mut hi = Mat::<f64>::zeros(1, nctrl);

        for j in 1..10 {
            let u = j as f64 / 10.0 + 0.013;
            if u >= 1.0 {
                break;
            }
            let span = mfa.find_span(0, u, nctrl);
            mfa.der_basis_funs(0, u, span, 1, &mut ders.as_mut());

            let span_lo = mfa.find_span(0, u - h, nctrl);
            let span_hi = mfa.find_span(0, u + h, nctrl);
            mfa.orig_basis_funs(0, u - h, span_lo, &mut lo.as_mut(), 0);
            mfa.orig_basis_funs(0, u + h, span_hi, &mut hi.as_mut(), 0);

            for i in 0..nctrl {
                let fd = (hi[(0, i)] - lo[(0, i)]) / (2.0 * h);
                assert!(
                    (ders[(1, i)] - fd).abs() < 1e-5,
                    "u = {} i = {}: {} vs {}",
                    u,
                    i,
                    ders[(1, i)],
                    fd
                );
            }
        }
    }

    #[test]
    fn fast_der1_matches_general_path() {
        let (mfa, _) = cubic_model(11, 7);
        let nctrl = 7;
        let mut ders = Mat::<f64>::zeros(3, nctrl);
        let mut d = vec![vec![0.0; 4]; 3];
        let mut bfi = BasisFunInfo::new(&[4]);

        for j in 0..=20 {
            let u = j as f64 / 20.0;
            let span = mfa.find_span(0, u, nctrl);
            mfa.der_basis_funs(0, u, span, 2, &mut ders.as_mut());
            mfa.fast_basis_funs_ders(0, u, span, 2, &mut d, &mut bfi);
            for a in 0..=3 {
                assert!((d[0][a] - ders[(0, span - 3 + a)]).abs() < 1e-12);
                assert!((d[1][a] - ders[(1, span - 3 + a)]).abs() < 1e-9);
                assert!((d[2][a] - ders[(2, span - 3 + a)]).abs() < 1e-7);
            }

            let mut d1 = vec![vec![0.0; 4]; 2];
            mfa.fast_basis_funs_ders(0, u, span, 1, &mut d1, &mut bfi);
            for a in 0..=3 {
                assert!((d1[1][a] - ders[(1, span - 3 + a)]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn tensor_basis_funs_match_plain_recurrence_at_level_zero() {
        let (mfa, _) = cubic_model(11, 7);
        let nctrl = 7;
        let tensor = mfa.tmesh.tensor_prods[0].clone();
        let mut plain = Mat::<f64>::zeros(1, nctrl);
        let mut skipping = Mat::<f64>::zeros(1, nctrl);
        let mut local = Mat::<f64>::zeros(1, nctrl);

        for j in 0..=20 {
            let u = j as f64 / 20.0;
            let span = mfa.find_span(0, u, nctrl);
            mfa.orig_basis_funs(0, u, span, &mut plain.as_mut(), 0);
            mfa.tensor_basis_funs(&tensor, 0, u, span, &mut skipping.as_mut(), 0);
            mfa.basis_funs(0, u, span, &mut local.as_mut(), 0);
            for c in 0..nctrl {
                assert!((plain[(0, c)] - skipping[(0, c)]).abs() < 1e-14);
                assert!((plain[(0, c)] - local[(0, c)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn rationalize_with_unit_weights_is_plain_normal_matrix() {
        let (mut mfa, input) = cubic_model(11, 7);
        let nctrl = 7;
        let mut n = Mat::<f64>::zeros(11, nctrl);
        let grid = input.param_grid()[0].clone();
        for (i, &u) in grid.iter().enumerate() {
            let span = mfa.find_span(0, u, nctrl);
            mfa.orig_basis_funs(0, u, span, &mut n.as_mut(), i);
        }
        mfa.basis = vec![n.clone()];

        let weights = Col::from_fn(nctrl, |_| 1.0);
        let ntn_rat = mfa.rationalize(&weights, n.as_ref());
        let ntn = n.transpose() * &n;

        for r in 0..nctrl {
            for c in 0..nctrl {
                assert!((ntn_rat[(r, c)] - ntn[(r, c)]).abs() < 1e-12);
            }
        }
    }
}
