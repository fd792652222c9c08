/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements tensor-product decoding: point, grid, T-mesh, and fast n-mode-product paths.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # decode
//!
//! Evaluation of a fitted model at arbitrary parameters. Two accumulation
//! strategies are provided: the volume-iterator walk over the local
//! `(p+1)^d` cube, which folds each completed lower-dimensional slice into
//! the next higher dimension, and the n-mode-product contractions
//! ([`Decoder::fast_vol_pt`], [`Decoder::fast_grad`]) that contract the
//! control lattice with one basis vector per dimension (see "Tensor
//! Decompositions and Applications", Kolda & Bader, chapter 2.5). The
//! rational denominator is accumulated alongside the numerator with the same
//! structure.
//!
//! Hierarchical models decode through [`Decoder::vol_pt_tmesh`], which visits
//! every tensor overlapping the parameter's anchors and evaluates single
//! basis functions from local knot vectors.

use std::sync::Arc;

use faer::{Col, Mat};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{MfaError, MfaResult};
use crate::model::{BasisFunInfo, MfaData};
use crate::pointset::PointSet;
use crate::progress::{emit, ProgressMsg, ProgressSink};
use crate::tmesh::{TensorProduct, NAW};
use crate::vol_iterator::VolIterator;

/// Reusable per-worker scratch for repeated volume-point evaluation.
#[derive(Debug, Clone)]
pub struct DecodeInfo {
    /// Basis function row per dimension.
    pub n: Vec<Mat<f64>>,

    /// Partial point accumulator per dimension.
    pub temp: Vec<Col<f64>>,

    /// Knot span per dimension.
    pub span: Vec<usize>,

    /// Partial rational denominator per dimension.
    pub temp_denom: Vec<f64>,

    /// Basis derivative tables per dimension (only when derivatives are
    /// requested).
    pub ders: Vec<Mat<f64>>,
}

impl DecodeInfo {
    pub fn new(mfa: &MfaData, derivs: &[usize]) -> Self {
        let t = &mfa.tmesh.tensor_prods[0];
        let pt_dim = t.ctrl_pts.ncols();

        DecodeInfo {
            n: (0..mfa.dom_dim)
                .map(|i| Mat::zeros(1, t.nctrl_pts[i]))
                .collect(),
            temp: (0..mfa.dom_dim).map(|_| Col::zeros(pt_dim)).collect(),
            span: vec![0; mfa.dom_dim],
            temp_denom: vec![0.0; mfa.dom_dim],
            ders: (0..mfa.dom_dim)
                .map(|i| {
                    if !derivs.is_empty() && derivs[i] > 0 {
                        Mat::zeros(derivs[i] + 1, t.nctrl_pts[i])
                    } else {
                        Mat::new()
                    }
                })
                .collect(),
        }
    }

    fn reset(&mut self) {
        for i in 0..self.temp.len() {
            for c in 0..self.temp[i].nrows() {
                self.temp[i][c] = 0.0;
            }
            self.temp_denom[i] = 0.0;
        }
    }
}

/// Scratch for the n-mode-product fast paths, allocated once and reused.
#[derive(Debug, Clone)]
pub struct FastDecodeInfo {
    /// Basis function scratch.
    pub bfi: BasisFunInfo,

    /// Basis values per dimension, `p + 1` entries each.
    pub n: Vec<Vec<f64>>,

    /// Basis values and derivatives per dimension: `d[k][order][i]`.
    pub d: Vec<Vec<Vec<f64>>>,

    /// Branch-free alias table: `ord[e][k]` is the derivative order to read
    /// in dimension `k` when computing the derivative in direction `e`
    /// (`e == dom_dim` reads plain values everywhere and yields the point
    /// value). The hot loops index `d[k][ord[e][k]][..]` without branching.
    pub ord: Vec<Vec<usize>>,

    /// Intermediate contraction sums per dimension.
    pub t: Vec<Vec<f64>>,

    /// Intermediate contraction sums per derivative direction and dimension.
    pub td: Vec<Vec<Vec<f64>>>,

    /// Number of derivatives `d` currently supports.
    pub nders: usize,

    /// Knot span per dimension.
    pub span: Vec<usize>,

    q: Vec<usize>,
}

impl FastDecodeInfo {
    pub fn new(decoder: &Decoder<'_>) -> Self {
        let dom_dim = decoder.dom_dim;
        let q = decoder.q.clone();

        // t[k] holds the partial sums remaining after contracting
        // dimensions 0..=k
        let mut sizes = Vec::with_capacity(dom_dim);
        let mut sz = decoder.tot_iters;
        for k in 0..dom_dim {
            sz /= q[k];
            sizes.push(sz);
        }

        let t: Vec<Vec<f64>> = sizes.iter().map(|&s| vec![0.0; s]).collect();
        let td: Vec<Vec<Vec<f64>>> = (0..=dom_dim).map(|_| t.clone()).collect();

        FastDecodeInfo {
            bfi: BasisFunInfo::new(&q),
            n: q.iter().map(|&qi| vec![0.0; qi]).collect(),
            d: Vec::new(),
            ord: Vec::new(),
            t,
            td,
            nders: 0,
            span: vec![0; dom_dim],
            q,
        }
    }

    /// Allocates the derivative tables and the alias table for derivatives
    /// up to order `nders`. Call once after construction, before
    /// [`Decoder::fast_grad`].
    pub fn resize_ders(&mut self, nders: usize) {
        let dom_dim = self.q.len();
        self.d = (0..dom_dim)
            .map(|k| (0..=nders).map(|_| vec![0.0; self.q[k]]).collect())
            .collect();

        // e == k reads the derivative row, anything else the value row
        self.ord = (0..=dom_dim)
            .map(|e| (0..dom_dim).map(|k| if e == k { nders } else { 0 }).collect())
            .collect();

        self.nders = nders;
    }
}

/// Evaluates a fitted model at parameters, grids, and point sets.
pub struct Decoder<'a> {
    mfa: &'a MfaData,
    dom_dim: usize,

    /// Total iterations of the flattened local-cube walk.
    tot_iters: usize,

    /// Control point stride per dimension.
    cs: Vec<usize>,

    /// Flat jump from the first control point for each iteration.
    jumps: Vec<usize>,

    /// Spline order `p + 1` per dimension.
    q: Vec<usize>,
    q0: usize,

    progress: Option<Arc<dyn ProgressSink>>,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder for a model whose first tensor has been encoded.
    pub fn new(mfa: &'a MfaData, progress: Option<Arc<dyn ProgressSink>>) -> MfaResult<Self> {
        let encoded = !mfa.p.is_empty()
            && !mfa.tmesh.all_knots.is_empty()
            && !mfa.tmesh.tensor_prods.is_empty()
            && !mfa.tmesh.tensor_prods[0].nctrl_pts.is_empty()
            && mfa.tmesh.tensor_prods[0].ctrl_pts.nrows() > 0;
        if !encoded {
            return Err(MfaError::DecodeBeforeEncode);
        }

        let dom_dim = mfa.dom_dim;
        let t = &mfa.tmesh.tensor_prods[0];

        let q: Vec<usize> = mfa.p.iter().map(|&p| p + 1).collect();
        let tot_iters: usize = q.iter().product();

        let mut cs = vec![1usize; dom_dim];
        for i in 1..dom_dim {
            cs[i] = cs[i - 1] * t.nctrl_pts[i - 1];
        }

        // digits of the local (p+1)^d cube for every flat iteration
        let mut ct = vec![vec![0usize; dom_dim]; tot_iters];
        for (i, digits) in ct.iter_mut().enumerate() {
            let mut div = tot_iters;
            let mut rem = i;
            for j in (0..dom_dim).rev() {
                div /= q[j];
                digits[j] = rem / div;
                rem -= digits[j] * div;
            }
        }

        let jumps: Vec<usize> = ct
            .iter()
            .map(|digits| digits.iter().zip(cs.iter()).map(|(&d, &s)| d * s).sum())
            .collect();

        Ok(Decoder {
            mfa,
            dom_dim,
            tot_iters,
            cs,
            jumps,
            q0: q[0],
            q,
            progress,
        })
    }

    // ------------------------------------------------------------------
    // point-set and grid decoding
    // ------------------------------------------------------------------

    /// Decodes the model at every parameter of `input`, writing columns
    /// `min_dim ..= max_dim` of `approx` (P&T eq. 9.77).
    ///
    /// `saved_basis` reuses the basis matrices computed during encoding
    /// (structured input, values only). `derivs` requests the mixed partial
    /// derivative of the given order per dimension; pass `&[]` for values.
    pub fn decode_domain(
        &self,
        input: &PointSet,
        approx: &mut Mat<f64>,
        min_dim: usize,
        max_dim: usize,
        saved_basis: bool,
        derivs: &[usize],
    ) -> MfaResult<()> {
        if !derivs.is_empty() && derivs.len() != self.dom_dim {
            return Err(MfaError::DerivsSizeMismatch {
                expected: self.dom_dim,
                got: derivs.len(),
            });
        }

        if saved_basis && !input.structured_grid() {
            emit(
                &self.progress,
                ProgressMsg::Message {
                    message: "saved-basis decoding needs structured input; decoding standard"
                        .into(),
                },
            );
        }

        let use_saved = saved_basis
            && input.structured_grid()
            && derivs.is_empty()
            && !self.mfa.config.use_tmesh
            && !self.mfa.basis.is_empty();

        let tensor = &self.mfa.tmesh.tensor_prods[0];
        let width = max_dim - min_dim + 1;
        let npts = input.npts();

        let decode_one = |di: &mut DecodeInfo, idx: usize| -> MfaResult<Col<f64>> {
            let mut param = vec![0.0; self.dom_dim];
            input.pt_params(idx, &mut param);
            let mut cpt = Col::<f64>::zeros(tensor.ctrl_pts.ncols());

            if self.mfa.config.use_tmesh {
                self.vol_pt_tmesh(&param, &mut cpt)?;
            } else if use_saved {
                let mut ijk = vec![0usize; self.dom_dim];
                input.pt_ijk(idx, &mut ijk);
                self.vol_pt_saved_basis(&ijk, &param, &mut cpt, di, tensor);
            } else {
                self.vol_pt_with_info(&param, &mut cpt, di, tensor, derivs)?;
            }
            Ok(cpt)
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<MfaResult<Col<f64>>> = (0..npts)
            .into_par_iter()
            .map_init(
                || DecodeInfo::new(self.mfa, derivs),
                |di, idx| decode_one(di, idx),
            )
            .collect();

        #[cfg(not(feature = "parallel"))]
        let rows: Vec<MfaResult<Col<f64>>> = {
            let mut di = DecodeInfo::new(self.mfa, derivs);
            (0..npts).map(|idx| decode_one(&mut di, idx)).collect()
        };

        for (idx, row) in rows.into_iter().enumerate() {
            let cpt = row?;
            for c in 0..width {
                approx[(idx, min_dim + c)] = cpt[c];
            }
        }

        Ok(())
    }

    /// Decodes at a regular grid spanning `min_params ..= max_params` with
    /// `ndom_pts` samples per dimension, precomputing the grid basis
    /// matrices once.
    pub fn decode_grid(
        &self,
        result: &mut Mat<f64>,
        min_dim: usize,
        max_dim: usize,
        min_params: &[f64],
        max_params: &[f64],
        ndom_pts: &[usize],
    ) -> MfaResult<()> {
        let tensor = &self.mfa.tmesh.tensor_prods[0];
        let width = max_dim - min_dim + 1;

        let params: Vec<Vec<f64>> = (0..self.dom_dim)
            .map(|k| {
                let n = ndom_pts[k];
                (0..n)
                    .map(|i| {
                        if n == 1 {
                            min_params[k]
                        } else {
                            min_params[k]
                                + i as f64 * (max_params[k] - min_params[k]) / (n - 1) as f64
                        }
                    })
                    .collect()
            })
            .collect();

        // basis matrices for all grid parameters, computed once
        let mut nn: Vec<Mat<f64>> = Vec::with_capacity(self.dom_dim);
        for k in 0..self.dom_dim {
            let mut n = Mat::<f64>::zeros(ndom_pts[k], tensor.nctrl_pts[k]);
            for i in 0..ndom_pts[k] {
                let span = self.mfa.find_span(k, params[k][i], tensor.nctrl_pts[k]);
                self.mfa
                    .orig_basis_funs(k, params[k][i], span, &mut n.as_mut(), i);
            }
            nn.push(n);
        }

        let npts: usize = ndom_pts.iter().product();
        let grid_it = VolIterator::new(ndom_pts);

        let decode_one = |di: &mut DecodeInfo, idx: usize| -> Col<f64> {
            let mut ijk = vec![0usize; self.dom_dim];
            grid_it.idx_ijk(idx, &mut ijk);
            let param: Vec<f64> = (0..self.dom_dim).map(|k| params[k][ijk[k]]).collect();
            let mut cpt = Col::<f64>::zeros(tensor.ctrl_pts.ncols());
            self.vol_pt_saved_basis_grid(&ijk, &param, &mut cpt, di, tensor, &nn);
            cpt
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<Col<f64>> = (0..npts)
            .into_par_iter()
            .map_init(
                || DecodeInfo::new(self.mfa, &[]),
                |di, idx| decode_one(di, idx),
            )
            .collect();

        #[cfg(not(feature = "parallel"))]
        let rows: Vec<Col<f64>> = {
            let mut di = DecodeInfo::new(self.mfa, &[]);
            (0..npts).map(|idx| decode_one(&mut di, idx)).collect()
        };

        for (idx, cpt) in rows.into_iter().enumerate() {
            for c in 0..width {
                result[(idx, min_dim + c)] = cpt[c];
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // volume-iterator point evaluation
    // ------------------------------------------------------------------

    /// Computes one point of the NURBS volume at `param` (P&T alg. 4.3),
    /// allocating fresh scratch. Pass `&[]` for `derivs` to evaluate values.
    pub fn vol_pt(
        &self,
        param: &[f64],
        out_pt: &mut Col<f64>,
        tensor: &TensorProduct,
        derivs: &[usize],
    ) -> MfaResult<()> {
        let mut di = DecodeInfo::new(self.mfa, derivs);
        self.vol_pt_with_info(param, out_pt, &mut di, tensor, derivs)
    }

    /// Same as [`Decoder::vol_pt`], reusing caller-allocated scratch.
    pub fn vol_pt_with_info(
        &self,
        param: &[f64],
        out_pt: &mut Col<f64>,
        di: &mut DecodeInfo,
        tensor: &TensorProduct,
        derivs: &[usize],
    ) -> MfaResult<()> {
        let last = tensor.ctrl_pts.ncols() - 1;
        if !derivs.is_empty() && derivs.len() != self.dom_dim {
            return Err(MfaError::DerivsSizeMismatch {
                expected: self.dom_dim,
                got: derivs.len(),
            });
        }

        di.reset();

        for i in 0..self.dom_dim {
            di.span[i] = self.mfa.find_span(i, param[i], tensor.nctrl_pts[i]);

            if !derivs.is_empty() && derivs[i] > 0 {
                self.mfa
                    .der_basis_funs(i, param[i], di.span[i], derivs[i], &mut di.ders[i].as_mut());
                for c in 0..di.n[i].ncols() {
                    di.n[i][(0, c)] = di.ders[i][(derivs[i], c)];
                }
            } else if self.mfa.config.use_tmesh {
                self.mfa
                    .basis_funs(i, param[i], di.span[i], &mut di.n[i].as_mut(), 0);
            } else {
                self.mfa
                    .orig_basis_funs(i, param[i], di.span[i], &mut di.n[i].as_mut(), 0);
            }
        }

        // flat index of the first control point of the local cube
        let start_ctrl_idx: usize = (0..self.dom_dim)
            .map(|j| (di.span[j] - self.mfa.p[j]) * self.cs[j])
            .sum();
        let mut ctrl_idx = start_ctrl_idx;

        let mut vol_iter = VolIterator::new(&self.q);
        while !vol_iter.done() {
            // accumulate the innermost dimension directly from control points
            let b0 = di.n[0][(0, vol_iter.idx_dim(0) + di.span[0] - self.mfa.p[0])];
            let w = tensor.weights[ctrl_idx];

            if self.mfa.config.weigh_all_dims {
                for j in 0..=last {
                    di.temp[0][j] += b0 * tensor.ctrl_pts[(ctrl_idx, j)] * w;
                }
            } else {
                for j in 0..last {
                    di.temp[0][j] += b0 * tensor.ctrl_pts[(ctrl_idx, j)];
                }
                di.temp[0][last] += b0 * tensor.ctrl_pts[(ctrl_idx, last)] * w;
            }
            di.temp_denom[0] += w * b0;

            vol_iter.incr_iter();

            if vol_iter.cur_iter() < vol_iter.tot_iters() {
                ctrl_idx = start_ctrl_idx + self.jumps[vol_iter.cur_iter()];
            }

            // fold each finished dimension into the next higher one
            for k in 0..self.dom_dim {
                if k < self.dom_dim - 1 && vol_iter.done_dim(k) {
                    let b = di.n[k + 1][(
                        0,
                        vol_iter.prev_idx_dim(k + 1) + di.span[k + 1] - self.mfa.p[k + 1],
                    )];
                    for j in 0..=last {
                        let v = di.temp[k][j];
                        di.temp[k + 1][j] += b * v;
                        di.temp[k][j] = 0.0;
                    }
                    di.temp_denom[k + 1] += di.temp_denom[k] * b;
                    di.temp_denom[k] = 0.0;
                }
            }
        }

        let denom = if !derivs.is_empty() && derivs.iter().sum::<usize>() > 0 {
            1.0 // weights do not apply to derivatives
        } else {
            let d = di.temp_denom[self.dom_dim - 1];
            if d == 0.0 {
                emit(
                    &self.progress,
                    ProgressMsg::ZeroDenominator {
                        param: param.to_vec(),
                    },
                );
                1.0
            } else {
                d
            }
        };

        if self.mfa.config.weigh_all_dims {
            for j in 0..=last {
                out_pt[j] = di.temp[self.dom_dim - 1][j] / denom;
            }
        } else {
            for j in 0..=last {
                out_pt[j] = di.temp[self.dom_dim - 1][j];
            }
            out_pt[last] /= denom;
        }

        Ok(())
    }

    /// Fastest multi-point path: reuses the basis matrices saved during
    /// encoding (values only).
    pub fn vol_pt_saved_basis(
        &self,
        ijk: &[usize],
        param: &[f64],
        out_pt: &mut Col<f64>,
        di: &mut DecodeInfo,
        tensor: &TensorProduct,
    ) {
        let last = tensor.ctrl_pts.ncols() - 1;
        di.reset();

        for j in 0..self.dom_dim {
            di.span[j] = self.mfa.find_span(j, param[j], tensor.nctrl_pts[j]);
        }

        self.accumulate_saved(ijk, out_pt, di, tensor, &self.mfa.basis, last);
    }

    /// Saved-basis evaluation against externally precomputed grid basis
    /// matrices.
    pub fn vol_pt_saved_basis_grid(
        &self,
        ijk: &[usize],
        param: &[f64],
        out_pt: &mut Col<f64>,
        di: &mut DecodeInfo,
        tensor: &TensorProduct,
        nn: &[Mat<f64>],
    ) {
        let last = tensor.ctrl_pts.ncols() - 1;
        di.reset();

        for j in 0..self.dom_dim {
            di.span[j] = self.mfa.find_span(j, param[j], tensor.nctrl_pts[j]);
        }

        self.accumulate_saved(ijk, out_pt, di, tensor, nn, last);
    }

    /// Shared accumulation of the saved-basis paths.
    fn accumulate_saved(
        &self,
        ijk: &[usize],
        out_pt: &mut Col<f64>,
        di: &mut DecodeInfo,
        tensor: &TensorProduct,
        nn: &[Mat<f64>],
        last: usize,
    ) {
        let start_ctrl_idx: usize = (0..self.dom_dim)
            .map(|j| (di.span[j] - self.mfa.p[j]) * self.cs[j])
            .sum();
        let mut ctrl_idx = start_ctrl_idx;

        let mut vol_iter = VolIterator::new(&self.q);
        while !vol_iter.done() {
            let b0 = nn[0][(ijk[0], vol_iter.idx_dim(0) + di.span[0] - self.mfa.p[0])];
            let w = tensor.weights[ctrl_idx];

            if self.mfa.config.weigh_all_dims {
                for j in 0..=last {
                    di.temp[0][j] += b0 * tensor.ctrl_pts[(ctrl_idx, j)] * w;
                }
            } else {
                for j in 0..last {
                    di.temp[0][j] += b0 * tensor.ctrl_pts[(ctrl_idx, j)];
                }
                di.temp[0][last] += b0 * tensor.ctrl_pts[(ctrl_idx, last)] * w;
            }
            di.temp_denom[0] += w * b0;

            vol_iter.incr_iter();
            if vol_iter.cur_iter() < vol_iter.tot_iters() {
                ctrl_idx = start_ctrl_idx + self.jumps[vol_iter.cur_iter()];
            }

            for k in 0..self.dom_dim {
                if k < self.dom_dim - 1 && vol_iter.done_dim(k) {
                    let b = nn[k + 1][(
                        ijk[k + 1],
                        vol_iter.prev_idx_dim(k + 1) + di.span[k + 1] - self.mfa.p[k + 1],
                    )];
                    for j in 0..=last {
                        let v = di.temp[k][j];
                        di.temp[k + 1][j] += b * v;
                        di.temp[k][j] = 0.0;
                    }
                    di.temp_denom[k + 1] += di.temp_denom[k] * b;
                    di.temp_denom[k] = 0.0;
                }
            }
        }

        let denom = di.temp_denom[self.dom_dim - 1];
        let denom = if denom == 0.0 { 1.0 } else { denom };

        if self.mfa.config.weigh_all_dims {
            for j in 0..=last {
                out_pt[j] = di.temp[self.dom_dim - 1][j] / denom;
            }
        } else {
            for j in 0..=last {
                out_pt[j] = di.temp[self.dom_dim - 1][j];
            }
            out_pt[last] /= denom;
        }
    }

    // ------------------------------------------------------------------
    // T-mesh point evaluation
    // ------------------------------------------------------------------

    /// Decodes one point of a hierarchical model: every tensor overlapping
    /// the parameter's anchors contributes its control points, each through
    /// a single basis function evaluated from a local knot vector obtained by
    /// knot-line intersection. Weights apply to all coordinates on this path.
    pub fn vol_pt_tmesh(&self, param: &[f64], out_pt: &mut Col<f64>) -> MfaResult<()> {
        for j in 0..out_pt.nrows() {
            out_pt[j] = 0.0;
        }
        let mut b_sum = 0.0;

        let anchors = self.mfa.tmesh.anchors(param);

        for t in self.mfa.tmesh.tensor_prods.iter() {
            // refinement-record tensors without solved control points do not
            // contribute
            if t.ctrl_pts.nrows() == 0 {
                continue;
            }

            // skip tensors entirely outside the anchor range
            let outside = (0..self.dom_dim).any(|j| {
                t.knot_maxs[j] < *anchors[j].first().unwrap()
                    || t.knot_mins[j] > *anchors[j].last().unwrap()
            });
            if outside {
                continue;
            }

            let mut vol_iter = VolIterator::new(&t.nctrl_pts);
            let mut ijk = vec![0usize; self.dom_dim];

            while !vol_iter.done() {
                let cur = vol_iter.cur_iter();
                vol_iter.idx_ijk(cur, &mut ijk);
                let anchor = self.mfa.tmesh.ctrl_pt_anchor(t, &ijk);

                // skip odd-degree duplicated points, marked by the sentinel
                if t.weights[cur] == NAW {
                    vol_iter.incr_iter();
                    continue;
                }

                // skip control points too far from the decoded point
                if !self.mfa.tmesh.in_anchors(&anchor, &anchors) {
                    vol_iter.incr_iter();
                    continue;
                }

                let local_knot_idxs = self.mfa.tmesh.knot_intersections(&anchor, t.level);

                let mut b = 1.0;
                for i in 0..self.dom_dim {
                    let local_knots: Vec<f64> = local_knot_idxs[i]
                        .iter()
                        .map(|&idx| self.mfa.tmesh.all_knots[i][idx])
                        .collect();
                    b *= self.mfa.one_basis_fun_local(i, param[i], &local_knots);
                }

                let w = t.weights[cur];
                for j in 0..out_pt.nrows() {
                    out_pt[j] += b * t.ctrl_pts[(cur, j)] * w;
                }
                b_sum += b * w;

                vol_iter.incr_iter();
            }
        }

        // normalize by the weighted basis sum for a partition of unity
        if b_sum > 0.0 {
            for j in 0..out_pt.nrows() {
                out_pt[j] /= b_sum;
            }
        } else {
            emit(
                &self.progress,
                ProgressMsg::ZeroDenominator {
                    param: param.to_vec(),
                },
            );
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // n-mode-product fast paths
    // ------------------------------------------------------------------

    /// Fast point evaluation by successive n-mode products: contract the
    /// control lattice with the dimension-0 basis vector, then contract each
    /// following dimension into the shrinking partial sums.
    ///
    /// Supported only for unweighted models with a single range coordinate
    /// and no T-mesh.
    pub fn fast_vol_pt(
        &self,
        param: &[f64],
        di: &mut FastDecodeInfo,
        tensor: &TensorProduct,
    ) -> MfaResult<f64> {
        self.check_fast_path(tensor)?;

        for i in 0..self.dom_dim {
            di.span[i] = self.mfa.find_span_model(i, param[i]);
            let (n_i, bfi) = (&mut di.n[i], &mut di.bfi);
            self.mfa.fast_basis_funs(i, param[i], di.span[i], n_i, bfi);
        }

        let start_ctrl_idx: usize = (0..self.dom_dim)
            .map(|j| (di.span[j] - self.mfa.p[j]) * self.cs[j])
            .sum();

        // dimension 0: the only loop that touches control points
        let mut id = 0usize;
        let mut m = 0usize;
        while m < self.tot_iters {
            let ctrl_idx = start_ctrl_idx + self.jumps[m];
            let mut acc = di.n[0][0] * tensor.ctrl_pts[(ctrl_idx, 0)];
            for a in 1..self.q0 {
                acc += di.n[0][a] * tensor.ctrl_pts[(ctrl_idx + a, 0)];
            }
            di.t[0][id] = acc;
            id += 1;
            m += self.q0;
        }

        // remaining dimensions contract the partial sums
        for k in 1..self.dom_dim {
            let qcur = self.q[k];
            let (prev_slice, cur_slice) = di.t.split_at_mut(k);
            let prev = &prev_slice[k - 1];
            let cur = &mut cur_slice[0];

            let mut id = 0usize;
            let mut m = 0usize;
            while m < prev.len() {
                let mut acc = di.n[k][0] * prev[m];
                for l in 1..qcur {
                    acc += di.n[k][l] * prev[m + l];
                }
                cur[id] = acc;
                id += 1;
                m += qcur;
            }
        }

        Ok(di.t[self.dom_dim - 1][0])
    }

    /// Gradient (and optionally the value) by the same n-mode contractions,
    /// run once per derivative direction with the alias table selecting
    /// basis values or derivatives per dimension.
    pub fn fast_grad(
        &self,
        param: &[f64],
        di: &mut FastDecodeInfo,
        tensor: &TensorProduct,
        out_grad: &mut [f64],
        mut out_val: Option<&mut f64>,
    ) -> MfaResult<()> {
        self.check_fast_path(tensor)?;
        if di.nders < 1 {
            return Err(MfaError::FastPathUnsupported {
                reason: "FastDecodeInfo::resize_ders(1) must be called before fast_grad",
            });
        }

        // the value slot rides along as an extra derivative direction
        let end_d = if out_val.is_some() {
            self.dom_dim + 1
        } else {
            self.dom_dim
        };

        for i in 0..self.dom_dim {
            di.span[i] = self.mfa.find_span_model(i, param[i]);
            let (d_i, bfi) = (&mut di.d[i], &mut di.bfi);
            self.mfa
                .fast_basis_funs_ders(i, param[i], di.span[i], 1, d_i, bfi);
        }

        let start_ctrl_idx: usize = (0..self.dom_dim)
            .map(|j| (di.span[j] - self.mfa.p[j]) * self.cs[j])
            .sum();

        // 0-mode products: derivative direction 0 and the shared value row
        let mut id = 0usize;
        let mut m = 0usize;
        while m < self.tot_iters {
            let ctrl_idx = start_ctrl_idx + self.jumps[m];

            let der0 = &di.d[0][di.ord[0][0]];
            let val0 = &di.d[0][di.ord[1][0]];

            let mut acc_d = der0[0] * tensor.ctrl_pts[(ctrl_idx, 0)];
            let mut acc_v = val0[0] * tensor.ctrl_pts[(ctrl_idx, 0)];
            for a in 1..self.q0 {
                acc_d += der0[a] * tensor.ctrl_pts[(ctrl_idx + a, 0)];
                acc_v += val0[a] * tensor.ctrl_pts[(ctrl_idx + a, 0)];
            }
            di.td[0][0][id] = acc_d;
            di.t[0][id] = acc_v;
            id += 1;
            m += self.q0;
        }
        // directions other than 0 share the plain-value 0-mode product
        for e in 1..end_d {
            let len = di.td[e][0].len();
            di.td[e][0][..len].copy_from_slice(&di.t[0][..len]);
        }

        // k-mode products for every derivative direction
        for e in 0..end_d {
            for k in 1..self.dom_dim {
                let qcur = self.q[k];
                let basis = &di.d[k][di.ord[e][k]];
                let (prev_slice, cur_slice) = di.td[e].split_at_mut(k);
                let prev = &prev_slice[k - 1];
                let cur = &mut cur_slice[0];

                let mut id = 0usize;
                let mut m = 0usize;
                while m < prev.len() {
                    let mut acc = basis[0] * prev[m];
                    for l in 1..qcur {
                        acc += basis[l] * prev[m + l];
                    }
                    cur[id] = acc;
                    id += 1;
                    m += qcur;
                }
            }
        }

        for e in 0..self.dom_dim {
            out_grad[e] = di.td[e][self.dom_dim - 1][0];
        }
        if let Some(val) = out_val.as_deref_mut() {
            *val = di.td[self.dom_dim][self.dom_dim - 1][0];
        }

        Ok(())
    }

    fn check_fast_path(&self, tensor: &TensorProduct) -> MfaResult<()> {
        if self.mfa.config.use_tmesh {
            return Err(MfaError::FastPathUnsupported {
                reason: "fast paths do not support the T-mesh decoder",
            });
        }
        if !self.mfa.config.no_weights {
            return Err(MfaError::FastPathUnsupported {
                reason: "fast paths require the unweighted configuration",
            });
        }
        if tensor.ctrl_pts.ncols() != 1 {
            return Err(MfaError::FastPathUnsupported {
                reason: "fast paths require a single range coordinate",
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // single-curve evaluation
    // ------------------------------------------------------------------

    /// Point of a 1-d curve of temporary control points (P&T alg. 4.1); used
    /// by the per-curve error analysis.
    pub fn curve_pt(
        &self,
        cur_dim: usize,
        param: f64,
        temp_ctrl: &Mat<f64>,
        temp_weights: &Col<f64>,
        tensor: &TensorProduct,
        out_pt: &mut Col<f64>,
    ) -> MfaResult<()> {
        let p = self.mfa.p[cur_dim];
        let span = self.mfa.find_span_tensor(cur_dim, param, tensor)?;

        let mut n = Mat::<f64>::zeros(1, temp_ctrl.nrows());
        if self.mfa.config.use_tmesh {
            self.mfa.basis_funs(cur_dim, param, span, &mut n.as_mut(), 0);
        } else {
            self.mfa
                .orig_basis_funs(cur_dim, param, span, &mut n.as_mut(), 0);
        }

        for j in 0..out_pt.nrows() {
            out_pt[j] = 0.0;
        }
        for j in 0..=p {
            let idx = span - p + j;
            let b = n[(0, idx)] * temp_weights[idx];
            for c in 0..out_pt.nrows() {
                out_pt[c] += b * temp_ctrl[(idx, c)];
            }
        }

        let mut denom = 0.0;
        for c in 0..n.ncols() {
            denom += n[(0, c)] * temp_weights[c];
        }
        for c in 0..out_pt.nrows() {
            out_pt[c] /= denom;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::encode::Encoder;

    fn encode_sine(n: usize, nctrl: usize) -> (MfaData, PointSet) {
        let domain = Mat::from_fn(n, 2, |i, j| {
            let x = i as f64 / (n - 1) as f64;
            if j == 0 {
                x
            } else {
                (std::f64::consts::PI * x).sin()
            }
        });
        let input = PointSet::structured(1, vec![n], domain).unwrap();
        let mut mfa =
            MfaData::new(vec![3], Some(vec![nctrl]), 0, 1, ModelConfig::default()).unwrap();
        mfa.set_knots(&input).unwrap();
        {
            let mut encoder = Encoder::new(&mut mfa, &input, None);
            let (ctrl, w) = encoder.encode(&[nctrl], false).unwrap();
            let t = &mut mfa.tmesh.tensor_prods[0];
            t.ctrl_pts = ctrl;
            t.weights = w;
        }
        (mfa, input)
    }

    #[test]
    fn decode_before_encode_is_an_error() {
        let mfa = MfaData::new(vec![2], Some(vec![4]), 0, 1, ModelConfig::default()).unwrap();
        assert!(matches!(
            Decoder::new(&mfa, None),
            Err(MfaError::DecodeBeforeEncode)
        ));
    }

    #[test]
    fn endpoint_interpolation_with_clamped_knots() {
        let (mfa, _input) = encode_sine(11, 7);
        let decoder = Decoder::new(&mfa, None).unwrap();
        let tensor = &mfa.tmesh.tensor_prods[0];

        let mut cpt = Col::<f64>::zeros(2);
        decoder.vol_pt(&[0.0], &mut cpt, tensor, &[]).unwrap();
        assert!((cpt[0] - tensor.ctrl_pts[(0, 0)]).abs() < 1e-14);
        assert!((cpt[1] - tensor.ctrl_pts[(0, 1)]).abs() < 1e-14);

        decoder.vol_pt(&[1.0], &mut cpt, tensor, &[]).unwrap();
        let lastrow = tensor.ctrl_pts.nrows() - 1;
        assert!((cpt[0] - tensor.ctrl_pts[(lastrow, 0)]).abs() < 1e-14);
        assert!((cpt[1] - tensor.ctrl_pts[(lastrow, 1)]).abs() < 1e-14);
    }

    #[test]
    fn derivative_matches_central_difference_of_value() {
        let (mfa, _input) = encode_sine(21, 12);
        let decoder = Decoder::new(&mfa, None).unwrap();
        let tensor = &mfa.tmesh.tensor_prods[0];

        let h = 1e-5;
        let mut val_lo = Col::<f64>::zeros(2);
        let mut val_hi = Col::<f64>::zeros(2);
        let mut der = Col::<f64>::zeros(2);

        for i in 1..10 {
            let u = i as f64 / 10.0;
            decoder.vol_pt(&[u - h], &mut val_lo, tensor, &[]).unwrap();
            decoder.vol_pt(&[u + h], &mut val_hi, tensor, &[]).unwrap();
            decoder.vol_pt(&[u], &mut der, tensor, &[1]).unwrap();

            let fd = (val_hi[1] - val_lo[1]) / (2.0 * h);
            assert!(
                (der[1] - fd).abs() < 1e-4,
                "u = {}: {} vs {}",
                u,
                der[1],
                fd
            );
        }
    }

    #[test]
    fn weight_scaling_leaves_decoded_point_unchanged() {
        let (mut mfa, _input) = encode_sine(11, 7);

        let decoder = Decoder::new(&mfa, None).unwrap();
        let mut before = Col::<f64>::zeros(2);
        decoder
            .vol_pt(&[0.37], &mut before, &mfa.tmesh.tensor_prods[0], &[])
            .unwrap();
        drop(decoder);

        // scale all weights by a positive constant
        {
            let t = &mut mfa.tmesh.tensor_prods[0];
            for i in 0..t.weights.nrows() {
                t.weights[i] *= 7.5;
            }
        }

        let decoder = Decoder::new(&mfa, None).unwrap();
        let mut after = Col::<f64>::zeros(2);
        decoder
            .vol_pt(&[0.37], &mut after, &mfa.tmesh.tensor_prods[0], &[])
            .unwrap();

        assert!((before[1] - after[1]).abs() < 1e-13);
    }

    #[test]
    fn tmesh_decode_matches_plain_decode_on_a_single_tensor() {
        let (mfa, _input) = encode_sine(11, 7);
        let decoder = Decoder::new(&mfa, None).unwrap();
        let tensor = &mfa.tmesh.tensor_prods[0];

        let mut plain = Col::<f64>::zeros(2);
        let mut tmesh = Col::<f64>::zeros(2);
        for u in [0.0, 0.1, 0.33, 0.5, 0.77, 0.99] {
            decoder.vol_pt(&[u], &mut plain, tensor, &[]).unwrap();
            decoder.vol_pt_tmesh(&[u], &mut tmesh).unwrap();
            assert!(
                (plain[1] - tmesh[1]).abs() < 1e-12,
                "u = {}: {} vs {}",
                u,
                plain[1],
                tmesh[1]
            );
        }
    }

    #[test]
    fn grid_decode_matches_pointwise_decode() {
        let (mfa, _input) = encode_sine(11, 7);
        let decoder = Decoder::new(&mfa, None).unwrap();
        let tensor = &mfa.tmesh.tensor_prods[0];

        let mut grid = Mat::<f64>::zeros(9, 2);
        decoder
            .decode_grid(&mut grid, 0, 1, &[0.0], &[1.0], &[9])
            .unwrap();

        let mut cpt = Col::<f64>::zeros(2);
        for i in 0..9 {
            let u = i as f64 / 8.0;
            decoder.vol_pt(&[u], &mut cpt, tensor, &[]).unwrap();
            assert!((grid[(i, 1)] - cpt[1]).abs() < 1e-12, "i = {}", i);
        }
    }

    #[test]
    fn fast_vol_pt_matches_vol_pt_for_scalar_models() {
        // scalar range model: fit only the sine coordinate
        let n = 11;
        let domain = Mat::from_fn(n, 2, |i, j| {
            let x = i as f64 / (n - 1) as f64;
            if j == 0 {
                x
            } else {
                (std::f64::consts::PI * x).sin()
            }
        });
        let input = PointSet::structured(1, vec![n], domain).unwrap();
        let config = ModelConfig::builder().no_weights(true).build();
        let mut mfa = MfaData::new(vec![3], Some(vec![7]), 1, 1, config).unwrap();
        mfa.set_knots(&input).unwrap();
        {
            let mut encoder = Encoder::new(&mut mfa, &input, None);
            let (ctrl, w) = encoder.encode(&[7], false).unwrap();
            let t = &mut mfa.tmesh.tensor_prods[0];
            t.ctrl_pts = ctrl;
            t.weights = w;
        }

        let decoder = Decoder::new(&mfa, None).unwrap();
        let tensor = &mfa.tmesh.tensor_prods[0];
        let mut di = FastDecodeInfo::new(&decoder);

        let mut cpt = Col::<f64>::zeros(1);
        for i in 0..=20 {
            let u = i as f64 / 20.0;
            decoder.vol_pt(&[u], &mut cpt, tensor, &[]).unwrap();
            let fast = decoder.fast_vol_pt(&[u], &mut di, tensor).unwrap();
            assert!((fast - cpt[0]).abs() < 1e-13, "u = {}", u);
        }
    }
}
