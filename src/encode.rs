/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements the separable least-squares encoder and the per-curve weight solver.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # encode
//!
//! Separable least-squares fitting of an n-dimensional NURBS hypervolume
//! (n-d generalization of Piegl & Tiller algorithm 9.7 / section 9.4.3).
//! One dimension at a time, the input lattice is replaced by control points:
//! a banded basis matrix `N` is assembled from the input parameters of that
//! dimension, and each 1-d curve of the lattice is solved independently
//! through the normal equations `N^T N  P = N^T Q`. Two equally sized slabs
//! double-buffer the intermediate lattice so dimension `k + 1` reads what
//! dimension `k` wrote.
//!
//! Optionally, the last dimension estimates per-curve rational weights with
//! the Ma-Kruth eigenproblem, falling back to an expanding-eigenspace linear
//! program and finally to unit weights.
//!
//! # References
//! 1. Piegl, L., Tiller, W. The NURBS Book, 2nd ed., section 9.4.3.
//! 2. Ma, W., Kruth, J.-P. NURBS curve and surface fitting for reverse
//!    engineering. Int. J. Adv. Manuf. Technol. 14, 1998.

use std::collections::BTreeSet;
use std::sync::Arc;

use faer::linalg::solvers::Solve;
use faer::{Col, Mat, MatRef, Side};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::decode::Decoder;
use crate::error::{MfaError, MfaResult};
use crate::model::MfaData;
use crate::pointset::{curve_offsets, PointSet};
use crate::progress::{emit, ProgressMsg, ProgressSink};
use crate::refine::{NewKnots, RefineOutcome};
use crate::simplex::{BoundedSimplex, WeightLp};

/// Solve the normal equations with Cholesky, falling back to Bunch-Kaufman
/// when the matrix is numerically indefinite.
pub(crate) fn solve_normal(a: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Mat<f64> {
    match a.llt(Side::Lower) {
        Ok(llt) => llt.solve(rhs),
        Err(_) => a.lblt(Side::Lower).solve(rhs),
    }
}

/// Fits control points (and optionally weights) of a model to an input
/// point set.
pub struct Encoder<'a> {
    mfa: &'a mut MfaData,
    input: &'a PointSet,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl<'a> Encoder<'a> {
    pub fn new(
        mfa: &'a mut MfaData,
        input: &'a PointSet,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        Encoder {
            mfa,
            input,
            progress,
        }
    }

    /// Separable least-squares encode with `nctrl_pts` control points per
    /// dimension. Returns the control point lattice (row-major, dimension 0
    /// fastest) and one weight per control point.
    pub fn encode(&mut self, nctrl_pts: &[usize], weighted: bool) -> MfaResult<(Mat<f64>, Col<f64>)> {
        self.quants(nctrl_pts)?;

        let dom_dim = self.mfa.dom_dim;
        let pt_dim = self.mfa.pt_dim();
        let ndom_pts = &self.input.ndom_pts;

        let tot_nctrl: usize = nctrl_pts.iter().product();
        let mut ctrl_pts = Mat::<f64>::zeros(tot_nctrl, pt_dim);
        let mut weights = Col::from_fn(tot_nctrl, |_| 1.0);

        // double buffer of temporary control points; the first dimension
        // shrinks to its control count immediately, the rest start at the
        // input resolution (or the control count, when that is larger)
        let tot_ntemp: usize = (0..dom_dim)
            .map(|k| {
                if k == 0 {
                    nctrl_pts[0]
                } else {
                    ndom_pts[k].max(nctrl_pts[k])
                }
            })
            .product();
        let mut temp_ctrl0 = Mat::<f64>::zeros(tot_ntemp, pt_dim);
        let mut temp_ctrl1 = Mat::<f64>::zeros(tot_ntemp, pt_dim);

        let mut ntemp_ctrl = ndom_pts.clone();
        let mut cs = 1usize;

        for k in 0..dom_dim {
            let ncurves: usize = (0..dom_dim)
                .map(|i| {
                    if i < k {
                        nctrl_pts[i]
                    } else if i > k {
                        ndom_pts[i]
                    } else {
                        1
                    }
                })
                .product();

            let co = curve_offsets(ncurves, cs, ntemp_ctrl[k]);
            let to = curve_offsets(ncurves, cs, nctrl_pts[k]);

            self.fill_basis(k, nctrl_pts[k]);

            let ntn = {
                let n = &self.mfa.basis[k];
                n.transpose() * n
            };

            let results = {
                let n = &self.mfa.basis[k];

                #[cfg(feature = "parallel")]
                let results: Vec<(Mat<f64>, Vec<f64>)> = (0..ncurves)
                    .into_par_iter()
                    .map(|j| {
                        self.ctrl_curve(
                            k,
                            n.as_ref(),
                            ntn.as_ref(),
                            co[j],
                            cs,
                            j,
                            &temp_ctrl0,
                            &temp_ctrl1,
                            weighted,
                        )
                    })
                    .collect();

                #[cfg(not(feature = "parallel"))]
                let results: Vec<(Mat<f64>, Vec<f64>)> = (0..ncurves)
                    .map(|j| {
                        self.ctrl_curve(
                            k,
                            n.as_ref(),
                            ntn.as_ref(),
                            co[j],
                            cs,
                            j,
                            &temp_ctrl0,
                            &temp_ctrl1,
                            weighted,
                        )
                    })
                    .collect();

                results
            };

            for (j, (p, w)) in results.iter().enumerate() {
                copy_ctrl(
                    p,
                    dom_dim,
                    k,
                    to[j],
                    cs,
                    &mut ctrl_pts,
                    &mut temp_ctrl0,
                    &mut temp_ctrl1,
                );
                if k == dom_dim - 1 {
                    for (i, &wi) in w.iter().enumerate() {
                        weights[to[j] + i * cs] = wi;
                    }
                }
            }

            ntemp_ctrl[k] = nctrl_pts[k];
            cs *= ntemp_ctrl[k];

            emit(
                &self.progress,
                ProgressMsg::EncodeDimension { dim: k, ncurves },
            );
        }

        Ok((ctrl_pts, weights))
    }

    /// Adaptive encode: encode, estimate per-span error, insert knots at the
    /// midpoints of flagged spans, repeat. Stops when no spans are flagged,
    /// when control points would outnumber input points in any dimension, or
    /// at the optional round cap.
    pub fn adaptive_encode(
        &mut self,
        err_limit: f64,
        weighted: bool,
        extents: Option<&[f64]>,
        max_rounds: usize,
    ) -> MfaResult<()> {
        for round in 0.. {
            let nctrl_pts: Vec<usize> = (0..self.mfa.dom_dim)
                .map(|k| self.mfa.tmesh.all_knots[k].len() - self.mfa.p[k] - 1)
                .collect();

            let (ctrl_pts, weights) = self.encode(&nctrl_pts, weighted)?;
            let t = &mut self.mfa.tmesh.tensor_prods[0];
            t.nctrl_pts = nctrl_pts;
            t.ctrl_pts = ctrl_pts;
            t.weights = weights;

            if max_rounds > 0 && round >= max_rounds {
                break;
            }

            let outcome = if self.mfa.config.use_tmesh {
                let mut nk = NewKnots::new(self.mfa, self.input, self.progress.clone());
                nk.first_error_span(err_limit, extents, round + 1)?
            } else {
                self.new_knots_curve(err_limit, extents)?
            };

            match outcome {
                RefineOutcome::Refined { new_knots } => {
                    if self.mfa.config.use_tmesh {
                        // the root tensor is re-encoded over every knot next
                        // round, so all levels are active for it
                        self.mfa.tmesh.tensor_prods[0].level = round + 1;
                    }
                    emit(
                        &self.progress,
                        ProgressMsg::RefinementRound {
                            round,
                            new_knots,
                            max_err: self.mfa.max_err,
                        },
                    );
                }
                RefineOutcome::Done | RefineOutcome::CtrlExceedsInput => {
                    emit(
                        &self.progress,
                        ProgressMsg::RefinementRound {
                            round,
                            new_knots: 0,
                            max_err: self.mfa.max_err,
                        },
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Checks the quantities needed for approximation.
    fn quants(&self, nctrl_pts: &[usize]) -> MfaResult<()> {
        if !self.input.structured_grid() {
            return Err(MfaError::UnstructuredInput);
        }
        if self.mfa.p.len() != self.input.ndom_pts.len() {
            return Err(MfaError::DimMismatch {
                expected: self.mfa.p.len(),
                got: self.input.ndom_pts.len(),
            });
        }
        for dim in 0..self.mfa.dom_dim {
            if nctrl_pts[dim] <= self.mfa.p[dim] {
                return Err(MfaError::TooFewCtrlPts {
                    dim,
                    nctrl_pts: nctrl_pts[dim],
                    degree: self.mfa.p[dim],
                });
            }
            // not an error, but compression is impossible there
            if nctrl_pts[dim] > self.input.ndom_pts[dim] {
                emit(
                    &self.progress,
                    ProgressMsg::CompressionImpossible {
                        dim,
                        nctrl_pts: nctrl_pts[dim],
                        ndom_pts: self.input.ndom_pts[dim],
                    },
                );
            }
        }
        Ok(())
    }

    /// Assembles the basis matrix for dimension `k` at the input parameters,
    /// saving it on the model for later saved-basis decoding.
    fn fill_basis(&mut self, k: usize, nctrl_pts: usize) {
        let m = self.input.ndom_pts[k];
        let mut n = Mat::<f64>::zeros(m, nctrl_pts);
        let params = &self.input.param_grid()[k];

        for i in 0..m {
            let span = self.mfa.find_span(k, params[i], nctrl_pts);
            if self.mfa.config.use_tmesh {
                self.mfa.basis_funs(k, params[i], span, &mut n.as_mut(), i);
            } else {
                self.mfa.orig_basis_funs(k, params[i], span, &mut n.as_mut(), i);
            }
        }

        if self.mfa.basis.len() != self.mfa.dom_dim {
            self.mfa.basis = vec![Mat::new(); self.mfa.dom_dim];
        }
        self.mfa.basis[k] = n;
    }

    /// Solves one curve of control points: optional weight estimation, RHS
    /// assembly, rationalization, and the normal-equation solve. Returns the
    /// solved points and the curve's weights.
    #[allow(clippy::too_many_arguments)]
    fn ctrl_curve(
        &self,
        k: usize,
        n: MatRef<'_, f64>,
        ntn: MatRef<'_, f64>,
        co: usize,
        cs: usize,
        curve_id: usize,
        temp_ctrl0: &Mat<f64>,
        temp_ctrl1: &Mat<f64>,
        weighted: bool,
    ) -> (Mat<f64>, Vec<f64>) {
        let pt_dim = self.mfa.pt_dim();
        let last_dim = self.mfa.dom_dim - 1;

        // weights are estimated only on the final dimension of the sweep
        let temp_weights = if weighted && !self.mfa.config.no_weights && k == last_dim {
            let q = self.gather_curve_points(k, co, cs, temp_ctrl0, temp_ctrl1);
            self.weights_solve(&q, n, ntn, curve_id)
        } else {
            Col::from_fn(n.ncols(), |_| 1.0)
        };

        // first dimension reads the input domain; later dimensions alternate
        // between the double buffers, opposite to the writing parity
        let r = if k == 0 {
            self.rhs_from_domain(k, n, &temp_weights, co)
        } else if k % 2 == 1 {
            self.rhs_from_points(temp_ctrl0, n, &temp_weights, co, cs)
        } else {
            self.rhs_from_points(temp_ctrl1, n, &temp_weights, co, cs)
        };

        let ntn_rat = self.mfa.rationalize(&temp_weights, n);

        let p = if self.mfa.config.weigh_all_dims {
            solve_normal(ntn_rat.as_ref(), r.as_ref())
        } else {
            // unweighted solve for the domain coordinates, rational solve for
            // the range column only
            let mut p = solve_normal(ntn, r.as_ref());
            let p2 = solve_normal(ntn_rat.as_ref(), r.as_ref());
            for i in 0..p.nrows() {
                p[(i, pt_dim - 1)] = p2[(i, pt_dim - 1)];
            }
            p
        };

        let w: Vec<f64> = (0..temp_weights.nrows()).map(|i| temp_weights[i]).collect();
        (p, w)
    }

    /// Gathers the input slice of one curve (for weight estimation).
    fn gather_curve_points(
        &self,
        k: usize,
        co: usize,
        cs: usize,
        temp_ctrl0: &Mat<f64>,
        temp_ctrl1: &Mat<f64>,
    ) -> Mat<f64> {
        let m = self.input.ndom_pts[k];
        let pt_dim = self.mfa.pt_dim();
        let min_dim = self.mfa.min_dim;

        Mat::from_fn(m, pt_dim, |i, j| {
            if k == 0 {
                self.input.domain[(co + i * cs, min_dim + j)]
            } else if k % 2 == 1 {
                temp_ctrl0[(co + i * cs, j)]
            } else {
                temp_ctrl1[(co + i * cs, j)]
            }
        })
    }

    /// Right-hand side of the normal equations for a curve read from the
    /// original input domain (P&T eqs. 9.63/9.67, weighted form).
    fn rhs_from_domain(
        &self,
        k: usize,
        n: MatRef<'_, f64>,
        weights: &Col<f64>,
        co: usize,
    ) -> Mat<f64> {
        let ds = self.input.ds[k];
        let min_dim = self.mfa.min_dim;
        let pt_dim = self.mfa.pt_dim();
        let rk = Mat::from_fn(n.nrows(), pt_dim, |r, j| {
            self.input.domain[(co + r * ds, min_dim + j)]
        });
        self.rhs_core(n, weights, &rk)
    }

    /// Right-hand side for a curve read from an intermediate control slab.
    fn rhs_from_points(
        &self,
        in_pts: &Mat<f64>,
        n: MatRef<'_, f64>,
        weights: &Col<f64>,
        co: usize,
        cs: usize,
    ) -> Mat<f64> {
        let rk = Mat::from_fn(n.nrows(), in_pts.ncols(), |r, j| in_pts[(co + r * cs, j)]);
        self.rhs_core(n, weights, &rk)
    }

    fn rhs_core(&self, n: MatRef<'_, f64>, weights: &Col<f64>, rk: &Mat<f64>) -> Mat<f64> {
        let pt_dim = rk.ncols();
        let last = pt_dim - 1;

        let mut denom = vec![0.0; n.nrows()];
        for r in 0..n.nrows() {
            let mut d = 0.0;
            for c in 0..n.ncols() {
                d += n[(r, c)] * weights[c];
            }
            if self.mfa.config.unclamped_knots && d == 0.0 {
                d = 1.0;
            }
            denom[r] = d;
        }

        let mut out = Mat::<f64>::zeros(n.ncols(), pt_dim);
        if self.mfa.config.weigh_all_dims {
            for i in 0..n.ncols() {
                for j in 0..pt_dim {
                    let mut acc = 0.0;
                    for r in 0..n.nrows() {
                        acc += n[(r, i)] * weights[i] / denom[r] * rk[(r, j)];
                    }
                    out[(i, j)] = acc;
                }
            }
        } else {
            for i in 0..n.ncols() {
                for j in 0..last {
                    let mut acc = 0.0;
                    for r in 0..n.nrows() {
                        acc += n[(r, i)] * rk[(r, j)];
                    }
                    out[(i, j)] = acc;
                }
                let mut acc = 0.0;
                for r in 0..n.nrows() {
                    acc += n[(r, i)] * weights[i] / denom[r] * rk[(r, last)];
                }
                out[(i, last)] = acc;
            }
        }
        out
    }

    /// Per-curve weight estimation after Ma and Kruth [2]: build
    /// `M = N^T Q^2 N - N^T Q N (N^T N)^{-1} N^T Q N` from the curve's range
    /// coordinate, take the eigenvector of the smallest eigenvalue when it is
    /// sign-definite, otherwise search the expanding eigenspace with the
    /// linear program, and fall back to unit weights.
    fn weights_solve(
        &self,
        q: &Mat<f64>,
        n: MatRef<'_, f64>,
        ntn: MatRef<'_, f64>,
        curve_id: usize,
    ) -> Col<f64> {
        let nweights = n.ncols();
        let last = q.ncols() - 1;
        let unit = || Col::from_fn(nweights, |_| 1.0);

        let ntni = ntn
            .partial_piv_lu()
            .solve(Mat::<f64>::identity(nweights, nweights));

        // N^T scaled column-wise by the range coordinate and its square
        let mut ntq = Mat::<f64>::zeros(nweights, n.nrows());
        let mut ntq2 = Mat::<f64>::zeros(nweights, n.nrows());
        for i in 0..n.nrows() {
            let qi = q[(i, last)];
            for r in 0..nweights {
                ntq[(r, i)] = n[(i, r)] * qi;
                ntq2[(r, i)] = n[(i, r)] * qi * qi;
            }
        }

        let ntqn = &ntq * n;
        let ntq2n = &ntq2 * n;
        let m = ntq2n - &ntqn * &ntni * &ntqn;

        let evd = match m.self_adjoint_eigen(Side::Lower) {
            Ok(evd) => evd,
            Err(_) => {
                emit(
                    &self.progress,
                    ProgressMsg::DegenerateEigenvalues { curve: curve_id },
                );
                return unit();
            }
        };

        let ev = evd.U();
        let evals: Vec<f64> = evd.S().column_vector().iter().copied().collect();

        // eigenvector columns by ascending eigenvalue
        let mut order: Vec<usize> = (0..evals.len()).collect();
        order.sort_by(|&a, &b| evals[a].partial_cmp(&evals[b]).unwrap());

        // eigenvalues should be positive and distinct
        for w in order.windows(2) {
            if evals[w[0]] == 0.0 || evals[w[0]] == evals[w[1]] {
                emit(
                    &self.progress,
                    ProgressMsg::DegenerateEigenvalues { curve: curve_id },
                );
                return unit();
            }
        }

        // the eigenvector of the smallest eigenvalue, when sign-definite,
        // is the weight vector
        let smallest = order[0];
        let all_pos = (0..nweights).all(|j| ev[(j, smallest)] > 0.0);
        let all_neg = (0..nweights).all(|j| ev[(j, smallest)] < 0.0);
        if all_pos || all_neg {
            let sign = if all_pos { 1.0 } else { -1.0 };
            let mut w = Col::from_fn(nweights, |j| sign * ev[(j, smallest)]);
            scale_to_unit_max(&mut w);
            return w;
        }

        // mixed signs: search a non-negative combination in the expanding
        // eigenspace
        let params = &self.mfa.config.weight_params;
        let lp = BoundedSimplex;

        for ncols_used in 2..=nweights {
            let clamped = Mat::from_fn(nweights, ncols_used, |j, c| {
                let v = ev[(j, order[c])];
                if v.abs() < params.min_eigenvector_value {
                    0.0
                } else {
                    v
                }
            });

            if let Some(x) =
                lp.feasible_point(clamped.as_ref(), params.min_weight, params.max_weight)
            {
                let mut w = Col::from_fn(nweights, |j| {
                    (0..ncols_used).map(|c| x[c] * ev[(j, order[c])]).sum::<f64>()
                });
                if (0..nweights).all(|j| w[j] > 0.0) {
                    scale_to_unit_max(&mut w);
                    emit(
                        &self.progress,
                        ProgressMsg::WeightsFromEigenspace {
                            curve: curve_id,
                            num_eigenvectors: ncols_used,
                        },
                    );
                    return w;
                }
            }
        }

        emit(&self.progress, ProgressMsg::WeightFallback { curve: curve_id });
        unit()
    }

    // ------------------------------------------------------------------
    // curve-sampled refinement analysis
    // ------------------------------------------------------------------

    /// 1-d encode / 1-d decode refinement analysis: per dimension, fit
    /// sampled curves of the raw input, collect knot spans whose error
    /// exceeds the limit, and insert knots at their midpoints. Curve
    /// sampling halves its stride until the worst-curve error count stops
    /// changing for two consecutive step sizes.
    pub(crate) fn new_knots_curve(
        &mut self,
        err_limit: f64,
        extents: Option<&[f64]>,
    ) -> MfaResult<RefineOutcome> {
        let dom_dim = self.mfa.dom_dim;
        let pt_dim = self.mfa.pt_dim();
        let npts = self.input.npts();

        let mut new_knot_values: Vec<Vec<f64>> = vec![Vec::new(); dom_dim];
        let mut max_err_all: f64 = 0.0;

        for k in 0..dom_dim {
            let nctrl = self.mfa.tmesh.tensor_prods[0].nctrl_pts[k];
            let weights = Col::from_fn(nctrl, |_| 1.0);

            self.fill_basis(k, nctrl);
            let ntn = {
                let n = &self.mfa.basis[k];
                n.transpose() * n
            };

            let mut err_spans: BTreeSet<usize> = BTreeSet::new();
            let mut max_nerr = 0usize;
            let mut nsame_steps = 0usize;
            let mut n_step_sizes = 0usize;

            let ncurves = npts / self.input.ndom_pts[k];
            let mut s = (ncurves / 2).max(1);

            while s >= 1 && ncurves / s < self.mfa.config.max_num_curves {
                let mut new_max_nerr = false;

                for j in 0..ncurves {
                    // shift the start of the s-th curves by one per step size
                    if j >= n_step_sizes && (j - n_step_sizes) % s == 0 {
                        let n = &self.mfa.basis[k];
                        let r = {
                            let ds = self.input.ds[k];
                            let min_dim = self.mfa.min_dim;
                            let co = self.input.co[k][j];
                            let rk = Mat::from_fn(n.nrows(), pt_dim, |row, col| {
                                self.input.domain[(co + row * ds, min_dim + col)]
                            });
                            self.rhs_core(n.as_ref(), &weights, &rk)
                        };

                        let ntn_rat = self.mfa.rationalize(&weights, n.as_ref());
                        let mut p = solve_normal(ntn.as_ref(), r.as_ref());
                        let p2 = solve_normal(ntn_rat.as_ref(), r.as_ref());
                        for i in 0..p.nrows() {
                            p[(i, pt_dim - 1)] = p2[(i, pt_dim - 1)];
                        }

                        let (nerr, curve_max_err) = self.error_curve(
                            k,
                            self.input.co[k][j],
                            &p,
                            &weights,
                            extents,
                            &mut err_spans,
                            err_limit,
                        )?;
                        max_err_all = max_err_all.max(curve_max_err);

                        if nerr > max_nerr {
                            max_nerr = nerr;
                            new_max_nerr = true;
                        }
                    }
                }

                if max_nerr > 0 && !new_max_nerr {
                    nsame_steps += 1;
                }
                if nsame_steps == 2 {
                    break;
                }
                n_step_sizes += 1;

                if s == 1 {
                    break;
                }
                s /= 2;
            }

            let knots = &self.mfa.tmesh.all_knots[k];
            new_knot_values[k] = err_spans
                .iter()
                .map(|&span| (knots[span] + knots[span + 1]) / 2.0)
                .collect();
        }

        self.mfa.max_err = max_err_all;

        let total: usize = new_knot_values.iter().map(|v| v.len()).sum();
        if total == 0 {
            return Ok(RefineOutcome::Done);
        }

        // new knots would make control points outnumber input points
        for k in 0..dom_dim {
            let nctrl = self.mfa.tmesh.all_knots[k].len() - self.mfa.p[k] - 1;
            if nctrl + new_knot_values[k].len() >= self.input.ndom_pts[k] {
                return Ok(RefineOutcome::CtrlExceedsInput);
            }
        }

        for k in 0..dom_dim {
            let params = self.input.param_grid()[k].clone();
            for &value in &new_knot_values[k] {
                self.mfa.tmesh.insert_knot(k, value, 0, &params)?;
            }
        }

        Ok(RefineOutcome::Refined { new_knots: total })
    }

    /// Walks the input points of one curve along dimension `k`, decoding the
    /// supplied 1-d fit and flagging knot spans whose normalized error
    /// exceeds the limit. A span is flagged only when both halves of a split
    /// would retain an input parameter; the returned count includes points in
    /// unsplittable spans so the caller can identify the worst curves.
    #[allow(clippy::too_many_arguments)]
    fn error_curve(
        &self,
        k: usize,
        co: usize,
        ctrl_pts: &Mat<f64>,
        weights: &Col<f64>,
        extents: Option<&[f64]>,
        err_spans: &mut BTreeSet<usize>,
        err_limit: f64,
    ) -> MfaResult<(usize, f64)> {
        let decoder = Decoder::new(self.mfa, None)?;
        let tensor = &self.mfa.tmesh.tensor_prods[0];
        let pt_dim = self.mfa.pt_dim();
        let min_dim = self.mfa.min_dim;
        let params = &self.input.param_grid()[k];
        let knots = &self.mfa.tmesh.all_knots[k];

        let mut cpt = Col::<f64>::zeros(pt_dim);
        let mut nerr = 0usize;
        let mut worst: f64 = 0.0;
        let mut span = self.mfa.p[k];

        for i in 0..self.input.ndom_pts[k] {
            while knots[span + 1] < 1.0 && knots[span + 1] <= params[i] {
                span += 1;
            }

            decoder.curve_pt(k, params[i], ctrl_pts, weights, tensor, &mut cpt)?;

            let mut max_err: f64 = 0.0;
            for j in 0..pt_dim {
                let scale = extents.map_or(1.0, |e| e[min_dim + j]);
                let err = (cpt[j] - self.input.domain[(co + i * self.input.ds[k], min_dim + j)])
                    .abs()
                    / scale;
                max_err = max_err.max(err);
            }
            worst = worst.max(max_err);

            if max_err > err_limit {
                if !err_spans.contains(&span) {
                    let mid = (knots[span] + knots[span + 1]) / 2.0;
                    let split_left = params[..=i].iter().rev().any(|&u| {
                        u >= knots[span] && u < mid
                    });
                    let split_right = params[i..]
                        .iter()
                        .take_while(|&&u| u < knots[span + 1])
                        .any(|&u| u >= mid);
                    if split_left && split_right {
                        err_spans.insert(span);
                    }
                }
                // counted even when the span cannot be split; the total
                // identifies the worst curves
                nerr += 1;
            }
        }

        Ok((nerr, worst))
    }
}

fn scale_to_unit_max(w: &mut Col<f64>) {
    let mut max = f64::NEG_INFINITY;
    for i in 0..w.nrows() {
        max = max.max(w[i]);
    }
    for i in 0..w.nrows() {
        w[i] /= max;
    }
}

/// Scatters one solved curve into its destination: the final dimension goes
/// to the output lattice, earlier dimensions alternate between the two
/// temporary slabs (even dimensions write slab 0, odd write slab 1).
#[allow(clippy::too_many_arguments)]
fn copy_ctrl(
    p: &Mat<f64>,
    dom_dim: usize,
    k: usize,
    to: usize,
    cs: usize,
    ctrl_pts: &mut Mat<f64>,
    temp_ctrl0: &mut Mat<f64>,
    temp_ctrl1: &mut Mat<f64>,
) {
    let dst = if dom_dim == 1 || k == dom_dim - 1 {
        ctrl_pts
    } else if k % 2 == 0 {
        temp_ctrl0
    } else {
        temp_ctrl1
    };

    for i in 0..p.nrows() {
        dst.row_mut(to + i * cs).copy_from(p.row(i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::pointset::PointSet;

    fn sine_input(n: usize) -> PointSet {
        let domain = Mat::from_fn(n, 2, |i, j| {
            let x = i as f64 / (n - 1) as f64;
            if j == 0 {
                x
            } else {
                (4.0 * std::f64::consts::PI * x).sin()
            }
        });
        PointSet::structured(1, vec![n], domain).unwrap()
    }

    #[test]
    fn encode_rejects_unstructured_input() {
        let domain = Mat::from_fn(5, 2, |i, _| i as f64);
        let params = Mat::from_fn(5, 1, |i, _| i as f64 / 4.0);
        let input = PointSet::unstructured(1, domain, params).unwrap();

        let mut mfa =
            MfaData::new(vec![2], Some(vec![3]), 0, 1, ModelConfig::default()).unwrap();
        let mut encoder = Encoder::new(&mut mfa, &input, None);
        assert!(matches!(
            encoder.encode(&[3], false),
            Err(MfaError::UnstructuredInput)
        ));
    }

    #[test]
    fn adaptive_encode_of_fast_sine_terminates_within_ten_rounds() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc as StdArc;

        let input = sine_input(65);
        let mut mfa = MfaData::new(vec![3], None, 0, 1, ModelConfig::default()).unwrap();
        mfa.set_knots(&input).unwrap();

        let rounds = StdArc::new(AtomicUsize::new(0));
        let rounds_in_sink = rounds.clone();
        let (sink, handle) = crate::progress::closure_sink(256, move |msg| {
            if matches!(msg, ProgressMsg::RefinementRound { .. }) {
                rounds_in_sink.fetch_add(1, Ordering::SeqCst);
            }
        });
        {
            let mut encoder = Encoder::new(&mut mfa, &input, Some(sink));
            encoder.adaptive_encode(1e-4, false, None, 0).unwrap();
        }
        handle.join().ok();

        assert!(
            rounds.load(Ordering::SeqCst) <= 10,
            "took {} rounds",
            rounds.load(Ordering::SeqCst)
        );

        let nctrl = mfa.tmesh.tensor_prods[0].nctrl_pts[0];
        assert!(nctrl < 65, "refinement ran away: {} control points", nctrl);

        // the fit is tight at every input point
        let decoder = Decoder::new(&mfa, None).unwrap();
        let tensor = &mfa.tmesh.tensor_prods[0];
        let params = input.param_grid()[0].clone();
        let mut cpt = Col::<f64>::zeros(2);
        let mut max_err: f64 = 0.0;
        for (i, &u) in params.iter().enumerate() {
            decoder.vol_pt(&[u], &mut cpt, tensor, &[]).unwrap();
            max_err = max_err.max((cpt[1] - input.domain[(i, 1)]).abs());
        }
        assert!(max_err < 1e-3, "max_err = {}", max_err);
    }

    #[test]
    fn adaptive_error_is_nonincreasing_across_rounds() {
        let input = sine_input(65);

        let mut errs = Vec::new();
        for max_rounds in 1..=5usize {
            let mut mfa = MfaData::new(vec![3], None, 0, 1, ModelConfig::default()).unwrap();
            mfa.set_knots(&input).unwrap();
            {
                let mut encoder = Encoder::new(&mut mfa, &input, None);
                encoder.adaptive_encode(1e-4, false, None, max_rounds).unwrap();
            }

            let decoder = Decoder::new(&mfa, None).unwrap();
            let tensor = &mfa.tmesh.tensor_prods[0];
            let params = input.param_grid()[0].clone();
            let mut cpt = Col::<f64>::zeros(2);
            let mut max_err: f64 = 0.0;
            for (i, &u) in params.iter().enumerate() {
                decoder.vol_pt(&[u], &mut cpt, tensor, &[]).unwrap();
                max_err = max_err.max((cpt[1] - input.domain[(i, 1)]).abs());
            }
            errs.push(max_err);
        }

        for w in errs.windows(2) {
            // allow tie-breaking noise
            assert!(w[1] <= w[0] * 1.05, "{} -> {}", w[0], w[1]);
        }
    }
}
