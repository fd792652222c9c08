/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements Boehm knot insertion for curves and its separable n-dimensional sweep.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # insertion
//!
//! Knot insertion (Boehm's algorithm). The curve case is algorithm 5.1 of
//! Piegl & Tiller; the volume case generalizes algorithm 5.3 by sweeping the
//! curve operation over each dimension in turn, treating the control lattice
//! as a bundle of independent 1-d curves and double-buffering the result so
//! dimension `k + 1` reads what dimension `k` wrote.
//!
//! Two entry points exist: one for a knot not yet present in the T-mesh
//! (updates both the knot vectors and the control points) and one for a knot
//! already inserted globally (control points only, given the inserted
//! indices). Neither handles knot multiplicity above 1.

use faer::{Col, Mat};

use crate::error::{MfaError, MfaResult};
use crate::model::MfaData;
use crate::pointset::curve_offsets;
use crate::tmesh::{find_span_in, KnotIdx};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

impl MfaData {
    /// Inserts the knot `param` (one value per dimension) into the tensor at
    /// `tensor_idx`, updating the global knot vectors, the tensor's control
    /// points, weights, and knot bounds.
    ///
    /// `params_grid`, when given, refreshes the per-knot parameter-index
    /// references after the insertion.
    pub fn new_knot_insertion(
        &mut self,
        param: &[f64],
        tensor_idx: usize,
        params_grid: Option<&[Vec<f64>]>,
    ) -> MfaResult<()> {
        let tensor = &self.tmesh.tensor_prods[tensor_idx];
        let level = tensor.level;

        let result = new_vol_knot_ins(
            &self.p,
            &self.tmesh.all_knots,
            &self.tmesh.all_knot_levels,
            &tensor.ctrl_pts,
            &tensor.weights,
            &tensor.nctrl_pts,
            param,
            level,
        )?;

        self.tmesh.all_knots = result.knots;
        self.tmesh.all_knot_levels = result.knot_levels;

        let tensor = &mut self.tmesh.tensor_prods[tensor_idx];
        tensor.ctrl_pts = result.ctrl_pts;
        tensor.weights = result.weights;
        tensor.nctrl_pts = result.nctrl_pts;
        for dim in 0..self.dom_dim {
            tensor.knot_maxs[dim] += 1;
        }

        if let Some(grid) = params_grid {
            for dim in 0..self.dom_dim {
                self.reindex_knot_params(dim, &grid[dim]);
            }
        }

        Ok(())
    }

    /// Control-point-only insertion for a knot already added to the global
    /// knot vectors: `inserted_idx[k]` is the knot's index in the updated
    /// vector of dimension `k`.
    pub fn exist_knot_insertion(
        &mut self,
        inserted_idx: &[KnotIdx],
        param: &[f64],
        tensor_idx: usize,
    ) -> MfaResult<()> {
        let tensor = &self.tmesh.tensor_prods[tensor_idx];

        let (ctrl_pts, weights, nctrl_pts) = exist_vol_knot_ins(
            &self.p,
            &self.tmesh.all_knots,
            inserted_idx,
            &tensor.ctrl_pts,
            &tensor.weights,
            &tensor.nctrl_pts,
            param,
        )?;

        let tensor = &mut self.tmesh.tensor_prods[tensor_idx];
        tensor.ctrl_pts = ctrl_pts;
        tensor.weights = weights;
        tensor.nctrl_pts = nctrl_pts;

        Ok(())
    }

    fn reindex_knot_params(&mut self, dim: usize, params: &[f64]) {
        for j in 0..self.tmesh.all_knots[dim].len() {
            let knot = self.tmesh.all_knots[dim][j];
            self.tmesh.all_knot_param_idxs[dim][j] =
                params.partition_point(|&u| u < knot).saturating_sub(1);
        }
    }
}

struct VolInsResult {
    knots: Vec<Vec<f64>>,
    knot_levels: Vec<Vec<usize>>,
    ctrl_pts: Mat<f64>,
    weights: Col<f64>,
    nctrl_pts: Vec<usize>,
}

/// One curve's worth of control points and weights.
type Curve = (Mat<f64>, Vec<f64>);

/// Curve knot insertion, new-knot variant: alphas come from the old knot
/// vector. Returns the updated curve.
fn new_curve_knot_ins(
    p: usize,
    old_knots: &[f64],
    span: usize,
    u: f64,
    ctrl: &Mat<f64>,
    w: &[f64],
) -> Curve {
    curve_knot_ins_impl(p, span, ctrl, w, |i| {
        let l = span - p + 1;
        (u - old_knots[l + i]) / (old_knots[i + span + 1] - old_knots[l + i])
    })
}

/// Curve knot insertion, existing-knot variant: the knot is already in the
/// updated vector, so the span is one left of the inserted index and the
/// right end of each alpha denominator shifts by one.
fn exist_curve_knot_ins(
    p: usize,
    new_knots: &[f64],
    inserted_idx: KnotIdx,
    u: f64,
    ctrl: &Mat<f64>,
    w: &[f64],
) -> Curve {
    let span = inserted_idx - 1;
    curve_knot_ins_impl(p, span, ctrl, w, |i| {
        let l = span - p + 1;
        (u - new_knots[l + i]) / (new_knots[i + span + 2] - new_knots[l + i])
    })
}

/// Shared control-point update of algorithm 5.1: the new polygon keeps rows
/// `0 ..= span - p` and `span ..` of the old one (the latter shifted down by
/// one) and replaces the `p - 1` rows in between with affine combinations.
fn curve_knot_ins_impl<F: Fn(usize) -> f64>(
    p: usize,
    span: usize,
    ctrl: &Mat<f64>,
    w: &[f64],
    alpha: F,
) -> Curve {
    let n = ctrl.nrows();
    let cols = ctrl.ncols();

    let mut new_ctrl = Mat::<f64>::zeros(n + 1, cols);
    let mut new_w = vec![0.0; n + 1];

    let mut temp_ctrl = Mat::<f64>::zeros(p + 1, cols);
    let mut temp_w = vec![0.0; p + 1];

    for i in 0..=span - p {
        new_ctrl.row_mut(i).copy_from(ctrl.row(i));
        new_w[i] = w[i];
    }
    for i in span..n {
        new_ctrl.row_mut(i + 1).copy_from(ctrl.row(i));
        new_w[i + 1] = w[i];
    }
    for i in 0..=p {
        temp_ctrl.row_mut(i).copy_from(ctrl.row(span - p + i));
        temp_w[i] = w[span - p + i];
    }

    let l = span - p + 1;
    for i in 0..p {
        let a = alpha(i);
        for c in 0..cols {
            temp_ctrl[(i, c)] = a * temp_ctrl[(i + 1, c)] + (1.0 - a) * temp_ctrl[(i, c)];
        }
        temp_w[i] = a * temp_w[i + 1] + (1.0 - a) * temp_w[i];
    }

    new_ctrl.row_mut(l).copy_from(temp_ctrl.row(0));
    new_w[l] = temp_w[0];
    new_ctrl.row_mut(span).copy_from(temp_ctrl.row(p - 1));
    new_w[span] = temp_w[p - 1];

    for i in l + 1..span {
        new_ctrl.row_mut(i).copy_from(temp_ctrl.row(i - l));
        new_w[i] = temp_w[i - l];
    }

    (new_ctrl, new_w)
}

/// Gathers one curve of control points and weights out of the lattice.
fn gather_curve(
    all_ctrl: &Mat<f64>,
    all_w: &Col<f64>,
    len: usize,
    co: usize,
    cs: usize,
) -> (Mat<f64>, Vec<f64>) {
    let mut ctrl = Mat::<f64>::zeros(len, all_ctrl.ncols());
    let mut w = vec![0.0; len];
    for i in 0..len {
        ctrl.row_mut(i).copy_from(all_ctrl.row(co + i * cs));
        w[i] = all_w[co + i * cs];
    }
    (ctrl, w)
}

/// Scatters one curve back into the lattice.
fn scatter_curve(
    curve_ctrl: &Mat<f64>,
    curve_w: &[f64],
    all_ctrl: &mut Mat<f64>,
    all_w: &mut Col<f64>,
    co: usize,
    cs: usize,
) {
    for i in 0..curve_ctrl.nrows() {
        all_ctrl.row_mut(co + i * cs).copy_from(curve_ctrl.row(i));
        all_w[co + i * cs] = curve_w[i];
    }
}

/// Separable volume knot insertion, new-knot variant.
#[allow(clippy::too_many_arguments)]
fn new_vol_knot_ins(
    p: &[usize],
    old_knots: &[Vec<f64>],
    old_levels: &[Vec<usize>],
    old_ctrl: &Mat<f64>,
    old_w: &Col<f64>,
    nctrl_pts: &[usize],
    param: &[f64],
    level: usize,
) -> MfaResult<VolInsResult> {
    let dom_dim = p.len();
    let cols = old_ctrl.ncols();

    // span and duplicate check per dimension, before any mutation
    let mut spans = vec![0usize; dom_dim];
    for k in 0..dom_dim {
        let span = find_span_in(&old_knots[k], p[k], nctrl_pts[k], param[k]);
        if old_knots[k][span] == param[k] {
            return Err(MfaError::DuplicateKnot {
                dim: k,
                value: param[k],
            });
        }
        spans[k] = span;
    }

    // updated knot vectors
    let mut new_knots = old_knots.to_vec();
    let mut new_levels = old_levels.to_vec();
    for k in 0..dom_dim {
        new_knots[k].insert(spans[k] + 1, param[k]);
        new_levels[k].insert(spans[k] + 1, level);
    }

    let total: usize = nctrl_pts.iter().map(|&n| n + 1).product();
    let mut buf0 = Mat::<f64>::zeros(total, cols);
    let mut w0 = Col::<f64>::zeros(total);
    let mut buf1 = Mat::<f64>::zeros(total, cols);
    let mut w1 = Col::<f64>::zeros(total);

    buf1.submatrix_mut(0, 0, old_ctrl.nrows(), cols).copy_from(old_ctrl);
    for i in 0..old_w.nrows() {
        w1[i] = old_w[i];
    }

    let mut new_nctrl = nctrl_pts.to_vec();
    let mut cs = 1usize;

    for k in 0..dom_dim {
        let old_len = new_nctrl[k];
        let ncurves: usize = new_nctrl.iter().product::<usize>() / new_nctrl[k];
        let old_co = curve_offsets(ncurves, cs, old_len);
        new_nctrl[k] += 1;
        let new_co = curve_offsets(ncurves, cs, new_nctrl[k]);

        let ins = |ctrl: &Mat<f64>, w: &[f64]| -> Curve {
            new_curve_knot_ins(p[k], &old_knots[k], spans[k], param[k], ctrl, w)
        };

        if k % 2 == 0 {
            sweep_dim(&buf1, &w1, &mut buf0, &mut w0, &old_co, &new_co, cs, old_len, &ins);
        } else {
            sweep_dim(&buf0, &w0, &mut buf1, &mut w1, &old_co, &new_co, cs, old_len, &ins);
        }

        cs *= new_nctrl[k];
    }

    // odd dimension counts leave the result in buffer 0, even counts in buffer 1
    let (ctrl_pts, weights) = if dom_dim % 2 == 1 { (buf0, w0) } else { (buf1, w1) };
    let final_total: usize = new_nctrl.iter().product();

    Ok(VolInsResult {
        knots: new_knots,
        knot_levels: new_levels,
        ctrl_pts: ctrl_pts.subrows(0, final_total).to_owned(),
        weights: Col::from_fn(final_total, |i| weights[i]),
        nctrl_pts: new_nctrl,
    })
}

/// Separable volume knot insertion, existing-knot variant: the knot already
/// sits at `inserted_idx[k]` in the updated global vectors.
fn exist_vol_knot_ins(
    p: &[usize],
    all_knots: &[Vec<f64>],
    inserted_idx: &[KnotIdx],
    old_ctrl: &Mat<f64>,
    old_w: &Col<f64>,
    nctrl_pts: &[usize],
    param: &[f64],
) -> MfaResult<(Mat<f64>, Col<f64>, Vec<usize>)> {
    let dom_dim = p.len();
    let cols = old_ctrl.ncols();

    let total: usize = nctrl_pts.iter().map(|&n| n + 1).product();
    let mut buf0 = Mat::<f64>::zeros(total, cols);
    let mut w0 = Col::<f64>::zeros(total);
    let mut buf1 = Mat::<f64>::zeros(total, cols);
    let mut w1 = Col::<f64>::zeros(total);

    buf1.submatrix_mut(0, 0, old_ctrl.nrows(), cols).copy_from(old_ctrl);
    for i in 0..old_w.nrows() {
        w1[i] = old_w[i];
    }

    let mut new_nctrl = nctrl_pts.to_vec();
    let mut cs = 1usize;

    for k in 0..dom_dim {
        let old_len = new_nctrl[k];
        let ncurves: usize = new_nctrl.iter().product::<usize>() / new_nctrl[k];
        let old_co = curve_offsets(ncurves, cs, old_len);
        new_nctrl[k] += 1;
        let new_co = curve_offsets(ncurves, cs, new_nctrl[k]);

        let ins = |ctrl: &Mat<f64>, w: &[f64]| -> Curve {
            exist_curve_knot_ins(p[k], &all_knots[k], inserted_idx[k], param[k], ctrl, w)
        };

        if k % 2 == 0 {
            sweep_dim(&buf1, &w1, &mut buf0, &mut w0, &old_co, &new_co, cs, old_len, &ins);
        } else {
            sweep_dim(&buf0, &w0, &mut buf1, &mut w1, &old_co, &new_co, cs, old_len, &ins);
        }

        cs *= new_nctrl[k];
    }

    let (ctrl_pts, weights) = if dom_dim % 2 == 1 { (buf0, w0) } else { (buf1, w1) };
    let final_total: usize = new_nctrl.iter().product();

    Ok((
        ctrl_pts.subrows(0, final_total).to_owned(),
        Col::from_fn(final_total, |i| weights[i]),
        new_nctrl,
    ))
}

/// Applies the curve insertion to every curve of one dimension, reading from
/// one buffer and writing the other. Curves are independent; the parallel
/// build computes them with a map and scatters serially.
#[allow(clippy::too_many_arguments)]
fn sweep_dim<F>(
    src: &Mat<f64>,
    src_w: &Col<f64>,
    dst: &mut Mat<f64>,
    dst_w: &mut Col<f64>,
    old_co: &[usize],
    new_co: &[usize],
    cs: usize,
    old_len: usize,
    ins: &F,
) where
    F: Fn(&Mat<f64>, &[f64]) -> Curve + Sync,
{
    #[cfg(feature = "parallel")]
    let curves: Vec<Curve> = old_co
        .par_iter()
        .map(|&co| {
            let (ctrl, w) = gather_curve(src, src_w, old_len, co, cs);
            ins(&ctrl, &w)
        })
        .collect();

    #[cfg(not(feature = "parallel"))]
    let curves: Vec<Curve> = old_co
        .iter()
        .map(|&co| {
            let (ctrl, w) = gather_curve(src, src_w, old_len, co, cs);
            ins(&ctrl, &w)
        })
        .collect();

    for (j, (ctrl, w)) in curves.iter().enumerate() {
        scatter_curve(ctrl, w, dst, dst_w, new_co[j], cs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::decode::Decoder;
    use crate::pointset::PointSet;

    fn cubic_curve_model() -> MfaData {
        // p = 3, nctrl = 7, clamped knots {0,0,0,0,0.25,0.5,0.75,1,1,1,1}
        let n = 11;
        let domain = Mat::from_fn(n, 2, |i, j| {
            let x = i as f64 / (n - 1) as f64;
            if j == 0 {
                x
            } else {
                x * x * (1.0 - x)
            }
        });
        let input = PointSet::structured(1, vec![n], domain).unwrap();
        let mut mfa =
            MfaData::new(vec![3], Some(vec![7]), 0, 1, ModelConfig::default()).unwrap();
        mfa.set_knots(&input).unwrap();

        // hand-made control polygon, no encode needed for the invariance test
        let t = &mut mfa.tmesh.tensor_prods[0];
        t.ctrl_pts = Mat::from_fn(7, 2, |i, j| {
            let x = i as f64 / 6.0;
            if j == 0 {
                x
            } else {
                (2.5 * x).sin()
            }
        });
        t.weights = Col::from_fn(7, |_| 1.0);
        mfa
    }

    #[test]
    fn insertion_adds_one_ctrl_pt_and_keeps_the_curve() {
        let mut mfa = cubic_curve_model();

        let decoder = Decoder::new(&mfa, None).unwrap();
        let us: Vec<f64> = (0..=40).map(|i| i as f64 / 40.0).collect();
        let before: Vec<Vec<f64>> = us
            .iter()
            .map(|&u| {
                let mut out = Col::<f64>::zeros(2);
                decoder
                    .vol_pt(&[u], &mut out, &mfa.tmesh.tensor_prods[0], &[])
                    .unwrap();
                vec![out[0], out[1]]
            })
            .collect();
        drop(decoder);

        mfa.new_knot_insertion(&[0.3], 0, None).unwrap();

        assert_eq!(mfa.tmesh.tensor_prods[0].nctrl_pts, vec![8]);
        assert_eq!(mfa.tmesh.all_knots[0].len(), 12);
        assert_eq!(mfa.tmesh.all_knots[0][5], 0.3);

        let decoder = Decoder::new(&mfa, None).unwrap();
        for (i, &u) in us.iter().enumerate() {
            let mut out = Col::<f64>::zeros(2);
            decoder
                .vol_pt(&[u], &mut out, &mfa.tmesh.tensor_prods[0], &[])
                .unwrap();
            for c in 0..2 {
                assert!(
                    (out[c] - before[i][c]).abs() < 1e-13,
                    "u = {} coord {}: {} vs {}",
                    u,
                    c,
                    out[c],
                    before[i][c]
                );
            }
        }
    }

    #[test]
    fn duplicate_insertion_is_rejected() {
        let mut mfa = cubic_curve_model();
        assert!(matches!(
            mfa.new_knot_insertion(&[0.5], 0, None),
            Err(MfaError::DuplicateKnot { .. })
        ));
    }

    #[test]
    fn exist_insertion_matches_new_insertion() {
        use equator::assert;
        use faer::utils::approx::*;

        let mut mfa_new = cubic_curve_model();
        let mut mfa_b = cubic_curve_model();

        // new-knot path
        mfa_new.new_knot_insertion(&[0.3], 0, None).unwrap();

        // exist path: insert into the global vectors first, then update points
        let params: Vec<f64> = (0..11).map(|i| i as f64 / 10.0).collect();
        let idx = mfa_b.tmesh.insert_knot(0, 0.3, 0, &params).unwrap();
        mfa_b.exist_knot_insertion(&[idx], &[0.3], 0).unwrap();

        let ta = &mfa_new.tmesh.tensor_prods[0];
        let tb = &mfa_b.tmesh.tensor_prods[0];
        assert_eq!(ta.nctrl_pts, tb.nctrl_pts);

        let approx_eq = CwiseMat(ApproxEq::eps() * 128.0 * (ta.ctrl_pts.nrows() as f64));
        assert!(&ta.ctrl_pts ~ &tb.ctrl_pts);

        for i in 0..ta.weights.nrows() {
            assert!((ta.weights[i] - tb.weights[i]).abs() < 1e-14);
        }
    }
}
