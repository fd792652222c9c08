/////////////////////////////////////////////////////////////////////////////////////////////
//
// Stores the hierarchical knot structure and its list of tensor-product patches.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # tmesh
//!
//! The T-mesh is the global knot structure of a hierarchical NURBS model:
//! per-dimension knot vectors tagged with the refinement round (level) that
//! introduced each knot, plus an ordered list of [`TensorProduct`] patches.
//! Every input parameter is covered by the knot range of at least one tensor.
//!
//! A knot is *active* for a tensor when its level does not exceed the
//! tensor's level; basis functions of a tensor are built over its active
//! knots only. The *anchor* of a basis function is the active-knot index at
//! the center of its support.

use faer::{Col, Mat};
use serde::{Deserialize, Serialize};

use crate::error::{MfaError, MfaResult};

/// Index into a per-dimension knot vector.
pub type KnotIdx = usize;

/// `faer`'s `serde` feature implements (de)serialization for [`Mat`] but not
/// [`Col`], so [`TensorProduct::weights`] is (de)serialized through this
/// `Vec<f64>` shim instead.
mod col_f64_serde {
    use faer::Col;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(col: &Col<f64>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        col.iter().copied().collect::<Vec<f64>>().serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Col<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<f64>::deserialize(d)?;
        Ok(Col::from_fn(values.len(), |i| values[i]))
    }
}

/// Sentinel weight marking a duplicated (inactive) control point in an
/// odd-degree T-mesh corner. Control points carrying this weight are skipped
/// during T-mesh decoding.
pub const NAW: f64 = -1.0;

/// A rectangular patch of control points with its own knot bounds and level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorProduct {
    /// Lower knot index bound per dimension.
    pub knot_mins: Vec<KnotIdx>,

    /// Upper knot index bound per dimension.
    pub knot_maxs: Vec<KnotIdx>,

    /// Number of control points per dimension.
    pub nctrl_pts: Vec<usize>,

    /// Control points, one row per point, row-major lexicographic with
    /// dimension 0 varying fastest.
    pub ctrl_pts: Mat<f64>,

    /// One non-negative weight per control point ([`NAW`] marks skipped
    /// phantom points).
    #[serde(with = "col_f64_serde")]
    pub weights: Col<f64>,

    /// Refinement round at which this tensor was created.
    pub level: usize,
}

/// Global knots plus the ordered list of tensor products.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tmesh {
    pub dom_dim: usize,

    /// Polynomial degree per dimension.
    pub p: Vec<usize>,

    /// Knot values per dimension, non-decreasing in `[0, 1]`.
    pub all_knots: Vec<Vec<f64>>,

    /// Refinement level of each knot.
    pub all_knot_levels: Vec<Vec<usize>>,

    /// For each knot, the last input parameter index strictly less than it.
    pub all_knot_param_idxs: Vec<Vec<usize>>,

    /// Tensor products, in creation order.
    pub tensor_prods: Vec<TensorProduct>,
}

impl Tmesh {
    pub fn new(dom_dim: usize, p: Vec<usize>) -> Self {
        Tmesh {
            dom_dim,
            p,
            all_knots: vec![Vec::new(); dom_dim],
            all_knot_levels: vec![Vec::new(); dom_dim],
            all_knot_param_idxs: vec![Vec::new(); dom_dim],
            tensor_prods: Vec::new(),
        }
    }

    /// Allocates the per-dimension knot sequences for the given control point
    /// counts, all at level 0. Knot values are placed later by the model's
    /// knot policy.
    pub fn init_knots(&mut self, nctrl_pts: &[usize]) {
        for dim in 0..self.dom_dim {
            let nknots = nctrl_pts[dim] + self.p[dim] + 1;
            self.all_knots[dim] = vec![0.0; nknots];
            self.all_knot_levels[dim] = vec![0; nknots];
            self.all_knot_param_idxs[dim] = vec![0; nknots];
        }
    }

    /// Appends a tensor product spanning `[knot_mins, knot_maxs]` at `level`.
    ///
    /// The control point count per dimension is derived from the number of
    /// active (level-matching) knots inside the bounds, minus `p + 1`.
    /// Control points and weights are allocated empty; encoding populates
    /// them.
    pub fn append_tensor(&mut self, knot_mins: Vec<KnotIdx>, knot_maxs: Vec<KnotIdx>, level: usize) {
        let mut nctrl_pts = vec![0usize; self.dom_dim];
        for dim in 0..self.dom_dim {
            let active = (knot_mins[dim]..=knot_maxs[dim])
                .filter(|&j| self.all_knot_levels[dim][j] <= level)
                .count();
            nctrl_pts[dim] = active.saturating_sub(self.p[dim] + 1);
        }

        self.tensor_prods.push(TensorProduct {
            knot_mins,
            knot_maxs,
            nctrl_pts,
            ctrl_pts: Mat::new(),
            weights: Col::zeros(0),
            level,
        });
    }

    /// Inserts `value` into dimension `dim`'s global knot vector at `level`,
    /// maintaining the level and parameter-index bookkeeping and shifting the
    /// knot bounds of existing tensors.
    ///
    /// Returns the index of the inserted knot. Inserting a value already
    /// present is rejected; multiplicity above 1 is unsupported on this path.
    pub fn insert_knot(
        &mut self,
        dim: usize,
        value: f64,
        level: usize,
        params: &[f64],
    ) -> MfaResult<KnotIdx> {
        let knots = &mut self.all_knots[dim];
        let pos = knots.partition_point(|&k| k < value);
        if pos < knots.len() && knots[pos] == value {
            return Err(MfaError::DuplicateKnot { dim, value });
        }

        knots.insert(pos, value);
        self.all_knot_levels[dim].insert(pos, level);

        // last parameter strictly less than the new knot
        let param_idx = params.partition_point(|&u| u < value).saturating_sub(1);
        self.all_knot_param_idxs[dim].insert(pos, param_idx);

        for t in self.tensor_prods.iter_mut() {
            if t.knot_mins[dim] >= pos && t.knot_mins[dim] > 0 {
                t.knot_mins[dim] += 1;
            }
            if t.knot_maxs[dim] >= pos {
                t.knot_maxs[dim] += 1;
            }
        }

        Ok(pos)
    }

    /// Per-dimension ordered knot indices whose basis functions can be
    /// non-zero at `param`.
    ///
    /// The returned sets are a conservative superset: a control point whose
    /// anchor lies outside them is guaranteed to have zero basis value at
    /// `param`, while membership alone does not imply a non-zero value.
    pub fn anchors(&self, param: &[f64]) -> Vec<Vec<KnotIdx>> {
        (0..self.dom_dim)
            .map(|dim| {
                let knots = &self.all_knots[dim];
                let p = self.p[dim];
                let nctrl = knots.len() - p - 1;
                let span = find_span_in(knots, p, nctrl, param[dim]);
                let lo = span.saturating_sub(p);
                let hi = (span + p).min(knots.len() - 1);
                (lo..=hi).collect()
            })
            .collect()
    }

    /// Membership test of an anchor in the per-dimension anchor sets.
    pub fn in_anchors(&self, anchor: &[KnotIdx], anchors: &[Vec<KnotIdx>]) -> bool {
        anchor
            .iter()
            .zip(anchors.iter())
            .all(|(a, set)| set.binary_search(a).is_ok())
    }

    /// Anchor of the control point with local multi-index `ijk` in `tensor`:
    /// per dimension, the active knot at the center of the control point's
    /// support, counted from the tensor's lower knot bound.
    pub fn ctrl_pt_anchor(&self, tensor: &TensorProduct, ijk: &[usize]) -> Vec<KnotIdx> {
        (0..self.dom_dim)
            .map(|dim| {
                let target = ijk[dim] + (self.p[dim] + 1) / 2;
                self.nth_active_from(dim, tensor.knot_mins[dim], tensor.level, target)
            })
            .collect()
    }

    /// Local knot vectors (as global indices) of the basis function anchored
    /// at `anchor` for a tensor at `level`: `p + 2` consecutive active knots
    /// per dimension, centered on the anchor and clamped at the ends of the
    /// knot vector.
    pub fn knot_intersections(&self, anchor: &[KnotIdx], level: usize) -> Vec<Vec<KnotIdx>> {
        (0..self.dom_dim)
            .map(|dim| {
                let p = self.p[dim];
                let active: Vec<KnotIdx> = (0..self.all_knots[dim].len())
                    .filter(|&j| self.all_knot_levels[dim][j] <= level)
                    .collect();

                let pos = match active.binary_search(&anchor[dim]) {
                    Ok(pos) => pos,
                    Err(pos) => pos.min(active.len() - 1),
                };

                let want = p + 2;
                let start = pos
                    .saturating_sub((p + 1) / 2)
                    .min(active.len().saturating_sub(want));
                active[start..start + want].to_vec()
            })
            .collect()
    }

    /// Global index of the `n`-th active knot (level <= `level`) at or after
    /// `from` in dimension `dim`.
    fn nth_active_from(&self, dim: usize, from: KnotIdx, level: usize, n: usize) -> KnotIdx {
        let levels = &self.all_knot_levels[dim];
        let mut remaining = n;
        let mut idx = from;
        loop {
            if levels[idx] <= level {
                if remaining == 0 {
                    return idx;
                }
                remaining -= 1;
            }
            if idx + 1 >= levels.len() {
                return idx;
            }
            idx += 1;
        }
    }
}

/// Binary search for the span containing `u` in a single knot vector:
/// returns `i` such that `u` is in `[knots[i], knots[i + 1])`, clamped to
/// `[p, nctrl - 1]`; at `u == knots[nctrl]` returns `nctrl - 1`.
/// Algorithm 2.1, Piegl & Tiller, p. 68.
pub(crate) fn find_span_in(knots: &[f64], p: usize, nctrl: usize, u: f64) -> usize {
    if u == knots[nctrl] {
        return nctrl - 1;
    }

    let mut low = p;
    let mut high = nctrl;
    let mut mid = (low + high) / 2;
    while u < knots[mid] || u >= knots[mid + 1] {
        if u < knots[mid] {
            high = mid;
        } else {
            low = mid;
        }
        mid = (low + high) / 2;
    }

    mid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clamped_cubic_tmesh() -> Tmesh {
        // p = 3, nctrl = 7: knots {0,0,0,0,0.25,0.5,0.75,1,1,1,1}
        let mut tmesh = Tmesh::new(1, vec![3]);
        tmesh.init_knots(&[7]);
        tmesh.all_knots[0] = vec![0.0, 0.0, 0.0, 0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 1.0, 1.0];
        tmesh.append_tensor(vec![0], vec![10], 0);
        tmesh
    }

    #[test]
    fn append_tensor_derives_ctrl_counts_from_active_knots() {
        let tmesh = clamped_cubic_tmesh();
        assert_eq!(tmesh.tensor_prods[0].nctrl_pts, vec![7]);
    }

    #[test]
    fn find_span_clamps_to_valid_range() {
        let tmesh = clamped_cubic_tmesh();
        let knots = &tmesh.all_knots[0];

        assert_eq!(find_span_in(knots, 3, 7, 0.0), 3);
        assert_eq!(find_span_in(knots, 3, 7, 0.3), 4);
        assert_eq!(find_span_in(knots, 3, 7, 0.75), 6);
        // u == knots[nctrl] maps to the last valid span
        assert_eq!(find_span_in(knots, 3, 7, 1.0), 6);
    }

    #[test]
    fn insert_knot_shifts_tensor_bounds_and_rejects_duplicates() {
        let mut tmesh = clamped_cubic_tmesh();
        let params: Vec<f64> = (0..11).map(|i| i as f64 / 10.0).collect();

        let idx = tmesh.insert_knot(0, 0.3, 1, &params).unwrap();
        assert_eq!(idx, 5);
        assert_eq!(tmesh.all_knots[0][5], 0.3);
        assert_eq!(tmesh.all_knot_levels[0][5], 1);
        // last param strictly below 0.3 is index 2 (0.2)
        assert_eq!(tmesh.all_knot_param_idxs[0][5], 2);
        assert_eq!(tmesh.tensor_prods[0].knot_maxs[0], 11);

        assert!(matches!(
            tmesh.insert_knot(0, 0.3, 2, &params),
            Err(MfaError::DuplicateKnot { .. })
        ));
    }

    #[test]
    fn anchors_cover_the_nonzero_basis_functions() {
        let tmesh = clamped_cubic_tmesh();
        let anchors = tmesh.anchors(&[0.3]);
        // span of 0.3 is 4; superset is [1, 7]
        assert_eq!(anchors[0].first(), Some(&1));
        assert_eq!(anchors[0].last(), Some(&7));

        // control points 1..=4 are the nonzero ones at u = 0.3; all of their
        // anchors are members
        let t = &tmesh.tensor_prods[0];
        for i in 1..=4usize {
            let anchor = tmesh.ctrl_pt_anchor(t, &[i]);
            assert!(tmesh.in_anchors(&anchor, &anchors), "ctrl pt {}", i);
        }

        // the last control point is far from u = 0.3
        let anchor = tmesh.ctrl_pt_anchor(t, &[6]);
        assert!(!tmesh.in_anchors(&anchor, &anchors));
    }

    #[test]
    fn knot_intersections_return_contiguous_local_knots_at_level_zero() {
        let tmesh = clamped_cubic_tmesh();
        let t = &tmesh.tensor_prods[0];

        // control point 2 supports knots 2..=6
        let anchor = tmesh.ctrl_pt_anchor(t, &[2]);
        assert_eq!(anchor, vec![4]);
        let local = tmesh.knot_intersections(&anchor, t.level);
        assert_eq!(local[0], vec![2, 3, 4, 5, 6]);
    }
}
