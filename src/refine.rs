/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements full-dimensional adaptive refinement: error spans, knot splitting, new tensors.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # refine
//!
//! Full-dimensional refinement for hierarchical models: decode the model at
//! every input point, flag the knot spans containing points whose normalized
//! error exceeds the limit, insert knots at the midpoints of the flagged
//! spans at the next refinement level, and append tensor products covering
//! the refined regions (expanded by `p - 1` knot lines on each side and
//! clamped to the knot range).
//!
//! A span is flagged only when each half of the split would still contain an
//! input parameter, so refinement cannot outrun the data.

use std::collections::BTreeSet;
use std::sync::Arc;

use faer::Col;

use crate::decode::{DecodeInfo, Decoder};
use crate::error::MfaResult;
use crate::model::MfaData;
use crate::pointset::PointSet;
use crate::progress::{emit, ProgressMsg, ProgressSink};
use crate::tmesh::KnotIdx;

/// Result of one refinement round. Ordinary control flow, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefineOutcome {
    /// No spans were flagged; the model meets the error limit everywhere it
    /// can be refined.
    Done,

    /// Knots were inserted; another encode round is required.
    Refined { new_knots: usize },

    /// Inserting the flagged knots would make control points outnumber the
    /// input points in some dimension; nothing was inserted.
    CtrlExceedsInput,
}

/// One round of full-dimensional knot refinement.
pub struct NewKnots<'a> {
    mfa: &'a mut MfaData,
    input: &'a PointSet,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl<'a> NewKnots<'a> {
    pub fn new(
        mfa: &'a mut MfaData,
        input: &'a PointSet,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        NewKnots {
            mfa,
            input,
            progress,
        }
    }

    /// Flags error spans at full dimensionality and splits them.
    ///
    /// `level` tags the inserted knots and the appended tensors; it must
    /// exceed every existing level so that newer knots are distinguishable.
    pub fn first_error_span(
        &mut self,
        err_limit: f64,
        extents: Option<&[f64]>,
        level: usize,
    ) -> MfaResult<RefineOutcome> {
        let dom_dim = self.mfa.dom_dim;
        let pt_dim = self.mfa.pt_dim();
        let min_dim = self.mfa.min_dim;
        let npts = self.input.npts();

        let mut err_spans: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); dom_dim];
        let mut max_err_all: f64 = 0.0;

        {
            let decoder = Decoder::new(self.mfa, None)?;
            let tensor = &self.mfa.tmesh.tensor_prods[0];
            let mut di = DecodeInfo::new(self.mfa, &[]);
            let mut param = vec![0.0; dom_dim];
            let mut cpt = Col::<f64>::zeros(pt_dim);

            for idx in 0..npts {
                self.input.pt_params(idx, &mut param);
                decoder.vol_pt_with_info(&param, &mut cpt, &mut di, tensor, &[])?;

                let mut max_err: f64 = 0.0;
                for j in 0..pt_dim {
                    let scale = extents.map_or(1.0, |e| e[min_dim + j]);
                    let err =
                        (cpt[j] - self.input.domain[(idx, min_dim + j)]).abs() / scale;
                    max_err = max_err.max(err);
                }
                max_err_all = max_err_all.max(max_err);

                if max_err > err_limit {
                    for k in 0..dom_dim {
                        let span = self.mfa.find_span_model(k, param[k]);
                        if !err_spans[k].contains(&span) && self.splittable(k, span) {
                            err_spans[k].insert(span);
                        }
                    }
                }
            }
        }

        self.mfa.max_err = max_err_all;

        let total: usize = err_spans.iter().map(|s| s.len()).sum();
        if total == 0 {
            return Ok(RefineOutcome::Done);
        }

        // refuse rounds that would leave more control points than input points
        for k in 0..dom_dim {
            let nctrl = self.mfa.tmesh.all_knots[k].len() - self.mfa.p[k] - 1;
            if nctrl + err_spans[k].len() >= self.input.ndom_pts[k] {
                return Ok(RefineOutcome::CtrlExceedsInput);
            }
        }

        // midpoint values must be read before any insertion shifts the spans
        let new_values: Vec<Vec<f64>> = (0..dom_dim)
            .map(|k| {
                let knots = &self.mfa.tmesh.all_knots[k];
                err_spans[k]
                    .iter()
                    .map(|&span| (knots[span] + knots[span + 1]) / 2.0)
                    .collect()
            })
            .collect();

        // ascending insertion keeps previously returned indices stable
        let mut inserted: Vec<Vec<KnotIdx>> = vec![Vec::new(); dom_dim];
        for k in 0..dom_dim {
            let params = self.input.param_grid()[k].clone();
            for &value in &new_values[k] {
                let idx = self.mfa.tmesh.insert_knot(k, value, level, &params)?;
                inserted[k].push(idx);
            }
        }

        self.append_refined_tensors(&inserted, level);

        emit(
            &self.progress,
            ProgressMsg::Message {
                message: format!("refinement level {}: inserted {} knots", level, total),
            },
        );

        Ok(RefineOutcome::Refined { new_knots: total })
    }

    /// Both halves of the span must keep at least one input parameter.
    fn splittable(&self, k: usize, span: usize) -> bool {
        let knots = &self.mfa.tmesh.all_knots[k];
        let lo = knots[span];
        let hi = knots[span + 1];
        if hi <= lo {
            return false;
        }
        let mid = (lo + hi) / 2.0;

        let params = &self.input.param_grid()[k];
        let below_lo = params.partition_point(|&u| u < lo);
        let below_mid = params.partition_point(|&u| u < mid);
        let below_hi = params.partition_point(|&u| u < hi);

        below_mid > below_lo && below_hi > below_mid
    }

    /// Appends one tensor per existing tensor that received knots, spanning
    /// the inserted indices expanded by `p - 1` lines per side.
    fn append_refined_tensors(&mut self, inserted: &[Vec<KnotIdx>], level: usize) {
        let dom_dim = self.mfa.dom_dim;
        let ntensors = self.mfa.tmesh.tensor_prods.len();

        let mut appended = Vec::new();
        for i in 0..ntensors {
            let t = &self.mfa.tmesh.tensor_prods[i];

            let mut knot_mins = vec![0usize; dom_dim];
            let mut knot_maxs = vec![0usize; dom_dim];
            let mut covered = true;

            for j in 0..dom_dim {
                let expand = self.mfa.p[j].saturating_sub(1);
                let nknots = self.mfa.tmesh.all_knots[j].len();

                let inside: Vec<KnotIdx> = inserted[j]
                    .iter()
                    .copied()
                    .filter(|&idx| idx > t.knot_mins[j] && idx <= t.knot_maxs[j])
                    .collect();

                match (inside.iter().min(), inside.iter().max()) {
                    (Some(&lo), Some(&hi)) => {
                        knot_mins[j] = lo.saturating_sub(expand);
                        knot_maxs[j] = (hi + expand).min(nknots - 1);
                    }
                    _ => {
                        covered = false;
                        break;
                    }
                }
            }

            if covered {
                appended.push((knot_mins, knot_maxs));
            }
        }

        for (knot_mins, knot_maxs) in appended {
            self.mfa.tmesh.append_tensor(knot_mins, knot_maxs, level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::encode::Encoder;
    use faer::Mat;

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
    fn refined_rounds_append_tensors_at_increasing_levels() {
        let input = sine_input(65);
        let config = ModelConfig::builder().use_tmesh(true).build();
        let mut mfa = MfaData::new(vec![3], None, 0, 1, config).unwrap();
        mfa.set_knots(&input).unwrap();

        {
            let mut encoder = Encoder::new(&mut mfa, &input, None);
            encoder.adaptive_encode(1e-2, false, None, 3).unwrap();
        }

        // refinement appended at least one tensor beyond the root
        assert!(mfa.tmesh.tensor_prods.len() > 1);

        // levels are strictly increasing with appearance order past the root
        for t in &mfa.tmesh.tensor_prods[1..] {
            assert!(t.level >= 1);
        }

        // every inserted knot carries a level above 0 and lies strictly
        // inside (0, 1)
        let levels = &mfa.tmesh.all_knot_levels[0];
        let knots = &mfa.tmesh.all_knots[0];
        assert!(levels.iter().any(|&l| l > 0));
        for (j, &l) in levels.iter().enumerate() {
            if l > 0 {
                assert!(knots[j] > 0.0 && knots[j] < 1.0);
            }
        }
    }

    #[test]
    fn coverage_invariant_holds_after_refinement() {
        let input = sine_input(33);
        let config = ModelConfig::builder().use_tmesh(true).build();
        let mut mfa = MfaData::new(vec![2], None, 0, 1, config).unwrap();
        mfa.set_knots(&input).unwrap();

        {
            let mut encoder = Encoder::new(&mut mfa, &input, None);
            encoder.adaptive_encode(1e-2, false, None, 2).unwrap();
        }

        // every input parameter is covered by the root tensor's knot range
        let t = &mfa.tmesh.tensor_prods[0];
        let knots = &mfa.tmesh.all_knots[0];
        let lo = knots[t.knot_mins[0]];
        let hi = knots[t.knot_maxs[0]];
        for &u in &input.param_grid()[0] {
            assert!(u >= lo && u <= hi);
        }
    }
}
