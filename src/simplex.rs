/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements a small dense two-phase simplex kernel for the bounded weight search.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # simplex
//!
//! Feasibility search used by the weight solver: given a column basis `C`
//! (eigenvectors of the Ma-Kruth matrix), find free coefficients `x` such
//! that every component of `C x` lies in `[lo, hi]`. The solver behind the
//! [`WeightLp`] trait is replaceable; the default is a dense two-phase
//! primal simplex, adequate for the small systems (tens of control points)
//! that per-curve weight estimation produces.

use faer::{Mat, MatRef};

/// Pluggable boundary for the linear-programming facility of the weight
/// solver.
pub trait WeightLp {
    /// Searches for `x` with `lo <= (columns * x)_j <= hi` for every row `j`.
    /// Returns `None` when no such point exists.
    fn feasible_point(&self, columns: MatRef<'_, f64>, lo: f64, hi: f64) -> Option<Vec<f64>>;
}

/// Dense two-phase primal simplex over the standard-form expansion of the
/// box-constrained system.
///
/// The free variables are split as `x = u - v` with `u, v >= 0`; upper bounds
/// get slacks and lower bounds get surpluses plus phase-1 artificials.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoundedSimplex;

impl WeightLp for BoundedSimplex {
    fn feasible_point(&self, columns: MatRef<'_, f64>, lo: f64, hi: f64) -> Option<Vec<f64>> {
        let n = columns.nrows(); // constraints per bound
        let m = columns.ncols(); // free variables

        // standard form: rows 0..n:   C u - C v + s       = hi
        //                rows n..2n:  C u - C v     - t + a = lo
        // column order: u (m), v (m), s (n), t (n), a (n)
        let nrows = 2 * n;
        let ncols = 2 * m + 3 * n;
        let art0 = 2 * m + 2 * n;

        let mut a = Mat::<f64>::zeros(nrows, ncols);
        let mut b = vec![0.0; nrows];
        for r in 0..n {
            for c in 0..m {
                a[(r, c)] = columns[(r, c)];
                a[(r, m + c)] = -columns[(r, c)];
                a[(n + r, c)] = columns[(r, c)];
                a[(n + r, m + c)] = -columns[(r, c)];
            }
            a[(r, 2 * m + r)] = 1.0; // slack
            a[(n + r, 2 * m + n + r)] = -1.0; // surplus
            a[(n + r, art0 + r)] = 1.0; // artificial
            b[r] = hi;
            b[n + r] = lo;
        }

        // starting basis: slacks for the upper rows, artificials for the lower
        let mut basis: Vec<usize> = (0..n)
            .map(|r| 2 * m + r)
            .chain((0..n).map(|r| art0 + r))
            .collect();

        // phase 1: minimize the sum of artificials
        let mut cost = vec![0.0; ncols];
        for c in art0..ncols {
            cost[c] = 1.0;
        }
        let objective = run_simplex(&mut a, &mut b, &mut basis, &cost, Some(art0));
        if objective > 1e-9 {
            return None;
        }

        // read off u - v from the basic solution
        let mut x = vec![0.0; m];
        for (r, &col) in basis.iter().enumerate() {
            if col < m {
                x[col] += b[r];
            } else if col < 2 * m {
                x[col - m] -= b[r];
            }
        }
        Some(x)
    }
}

/// Primal simplex with Bland's rule. Pivots `a`, `b`, and `basis` in place
/// and returns the final objective value of `cost`.
///
/// Columns at or past `forbidden_from` (the artificials, during phase 1 use)
/// never re-enter the basis.
fn run_simplex(
    a: &mut Mat<f64>,
    b: &mut [f64],
    basis: &mut [usize],
    cost: &[f64],
    forbidden_from: Option<usize>,
) -> f64 {
    let nrows = a.nrows();
    let ncols = a.ncols();
    let enter_limit = forbidden_from.unwrap_or(ncols);
    let eps = 1e-12;

    loop {
        // reduced costs: c_j - c_B^T B^{-1} A_j; the tableau is kept in
        // B^{-1}-applied form, so the multipliers are just the basic costs
        let mut entering = None;
        for j in 0..enter_limit {
            if basis.contains(&j) {
                continue;
            }
            let mut reduced = cost[j];
            for r in 0..nrows {
                reduced -= cost[basis[r]] * a[(r, j)];
            }
            // Bland: first improving column
            if reduced < -eps {
                entering = Some(j);
                break;
            }
        }

        let Some(enter) = entering else {
            break;
        };

        // column of the entering variable in the current tableau
        let col: Vec<f64> = (0..nrows).map(|r| a[(r, enter)]).collect();

        // ratio test, Bland tie-break on the leaving index
        let mut leave: Option<usize> = None;
        let mut best = f64::INFINITY;
        for r in 0..nrows {
            if col[r] > eps {
                let ratio = b[r] / col[r];
                if ratio < best - eps
                    || (ratio < best + eps && leave.map_or(true, |l| basis[r] < basis[l]))
                {
                    best = ratio;
                    leave = Some(r);
                }
            }
        }

        let Some(leave) = leave else {
            // unbounded direction; with a zero phase-2 objective this cannot
            // happen, and in phase 1 the objective is bounded below by zero
            break;
        };

        // pivot
        let pivot = a[(leave, enter)];
        for c in 0..ncols {
            a[(leave, c)] /= pivot;
        }
        b[leave] /= pivot;
        for r in 0..nrows {
            if r == leave {
                continue;
            }
            let factor = a[(r, enter)];
            if factor == 0.0 {
                continue;
            }
            for c in 0..ncols {
                let v = a[(leave, c)];
                a[(r, c)] -= factor * v;
            }
            b[r] -= factor * b[leave];
        }
        basis[leave] = enter;
    }

    let mut objective = 0.0;
    for r in 0..nrows {
        objective += cost[basis[r]] * b[r];
    }
    objective
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn check_feasible(columns: &Mat<f64>, x: &[f64], lo: f64, hi: f64) {
        for r in 0..columns.nrows() {
            let mut v = 0.0;
            for c in 0..columns.ncols() {
                v += columns[(r, c)] * x[c];
            }
            assert!(v >= lo - 1e-7 && v <= hi + 1e-7, "row {}: {}", r, v);
        }
    }

    #[test]
    fn identity_columns_are_trivially_feasible() {
        let columns = Mat::<f64>::identity(4, 4);
        let lp = BoundedSimplex;
        let x = lp.feasible_point(columns.as_ref(), 1.0, 10.0).unwrap();
        check_feasible(&columns, &x, 1.0, 10.0);
    }

    #[test]
    fn mixed_sign_single_column_is_infeasible() {
        // one column with entries of both signs cannot keep C x >= 1 everywhere
        let columns = Mat::from_fn(3, 1, |r, _| if r == 1 { -1.0 } else { 1.0 });
        let lp = BoundedSimplex;
        assert!(lp.feasible_point(columns.as_ref(), 1.0, 10.0).is_none());
    }

    #[test]
    fn two_columns_spanning_positive_orthant_are_feasible() {
        // columns (1, 1, 1) and (0.5, -1, 0.2): x = (2, 0.6) gives
        // (2.3, 1.4, 2.12), inside [1, 10]
        let columns = Mat::from_fn(3, 2, |r, c| match (r, c) {
            (_, 0) => 1.0,
            (0, _) => 0.5,
            (1, _) => -1.0,
            _ => 0.2,
        });
        let lp = BoundedSimplex;
        let x = lp.feasible_point(columns.as_ref(), 1.0, 10.0).unwrap();
        check_feasible(&columns, &x, 1.0, 10.0);
    }

    #[test]
    fn tight_box_forces_the_unique_solution() {
        // C = I2, bounds [2, 2]: only x = (2, 2) is feasible
        let columns = Mat::<f64>::identity(2, 2);
        let lp = BoundedSimplex;
        let x = lp.feasible_point(columns.as_ref(), 2.0, 2.0).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-7);
        assert!((x[1] - 2.0).abs() < 1e-7);
    }
}
