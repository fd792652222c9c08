/////////////////////////////////////////////////////////////////////////////////////////////
//
// Holds input sample points and their parameterization over the unit cube.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # pointset
//!
//! Input sample points and their parameterization. A [`PointSet`] is either a
//! *structured* tensor grid, linearized row-major with dimension 0 varying
//! fastest, or an *unstructured* list of points with an explicit parameter
//! vector per point. Structured sets additionally carry the per-dimension
//! linearization strides and curve starting offsets that the separable encoder
//! and the knot-insertion sweep rely on.

use faer::Mat;
use serde::{Deserialize, Serialize};

use crate::error::{MfaError, MfaResult};

/// Parameter coordinates of the input points, in `[0, 1]` per dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Params {
    /// Structured: one ordered parameter sequence per domain dimension. The
    /// parameter vector of grid point `(i, j, ...)` is
    /// `(grid[0][i], grid[1][j], ...)`.
    Grid(Vec<Vec<f64>>),

    /// Unstructured: one row of `dom_dim` parameters per input point.
    List(Mat<f64>),
}

/// A set of input sample points over a `dom_dim`-dimensional parameter cube.
///
/// `domain` has one row per point; the first `dom_dim` columns are the
/// geometric position and the remaining columns the range values. Which
/// columns a model fits is chosen per model via `min_dim ..= max_dim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSet {
    /// Input points, one row per point.
    pub domain: Mat<f64>,

    /// Number of samples per dimension. Structured sets only; empty otherwise.
    pub ndom_pts: Vec<usize>,

    /// Domain dimensionality.
    pub dom_dim: usize,

    /// Parameter coordinates of every input point.
    pub params: Params,

    /// Stride of the linearization in each dimension (structured only).
    pub ds: Vec<usize>,

    /// Starting offsets of each curve in each dimension (structured only).
    /// `co[k][j]` is the linear index of the first point of the `j`-th curve
    /// along dimension `k`.
    pub co: Vec<Vec<usize>>,
}

impl PointSet {
    /// Creates a structured point set over a tensor grid.
    ///
    /// Parameters are derived per dimension from the grid coordinates,
    /// affinely mapped to `[0, 1]` (domain parameterization). A dimension
    /// whose coordinate is not strictly increasing along the grid (a closed
    /// curve, say) falls back to uniform parameters.
    pub fn structured(dom_dim: usize, ndom_pts: Vec<usize>, domain: Mat<f64>) -> MfaResult<Self> {
        if ndom_pts.len() != dom_dim {
            return Err(MfaError::DimMismatch {
                expected: dom_dim,
                got: ndom_pts.len(),
            });
        }
        let npts: usize = ndom_pts.iter().product();
        if domain.nrows() != npts {
            return Err(MfaError::DimMismatch {
                expected: npts,
                got: domain.nrows(),
            });
        }

        let ds = strides(&ndom_pts);
        let params = domain_params(dom_dim, &ndom_pts, &ds, &domain);
        let co = curve_offsets_all(&ndom_pts, &ds);

        Ok(PointSet {
            domain,
            ndom_pts,
            dom_dim,
            params: Params::Grid(params),
            ds,
            co,
        })
    }

    /// Creates an unstructured point set with an explicit parameter vector
    /// per point.
    pub fn unstructured(dom_dim: usize, domain: Mat<f64>, params: Mat<f64>) -> MfaResult<Self> {
        if params.ncols() != dom_dim {
            return Err(MfaError::DimMismatch {
                expected: dom_dim,
                got: params.ncols(),
            });
        }
        if params.nrows() != domain.nrows() {
            return Err(MfaError::DimMismatch {
                expected: domain.nrows(),
                got: params.nrows(),
            });
        }

        Ok(PointSet {
            domain,
            ndom_pts: Vec::new(),
            dom_dim,
            params: Params::List(params),
            ds: Vec::new(),
            co: Vec::new(),
        })
    }

    #[inline]
    pub fn structured_grid(&self) -> bool {
        matches!(self.params, Params::Grid(_))
    }

    #[inline]
    pub fn npts(&self) -> usize {
        self.domain.nrows()
    }

    /// Parameter sequences per dimension. Structured sets only.
    pub fn param_grid(&self) -> &[Vec<f64>] {
        match &self.params {
            Params::Grid(grid) => grid,
            Params::List(_) => panic!("param_grid() called on an unstructured point set"),
        }
    }

    /// Multidimensional grid index of the point at linear index `idx`.
    pub fn pt_ijk(&self, idx: usize, ijk: &mut [usize]) {
        let mut rem = idx;
        for dim in 0..self.dom_dim {
            ijk[dim] = rem % self.ndom_pts[dim];
            rem /= self.ndom_pts[dim];
        }
    }

    /// Parameter vector of the point at linear index `idx`.
    pub fn pt_params(&self, idx: usize, param: &mut [f64]) {
        match &self.params {
            Params::Grid(grid) => {
                let mut rem = idx;
                for dim in 0..self.dom_dim {
                    param[dim] = grid[dim][rem % self.ndom_pts[dim]];
                    rem /= self.ndom_pts[dim];
                }
            }
            Params::List(list) => {
                for dim in 0..self.dom_dim {
                    param[dim] = list[(idx, dim)];
                }
            }
        }
    }
}

/// Linearization stride of each dimension, dimension 0 varying fastest.
pub(crate) fn strides(npts: &[usize]) -> Vec<usize> {
    let mut ds = vec![1usize; npts.len()];
    for dim in 1..npts.len() {
        ds[dim] = ds[dim - 1] * npts[dim - 1];
    }
    ds
}

/// Starting offsets of the `ncurves` curves along one dimension, where a
/// curve steps with stride `cs` through `len` points.
///
/// Offsets advance by one inside a contiguous block of `cs` curves, then jump
/// over the `cs * len` points that the block's curves traverse.
pub(crate) fn curve_offsets(ncurves: usize, cs: usize, len: usize) -> Vec<usize> {
    let mut co = vec![0usize; ncurves];
    let mut coo = 0usize;
    for j in 1..ncurves {
        if j % cs != 0 {
            co[j] = co[j - 1] + 1;
        } else {
            co[j] = coo + cs * len;
            coo = co[j];
        }
    }
    co
}

fn curve_offsets_all(ndom_pts: &[usize], ds: &[usize]) -> Vec<Vec<usize>> {
    let npts: usize = ndom_pts.iter().product();
    (0..ndom_pts.len())
        .map(|dim| curve_offsets(npts / ndom_pts[dim], ds[dim], ndom_pts[dim]))
        .collect()
}

fn domain_params(
    dom_dim: usize,
    ndom_pts: &[usize],
    ds: &[usize],
    domain: &Mat<f64>,
) -> Vec<Vec<f64>> {
    let mut params = Vec::with_capacity(dom_dim);
    for dim in 0..dom_dim {
        let n = ndom_pts[dim];
        let coords: Vec<f64> = (0..n).map(|i| domain[(i * ds[dim], dim)]).collect();

        let monotone = coords.windows(2).all(|w| w[1] > w[0]);
        let extent = coords[n - 1] - coords[0];

        let p = if monotone && extent > 0.0 {
            coords.iter().map(|x| (x - coords[0]) / extent).collect()
        } else {
            (0..n).map(|i| i as f64 / (n - 1) as f64).collect()
        };
        params.push(p);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_2d(nx: usize, ny: usize) -> PointSet {
        let domain = Mat::from_fn(nx * ny, 3, |idx, j| {
            let i = idx % nx;
            let k = idx / nx;
            let x = i as f64 / (nx - 1) as f64;
            let y = k as f64 / (ny - 1) as f64;
            match j {
                0 => x,
                1 => y,
                _ => x * x + y * y,
            }
        });
        PointSet::structured(2, vec![nx, ny], domain).unwrap()
    }

    #[test]
    fn strides_and_offsets_cover_the_grid() {
        let ps = grid_2d(4, 3);
        assert_eq!(ps.ds, vec![1, 4]);

        // curves along dim 0: 3 of them, starting at rows 0, 4, 8
        assert_eq!(ps.co[0], vec![0, 4, 8]);
        // curves along dim 1: 4 of them, starting at rows 0..4
        assert_eq!(ps.co[1], vec![0, 1, 2, 3]);
    }

    #[test]
    fn params_recover_grid_coordinates() {
        let ps = grid_2d(5, 4);
        let mut param = [0.0f64; 2];
        ps.pt_params(7, &mut param); // i = 2, j = 1
        assert!((param[0] - 0.5).abs() < 1e-15);
        assert!((param[1] - 1.0 / 3.0).abs() < 1e-15);

        let mut ijk = [0usize; 2];
        ps.pt_ijk(7, &mut ijk);
        assert_eq!(ijk, [2, 1]);
    }

    #[test]
    fn non_monotone_coordinates_fall_back_to_uniform_params() {
        // closed curve: x goes 1 -> -1 -> 1
        let n = 9;
        let domain = Mat::from_fn(n, 2, |i, j| {
            let t = i as f64 / (n - 1) as f64;
            let angle = 2.0 * std::f64::consts::PI * t;
            if j == 0 {
                angle.cos()
            } else {
                angle.sin()
            }
        });
        let ps = PointSet::structured(1, vec![n], domain).unwrap();
        let grid = ps.param_grid();
        for i in 0..n {
            assert!((grid[0][i] - i as f64 / (n - 1) as f64).abs() < 1e-15);
        }
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let domain = Mat::<f64>::zeros(10, 2);
        assert!(PointSet::structured(1, vec![9], domain).is_err());
    }
}
