//! Vertical interpolation between pressure grids.
//!
//! All grids are ascending (usually `ln(p)` with the top of the atmosphere
//! first). Values outside the source grid are clamped to the boundary value,
//! never extrapolated.
//!
//! Tangent-linear functions return the perturbation of the interpolated
//! profile. Adjoint functions accumulate (`+=`) into their adjoint outputs and
//! zero the incoming adjoint of the interpolated profile as it is consumed.

use smallvec::SmallVec;

use crate::error::{OdpsError, Result};

/// Smallest layer width or overlap sum accepted by [`layer_avg`].
const SMALL_DIFF: f64 = 1.0e-20;

/// Bracketing source indices for one target point.
///
/// Either `k2 == k1 + 1` with `x[k1] <= u <= x[k2]`, or `k1 == k2` when the
/// target point lies outside the source grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpIndex {
    /// Lower (upper-atmosphere side) source index
    pub k1: usize,
    /// Upper (surface side) source index
    pub k2: usize,
}

/// Find the bracketing source indices for every target abscissa.
///
/// Both `x` and `u` must be ascending. This is not checked.
pub fn compute_interp_index(x: &[f64], u: &[f64]) -> Vec<InterpIndex> {
    debug_assert!(!x.is_empty());
    debug_assert!(x.windows(2).all(|w| w[0] <= w[1]));
    debug_assert!(u.windows(2).all(|w| w[0] <= w[1]));

    let n = x.len();
    // Since `u` is ascending, the search can resume where the previous
    // point ended
    let mut k = 0;
    u.iter()
        .map(|&ui| {
            if ui <= x[0] {
                InterpIndex { k1: 0, k2: 0 }
            } else if ui >= x[n - 1] {
                InterpIndex {
                    k1: n - 1,
                    k2: n - 1,
                }
            } else {
                while k + 1 < n - 1 && x[k + 1] < ui {
                    k += 1;
                }
                InterpIndex { k1: k, k2: k + 1 }
            }
        })
        .collect()
}

/// Weight of the upper bracket point: `(u - x1) / (x2 - x1)`.
#[inline]
fn fraction(x: &[f64], u: f64, idx: InterpIndex) -> f64 {
    (u - x[idx.k1]) / (x[idx.k2] - x[idx.k1])
}

/// Piecewise-linear interpolation using precomputed indices.
///
/// `index` has one entry per target abscissa in `u`.
pub fn interpolate_profile(index: &[InterpIndex], y: &[f64], x: &[f64], u: &[f64]) -> Vec<f64> {
    index
        .iter()
        .zip(u)
        .map(|(&idx, &ui)| {
            if idx.k1 == idx.k2 {
                y[idx.k1]
            } else {
                // Written so that f == 0 and f == 1 reproduce the end points
                let f = fraction(x, ui, idx);
                (1. - f) * y[idx.k1] + f * y[idx.k2]
            }
        })
        .collect()
}

/// Tangent-linear of [`interpolate_profile`] with respect to `y` only.
pub fn interpolate_profile_tl(
    index: &[InterpIndex],
    x: &[f64],
    u: &[f64],
    y_tl: &[f64],
) -> Vec<f64> {
    index
        .iter()
        .zip(u)
        .map(|(&idx, &ui)| {
            if idx.k1 == idx.k2 {
                y_tl[idx.k1]
            } else {
                let f = fraction(x, ui, idx);
                (1. - f) * y_tl[idx.k1] + f * y_tl[idx.k2]
            }
        })
        .collect()
}

/// Tangent-linear of [`interpolate_profile`] with respect to `y` and the
/// target abscissas `u`.
pub fn interpolate_profile_tl_u(
    index: &[InterpIndex],
    y: &[f64],
    x: &[f64],
    u: &[f64],
    y_tl: &[f64],
    u_tl: &[f64],
) -> Vec<f64> {
    index
        .iter()
        .zip(u)
        .zip(u_tl)
        .map(|((&idx, &ui), &ui_tl)| {
            if idx.k1 == idx.k2 {
                y_tl[idx.k1]
            } else {
                let dx = x[idx.k2] - x[idx.k1];
                let dy = y[idx.k2] - y[idx.k1];
                let y1_tl = y_tl[idx.k1];
                y1_tl + (y_tl[idx.k2] - y1_tl) * fraction(x, ui, idx) + dy / dx * ui_tl
            }
        })
        .collect()
}

/// Tangent-linear of [`interpolate_profile`] with respect to `y` and the
/// source abscissas `x`.
pub fn interpolate_profile_tl_x(
    index: &[InterpIndex],
    y: &[f64],
    x: &[f64],
    u: &[f64],
    y_tl: &[f64],
    x_tl: &[f64],
) -> Vec<f64> {
    index
        .iter()
        .zip(u)
        .map(|(&idx, &ui)| {
            if idx.k1 == idx.k2 {
                y_tl[idx.k1]
            } else {
                let (x1, x2) = (x[idx.k1], x[idx.k2]);
                let dx = x2 - x1;
                let dy = y[idx.k2] - y[idx.k1];
                let y1_tl = y_tl[idx.k1];
                y1_tl
                    + (y_tl[idx.k2] - y1_tl) * (ui - x1) / dx
                    + dy * (ui - x2) / (dx * dx) * x_tl[idx.k1]
                    - dy * (ui - x1) / (dx * dx) * x_tl[idx.k2]
            }
        })
        .collect()
}

/// Adjoint of [`interpolate_profile_tl`].
///
/// Accumulates into `y_ad` and zeroes `y_int_ad`.
pub fn interpolate_profile_ad(
    index: &[InterpIndex],
    x: &[f64],
    u: &[f64],
    y_int_ad: &mut [f64],
    y_ad: &mut [f64],
) {
    for ((&idx, &ui), y_int_ad) in index.iter().zip(u).zip(y_int_ad.iter_mut()).rev() {
        if idx.k1 == idx.k2 {
            y_ad[idx.k1] += *y_int_ad;
        } else {
            let f = fraction(x, ui, idx);
            y_ad[idx.k1] += (1. - f) * *y_int_ad;
            y_ad[idx.k2] += f * *y_int_ad;
        }
        *y_int_ad = 0.;
    }
}

/// Adjoint of [`interpolate_profile_tl_u`].
///
/// Accumulates into `y_ad` and `u_ad` and zeroes `y_int_ad`.
pub fn interpolate_profile_ad_u(
    index: &[InterpIndex],
    y: &[f64],
    x: &[f64],
    u: &[f64],
    y_int_ad: &mut [f64],
    y_ad: &mut [f64],
    u_ad: &mut [f64],
) {
    for (i, &idx) in index.iter().enumerate().rev() {
        let ad = y_int_ad[i];
        if idx.k1 == idx.k2 {
            y_ad[idx.k1] += ad;
        } else {
            let dx = x[idx.k2] - x[idx.k1];
            let dy = y[idx.k2] - y[idx.k1];
            let f = fraction(x, u[i], idx);
            u_ad[i] += dy / dx * ad;
            y_ad[idx.k1] += (1. - f) * ad;
            y_ad[idx.k2] += f * ad;
        }
        y_int_ad[i] = 0.;
    }
}

/// Adjoint of [`interpolate_profile_tl_x`].
///
/// Accumulates into `y_ad` and `x_ad` and zeroes `y_int_ad`.
pub fn interpolate_profile_ad_x(
    index: &[InterpIndex],
    y: &[f64],
    x: &[f64],
    u: &[f64],
    y_int_ad: &mut [f64],
    y_ad: &mut [f64],
    x_ad: &mut [f64],
) {
    for (i, &idx) in index.iter().enumerate().rev() {
        let ad = y_int_ad[i];
        if idx.k1 == idx.k2 {
            y_ad[idx.k1] += ad;
        } else {
            let (x1, x2) = (x[idx.k1], x[idx.k2]);
            let dx = x2 - x1;
            let dy = y[idx.k2] - y[idx.k1];
            let f = (u[i] - x1) / dx;
            x_ad[idx.k2] -= dy * (u[i] - x1) / (dx * dx) * ad;
            x_ad[idx.k1] += dy * (u[i] - x2) / (dx * dx) * ad;
            y_ad[idx.k1] += (1. - f) * ad;
            y_ad[idx.k2] += f * ad;
        }
        y_int_ad[i] = 0.;
    }
}

/// Layer averaging weights from a source layer grid onto a target layer grid.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    /// Range of source layers overlapping each target layer (inclusive).
    pub index: Vec<InterpIndex>,
    /// Weights of the source layers `index[k].k1..=index[k].k2`, summing to one.
    pub weights: Vec<SmallVec<[f64; 8]>>,
}

impl LayerWeights {
    /// Number of target layers.
    pub fn n_layers(&self) -> usize {
        self.index.len()
    }

    /// Average a source layer profile onto target layer `k`.
    pub fn average(&self, k: usize, source: impl Fn(usize) -> f64) -> f64 {
        let idx = self.index[k];
        (idx.k1..=idx.k2)
            .zip(&self.weights[k])
            .map(|(j, w)| w * source(j))
            .sum()
    }

    /// Adjoint of [`LayerWeights::average`]: spread `ad` back over the source
    /// layers of target layer `k`.
    pub fn average_ad(&self, k: usize, ad: f64, mut source_ad: impl FnMut(usize, f64)) {
        let idx = self.index[k];
        for (j, w) in (idx.k1..=idx.k2).zip(&self.weights[k]) {
            source_ad(j, w * ad);
        }
    }
}

/// Compute layer averaging weights.
///
/// Both grids are ascending level abscissas: `target` has `n + 1` levels
/// bounding `n` target layers and `source` has `m + 1` levels bounding `m`
/// source layers. Each target layer takes the overlap-weighted mean of the
/// source layers it covers. The parts of a target layer that lie beyond the
/// source grid are attributed to the nearest boundary source layer.
pub fn layer_avg(target: &[f64], source: &[f64]) -> Result<LayerWeights> {
    debug_assert!(target.len() >= 2 && source.len() >= 2);

    let n = target.len() - 1;
    let m = source.len() - 1;

    // Source layer j spans [lower(j), upper(j)], with the outer boundaries
    // pushed to infinity
    let lower = |j: usize| {
        if j == 0 {
            f64::NEG_INFINITY
        } else {
            source[j]
        }
    };
    let upper = |j: usize| {
        if j == m - 1 {
            f64::INFINITY
        } else {
            source[j + 1]
        }
    };

    let mut index = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);
    for k in 0..n {
        let (z1, z2) = (target[k], target[k + 1]);
        let width = z2 - z1;
        if width.abs() < SMALL_DIFF {
            return Err(OdpsError::DegenerateLayer { index: k, width });
        }

        let k1 = (0..m).find(|&j| upper(j) > z1).unwrap_or(m - 1);
        let k2 = (k1..m).find(|&j| upper(j) >= z2).unwrap_or(m - 1);

        let mut w: SmallVec<[f64; 8]> = (k1..=k2)
            .map(|j| (upper(j).min(z2) - lower(j).max(z1)).max(0.))
            .collect();
        let total: f64 = w.iter().sum();
        if total < SMALL_DIFF {
            return Err(OdpsError::DegenerateLayer {
                index: k,
                width: total,
            });
        }
        for w in &mut w {
            *w /= total;
        }

        index.push(InterpIndex { k1, k2 });
        weights.push(w);
    }

    Ok(LayerWeights { index, weights })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odps::tests::perturbation;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn simple_interpolation() {
        let x = [1., 2., 3.];
        let y = [10., 20., 30.];
        let u = [0.5, 1.5, 2.5, 4.];
        let index = compute_interp_index(&x, &u);
        assert_eq!(
            index,
            [
                InterpIndex { k1: 0, k2: 0 },
                InterpIndex { k1: 0, k2: 1 },
                InterpIndex { k1: 1, k2: 2 },
                InterpIndex { k1: 2, k2: 2 },
            ]
        );
        let y_int = interpolate_profile(&index, &y, &x, &u);
        assert_eq!(y_int, [10., 15., 25., 30.]);
    }

    #[test]
    fn boundary_values_are_exact() {
        let x = [-3.2, -1.1, 0.4, 2.9];
        let y = [0.3, 7.7, -2.1, 4.4];
        let u = [-10., -3.3, 3.0, 50.];
        let y_int = interpolate_profile(&compute_interp_index(&x, &u), &y, &x, &u);
        assert_eq!(y_int, [0.3, 0.3, 4.4, 4.4]);
    }

    #[test]
    fn coincident_points_are_exact() {
        let x = [0.1, 0.7, 1.9, 2.3, 5.0];
        let y = [1.234, -5.678, 9.1011, 0.1213, 14.15];
        let y_int = interpolate_profile(&compute_interp_index(&x, &x), &y, &x, &x);
        assert_eq!(y_int, y);
    }

    #[test]
    fn tl_matches_finite_difference() {
        let x = [0., 1., 2.5, 4.];
        let y = [1., 3., -2., 5.];
        let u = [0.5, 2., 3.];
        let y_tl = perturbation(4, 1);
        let u_tl = perturbation(3, 2);
        let index = compute_interp_index(&x, &u);

        let eps = 1e-6;
        let y_p: Vec<_> = y.iter().zip(&y_tl).map(|(y, d)| y + eps * d).collect();
        let u_p: Vec<_> = u.iter().zip(&u_tl).map(|(u, d)| u + eps * d).collect();
        let base = interpolate_profile(&index, &y, &x, &u);
        let pert = interpolate_profile(&index, &y_p, &x, &u_p);
        let tl = interpolate_profile_tl_u(&index, &y, &x, &u, &y_tl, &u_tl);
        for ((b, p), t) in base.iter().zip(&pert).zip(&tl) {
            assert_abs_diff_eq!((p - b) / eps, *t, epsilon = 1e-6);
        }
    }

    #[test]
    fn adjoint_symmetry_y() {
        let x = [0., 1., 2.5, 4., 4.5];
        let u = [-1., 0.3, 1.2, 2.5, 4.2, 6.];
        let index = compute_interp_index(&x, &u);
        let y_tl = perturbation(x.len(), 3);
        let seed = perturbation(u.len(), 4);

        let tl = interpolate_profile_tl(&index, &x, &u, &y_tl);
        let mut y_int_ad = seed.clone();
        let mut y_ad = vec![0.; x.len()];
        interpolate_profile_ad(&index, &x, &u, &mut y_int_ad, &mut y_ad);

        assert_relative_eq!(dot(&tl, &seed), dot(&y_ad, &y_tl), max_relative = 1e-12);
        assert!(y_int_ad.iter().all(|&v| v == 0.));
    }

    #[test]
    fn adjoint_symmetry_u() {
        let x = [0., 1., 2.5, 4., 4.5];
        let y = [2., -1., 0.5, 3., 3.5];
        let u = [-1., 0.3, 1.2, 2.5, 4.2, 6.];
        let index = compute_interp_index(&x, &u);
        let y_tl = perturbation(x.len(), 5);
        let u_tl = perturbation(u.len(), 6);
        let seed = perturbation(u.len(), 7);

        let tl = interpolate_profile_tl_u(&index, &y, &x, &u, &y_tl, &u_tl);
        let mut y_int_ad = seed.clone();
        let mut y_ad = vec![0.; x.len()];
        let mut u_ad = vec![0.; u.len()];
        interpolate_profile_ad_u(&index, &y, &x, &u, &mut y_int_ad, &mut y_ad, &mut u_ad);

        let lhs = dot(&tl, &seed);
        let rhs = dot(&y_ad, &y_tl) + dot(&u_ad, &u_tl);
        assert_relative_eq!(lhs, rhs, max_relative = 1e-12);
    }

    #[test]
    fn adjoint_symmetry_x() {
        let x = [0., 1., 2.5, 4., 4.5];
        let y = [2., -1., 0.5, 3., 3.5];
        let u = [-1., 0.3, 1.2, 2.5, 4.2, 6.];
        let index = compute_interp_index(&x, &u);
        let y_tl = perturbation(x.len(), 8);
        let x_tl = perturbation(x.len(), 9);
        let seed = perturbation(u.len(), 10);

        let tl = interpolate_profile_tl_x(&index, &y, &x, &u, &y_tl, &x_tl);
        let mut y_int_ad = seed.clone();
        let mut y_ad = vec![0.; x.len()];
        let mut x_ad = vec![0.; x.len()];
        interpolate_profile_ad_x(&index, &y, &x, &u, &mut y_int_ad, &mut y_ad, &mut x_ad);

        let lhs = dot(&tl, &seed);
        let rhs = dot(&y_ad, &y_tl) + dot(&x_ad, &x_tl);
        assert_relative_eq!(lhs, rhs, max_relative = 1e-12);
    }

    #[test]
    fn layer_avg_weights_are_normalized() {
        // Target extends past the source on both ends
        let source = [0., 1., 2., 3., 4., 5.];
        let target = [-0.5, 0.7, 1.1, 2.9, 3.0, 4.4, 6.0];
        let lw = layer_avg(&target, &source).unwrap();
        assert_eq!(lw.n_layers(), 6);
        for w in &lw.weights {
            assert_abs_diff_eq!(w.iter().sum::<f64>(), 1., epsilon = 1e-10);
            assert!(w.iter().all(|&w| w >= 0.));
        }
        // [-0.5, 0.7] lies in (extended) source layer 0 only
        assert_eq!(lw.index[0], InterpIndex { k1: 0, k2: 0 });
        // [1.1, 2.9] covers layers 1 and 2
        assert_eq!(lw.index[2], InterpIndex { k1: 1, k2: 2 });
        assert_relative_eq!(lw.weights[2][0], 0.9 / 1.8, max_relative = 1e-12);
        // [4.4, 6.0] is all in the extended last layer
        assert_eq!(lw.index[5], InterpIndex { k1: 4, k2: 4 });
    }

    #[test]
    fn layer_avg_of_constant_is_constant() {
        let source = [0., 0.3, 1.7, 2.2, 4.0];
        let target = [0.1, 0.9, 1.0, 2.5, 3.9];
        let lw = layer_avg(&target, &source).unwrap();
        for k in 0..lw.n_layers() {
            assert_relative_eq!(lw.average(k, |_| 7.5), 7.5, max_relative = 1e-12);
        }
    }

    #[test]
    fn layer_avg_rejects_coincident_levels() {
        let source = [0., 1., 2.];
        let target = [0., 1., 1., 2.];
        assert_eq!(
            layer_avg(&target, &source),
            Err(OdpsError::DegenerateLayer {
                index: 1,
                width: 0.
            })
        );
    }
}
