//! Geopotential height by hypsometric integration.
//!
//! Heights are in km. Pressures are level values ordered from the top of the
//! atmosphere down, so `p[n_layers]` is the surface. Temperature (K) and water
//! vapor mixing ratio (g/kg) are layer values, with layer `k` between levels
//! `k` and `k + 1`.

#![allow(clippy::excessive_precision)]

/// Ratio of the molecular weights of water and dry air
const EPS: f64 = 0.621_970_247;
/// Virtual temperature factor for a mixing ratio in g/kg
const C: f64 = (1. / EPS - 1.) / 1000.;
/// Gas constant of dry air (J/kg/K)
const R_DRYAIR: f64 = 287.0597;
/// Standard gravity (m/s²)
pub(crate) const G0: f64 = 9.80665;
/// Scale height per kelvin, in km
const CC: f64 = 0.001 * R_DRYAIR / G0;

/// Integrate level heights upward from `z_sfc`.
///
/// Returns `n_layers + 1` level heights with `z[n_layers] == z_sfc`.
pub(crate) fn geopotential_height(p: &[f64], t: &[f64], w: &[f64], z_sfc: f64) -> Vec<f64> {
    let n = t.len();
    debug_assert_eq!(p.len(), n + 1);
    debug_assert_eq!(w.len(), n);

    let mut z = vec![0.; n + 1];
    z[n] = z_sfc;
    for k in (1..=n).rev() {
        let tv = t[k - 1] * (1. + C * w[k - 1]);
        let h = CC * tv;
        z[k - 1] = z[k] + h * (p[k] / p[k - 1]).ln();
    }
    z
}

/// Tangent-linear of [`geopotential_height`] for perturbed temperature and
/// water vapor. The pressures and the surface height are fixed.
pub(crate) fn geopotential_height_tl(
    p: &[f64],
    t: &[f64],
    w: &[f64],
    t_tl: &[f64],
    w_tl: &[f64],
) -> Vec<f64> {
    let n = t.len();
    let mut z_tl = vec![0.; n + 1];
    for k in (1..=n).rev() {
        let tv_tl = t_tl[k - 1] * (1. + C * w[k - 1]) + t[k - 1] * C * w_tl[k - 1];
        let h_tl = CC * tv_tl;
        z_tl[k - 1] = z_tl[k] + h_tl * (p[k] / p[k - 1]).ln();
    }
    z_tl
}

/// Adjoint of [`geopotential_height_tl`].
///
/// Consumes `z_ad` (each level is zeroed once propagated, the top level
/// included) and accumulates into `t_ad` and `w_ad`. On return `z_ad[n_layers]`
/// holds the adjoint of the surface height.
pub(crate) fn geopotential_height_ad(
    p: &[f64],
    t: &[f64],
    w: &[f64],
    z_ad: &mut [f64],
    t_ad: &mut [f64],
    w_ad: &mut [f64],
) {
    let n = t.len();
    for k in 1..=n {
        z_ad[k] += z_ad[k - 1];
        let h_ad = z_ad[k - 1] * (p[k] / p[k - 1]).ln();
        z_ad[k - 1] = 0.;
        let tv_ad = CC * h_ad;
        t_ad[k - 1] += (1. + C * w[k - 1]) * tv_ad;
        w_ad[k - 1] += C * t[k - 1] * tv_ad;
    }
}
