//! Channel optical depth assembly.
//!
//! The generic model sums the per-component regressions into layer optical
//! depths on the internal grid, clamps them and accumulates the level-to-space
//! path. The path is then interpolated onto the caller's levels and
//! differenced back into layer optical depths along the local vertical.

use std::borrow::Cow;
use std::sync::Arc;

use super::interpolation::{
    compute_interp_index, interpolate_profile, interpolate_profile_ad, interpolate_profile_tl,
    InterpIndex,
};
use super::optran::{add_optran_wlo_od, add_optran_wlo_od_ad, add_optran_wlo_od_tl};
use super::path_model::{OpticalPath, OpticalPathModel};
use super::predictor::{OptranPredictor, Predictor};
use crate::coefficients::{ComponentId, OptranCoefficients, TauCoefficients};
use crate::error::{check_len, Result};
use crate::options::OdpsOptions;

/// Optical depth of one channel on the caller's grid, with the forward
/// intermediates needed by the tangent-linear and adjoint calls.
#[derive(Debug, Clone, PartialEq)]
pub struct AtmAbsorption {
    /// Optical depth of each user layer along the local vertical
    pub optical_depth: Vec<f64>,
    /// Slant optical path at the user levels, `user_path[0] == 0`
    pub user_path: Vec<f64>,
    path: OpticalPath,
}

impl AtmAbsorption {
    /// The optical path on the internal levels.
    pub fn optical_path(&self) -> &OpticalPath {
        &self.path
    }
}

/// Whether a raw layer optical depth passes through the clamp unchanged.
#[inline]
fn within_limits(od: f64, max_od: f64) -> bool {
    (0. ..=max_od).contains(&od)
}

/// Clamp layer optical depths to `[0, max_od]` and accumulate the level path.
fn cumulative_path(od: &[f64], max_od: f64) -> Vec<f64> {
    let mut od_path = Vec::with_capacity(od.len() + 1);
    let mut path = 0.;
    od_path.push(path);
    for &od in od {
        path += if od < 0. {
            0.
        } else if od > max_od {
            max_od
        } else {
            od
        };
        od_path.push(path);
    }
    od_path
}

/// The ODPS regression model for ordinary sensors.
#[derive(Debug, Clone)]
pub struct OdpsPath {
    coeffs: Arc<TauCoefficients>,
    options: OdpsOptions,
}

impl OdpsPath {
    /// Build the model over a validated coefficient table.
    pub fn new(coeffs: Arc<TauCoefficients>, options: OdpsOptions) -> Self {
        Self { coeffs, options }
    }

    /// OPTRAN coefficients and predictors, if component `component` of
    /// `channel` is computed by OPTRAN.
    fn optran<'a>(
        &'a self,
        component: ComponentId,
        channel: usize,
        predictor: &'a Predictor,
    ) -> Option<(&'a OptranCoefficients, &'a OptranPredictor)> {
        if component != ComponentId::WaterLine || !self.options.allow_optran {
            return None;
        }
        match (&self.coeffs.optran, &predictor.optran) {
            (Some(optran), Some(op)) if optran.significance[channel] => Some((optran, op)),
            _ => None,
        }
    }

    /// Regression coefficients of predictor `i` for component `j`.
    fn coefficients(&self, j: usize, channel: usize, i: usize) -> &[f64] {
        let n = self.coeffs.n_layers();
        let pos = self.coeffs.pos_index[[j, channel]] + i * n;
        &self.coeffs.c[pos..pos + n]
    }
}

impl OpticalPathModel for OdpsPath {
    fn optical_path(&self, channel: usize, predictor: &Predictor) -> Result<OpticalPath> {
        let coeffs = &*self.coeffs;
        let n = coeffs.n_layers();
        check_len("predictor layers", n, predictor.n_layers())?;

        let mut od = vec![0.; n];
        let mut optran_state = None;
        for (j, &component) in coeffs.component_ids.iter().enumerate() {
            let np = coeffs.n_predictors[[j, channel]];
            if np == 0 {
                continue;
            }
            if let Some((optran, op)) = self.optran(component, channel, predictor) {
                optran_state = add_optran_wlo_od(optran, channel, op, &self.options, &mut od);
                continue;
            }
            for i in 0..np {
                for (k, c) in self.coefficients(j, channel, i).iter().enumerate() {
                    od[k] += c * predictor.x[[k, i, j]];
                }
            }
        }

        Ok(OpticalPath {
            od_path: cumulative_path(&od, self.options.max_od),
            od,
            optran: optran_state,
        })
    }

    fn optical_path_tl(
        &self,
        channel: usize,
        predictor: &Predictor,
        path: &OpticalPath,
        predictor_tl: &Predictor,
    ) -> Result<Vec<f64>> {
        let coeffs = &*self.coeffs;
        let n = coeffs.n_layers();
        check_len("predictor increment layers", n, predictor_tl.n_layers())?;

        let mut od_tl = vec![0.; n];
        for (j, &component) in coeffs.component_ids.iter().enumerate() {
            let np = coeffs.n_predictors[[j, channel]];
            if np == 0 {
                continue;
            }
            if let Some((optran, op)) = self.optran(component, channel, predictor) {
                if let (Some(state), Some(op_tl)) = (&path.optran, &predictor_tl.optran) {
                    add_optran_wlo_od_tl(
                        optran,
                        channel,
                        op,
                        state,
                        op_tl,
                        &self.options,
                        &mut od_tl,
                    );
                }
                continue;
            }
            for i in 0..np {
                for (k, c) in self.coefficients(j, channel, i).iter().enumerate() {
                    od_tl[k] += c * predictor_tl.x[[k, i, j]];
                }
            }
        }

        let mut od_path_tl = Vec::with_capacity(n + 1);
        let mut path_tl = 0.;
        od_path_tl.push(path_tl);
        for (od, od_tl) in path.od.iter().zip(od_tl) {
            if within_limits(*od, self.options.max_od) {
                path_tl += od_tl;
            }
            od_path_tl.push(path_tl);
        }
        Ok(od_path_tl)
    }

    fn optical_path_ad(
        &self,
        channel: usize,
        predictor: &Predictor,
        path: &OpticalPath,
        od_path_ad: &mut [f64],
        predictor_ad: &mut Predictor,
    ) -> Result<()> {
        let coeffs = &*self.coeffs;
        let n = coeffs.n_layers();
        check_len("optical path adjoint", n + 1, od_path_ad.len())?;
        check_len("predictor adjoint layers", n, predictor_ad.n_layers())?;

        let mut od_ad = vec![0.; n];
        for k in (0..n).rev() {
            let ad = od_path_ad[k + 1];
            od_path_ad[k] += ad;
            if within_limits(path.od[k], self.options.max_od) {
                od_ad[k] += ad;
            }
            od_path_ad[k + 1] = 0.;
        }
        od_path_ad[0] = 0.;

        for (j, &component) in coeffs.component_ids.iter().enumerate().rev() {
            let np = coeffs.n_predictors[[j, channel]];
            if np == 0 {
                continue;
            }
            if let Some((optran, op)) = self.optran(component, channel, predictor) {
                if let (Some(state), Some(op_ad)) = (&path.optran, &mut predictor_ad.optran) {
                    add_optran_wlo_od_ad(optran, channel, op, state, &od_ad, &self.options, op_ad);
                }
                continue;
            }
            for i in (0..np).rev() {
                for (k, c) in self.coefficients(j, channel, i).iter().enumerate().rev() {
                    predictor_ad.x[[k, i, j]] += c * od_ad[k];
                }
            }
        }
        Ok(())
    }
}

/// Internal-to-user interpolation index, from the persistent cache if present.
fn user_index(predictor: &Predictor) -> Cow<'_, [InterpIndex]> {
    match predictor.user_index() {
        Some(index) => Cow::Borrowed(index),
        None => Cow::Owned(compute_interp_index(
            &predictor.ref_ln_press,
            &predictor.user_ln_press[1..],
        )),
    }
}

/// Interpolate the internal path onto the user levels and difference it into
/// user layer optical depths.
pub(crate) fn compute_atm_absorption(
    model: &dyn OpticalPathModel,
    channel: usize,
    predictor: &Predictor,
) -> Result<AtmAbsorption> {
    let path = model.optical_path(channel, predictor)?;
    check_len("optical path levels", predictor.ref_ln_press.len(), path.od_path.len())?;

    let index = user_index(predictor);
    let mut user_path = Vec::with_capacity(predictor.n_user_layers + 1);
    user_path.push(0.);
    user_path.extend(interpolate_profile(
        &index,
        &path.od_path,
        &predictor.ref_ln_press,
        &predictor.user_ln_press[1..],
    ));

    let optical_depth = user_path
        .windows(2)
        .map(|w| (w[1] - w[0]) / predictor.secant_zenith_surface)
        .collect();

    Ok(AtmAbsorption {
        optical_depth,
        user_path,
        path,
    })
}

/// Tangent-linear of [`compute_atm_absorption`]: the perturbation of the user
/// layer optical depths.
pub(crate) fn compute_atm_absorption_tl(
    model: &dyn OpticalPathModel,
    channel: usize,
    predictor: &Predictor,
    absorption: &AtmAbsorption,
    predictor_tl: &Predictor,
) -> Result<Vec<f64>> {
    let od_path_tl = model.optical_path_tl(channel, predictor, &absorption.path, predictor_tl)?;
    check_len("optical path increment levels", predictor.ref_ln_press.len(), od_path_tl.len())?;

    let index = user_index(predictor);
    let user_path_tl = interpolate_profile_tl(
        &index,
        &predictor.ref_ln_press,
        &predictor.user_ln_press[1..],
        &od_path_tl,
    );

    let mut previous = 0.;
    Ok(user_path_tl
        .into_iter()
        .map(|path_tl| {
            let od_tl = (path_tl - previous) / predictor.secant_zenith_surface;
            previous = path_tl;
            od_tl
        })
        .collect())
}

/// Adjoint of [`compute_atm_absorption_tl`].
///
/// Consumes (zeroes) `optical_depth_ad` and accumulates into `predictor_ad`.
pub(crate) fn compute_atm_absorption_ad(
    model: &dyn OpticalPathModel,
    channel: usize,
    predictor: &Predictor,
    absorption: &AtmAbsorption,
    optical_depth_ad: &mut [f64],
    predictor_ad: &mut Predictor,
) -> Result<()> {
    let n_user = predictor.n_user_layers;
    check_len("optical depth adjoint", n_user, optical_depth_ad.len())?;

    // Adjoint of the user path at levels 1..=n_user
    let mut user_path_ad = vec![0.; n_user];
    for k in (0..n_user).rev() {
        let ad = optical_depth_ad[k] / predictor.secant_zenith_surface;
        user_path_ad[k] += ad;
        if k > 0 {
            user_path_ad[k - 1] -= ad;
        }
        optical_depth_ad[k] = 0.;
    }

    let index = user_index(predictor);
    let mut od_path_ad = vec![0.; predictor.ref_ln_press.len()];
    interpolate_profile_ad(
        &index,
        &predictor.ref_ln_press,
        &predictor.user_ln_press[1..],
        &mut user_path_ad,
        &mut od_path_ad,
    );

    model.optical_path_ad(channel, predictor, &absorption.path, &mut od_path_ad, predictor_ad)
}
