//! Mapping a caller's profile onto the internal grid, and the viewing geometry.
//!
//! Steps, in order:
//!
//! 1. Layer-average temperature and absorbers onto the internal layers,
//!    clamping absorbers to their trained range and substituting the
//!    reference profile for species the caller did not supply.
//! 2. Anchor geopotential heights on the internal grid to the caller's
//!    surface altitude.
//! 3. Secant zenith angle of every internal layer for a spherical Earth.
//! 4. Regression (and OPTRAN) predictors.
//!
//! Only the values flowing through steps 1 to 4 are differentiated. The
//! surface anchor is fixed bookkeeping.

use log::debug;
use ndarray::Array2;

use super::geopotential::{geopotential_height, geopotential_height_ad, geopotential_height_tl};
use super::interpolation::{compute_interp_index, layer_avg, InterpIndex, LayerWeights};
use super::predictor::{
    compute_predictor, compute_predictor_ad, compute_predictor_optran,
    compute_predictor_optran_ad, compute_predictor_optran_tl, compute_predictor_tl, Predictor,
};
use crate::atmosphere::{AbsorberId, Atmosphere, Geometry};
use crate::coefficients::TauCoefficients;
use crate::error::{check_len, OdpsError, Result};
use crate::options::OdpsOptions;

/// Mean Earth radius in km
pub(crate) const EARTH_RADIUS: f64 = 6370.0;

/// Surface pressure (hPa) used to anchor heights when the caller's surface
/// lies below the internal grid
pub(crate) const SYNTHETIC_SURFACE_PRESSURE: f64 = 1013.0;

/// Position of the height anchor on the internal grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SurfaceAnchor {
    /// Internal layer containing the anchor pressure
    pub(crate) layer: usize,
    /// Position within the layer in `ln(p)`, 0 at its top level
    pub(crate) fraction: f64,
}

impl SurfaceAnchor {
    fn locate(ref_level_pressure: &[f64], surface_pressure: f64) -> Self {
        let n = ref_level_pressure.len() - 1;
        let p = if surface_pressure > ref_level_pressure[n] {
            debug!(
                "surface pressure {surface_pressure} hPa is below the internal grid, \
                 anchoring heights at {SYNTHETIC_SURFACE_PRESSURE} hPa"
            );
            SYNTHETIC_SURFACE_PRESSURE
        } else {
            surface_pressure
        };
        let layer = (0..n)
            .find(|&k| p <= ref_level_pressure[k + 1])
            .unwrap_or(n - 1);
        let (p1, p2) = (ref_level_pressure[layer], ref_level_pressure[layer + 1]);
        Self {
            layer,
            fraction: (p / p1).ln() / (p2 / p1).ln(),
        }
    }

    /// Linear interpolation of level values at the anchor.
    fn interpolate(&self, z: &[f64]) -> f64 {
        (1. - self.fraction) * z[self.layer] + self.fraction * z[self.layer + 1]
    }
}

/// Forward intermediates kept by a persistent [`Predictor`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForwardState {
    /// Internal-to-user level interpolation index
    pub(crate) user_index: Vec<InterpIndex>,
    weights: LayerWeights,
    /// Caller column for each table absorber, `None` if substituted
    user_columns: Vec<Option<usize>>,
    n_user_absorbers: usize,
    temperature: Vec<f64>,
    absorber: Array2<f64>,
    /// False where the absorber was clamped or substituted
    absorber_active: Array2<bool>,
    h2o: Option<usize>,
    /// Anchored level heights in km
    z: Vec<f64>,
    anchor: SurfaceAnchor,
    /// Ray parameter `(R + z_sfc) sin(zenith)` in km
    ray: f64,
    /// `R + z_sfc` in km
    r_surface: f64,
}

/// Clamp to `[min, max]`, reporting whether the value passed unchanged.
#[inline]
fn limit(q: f64, min: f64, max: f64) -> (f64, bool) {
    if q < min {
        (min, false)
    } else if q > max {
        (max, false)
    } else {
        (q, true)
    }
}

/// Water vapor column of the internal absorber array, zero if not declared.
fn water_vapor(absorber: &Array2<f64>, h2o: Option<usize>) -> Vec<f64> {
    match h2o {
        Some(col) => absorber.column(col).to_vec(),
        None => vec![0.; absorber.nrows()],
    }
}

/// Secant of the local zenith angle at radius `r` for ray parameter `s`.
#[inline]
fn secant(s: f64, r: f64) -> f64 {
    1. / (1. - (s / r).powi(2)).sqrt()
}

/// Radius of the bottom of a layer on the viewing ray, and whether it lies
/// above the surface. The ray never reaches below the surface, so deeper
/// layers see the surface radius.
#[inline]
fn layer_radius(z_bottom: f64, r_surface: f64) -> (f64, bool) {
    let r = EARTH_RADIUS + z_bottom;
    if r > r_surface {
        (r, true)
    } else {
        (r_surface, false)
    }
}

/// `d(secant)/dr`
#[inline]
fn secant_dr(s: f64, r: f64, sec: f64) -> f64 {
    -sec.powi(3) * s * s / r.powi(3)
}

pub(crate) fn compute_predictors(
    coeffs: &TauCoefficients,
    options: &OdpsOptions,
    atm: &Atmosphere,
    geo: &Geometry,
    persistent: bool,
) -> Result<Predictor> {
    atm.validate()?;
    // Scan side does not matter
    let zenith = geo.sensor_zenith_angle.abs();
    if !(0. ..90.).contains(&zenith) {
        return Err(OdpsError::InvalidGeometry {
            sensor_zenith_angle: geo.sensor_zenith_angle,
        });
    }

    let n = coeffs.n_layers();
    let n_user = atm.n_layers();
    debug!(
        "{}: mapping {n_user} user layers onto {n} internal layers",
        coeffs.sensor_id
    );

    let ref_ln: Vec<f64> = coeffs.ref_level_pressure.iter().map(|p| p.ln()).collect();
    let user_ln: Vec<f64> = atm.level_pressure.iter().map(|p| p.ln()).collect();
    let weights = layer_avg(&ref_ln, &user_ln)?;

    let temperature: Vec<f64> = (0..n)
        .map(|k| weights.average(k, |j| atm.temperature[j]))
        .collect();

    let user_columns: Vec<Option<usize>> = coeffs
        .absorber_ids
        .iter()
        .map(|&id| atm.absorber_index(id))
        .collect();
    let mut absorber = Array2::zeros([n, user_columns.len()]);
    let mut absorber_active = Array2::from_elem([n, user_columns.len()], false);
    for (a, column) in user_columns.iter().enumerate() {
        let Some(col) = *column else {
            debug!(
                "{}: {:?} not in the profile, using the reference amounts",
                coeffs.sensor_id, coeffs.absorber_ids[a]
            );
            absorber.column_mut(a).assign(&coeffs.ref_absorber.column(a));
            continue;
        };
        for k in 0..n {
            let q = weights.average(k, |j| atm.absorber[[j, col]]);
            let (q, active) = if options.apply_absorber_limits {
                limit(q, coeffs.min_absorber[[k, a]], coeffs.max_absorber[[k, a]])
            } else {
                (q, true)
            };
            absorber[[k, a]] = q;
            absorber_active[[k, a]] = active;
        }
    }

    // Heights from the internal surface, then shifted to the caller's
    let h2o = coeffs.absorber_index(AbsorberId::H2O);
    let w = water_vapor(&absorber, h2o);
    let mut z = geopotential_height(&coeffs.ref_level_pressure, &temperature, &w, 0.);
    let anchor = SurfaceAnchor::locate(&coeffs.ref_level_pressure, atm.level_pressure[n_user]);
    let offset = geo.surface_altitude / 1000. - anchor.interpolate(&z);
    for z in &mut z {
        *z += offset;
    }

    let r_surface = EARTH_RADIUS + geo.surface_altitude / 1000.;
    let ray = r_surface * zenith.to_radians().sin();
    let secant_zenith: Vec<f64> = (0..n)
        .map(|k| secant(ray, layer_radius(z[k + 1], r_surface).0))
        .collect();

    let with_optran = options.allow_optran && coeffs.optran.is_some() && h2o.is_some();
    let mut predictor = Predictor::new(n, coeffs.n_components(), with_optran, ref_ln, user_ln);
    predictor.secant_zenith_surface = geo.secant_zenith();
    compute_predictor(coeffs, &temperature, &absorber, &secant_zenith, &mut predictor.x);
    if let (Some(op), Some(h2o)) = (&mut predictor.optran, h2o) {
        compute_predictor_optran(coeffs, h2o, &temperature, &absorber, &secant_zenith, op);
    }
    predictor.secant_zenith = secant_zenith;

    if persistent {
        let user_index =
            compute_interp_index(&predictor.ref_ln_press, &predictor.user_ln_press[1..]);
        predictor.forward = Some(Box::new(ForwardState {
            user_index,
            weights,
            user_columns,
            n_user_absorbers: atm.absorber.ncols(),
            temperature,
            absorber,
            absorber_active,
            h2o,
            z,
            anchor,
            ray,
            r_surface,
        }));
    }
    Ok(predictor)
}

pub(crate) fn compute_predictors_tl(
    coeffs: &TauCoefficients,
    predictor: &Predictor,
    atm_tl: &Atmosphere,
) -> Result<Predictor> {
    let fwd = predictor
        .forward
        .as_deref()
        .ok_or(OdpsError::InactivePredictor)?;
    let n = coeffs.n_layers();
    check_len("temperature increment", predictor.n_user_layers, atm_tl.temperature.len())?;
    check_len("absorber increment layers", predictor.n_user_layers, atm_tl.absorber.nrows())?;
    check_len("absorber increment species", fwd.n_user_absorbers, atm_tl.absorber.ncols())?;

    let t_tl: Vec<f64> = (0..n)
        .map(|k| fwd.weights.average(k, |j| atm_tl.temperature[j]))
        .collect();
    let mut q_tl = Array2::zeros(fwd.absorber.raw_dim());
    for (a, column) in fwd.user_columns.iter().enumerate() {
        let Some(col) = *column else { continue };
        for k in 0..n {
            if fwd.absorber_active[[k, a]] {
                q_tl[[k, a]] = fwd.weights.average(k, |j| atm_tl.absorber[[j, col]]);
            }
        }
    }

    let w = water_vapor(&fwd.absorber, fwd.h2o);
    let w_tl = water_vapor(&q_tl, fwd.h2o);
    let mut z_tl = geopotential_height_tl(&coeffs.ref_level_pressure, &fwd.temperature, &w, &t_tl, &w_tl);
    let offset_tl = -fwd.anchor.interpolate(&z_tl);
    for z_tl in &mut z_tl {
        *z_tl += offset_tl;
    }

    let mut predictor_tl = predictor.zeroed_like();
    for k in 0..n {
        let (r, above) = layer_radius(fwd.z[k + 1], fwd.r_surface);
        if above {
            predictor_tl.secant_zenith[k] =
                secant_dr(fwd.ray, r, predictor.secant_zenith[k]) * z_tl[k + 1];
        }
    }

    compute_predictor_tl(
        coeffs,
        &fwd.temperature,
        &fwd.absorber,
        &predictor.secant_zenith,
        &t_tl,
        &q_tl,
        &predictor_tl.secant_zenith,
        &mut predictor_tl.x,
    );
    if let (Some(op_tl), Some(h2o)) = (&mut predictor_tl.optran, fwd.h2o) {
        compute_predictor_optran_tl(
            coeffs,
            h2o,
            &fwd.temperature,
            &fwd.absorber,
            &predictor.secant_zenith,
            &t_tl,
            &q_tl,
            &predictor_tl.secant_zenith,
            op_tl,
        );
    }
    Ok(predictor_tl)
}

pub(crate) fn compute_predictors_ad(
    coeffs: &TauCoefficients,
    predictor: &Predictor,
    predictor_ad: &mut Predictor,
    atm_ad: &mut Atmosphere,
) -> Result<()> {
    let fwd = predictor
        .forward
        .as_deref()
        .ok_or(OdpsError::InactivePredictor)?;
    let n = coeffs.n_layers();
    check_len("predictor adjoint layers", n, predictor_ad.n_layers())?;
    check_len("temperature adjoint", predictor.n_user_layers, atm_ad.temperature.len())?;
    check_len("absorber adjoint layers", predictor.n_user_layers, atm_ad.absorber.nrows())?;
    check_len("absorber adjoint species", fwd.n_user_absorbers, atm_ad.absorber.ncols())?;

    let mut t_ad = vec![0.; n];
    let mut q_ad = Array2::zeros(fwd.absorber.raw_dim());
    let mut secant_ad = predictor_ad.secant_zenith.clone();
    predictor_ad.secant_zenith.fill(0.);

    if let (Some(op_ad), Some(h2o)) = (&mut predictor_ad.optran, fwd.h2o) {
        compute_predictor_optran_ad(
            coeffs,
            h2o,
            &fwd.temperature,
            &fwd.absorber,
            &predictor.secant_zenith,
            op_ad,
            &mut t_ad,
            &mut q_ad,
            &mut secant_ad,
        );
    }
    compute_predictor_ad(
        coeffs,
        &fwd.temperature,
        &fwd.absorber,
        &predictor.secant_zenith,
        &mut predictor_ad.x,
        &mut t_ad,
        &mut q_ad,
        &mut secant_ad,
    );

    let mut z_ad = vec![0.; n + 1];
    for k in (0..n).rev() {
        let (r, above) = layer_radius(fwd.z[k + 1], fwd.r_surface);
        if above {
            z_ad[k + 1] += secant_dr(fwd.ray, r, predictor.secant_zenith[k]) * secant_ad[k];
        }
    }

    // Every level moves with the offset
    let offset_ad: f64 = z_ad.iter().sum();
    let SurfaceAnchor { layer, fraction } = fwd.anchor;
    z_ad[layer] -= (1. - fraction) * offset_ad;
    z_ad[layer + 1] -= fraction * offset_ad;

    let w = water_vapor(&fwd.absorber, fwd.h2o);
    let mut w_ad = vec![0.; n];
    geopotential_height_ad(
        &coeffs.ref_level_pressure,
        &fwd.temperature,
        &w,
        &mut z_ad,
        &mut t_ad,
        &mut w_ad,
    );
    if let Some(h2o) = fwd.h2o {
        for (k, w_ad) in w_ad.into_iter().enumerate() {
            q_ad[[k, h2o]] += w_ad;
        }
    }

    for k in (0..n).rev() {
        fwd.weights
            .average_ad(k, t_ad[k], |j, v| atm_ad.temperature[j] += v);
    }
    for (a, column) in fwd.user_columns.iter().enumerate().rev() {
        let Some(col) = *column else { continue };
        for k in (0..n).rev() {
            if fwd.absorber_active[[k, a]] {
                fwd.weights
                    .average_ad(k, q_ad[[k, a]], |j, v| atm_ad.absorber[[j, col]] += v);
            }
        }
    }
    Ok(())
}
