//! Regression predictors on the internal pressure grid.
//!
//! Every predictor is evaluated together with its partial derivatives with
//! respect to temperature, absorber amount and secant zenith angle. The
//! tangent-linear and adjoint routines are built from those partials, so the
//! three stay consistent.

use ndarray::{Array2, Array3};
use smallvec::SmallVec;

use super::geopotential::G0;
use super::interpolation::InterpIndex;
use super::mapping::ForwardState;
use crate::coefficients::{ComponentId, TauCoefficients};

/// Largest number of regression predictors for any component.
pub const MAX_N_PREDICTORS: usize = 7;
/// Number of OPTRAN predictors (`OX`) computed per layer.
pub const MAX_OPTRAN_PREDICTORS: usize = 8;
/// Highest polynomial order of the OPTRAN absorber basis (`Ap`).
pub const MAX_OPTRAN_ORDER: usize = 10;

/// Floor on the layer-mean water vapor path before taking its log
const MIN_PATH: f64 = 1.0e-20;

/// Number of predictors available for a component.
pub(crate) fn max_predictors(component: ComponentId) -> usize {
    match component {
        ComponentId::Dry => 7,
        ComponentId::WaterContinuum => 4,
        _ => 6,
    }
}

/// OPTRAN-specific predictors.
#[derive(Debug, Clone, PartialEq)]
pub struct OptranPredictor {
    /// Layer predictors, shape (`n_layers`, [`MAX_OPTRAN_PREDICTORS`])
    pub ox: Array2<f64>,
    /// Powers of the normalized log water vapor path, shape (`n_layers`,
    /// [`MAX_OPTRAN_ORDER`]). Column `j` holds power `j + 1`.
    pub ap: Array2<f64>,
    /// Slant water vapor path of each layer (kg/m²)
    pub da: Vec<f64>,
}

impl OptranPredictor {
    fn zeros(n_layers: usize) -> Self {
        Self {
            ox: Array2::zeros([n_layers, MAX_OPTRAN_PREDICTORS]),
            ap: Array2::zeros([n_layers, MAX_OPTRAN_ORDER]),
            da: vec![0.; n_layers],
        }
    }
}

/// Predictor state for one profile.
///
/// Forward calls fill every field. Tangent-linear and adjoint calls use a
/// second value of the same shape, made with [`Predictor::zeroed_like`], to
/// hold perturbations or adjoints of `x`, `optran` and `secant_zenith`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictor {
    /// Number of layers in the caller's profile
    pub n_user_layers: usize,
    /// Secant of the sensor zenith angle at the surface
    pub secant_zenith_surface: f64,
    /// Secant zenith angle for each internal layer
    pub secant_zenith: Vec<f64>,
    /// Regression predictors, shape (`n_layers`, [`MAX_N_PREDICTORS`],
    /// `n_components`)
    pub x: Array3<f64>,
    /// OPTRAN predictors, if the coefficient table carries OPTRAN coefficients
    pub optran: Option<OptranPredictor>,
    /// `ln(p)` of the internal levels
    pub(crate) ref_ln_press: Vec<f64>,
    /// `ln(p)` of the caller's levels
    pub(crate) user_ln_press: Vec<f64>,
    /// Forward intermediates, kept when the predictor is persistent
    pub(crate) forward: Option<Box<ForwardState>>,
}

impl Predictor {
    pub(crate) fn new(
        n_layers: usize,
        n_components: usize,
        with_optran: bool,
        ref_ln_press: Vec<f64>,
        user_ln_press: Vec<f64>,
    ) -> Self {
        Self {
            n_user_layers: user_ln_press.len() - 1,
            secant_zenith_surface: 0.,
            secant_zenith: vec![0.; n_layers],
            x: Array3::zeros([n_layers, MAX_N_PREDICTORS, n_components]),
            optran: with_optran.then(|| OptranPredictor::zeros(n_layers)),
            ref_ln_press,
            user_ln_press,
            forward: None,
        }
    }

    /// A predictor of the same shape with every value zeroed, for use as a
    /// tangent-linear or adjoint counterpart.
    pub fn zeroed_like(&self) -> Self {
        let (n_layers, _, n_components) = self.x.dim();
        Self::new(
            n_layers,
            n_components,
            self.optran.is_some(),
            self.ref_ln_press.clone(),
            self.user_ln_press.clone(),
        )
    }

    /// Number of internal layers.
    pub fn n_layers(&self) -> usize {
        self.secant_zenith.len()
    }

    /// Whether forward intermediates were kept for tangent-linear and
    /// adjoint calls.
    pub fn is_persistent(&self) -> bool {
        self.forward.is_some()
    }

    /// Cached internal-to-user interpolation index, if persistent.
    pub(crate) fn user_index(&self) -> Option<&[InterpIndex]> {
        self.forward.as_deref().map(|f| f.user_index.as_slice())
    }

    /// Set every perturbation/adjoint value to zero.
    pub fn zero(&mut self) {
        self.secant_zenith.fill(0.);
        self.x.fill(0.);
        if let Some(optran) = &mut self.optran {
            optran.ox.fill(0.);
            optran.ap.fill(0.);
            optran.da.fill(0.);
        }
    }
}

/// A predictor value and its partial derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Term {
    value: f64,
    d_t: f64,
    d_q: f64,
    d_s: f64,
}

/// All predictors of a component for one layer.
///
/// `t`/`tr` are the layer and reference temperatures, `q`/`qr` the layer and
/// reference absorber amounts (ignored for the dry component) and `s` the
/// secant zenith angle.
fn predictor_terms(
    component: ComponentId,
    t: f64,
    tr: f64,
    q: f64,
    qr: f64,
    s: f64,
) -> SmallVec<[Term; MAX_N_PREDICTORS]> {
    let tz = t / tr;

    if component == ComponentId::Dry {
        let s2 = s * s;
        return [
            (s, 0., 1.),
            (s * tz, s / tr, tz),
            (s * tz * tz, 2. * s * tz / tr, tz * tz),
            (tz, 1. / tr, 0.),
            (tz * tz, 2. * tz / tr, 0.),
            (s2, 0., 2. * s),
            (s2 * tz, s2 / tr, 2. * s * tz),
        ]
        .into_iter()
        .map(|(value, d_t, d_s)| Term {
            value,
            d_t,
            d_q: 0.,
            d_s,
        })
        .collect();
    }

    // Slant absorber amount relative to the reference profile
    let a = s * q / qr;
    // (f, df/da, df/dtz)
    let f: SmallVec<[(f64, f64, f64); MAX_N_PREDICTORS]> =
        if component == ComponentId::WaterContinuum {
            let tz2 = tz * tz;
            let tz3 = tz2 * tz;
            [
                (a / tz, 1. / tz, -a / tz2),
                (a * a / tz, 2. * a / tz, -a * a / tz2),
                (a / tz2, 1. / tz2, -2. * a / tz3),
                (a * a / tz2, 2. * a / tz2, -2. * a * a / tz3),
            ]
            .into_iter()
            .collect()
        } else {
            let sqrt_a = a.sqrt();
            // sqrt is not differentiable at zero amount; hold it fixed there
            let d_sqrt_a = if a > 0. { 0.5 / sqrt_a } else { 0. };
            [
                (a, 1., 0.),
                (a * tz, tz, a),
                (a * a, 2. * a, 0.),
                (sqrt_a, d_sqrt_a, 0.),
                (a * tz * tz, tz * tz, 2. * a * tz),
                (a * a * tz, 2. * a * tz, a * a),
            ]
            .into_iter()
            .collect()
        };

    f.into_iter()
        .map(|(value, f_a, f_tz)| Term {
            value,
            d_t: f_tz / tr,
            d_q: f_a * s / qr,
            d_s: f_a * q / qr,
        })
        .collect()
}

/// Column of the internal absorber array that drives each component.
fn component_columns(coeffs: &TauCoefficients) -> SmallVec<[Option<usize>; 8]> {
    coeffs
        .component_ids
        .iter()
        .map(|c| c.absorber().and_then(|id| coeffs.absorber_index(id)))
        .collect()
}

/// Terms for component `j` at layer `k`, reading the driving absorber from
/// `absorber` (internal grid, table column order).
fn layer_terms(
    coeffs: &TauCoefficients,
    columns: &[Option<usize>],
    j: usize,
    k: usize,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
) -> SmallVec<[Term; MAX_N_PREDICTORS]> {
    let (q, qr) = match columns[j] {
        Some(col) => (absorber[[k, col]], coeffs.ref_absorber[[k, col]]),
        None => (0., 1.),
    };
    predictor_terms(
        coeffs.component_ids[j],
        temperature[k],
        coeffs.ref_temperature[k],
        q,
        qr,
        secant[k],
    )
}

/// Fill the regression predictor tensor.
pub(crate) fn compute_predictor(
    coeffs: &TauCoefficients,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
    x: &mut Array3<f64>,
) {
    let columns = component_columns(coeffs);
    x.fill(0.);
    for k in 0..coeffs.n_layers() {
        for j in 0..coeffs.n_components() {
            let terms = layer_terms(coeffs, &columns, j, k, temperature, absorber, secant);
            for (i, term) in terms.iter().enumerate() {
                x[[k, i, j]] = term.value;
            }
        }
    }
}

/// Tangent-linear of [`compute_predictor`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_predictor_tl(
    coeffs: &TauCoefficients,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
    temperature_tl: &[f64],
    absorber_tl: &Array2<f64>,
    secant_tl: &[f64],
    x_tl: &mut Array3<f64>,
) {
    let columns = component_columns(coeffs);
    x_tl.fill(0.);
    for k in 0..coeffs.n_layers() {
        for j in 0..coeffs.n_components() {
            let q_tl = columns[j].map_or(0., |col| absorber_tl[[k, col]]);
            let terms = layer_terms(coeffs, &columns, j, k, temperature, absorber, secant);
            for (i, term) in terms.iter().enumerate() {
                x_tl[[k, i, j]] =
                    term.d_t * temperature_tl[k] + term.d_q * q_tl + term.d_s * secant_tl[k];
            }
        }
    }
}

/// Adjoint of [`compute_predictor_tl`].
///
/// Consumes (zeroes) `x_ad` and accumulates into the other adjoints.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_predictor_ad(
    coeffs: &TauCoefficients,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
    x_ad: &mut Array3<f64>,
    temperature_ad: &mut [f64],
    absorber_ad: &mut Array2<f64>,
    secant_ad: &mut [f64],
) {
    let columns = component_columns(coeffs);
    for k in (0..coeffs.n_layers()).rev() {
        for j in (0..coeffs.n_components()).rev() {
            let terms = layer_terms(coeffs, &columns, j, k, temperature, absorber, secant);
            for (i, term) in terms.iter().enumerate().rev() {
                let ad = x_ad[[k, i, j]];
                temperature_ad[k] += term.d_t * ad;
                secant_ad[k] += term.d_s * ad;
                if let Some(col) = columns[j] {
                    absorber_ad[[k, col]] += term.d_q * ad;
                }
            }
        }
    }
    x_ad.fill(0.);
}

/// Temperature derivatives of the `OX` predictors at one layer.
fn optran_ox(t: f64, p: f64) -> ([f64; MAX_OPTRAN_PREDICTORS], [f64; MAX_OPTRAN_PREDICTORS]) {
    let (t2, p2) = (t * t, p * p);
    (
        [t, p, t2, p2, t * p, t2 * p, t * p2, t2 * p2],
        [1., 0., 2. * t, 0., p, 2. * t * p, p2, 2. * t * p2],
    )
}

/// Water vapor path bookkeeping shared by the OPTRAN routines.
struct OptranPath {
    /// Pressure thickness over gravity for each layer
    dpg: Vec<f64>,
    /// Layer-mean cumulative path, floored at `MIN_PATH`
    mean_path: Vec<f64>,
    /// Whether the floor was not hit
    active: Vec<bool>,
}

impl OptranPath {
    fn new(coeffs: &TauCoefficients, w: impl Fn(usize) -> f64, secant: &[f64]) -> Self {
        let n = coeffs.n_layers();
        let p = &coeffs.ref_level_pressure;
        // w in g/kg and dp in hPa gives kg/m² after dividing by 10 g0
        let dpg: Vec<f64> = (0..n).map(|k| (p[k + 1] - p[k]) / (10. * G0)).collect();

        let mut mean_path = Vec::with_capacity(n);
        let mut active = Vec::with_capacity(n);
        let mut path = 0.;
        for k in 0..n {
            let da = secant[k] * w(k) * dpg[k];
            let am = path + 0.5 * da;
            path += da;
            active.push(am > MIN_PATH);
            mean_path.push(am.max(MIN_PATH));
        }
        Self {
            dpg,
            mean_path,
            active,
        }
    }
}

/// Fill the OPTRAN predictors.
pub(crate) fn compute_predictor_optran(
    coeffs: &TauCoefficients,
    h2o: usize,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
    op: &mut OptranPredictor,
) {
    let Some(optran) = &coeffs.optran else {
        return;
    };
    let path = OptranPath::new(coeffs, |k| absorber[[k, h2o]], secant);
    for k in 0..coeffs.n_layers() {
        op.da[k] = secant[k] * absorber[[k, h2o]] * path.dpg[k];

        let ap1 = (path.mean_path[k].ln() - optran.alpha_c2) / optran.alpha_c1;
        let mut power = 1.;
        for j in 0..MAX_OPTRAN_ORDER {
            power *= ap1;
            op.ap[[k, j]] = power;
        }

        let (ox, _) = optran_ox(temperature[k], coeffs.ref_pressure[k]);
        for (i, ox) in ox.into_iter().enumerate() {
            op.ox[[k, i]] = ox;
        }
    }
}

/// Tangent-linear of [`compute_predictor_optran`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_predictor_optran_tl(
    coeffs: &TauCoefficients,
    h2o: usize,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
    temperature_tl: &[f64],
    absorber_tl: &Array2<f64>,
    secant_tl: &[f64],
    op_tl: &mut OptranPredictor,
) {
    let Some(optran) = &coeffs.optran else {
        return;
    };
    let path = OptranPath::new(coeffs, |k| absorber[[k, h2o]], secant);
    let mut path_tl = 0.;
    for k in 0..coeffs.n_layers() {
        let w = absorber[[k, h2o]];
        let da_tl = (secant_tl[k] * w + secant[k] * absorber_tl[[k, h2o]]) * path.dpg[k];
        op_tl.da[k] = da_tl;

        let am_tl = path_tl + 0.5 * da_tl;
        path_tl += da_tl;

        let ap1 = (path.mean_path[k].ln() - optran.alpha_c2) / optran.alpha_c1;
        let ap1_tl = if path.active[k] {
            am_tl / (path.mean_path[k] * optran.alpha_c1)
        } else {
            0.
        };
        // d(ap1^(j+1)) = (j+1) ap1^j d(ap1)
        let mut power = 1.;
        for j in 0..MAX_OPTRAN_ORDER {
            op_tl.ap[[k, j]] = (j + 1) as f64 * power * ap1_tl;
            power *= ap1;
        }

        let (_, d_ox) = optran_ox(temperature[k], coeffs.ref_pressure[k]);
        for (i, d_ox) in d_ox.into_iter().enumerate() {
            op_tl.ox[[k, i]] = d_ox * temperature_tl[k];
        }
    }
}

/// Adjoint of [`compute_predictor_optran_tl`].
///
/// Consumes (zeroes) `op_ad` and accumulates into the other adjoints.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_predictor_optran_ad(
    coeffs: &TauCoefficients,
    h2o: usize,
    temperature: &[f64],
    absorber: &Array2<f64>,
    secant: &[f64],
    op_ad: &mut OptranPredictor,
    temperature_ad: &mut [f64],
    absorber_ad: &mut Array2<f64>,
    secant_ad: &mut [f64],
) {
    let Some(optran) = &coeffs.optran else {
        return;
    };
    let path = OptranPath::new(coeffs, |k| absorber[[k, h2o]], secant);
    // Adjoint of the cumulative path below the current layer
    let mut path_ad = 0.;
    for k in (0..coeffs.n_layers()).rev() {
        let (_, d_ox) = optran_ox(temperature[k], coeffs.ref_pressure[k]);
        for (i, d_ox) in d_ox.into_iter().enumerate().rev() {
            temperature_ad[k] += d_ox * op_ad.ox[[k, i]];
            op_ad.ox[[k, i]] = 0.;
        }

        let ap1 = (path.mean_path[k].ln() - optran.alpha_c2) / optran.alpha_c1;
        let mut ap1_ad = 0.;
        let mut power = 1.;
        for j in 0..MAX_OPTRAN_ORDER {
            ap1_ad += (j + 1) as f64 * power * op_ad.ap[[k, j]];
            op_ad.ap[[k, j]] = 0.;
            power *= ap1;
        }
        let am_ad = if path.active[k] {
            ap1_ad / (path.mean_path[k] * optran.alpha_c1)
        } else {
            0.
        };

        let da_ad = op_ad.da[k] + path_ad + 0.5 * am_ad;
        op_ad.da[k] = 0.;
        path_ad += am_ad;

        let w = absorber[[k, h2o]];
        secant_ad[k] += w * path.dpg[k] * da_ad;
        absorber_ad[[k, h2o]] += secant[k] * path.dpg[k] * da_ad;
    }
}
