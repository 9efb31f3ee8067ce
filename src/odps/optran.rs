//! OPTRAN water vapor line optical depth.
//!
//! For channels where the trained significance flag selects it, the water
//! vapor line contribution is a log-linear model in the OPTRAN predictors,
//! with coefficients that are polynomials in the normalized water vapor path:
//!
//! ```text
//! b[k, i]   = c[i, 0] + sum_j c[i, j] * Ap[k, j]
//! ln_chi[k] = b[k, 0] + sum_i b[k, i] * OX[k, idx[i]]
//! OD[k]    += chi[k] * dA[k]
//! ```

use ndarray::Array2;

use super::predictor::OptranPredictor;
use crate::coefficients::OptranCoefficients;
use crate::options::OdpsOptions;

/// Forward intermediates of [`add_optran_wlo_od`] for one channel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OptranState {
    /// Polynomial-evaluated coefficients, shape (`n_layers`, `np + 1`)
    b: Array2<f64>,
    ln_chi: Vec<f64>,
    chi: Vec<f64>,
}

impl OptranState {
    #[cfg(test)]
    pub(crate) fn chi(&self) -> &[f64] {
        &self.chi
    }
}

/// `chi = exp(ln_chi)` with saturation. The flag is false when saturated,
/// where the derivative is zero.
#[inline]
fn saturating_exp(ln_chi: f64, options: &OdpsOptions) -> (f64, bool) {
    if ln_chi > options.limit_exp {
        (options.limit_log, false)
    } else if ln_chi < -options.limit_exp {
        (0., false)
    } else {
        (ln_chi.exp(), true)
    }
}

/// Add the OPTRAN water vapor line optical depth of `channel` into `od`.
///
/// Returns `None`, leaving `od` untouched, when the channel has no OPTRAN
/// predictors.
pub(crate) fn add_optran_wlo_od(
    optran: &OptranCoefficients,
    channel: usize,
    predictor: &OptranPredictor,
    options: &OdpsOptions,
    od: &mut [f64],
) -> Option<OptranState> {
    let np = optran.n_predictors(channel);
    if np == 0 {
        return None;
    }
    let n_layers = od.len();
    let order = optran.order[channel];
    let pos = optran.pos_index[channel];
    let oc = &optran.coefficients;
    let op_index = &optran.predictor_index[channel];

    let mut b = Array2::zeros([n_layers, np + 1]);
    for i in 0..=np {
        let j = pos + i * (order + 1);
        for k in 0..n_layers {
            b[[k, i]] = oc[j]
                + (1..=order)
                    .map(|jj| oc[j + jj] * predictor.ap[[k, jj - 1]])
                    .sum::<f64>();
        }
    }

    let mut ln_chi = vec![0.; n_layers];
    let mut chi = vec![0.; n_layers];
    for k in 0..n_layers {
        ln_chi[k] = b[[k, 0]]
            + (1..=np)
                .map(|i| b[[k, i]] * predictor.ox[[k, op_index[i - 1]]])
                .sum::<f64>();
        chi[k] = saturating_exp(ln_chi[k], options).0;
        od[k] += chi[k] * predictor.da[k];
    }

    Some(OptranState { b, ln_chi, chi })
}

/// Tangent-linear of [`add_optran_wlo_od`], adding into `od_tl`.
pub(crate) fn add_optran_wlo_od_tl(
    optran: &OptranCoefficients,
    channel: usize,
    predictor: &OptranPredictor,
    state: &OptranState,
    predictor_tl: &OptranPredictor,
    options: &OdpsOptions,
    od_tl: &mut [f64],
) {
    let np = optran.n_predictors(channel);
    if np == 0 {
        return;
    }
    let n_layers = od_tl.len();
    let order = optran.order[channel];
    let pos = optran.pos_index[channel];
    let oc = &optran.coefficients;
    let op_index = &optran.predictor_index[channel];

    let mut b_tl = Array2::<f64>::zeros([n_layers, np + 1]);
    for i in 0..=np {
        let j = pos + i * (order + 1);
        for k in 0..n_layers {
            b_tl[[k, i]] = (1..=order)
                .map(|jj| oc[j + jj] * predictor_tl.ap[[k, jj - 1]])
                .sum();
        }
    }

    for k in 0..n_layers {
        let ln_chi_tl = b_tl[[k, 0]]
            + (1..=np)
                .map(|i| {
                    let ip = op_index[i - 1];
                    b_tl[[k, i]] * predictor.ox[[k, ip]] + state.b[[k, i]] * predictor_tl.ox[[k, ip]]
                })
                .sum::<f64>();
        let chi_tl = match saturating_exp(state.ln_chi[k], options) {
            (_, true) => state.chi[k] * ln_chi_tl,
            (_, false) => 0.,
        };
        od_tl[k] += chi_tl * predictor.da[k] + state.chi[k] * predictor_tl.da[k];
    }
}

/// Adjoint of [`add_optran_wlo_od_tl`].
///
/// Reads `od_ad` without modifying it (the caller owns its lifetime) and
/// accumulates into `predictor_ad`.
pub(crate) fn add_optran_wlo_od_ad(
    optran: &OptranCoefficients,
    channel: usize,
    predictor: &OptranPredictor,
    state: &OptranState,
    od_ad: &[f64],
    options: &OdpsOptions,
    predictor_ad: &mut OptranPredictor,
) {
    let np = optran.n_predictors(channel);
    if np == 0 {
        return;
    }
    let n_layers = od_ad.len();
    let order = optran.order[channel];
    let pos = optran.pos_index[channel];
    let oc = &optran.coefficients;
    let op_index = &optran.predictor_index[channel];

    let mut b_ad = Array2::<f64>::zeros([n_layers, np + 1]);
    for k in (0..n_layers).rev() {
        let chi_ad = od_ad[k] * predictor.da[k];
        predictor_ad.da[k] += state.chi[k] * od_ad[k];

        let ln_chi_ad = match saturating_exp(state.ln_chi[k], options) {
            (_, true) => state.chi[k] * chi_ad,
            (_, false) => 0.,
        };

        for i in (1..=np).rev() {
            let ip = op_index[i - 1];
            b_ad[[k, i]] += ln_chi_ad * predictor.ox[[k, ip]];
            predictor_ad.ox[[k, ip]] += state.b[[k, i]] * ln_chi_ad;
        }
        b_ad[[k, 0]] += ln_chi_ad;
    }

    for i in (0..=np).rev() {
        let j = pos + i * (order + 1);
        for k in (0..n_layers).rev() {
            for jj in (1..=order).rev() {
                predictor_ad.ap[[k, jj - 1]] += oc[j + jj] * b_ad[[k, i]];
            }
        }
    }
}
