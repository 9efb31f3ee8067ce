//! Shared fixtures and end-to-end tests.

use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::{array, Array2, Array3};
use smallvec::smallvec;

use super::*;
use crate::atmosphere::AbsorberId;
use crate::coefficients::{ComponentId, OptranCoefficients};

/// Deterministic pseudo-random values in [-1, 1)
pub(crate) fn perturbation(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64) * 2. - 1.
        })
        .collect()
}

pub(crate) fn perturbation2(shape: (usize, usize), seed: u64) -> Array2<f64> {
    Array2::from_shape_vec(shape, perturbation(shape.0 * shape.1, seed)).unwrap()
}

pub(crate) fn dot2(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

pub(crate) fn dot3(a: &Array3<f64>, b: &Array3<f64>) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

/// Mean pressure of a layer, for a pressure varying exponentially with height
fn layer_pressure(p1: f64, p2: f64) -> f64 {
    (p2 - p1) / (p2 / p1).ln()
}

fn reference_temperature(p: f64) -> f64 {
    205. + 0.075 * p
}

fn reference_water_vapor(p: f64) -> f64 {
    0.003 + 9. * (p / 1100.).powi(3)
}

fn reference_ozone(p: f64) -> f64 {
    0.05 + 8. * (-0.5 * (p / 10.).ln().powi(2)).exp()
}

/// A 14-layer table with four components and three channels.
///
/// Channel 0 uses every predictor, channel 1 a few, and channel 2 computes
/// its water vapor line absorption with OPTRAN.
pub(crate) fn synthetic_coefficients() -> TauCoefficients {
    let ref_level_pressure = vec![
        0.005, 0.05, 0.3, 1., 3., 10., 30., 70., 150., 250., 400., 550., 700., 850., 1100.,
    ];
    let n = ref_level_pressure.len() - 1;
    let ref_pressure: Vec<f64> = ref_level_pressure
        .windows(2)
        .map(|w| layer_pressure(w[0], w[1]))
        .collect();

    let mut ref_absorber = Array2::zeros([n, 2]);
    for (k, &p) in ref_pressure.iter().enumerate() {
        ref_absorber[[k, 0]] = reference_water_vapor(p);
        ref_absorber[[k, 1]] = reference_ozone(p);
    }

    let n_predictors: Array2<usize> = array![[7, 3, 7], [6, 0, 6], [4, 2, 4], [6, 0, 2]];
    let mut pos_index = Array2::zeros(n_predictors.raw_dim());
    let mut pos = 0;
    for ((j, l), &np) in n_predictors.indexed_iter() {
        pos_index[[j, l]] = pos;
        pos += np * n;
    }
    let c = (0..pos)
        .map(|i| 1e-3 * (1. + 0.5 * (0.37 * i as f64).sin()))
        .collect();

    let optran = OptranCoefficients {
        alpha_c1: 12.,
        alpha_c2: -8.,
        significance: vec![false, false, true],
        order: vec![0, 0, 3],
        predictor_index: vec![smallvec![], smallvec![], smallvec![0, 2, 4]],
        pos_index: vec![0, 0, 0],
        coefficients: vec![
            -7., 0.5, 0.1, 0.05, // intercept
            1e-3, 1e-4, 0., 0., // T
            1e-6, 0., 1e-7, 0., // T²
            1e-7, 1e-8, 0., 0., // T·P
        ],
    };

    TauCoefficients {
        sensor_id: "synthetic".into(),
        group: SensorGroup::Generic,
        n_channels: 3,
        component_ids: vec![
            ComponentId::Dry,
            ComponentId::WaterLine,
            ComponentId::WaterContinuum,
            ComponentId::Ozone,
        ],
        absorber_ids: vec![AbsorberId::H2O, AbsorberId::O3],
        ref_temperature: ref_pressure.iter().map(|&p| reference_temperature(p)).collect(),
        min_absorber: ref_absorber.mapv(|q| 0.1 * q),
        max_absorber: ref_absorber.mapv(|q| 10. * q),
        ref_absorber,
        ref_level_pressure,
        ref_pressure,
        n_predictors,
        pos_index,
        c,
        optran: Some(optran),
    }
}

/// An 8-layer profile close to the reference, with the absorbers in the
/// opposite order to the table.
pub(crate) fn sample_atmosphere() -> Atmosphere {
    let level_pressure = vec![0.1, 5., 50., 150., 300., 500., 700., 850., 1000.];
    let pressure: Vec<f64> = level_pressure
        .windows(2)
        .map(|w| layer_pressure(w[0], w[1]))
        .collect();
    let mut absorber = Array2::zeros([pressure.len(), 2]);
    for (k, &p) in pressure.iter().enumerate() {
        absorber[[k, 0]] = 0.9 * reference_ozone(p);
        absorber[[k, 1]] = 1.1 * reference_water_vapor(p);
    }
    Atmosphere {
        temperature: pressure.iter().map(|&p| 200. + 0.08 * p).collect(),
        level_pressure,
        pressure,
        absorber,
        absorber_ids: vec![AbsorberId::O3, AbsorberId::H2O],
    }
}

pub(crate) fn sample_geometry() -> Geometry {
    Geometry {
        sensor_zenith_angle: 35.,
        surface_altitude: 150.,
    }
}

fn model() -> Odps {
    Odps::new(Arc::new(synthetic_coefficients())).unwrap()
}

/// A temperature and water vapor perturbation of `atm`.
fn increment(atm: &Atmosphere, seed: u64) -> Atmosphere {
    let mut atm_tl = atm.zeroed_like();
    atm_tl.temperature = perturbation(atm.n_layers(), seed);
    let h2o = atm.absorber_index(AbsorberId::H2O).unwrap();
    let dq = perturbation(atm.n_layers(), seed + 1);
    for (k, dq) in dq.into_iter().enumerate() {
        atm_tl.absorber[[k, h2o]] = 0.05 * atm.absorber[[k, h2o]] * dq;
    }
    atm_tl
}

fn add_scaled(atm: &Atmosphere, atm_tl: &Atmosphere, eps: f64) -> Atmosphere {
    let mut out = atm.clone();
    for (t, dt) in out.temperature.iter_mut().zip(&atm_tl.temperature) {
        *t += eps * dt;
    }
    out.absorber.scaled_add(eps, &atm_tl.absorber);
    out
}

#[test]
fn synthetic_table_is_valid() {
    let coeffs = synthetic_coefficients();
    assert_eq!(coeffs.validate(), Ok(()));
    assert_eq!(coeffs.n_layers(), 14);
}

#[test]
fn inconsistent_table_is_rejected() {
    let mut coeffs = synthetic_coefficients();
    coeffs.ref_temperature.pop();
    assert_eq!(
        Odps::new(Arc::new(coeffs)).unwrap_err(),
        OdpsError::InconsistentInputs {
            what: "reference temperature",
            expected: 14,
            actual: 13
        }
    );

    let mut coeffs = synthetic_coefficients();
    coeffs.n_predictors[[2, 0]] = 5;
    assert!(matches!(
        coeffs.validate(),
        Err(OdpsError::InconsistentInputs {
            what: "predictor count",
            ..
        })
    ));
}

#[test]
fn optical_depths_are_physical() {
    let odps = model();
    let atm = sample_atmosphere();
    let predictor = odps.compute_predictors(&atm, &sample_geometry(), false).unwrap();
    for channel in 0..3 {
        let absorption = odps.compute_atm_absorption(channel, &predictor).unwrap();
        assert_eq!(absorption.optical_depth.len(), atm.n_layers());
        assert!(absorption.optical_depth.iter().all(|od| od.is_finite() && *od >= 0.));

        let path = absorption.optical_path();
        assert_eq!(path.od_path[0], 0.);
        assert!(path.od_path.windows(2).all(|w| w[1] >= w[0]));
        assert!(path
            .layer_optical_depth()
            .iter()
            .all(|&od| (0. ..=OdpsOptions::MAX_OD).contains(&od)));
    }
}

#[test]
fn channel_out_of_range() {
    let odps = model();
    let predictor = odps
        .compute_predictors(&sample_atmosphere(), &sample_geometry(), false)
        .unwrap();
    assert_eq!(
        odps.compute_atm_absorption(3, &predictor),
        Err(OdpsError::ChannelOutOfRange {
            channel: 3,
            n_channels: 3
        })
    );
}

#[test]
fn optran_replaces_the_water_line_regression() {
    let coeffs = Arc::new(synthetic_coefficients());
    let atm = sample_atmosphere();
    let geo = sample_geometry();

    let with_optran = Odps::new(coeffs.clone()).unwrap();
    let without = Odps::with_options(
        coeffs,
        OdpsOptions {
            allow_optran: false,
            ..OdpsOptions::default()
        },
    )
    .unwrap();

    let a = with_optran.optical_depth(&atm, &geo, &[0, 2]).unwrap();
    let b = without.optical_depth(&atm, &geo, &[0, 2]).unwrap();
    // Channel 0 never uses OPTRAN
    assert_eq!(a.row(0), b.row(0));
    assert!(a.row(1).iter().zip(b.row(1)).any(|(x, y)| x != y));
}

#[test]
fn persistence_does_not_change_the_forward_result() {
    let odps = model();
    let atm = sample_atmosphere();
    let geo = sample_geometry();
    let transient = odps.compute_predictors(&atm, &geo, false).unwrap();
    let persistent = odps.compute_predictors(&atm, &geo, true).unwrap();
    assert!(persistent.is_persistent());
    assert_eq!(transient.x, persistent.x);
    assert_eq!(transient.secant_zenith, persistent.secant_zenith);
    for channel in 0..3 {
        assert_eq!(
            odps.compute_atm_absorption(channel, &transient).unwrap(),
            odps.compute_atm_absorption(channel, &persistent).unwrap()
        );
    }
}

#[test]
fn tangent_linear_matches_finite_difference() {
    let odps = model();
    let atm = sample_atmosphere();
    let geo = sample_geometry();
    let atm_tl = increment(&atm, 51);

    let predictor = odps.compute_predictors(&atm, &geo, true).unwrap();
    let predictor_tl = odps.compute_predictors_tl(&atm_tl, &predictor).unwrap();

    let eps = 1e-3;
    let plus = odps
        .optical_depth(&add_scaled(&atm, &atm_tl, eps), &geo, &[0, 1, 2])
        .unwrap();
    let minus = odps
        .optical_depth(&add_scaled(&atm, &atm_tl, -eps), &geo, &[0, 1, 2])
        .unwrap();

    for channel in 0..3 {
        let absorption = odps.compute_atm_absorption(channel, &predictor).unwrap();
        let od_tl = odps
            .compute_atm_absorption_tl(channel, &predictor, &absorption, &predictor_tl)
            .unwrap();
        for (k, tl) in od_tl.iter().enumerate() {
            let fd = (plus[[channel, k]] - minus[[channel, k]]) / (2. * eps);
            assert_relative_eq!(fd, *tl, epsilon = 1e-10, max_relative = 1e-4);
        }
    }
}

#[test]
fn driver_adjoint_symmetry() {
    let odps = model();
    let atm = sample_atmosphere();
    let predictor = odps.compute_predictors(&atm, &sample_geometry(), true).unwrap();
    let (n, np, nc) = predictor.x.dim();

    let mut atm_tl = increment(&atm, 61);
    let o3 = atm.absorber_index(AbsorberId::O3).unwrap();
    for (k, dq) in perturbation(atm.n_layers(), 63).into_iter().enumerate() {
        atm_tl.absorber[[k, o3]] = 0.05 * atm.absorber[[k, o3]] * dq;
    }
    let predictor_tl = odps.compute_predictors_tl(&atm_tl, &predictor).unwrap();

    let mut predictor_ad = predictor.zeroed_like();
    predictor_ad.x = Array3::from_shape_vec([n, np, nc], perturbation(n * np * nc, 64)).unwrap();
    predictor_ad.secant_zenith = perturbation(n, 65);
    let optran_ad = predictor_ad.optran.as_mut().unwrap();
    optran_ad.ox = perturbation2(optran_ad.ox.dim(), 66).mapv(|v| 1e-4 * v);
    optran_ad.ap = perturbation2(optran_ad.ap.dim(), 67);
    optran_ad.da = perturbation(n, 68);
    let seed = predictor_ad.clone();

    let mut atm_ad = atm.zeroed_like();
    odps.compute_predictors_ad(&mut predictor_ad, &predictor, &mut atm_ad)
        .unwrap();

    let op_tl = predictor_tl.optran.as_ref().unwrap();
    let op_seed = seed.optran.as_ref().unwrap();
    let lhs = dot3(&predictor_tl.x, &seed.x)
        + dot(&predictor_tl.secant_zenith, &seed.secant_zenith)
        + dot2(&op_tl.ox, &op_seed.ox)
        + dot2(&op_tl.ap, &op_seed.ap)
        + dot(&op_tl.da, &op_seed.da);
    let rhs = dot(&atm_ad.temperature, &atm_tl.temperature) + dot2(&atm_ad.absorber, &atm_tl.absorber);
    assert_relative_eq!(lhs, rhs, max_relative = 1e-10);

    // The predictor adjoint is consumed
    assert!(predictor_ad.x.iter().all(|&v| v == 0.));
    assert!(predictor_ad.secant_zenith.iter().all(|&v| v == 0.));
    assert!(predictor_ad.optran.as_ref().unwrap().da.iter().all(|&v| v == 0.));
}

#[test]
fn full_chain_adjoint_symmetry() {
    let odps = model();
    let atm = sample_atmosphere();
    let predictor = odps.compute_predictors(&atm, &sample_geometry(), true).unwrap();
    let atm_tl = increment(&atm, 71);
    let predictor_tl = odps.compute_predictors_tl(&atm_tl, &predictor).unwrap();

    for channel in 0..3 {
        let absorption = odps.compute_atm_absorption(channel, &predictor).unwrap();
        let od_tl = odps
            .compute_atm_absorption_tl(channel, &predictor, &absorption, &predictor_tl)
            .unwrap();

        let seed = perturbation(atm.n_layers(), 72 + channel as u64);
        let mut od_ad = seed.clone();
        let mut predictor_ad = predictor.zeroed_like();
        odps.compute_atm_absorption_ad(channel, &predictor, &absorption, &mut od_ad, &mut predictor_ad)
            .unwrap();
        assert!(od_ad.iter().all(|&v| v == 0.));

        let mut atm_ad = atm.zeroed_like();
        odps.compute_predictors_ad(&mut predictor_ad, &predictor, &mut atm_ad)
            .unwrap();

        let lhs = dot(&od_tl, &seed);
        let rhs = dot(&atm_ad.temperature, &atm_tl.temperature)
            + dot2(&atm_ad.absorber, &atm_tl.absorber);
        assert_relative_eq!(lhs, rhs, max_relative = 1e-10);
    }
}

#[test]
fn zero_ozone_keeps_derivatives_finite() {
    let odps = Odps::with_options(
        Arc::new(synthetic_coefficients()),
        OdpsOptions {
            apply_absorber_limits: false,
            ..OdpsOptions::default()
        },
    )
    .unwrap();
    let mut atm = sample_atmosphere();
    let o3 = atm.absorber_index(AbsorberId::O3).unwrap();
    atm.absorber.column_mut(o3).fill(0.);

    let predictor = odps.compute_predictors(&atm, &sample_geometry(), true).unwrap();
    let mut atm_tl = atm.zeroed_like();
    atm_tl.temperature = perturbation(atm.n_layers(), 81);
    let predictor_tl = odps.compute_predictors_tl(&atm_tl, &predictor).unwrap();

    for channel in 0..3 {
        let absorption = odps.compute_atm_absorption(channel, &predictor).unwrap();
        assert!(absorption.optical_depth.iter().all(|od| od.is_finite()));
        let od_tl = odps
            .compute_atm_absorption_tl(channel, &predictor, &absorption, &predictor_tl)
            .unwrap();
        assert!(od_tl.iter().all(|v| v.is_finite()));

        let seed = perturbation(atm.n_layers(), 82 + channel as u64);
        let mut od_ad = seed.clone();
        let mut predictor_ad = predictor.zeroed_like();
        odps.compute_atm_absorption_ad(channel, &predictor, &absorption, &mut od_ad, &mut predictor_ad)
            .unwrap();
        let mut atm_ad = atm.zeroed_like();
        odps.compute_predictors_ad(&mut predictor_ad, &predictor, &mut atm_ad)
            .unwrap();
        assert!(atm_ad.temperature.iter().all(|v| v.is_finite()));
        assert!(atm_ad.absorber.iter().all(|v| v.is_finite()));

        let lhs = dot(&od_tl, &seed);
        let rhs = dot(&atm_ad.temperature, &atm_tl.temperature);
        assert_relative_eq!(lhs, rhs, max_relative = 1e-10);
    }
}

#[test]
fn adjoint_accumulates_into_existing_values() {
    let odps = model();
    let atm = sample_atmosphere();
    let predictor = odps.compute_predictors(&atm, &sample_geometry(), true).unwrap();
    let absorption = odps.compute_atm_absorption(0, &predictor).unwrap();

    let run = |atm_ad: &mut Atmosphere| {
        let mut od_ad = vec![1.; atm.n_layers()];
        let mut predictor_ad = predictor.zeroed_like();
        odps.compute_atm_absorption_ad(0, &predictor, &absorption, &mut od_ad, &mut predictor_ad)
            .unwrap();
        odps.compute_predictors_ad(&mut predictor_ad, &predictor, atm_ad)
            .unwrap();
    };

    let mut once = atm.zeroed_like();
    run(&mut once);
    let mut twice = atm.zeroed_like();
    run(&mut twice);
    run(&mut twice);
    for (a, b) in once.temperature.iter().zip(&twice.temperature) {
        assert_relative_eq!(2. * a, *b, max_relative = 1e-12);
    }
}

/// Optical path linear in `ln(p)`, with slope `self.0`.
#[derive(Debug)]
struct LogPressurePath(f64);

impl OpticalPathModel for LogPressurePath {
    fn optical_path(&self, _channel: usize, predictor: &Predictor) -> Result<OpticalPath> {
        let top = predictor.ref_ln_press[0];
        Ok(OpticalPath::from_path(
            predictor
                .ref_ln_press
                .iter()
                .map(|ln_p| self.0 * (ln_p - top))
                .collect(),
        ))
    }

    fn optical_path_tl(
        &self,
        _channel: usize,
        predictor: &Predictor,
        _path: &OpticalPath,
        _predictor_tl: &Predictor,
    ) -> Result<Vec<f64>> {
        Ok(vec![0.; predictor.ref_ln_press.len()])
    }

    fn optical_path_ad(
        &self,
        _channel: usize,
        _predictor: &Predictor,
        _path: &OpticalPath,
        od_path_ad: &mut [f64],
        _predictor_ad: &mut Predictor,
    ) -> Result<()> {
        od_path_ad.fill(0.);
        Ok(())
    }
}

#[test]
fn zssmis_sensors_use_the_registered_model() {
    let mut coeffs = synthetic_coefficients();
    coeffs.group = SensorGroup::Zssmis;
    let coeffs = Arc::new(coeffs);
    let atm = sample_atmosphere();
    let geo = sample_geometry();

    let odps = Odps::new(coeffs.clone()).unwrap();
    let predictor = odps.compute_predictors(&atm, &geo, false).unwrap();
    assert_eq!(
        odps.compute_atm_absorption(0, &predictor),
        Err(OdpsError::MissingPathModel(SensorGroup::Zssmis))
    );

    let slope = 0.2;
    let odps = odps.with_zssmis_model(Arc::new(LogPressurePath(slope)));
    let absorption = odps.compute_atm_absorption(0, &predictor).unwrap();
    for (k, od) in absorption.optical_depth.iter().enumerate() {
        let expected = slope * (atm.level_pressure[k + 1] / atm.level_pressure[k]).ln()
            / geo.secant_zenith();
        // The path is zero at the user's top level
        if k > 0 {
            assert_relative_eq!(*od, expected, max_relative = 1e-10);
        }
    }
}

#[test]
fn batch_matches_serial_evaluation() {
    let odps = model();
    let atm = sample_atmosphere();
    let mut tilted = atm.clone();
    for t in &mut tilted.temperature {
        *t += 4.;
    }
    let mut broken = atm.clone();
    broken.level_pressure.swap(2, 3);

    let geo = sample_geometry();
    let nadir = Geometry {
        sensor_zenith_angle: 0.,
        ..geo
    };
    let profiles = vec![(atm.clone(), geo), (tilted, nadir), (broken, geo)];
    let channels = [2, 0];

    let results = odps.optical_depth_batch(&profiles, &channels);
    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].as_ref().unwrap(),
        &odps.optical_depth(&atm, &geo, &channels).unwrap()
    );
    assert_eq!(results[1].as_ref().unwrap().dim(), (2, atm.n_layers()));
    assert!(matches!(results[2], Err(OdpsError::NotAscending { .. })));
}
