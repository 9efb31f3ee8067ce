//! Python interface.
//!
//! Only the generic ODPS path is available from Python. Profiles are processed
//! in parallel, with progress reported through the `logging` module.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use ndarray::{Array2, Array3, Axis};
use numpy::prelude::*;
use numpy::{IntoPyArray, PyArray3, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use rayon::prelude::*;

use crate::atmosphere::{AbsorberId, Atmosphere, Geometry};
use crate::coefficients::{ComponentId, SensorGroup, TauCoefficients};
use crate::error::OdpsError;
use crate::odps::Odps;

impl From<OdpsError> for PyErr {
    fn from(e: OdpsError) -> Self {
        match e {
            OdpsError::InconsistentInputs { .. }
            | OdpsError::NotAscending { .. }
            | OdpsError::DegenerateLayer { .. }
            | OdpsError::NonPhysicalProfile { .. }
            | OdpsError::InvalidGeometry { .. }
            | OdpsError::ChannelOutOfRange { .. }
            | OdpsError::InactivePredictor
            | OdpsError::MissingPathModel(_)
            | OdpsError::NotContiguous
            | OdpsError::Cancelled => PyValueError::new_err(e.to_string()),
        }
    }
}

/// Mean pressure of each layer between the given levels.
fn layer_pressure(level_pressure: &[f64]) -> Vec<f64> {
    level_pressure
        .windows(2)
        .map(|w| (w[1] - w[0]) / (w[1] / w[0]).ln())
        .collect()
}

/// An ODPS coefficient table for one sensor.
///
/// `component_ids` and `absorber_ids` are numeric codes (absorbers as in
/// HITRAN: 1 = H2O, 2 = CO2, 3 = O3, ...). The reference profiles are
/// dimensioned as (`n_layers`, `n_absorbers`) and the predictor counts and
/// coefficient positions as (`n_components`, `n_channels`).
#[pyclass(name = "TauCoefficients")]
struct PyTauCoefficients {
    odps: Odps,
}

#[pymethods]
impl PyTauCoefficients {
    #[new]
    #[pyo3(signature = (sensor_id, component_ids, absorber_ids, ref_level_pressure, ref_temperature, ref_absorber, min_absorber, max_absorber, n_predictors, pos_index, coefficients))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        sensor_id: String,
        component_ids: Vec<u8>,
        absorber_ids: Vec<u8>,
        ref_level_pressure: PyReadonlyArray1<'_, f64>,
        ref_temperature: PyReadonlyArray1<'_, f64>,
        ref_absorber: PyReadonlyArray2<'_, f64>,
        min_absorber: PyReadonlyArray2<'_, f64>,
        max_absorber: PyReadonlyArray2<'_, f64>,
        n_predictors: PyReadonlyArray2<'_, u32>,
        pos_index: PyReadonlyArray2<'_, u32>,
        coefficients: PyReadonlyArray1<'_, f64>,
    ) -> PyResult<Self> {
        let component_ids = component_ids
            .into_iter()
            .map(ComponentId::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let absorber_ids = absorber_ids
            .into_iter()
            .map(AbsorberId::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let ref_level_pressure = ref_level_pressure.as_slice()?.to_vec();
        let n_predictors = n_predictors.as_array().mapv(|v| v as usize);

        let coeffs = TauCoefficients {
            sensor_id,
            group: SensorGroup::Generic,
            n_channels: n_predictors.ncols(),
            component_ids,
            absorber_ids,
            ref_pressure: layer_pressure(&ref_level_pressure),
            ref_level_pressure,
            ref_temperature: ref_temperature.as_slice()?.to_vec(),
            ref_absorber: ref_absorber.as_array().to_owned(),
            min_absorber: min_absorber.as_array().to_owned(),
            max_absorber: max_absorber.as_array().to_owned(),
            n_predictors,
            pos_index: pos_index.as_array().mapv(|v| v as usize),
            c: coefficients.as_slice()?.to_vec(),
            optran: None,
        };

        Ok(Self {
            odps: Odps::new(Arc::new(coeffs))?,
        })
    }

    #[getter]
    fn sensor_id(&self) -> String {
        self.odps.coefficients().sensor_id.clone()
    }

    #[getter]
    fn n_channels(&self) -> usize {
        self.odps.coefficients().n_channels
    }

    #[getter]
    fn n_layers(&self) -> usize {
        self.odps.coefficients().n_layers()
    }
}

/// Compute gaseous layer optical depths.
///
/// `level_pressure`: level pressures in hPa, top of the atmosphere first,
/// shape (`num_profiles`, `num_layers + 1`)
///
/// `temperature`: layer temperatures in K, shape (`num_profiles`,
/// `num_layers`)
///
/// `absorber`: layer absorber amounts, shape (`num_profiles`, `num_layers`,
/// `num_absorbers`), with water vapor in g/kg and other gases in ppmv
///
/// `absorber_ids`: HITRAN code of each absorber column
///
/// `sensor_zenith_angle` (degrees) and `surface_altitude` (m) have shape
/// (`num_profiles`, ).
///
/// `channels`: channel indices into the coefficient table
///
/// The result is dimensioned as (`num_profiles`, `num_channels`,
/// `num_layers`).
///
/// The number of worker threads is controlled by `num_threads`. It must be a
/// positive integer, or `None` to automatically choose the number of threads.
#[pyfunction]
#[pyo3(signature = (coefficients, level_pressure, temperature, absorber, absorber_ids, sensor_zenith_angle, surface_altitude, channels, num_threads))]
#[allow(clippy::too_many_arguments)]
fn compute_optical_depth<'py>(
    py: Python<'py>,
    coefficients: PyRef<'py, PyTauCoefficients>,
    level_pressure: PyReadonlyArray2<'py, f64>,
    temperature: PyReadonlyArray2<'py, f64>,
    absorber: PyReadonlyArray3<'py, f64>,
    absorber_ids: Vec<u8>,
    sensor_zenith_angle: PyReadonlyArray1<'py, f64>,
    surface_altitude: PyReadonlyArray1<'py, f64>,
    channels: Vec<usize>,
    num_threads: Option<usize>,
) -> PyResult<Bound<'py, PyArray3<f64>>> {
    let num_profiles = temperature.shape()[0];
    let num_layers = temperature.shape()[1];
    let num_absorbers = absorber_ids.len();
    let num_channels = channels.len();

    // Check shapes of all inputs
    {
        if level_pressure.dims() != [num_profiles, num_layers + 1] {
            return Err(OdpsError::InconsistentInputs {
                what: "level pressure",
                expected: num_layers + 1,
                actual: level_pressure.shape()[1],
            }
            .into());
        }
        if absorber.dims() != [num_profiles, num_layers, num_absorbers] {
            return Err(OdpsError::InconsistentInputs {
                what: "absorber",
                expected: num_profiles * num_layers * num_absorbers,
                actual: absorber.len(),
            }
            .into());
        }
        for (what, len) in [
            ("sensor zenith angle", sensor_zenith_angle.len()),
            ("surface altitude", surface_altitude.len()),
        ] {
            if len != num_profiles {
                return Err(OdpsError::InconsistentInputs {
                    what,
                    expected: num_profiles,
                    actual: len,
                }
                .into());
            }
        }
    }
    debug!("input shapes are consistent");

    let absorber_ids = absorber_ids
        .into_iter()
        .map(AbsorberId::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let odps = &coefficients.odps;
    let level_pressure = level_pressure.as_array();
    let temperature = temperature.as_array();
    let absorber = absorber.as_array();
    let sensor_zenith_angle = sensor_zenith_angle.as_slice()?;
    let surface_altitude = surface_altitude.as_slice()?;

    let mut results = Vec::new();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .build()
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    // These atomics keep track of how many profiles have finished and whether
    // it's time to cancel the computation or not
    let num_completed = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);

    info!(
        "Computing optical depths for {num_profiles} profiles and {num_channels} channels"
    );

    pool.in_place_scope(|s| -> Result<(), PyErr> {
        s.spawn(|_| {
            (0..num_profiles)
                .into_par_iter()
                .map(|profile| -> Result<Array2<f64>, OdpsError> {
                    if cancelled.load(Ordering::Relaxed) {
                        return Err(OdpsError::Cancelled);
                    }

                    let level_pressure = level_pressure
                        .index_axis(Axis(0), profile)
                        .as_slice()
                        .ok_or(OdpsError::NotContiguous)?
                        .to_vec();
                    let atm = Atmosphere {
                        pressure: layer_pressure(&level_pressure),
                        level_pressure,
                        temperature: temperature
                            .index_axis(Axis(0), profile)
                            .as_slice()
                            .ok_or(OdpsError::NotContiguous)?
                            .to_vec(),
                        absorber: absorber.index_axis(Axis(0), profile).to_owned(),
                        absorber_ids: absorber_ids.clone(),
                    };
                    let geo = Geometry {
                        sensor_zenith_angle: sensor_zenith_angle[profile],
                        surface_altitude: surface_altitude[profile],
                    };

                    odps.optical_depth(&atm, &geo, &channels)
                })
                .inspect(|_| {
                    num_completed.fetch_add(1, Ordering::Relaxed);
                })
                .collect_into_vec(&mut results);
        });

        // The work is done in the thread pool, but back here in the main
        // thread, handle progress reporting and checking for early
        // cancellation
        while !cancelled.load(Ordering::Relaxed) {
            if let Err(e) = py.check_signals() {
                cancelled.store(true, Ordering::Relaxed);
                return Err(e);
            }

            let num_completed = num_completed.load(Ordering::Relaxed);
            let progress = num_completed as f32 / num_profiles as f32 * 100.;
            info!("Completed {num_completed}/{num_profiles} profiles ({progress:0.2}%)");

            // All finished without cancelling early
            if num_completed == num_profiles {
                break;
            }

            py.allow_threads(|| {
                std::thread::sleep(Duration::from_secs(5));
            });
        }

        Ok(())
    })?;

    // Copy the intermediate results to the output array
    debug!("copying optical depths");
    let mut output = Array3::zeros([num_profiles, num_channels, num_layers]);
    results
        .into_iter()
        .enumerate()
        .try_for_each(|(index, optical_depth)| -> Result<_, OdpsError> {
            output
                .index_axis_mut(Axis(0), index)
                .assign(&optical_depth?);
            Ok(())
        })?;

    Ok(output.into_pyarray(py))
}

/// A Python module implemented in Rust.
#[pymodule]
fn odps_atmabs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();

    m.add_function(wrap_pyfunction!(compute_optical_depth, m)?)?;
    m.add_class::<PyTauCoefficients>()?;
    Ok(())
}
