//! Gaseous absorption by optical depth in pressure space (ODPS)
//!
//! Layer optical depths for a sensor's channels are computed from a trained
//! regression on a fixed internal pressure grid. A caller's atmosphere profile
//! is mapped onto that grid, the regression predictors are evaluated there,
//! and the resulting level-to-space optical path is interpolated back onto the
//! caller's levels. Every stage has tangent-linear and adjoint forms for
//! variational data assimilation.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use odps_atmabs::{Atmosphere, Geometry, Odps, TauCoefficients};
//! # fn run(coeffs: TauCoefficients, atm: Atmosphere, geo: Geometry) -> odps_atmabs::Result<()> {
//! let odps = Odps::new(Arc::new(coeffs))?;
//! let predictor = odps.compute_predictors(&atm, &geo, false)?;
//! let absorption = odps.compute_atm_absorption(0, &predictor)?;
//! println!("{:?}", absorption.optical_depth);
//! # Ok(())
//! # }
//! ```
//!
//! NOTE: the Python bindings (feature `python`) live in their own module and
//! are the only place `pyo3` is used.

pub mod atmosphere;
pub mod coefficients;
pub mod error;
pub mod odps;
pub mod options;
#[cfg(feature = "python")]
mod python;

pub use atmosphere::{AbsorberId, Atmosphere, Geometry};
pub use coefficients::{ComponentId, OptranCoefficients, SensorGroup, TauCoefficients};
pub use error::{OdpsError, Result};
pub use odps::{AtmAbsorption, Odps, OdpsPath, OpticalPath, OpticalPathModel, Predictor};
pub use options::OdpsOptions;
