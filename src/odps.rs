//! Optical depth in pressure space.
//!
//! [`Odps`] is the handle callers use. It owns a shared, validated
//! [`TauCoefficients`] table and the optical path model for the table's
//! sensor group, and exposes the forward, tangent-linear and adjoint forms of
//! the two stages of the calculation:
//!
//! 1. [`Odps::compute_predictors`] maps an atmosphere profile onto the
//!    internal pressure grid and computes the regression predictors.
//! 2. [`Odps::compute_atm_absorption`] evaluates the optical depth of one
//!    channel from those predictors, on the caller's layers.
//!
//! For tangent-linear and adjoint work the forward predictors must be
//! computed with `persistent = true`. Adjoint methods consume (zero) the
//! adjoint inputs and accumulate (`+=`) into the adjoint outputs.

mod absorption;
mod geopotential;
pub mod interpolation;
mod mapping;
mod optran;
mod path_model;
pub mod predictor;
#[cfg(test)]
pub(crate) mod tests;

use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

pub use absorption::{AtmAbsorption, OdpsPath};
pub use path_model::{OpticalPath, OpticalPathModel};
pub use predictor::{OptranPredictor, Predictor};

use crate::atmosphere::{Atmosphere, Geometry};
use crate::coefficients::{SensorGroup, TauCoefficients};
use crate::error::{OdpsError, Result};
use crate::options::OdpsOptions;

/// Gaseous absorption model for one sensor.
#[derive(Debug, Clone)]
pub struct Odps {
    coeffs: Arc<TauCoefficients>,
    options: OdpsOptions,
    /// Optical path model for the table's sensor group, if available
    path_model: Option<Arc<dyn OpticalPathModel>>,
}

impl Odps {
    /// Validate the coefficient table and build a model with default options.
    pub fn new(coeffs: Arc<TauCoefficients>) -> Result<Self> {
        Self::with_options(coeffs, OdpsOptions::default())
    }

    /// Validate the coefficient table and build a model.
    pub fn with_options(coeffs: Arc<TauCoefficients>, options: OdpsOptions) -> Result<Self> {
        coeffs.validate()?;
        info!(
            "{}: {} channels, {} internal layers, {} components{}",
            coeffs.sensor_id,
            coeffs.n_channels,
            coeffs.n_layers(),
            coeffs.n_components(),
            if coeffs.optran.is_some() { ", OPTRAN" } else { "" }
        );

        let path_model: Option<Arc<dyn OpticalPathModel>> = match coeffs.group {
            SensorGroup::Generic => Some(Arc::new(OdpsPath::new(coeffs.clone(), options))),
            SensorGroup::Zssmis => None,
        };
        Ok(Self {
            coeffs,
            options,
            path_model,
        })
    }

    /// Register the optical path model for SSMIS Zeeman channels.
    ///
    /// Only used when the table's group is [`SensorGroup::Zssmis`].
    pub fn with_zssmis_model(mut self, model: Arc<dyn OpticalPathModel>) -> Self {
        if self.coeffs.group == SensorGroup::Zssmis {
            self.path_model = Some(model);
        } else {
            debug!(
                "{}: ignoring ZSSMIS model for a {:?} sensor",
                self.coeffs.sensor_id, self.coeffs.group
            );
        }
        self
    }

    /// The coefficient table.
    pub fn coefficients(&self) -> &TauCoefficients {
        &self.coeffs
    }

    /// The options the model was built with.
    pub fn options(&self) -> &OdpsOptions {
        &self.options
    }

    fn path_model(&self) -> Result<&dyn OpticalPathModel> {
        self.path_model
            .as_deref()
            .ok_or(OdpsError::MissingPathModel(self.coeffs.group))
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel < self.coeffs.n_channels {
            Ok(())
        } else {
            Err(OdpsError::ChannelOutOfRange {
                channel,
                n_channels: self.coeffs.n_channels,
            })
        }
    }

    /// Map a profile onto the internal grid and compute its predictors.
    ///
    /// With `persistent` set, the forward intermediates are kept in the
    /// returned predictor for later tangent-linear and adjoint calls.
    pub fn compute_predictors(
        &self,
        atm: &Atmosphere,
        geo: &Geometry,
        persistent: bool,
    ) -> Result<Predictor> {
        mapping::compute_predictors(&self.coeffs, &self.options, atm, geo, persistent)
    }

    /// Predictor perturbation for a temperature/absorber perturbation
    /// `atm_tl` of the profile `predictor` was computed from.
    pub fn compute_predictors_tl(
        &self,
        atm_tl: &Atmosphere,
        predictor: &Predictor,
    ) -> Result<Predictor> {
        mapping::compute_predictors_tl(&self.coeffs, predictor, atm_tl)
    }

    /// Adjoint of [`Odps::compute_predictors_tl`].
    ///
    /// Consumes `predictor_ad` and accumulates into the temperature and
    /// absorber of `atm_ad`.
    pub fn compute_predictors_ad(
        &self,
        predictor_ad: &mut Predictor,
        predictor: &Predictor,
        atm_ad: &mut Atmosphere,
    ) -> Result<()> {
        mapping::compute_predictors_ad(&self.coeffs, predictor, predictor_ad, atm_ad)
    }

    /// Optical depth of `channel` on the caller's layers.
    pub fn compute_atm_absorption(
        &self,
        channel: usize,
        predictor: &Predictor,
    ) -> Result<AtmAbsorption> {
        self.check_channel(channel)?;
        absorption::compute_atm_absorption(self.path_model()?, channel, predictor)
    }

    /// Optical depth perturbation for a predictor perturbation.
    ///
    /// `absorption` is the forward result for the same channel and predictor.
    pub fn compute_atm_absorption_tl(
        &self,
        channel: usize,
        predictor: &Predictor,
        absorption: &AtmAbsorption,
        predictor_tl: &Predictor,
    ) -> Result<Vec<f64>> {
        self.check_channel(channel)?;
        absorption::compute_atm_absorption_tl(
            self.path_model()?,
            channel,
            predictor,
            absorption,
            predictor_tl,
        )
    }

    /// Adjoint of [`Odps::compute_atm_absorption_tl`].
    ///
    /// Consumes `optical_depth_ad` and accumulates into `predictor_ad`.
    pub fn compute_atm_absorption_ad(
        &self,
        channel: usize,
        predictor: &Predictor,
        absorption: &AtmAbsorption,
        optical_depth_ad: &mut [f64],
        predictor_ad: &mut Predictor,
    ) -> Result<()> {
        self.check_channel(channel)?;
        absorption::compute_atm_absorption_ad(
            self.path_model()?,
            channel,
            predictor,
            absorption,
            optical_depth_ad,
            predictor_ad,
        )
    }

    /// Optical depths of one profile for several channels, dimensioned as
    /// (`channels.len()`, `n_layers`).
    pub fn optical_depth(
        &self,
        atm: &Atmosphere,
        geo: &Geometry,
        channels: &[usize],
    ) -> Result<Array2<f64>> {
        let predictor = self.compute_predictors(atm, geo, false)?;
        let mut output = Array2::zeros([channels.len(), atm.n_layers()]);
        for (mut row, &channel) in output.rows_mut().into_iter().zip(channels) {
            let absorption = self.compute_atm_absorption(channel, &predictor)?;
            row.assign(&ArrayView1::from(absorption.optical_depth.as_slice()));
        }
        Ok(output)
    }

    /// [`Odps::optical_depth`] for independent profiles, evaluated in
    /// parallel on the current rayon thread pool.
    pub fn optical_depth_batch(
        &self,
        profiles: &[(Atmosphere, Geometry)],
        channels: &[usize],
    ) -> Vec<Result<Array2<f64>>> {
        debug!(
            "{}: {} profiles, {} channels",
            self.coeffs.sensor_id,
            profiles.len(),
            channels.len()
        );
        profiles
            .par_iter()
            .map(|(atm, geo)| self.optical_depth(atm, geo, channels))
            .collect()
    }
}
