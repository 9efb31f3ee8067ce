//! ODPS transmittance coefficient table.
//!
//! The table is produced by an external loader and is read-only afterwards.
//! It is shared between threads as an `Arc<TauCoefficients>`.

use ndarray::Array2;
use smallvec::SmallVec;

use crate::atmosphere::AbsorberId;
use crate::error::{check_ascending, check_len, OdpsError, Result};

/// Sensor families that need different optical path treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorGroup {
    /// Ordinary sensors, handled by the per-component regression.
    Generic,
    /// SSMIS upper-atmosphere channels, which need a dedicated model.
    Zssmis,
}

/// Physical absorption mechanisms with their own trained predictor sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentId {
    /// Mixed (dry) gases
    Dry,
    /// Water vapor line absorption
    WaterLine,
    /// Water vapor continuum absorption
    WaterContinuum,
    /// Ozone
    Ozone,
    /// Carbon dioxide
    CarbonDioxide,
    /// Nitrous oxide
    NitrousOxide,
    /// Carbon monoxide
    CarbonMonoxide,
    /// Methane
    Methane,
}

impl TryFrom<u8> for ComponentId {
    type Error = OdpsError;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            1 => Self::Dry,
            2 => Self::WaterLine,
            3 => Self::WaterContinuum,
            4 => Self::Ozone,
            5 => Self::CarbonDioxide,
            6 => Self::NitrousOxide,
            7 => Self::CarbonMonoxide,
            8 => Self::Methane,
            _ => {
                return Err(OdpsError::InconsistentInputs {
                    what: "component id",
                    expected: 8,
                    actual: id.into(),
                })
            }
        })
    }
}

impl ComponentId {
    /// The absorber whose amount drives this component, if any.
    pub fn absorber(self) -> Option<AbsorberId> {
        match self {
            Self::Dry => None,
            Self::WaterLine | Self::WaterContinuum => Some(AbsorberId::H2O),
            Self::Ozone => Some(AbsorberId::O3),
            Self::CarbonDioxide => Some(AbsorberId::CO2),
            Self::NitrousOxide => Some(AbsorberId::N2O),
            Self::CarbonMonoxide => Some(AbsorberId::CO),
            Self::Methane => Some(AbsorberId::CH4),
        }
    }
}

/// Coefficients for the OPTRAN water vapor line model.
#[derive(Debug, Clone, PartialEq)]
pub struct OptranCoefficients {
    /// Scale of the log absorber amount used for the polynomial basis.
    pub alpha_c1: f64,
    /// Offset of the log absorber amount used for the polynomial basis.
    pub alpha_c2: f64,
    /// Per channel, whether the water line OD comes from OPTRAN.
    pub significance: Vec<bool>,
    /// Per channel polynomial order.
    pub order: Vec<usize>,
    /// Per channel OPTRAN predictor indices (into `OX`).
    pub predictor_index: Vec<SmallVec<[usize; 8]>>,
    /// Per channel start of the coefficient block in `coefficients`.
    pub pos_index: Vec<usize>,
    /// Flat coefficients. For predictor `i` (0 is the intercept) the
    /// `order + 1` polynomial coefficients start at `pos + i * (order + 1)`.
    pub coefficients: Vec<f64>,
}

/// The ODPS coefficient table for one sensor.
///
/// Level pressures are in hPa, ordered from the top of the atmosphere down.
#[derive(Debug, Clone, PartialEq)]
pub struct TauCoefficients {
    /// Sensor identifier, for log messages.
    pub sensor_id: String,
    /// Which optical path model the sensor uses.
    pub group: SensorGroup,
    /// Number of channels.
    pub n_channels: usize,
    /// Components in the order of the coefficient tables.
    pub component_ids: Vec<ComponentId>,
    /// Absorbers in the order of the reference profiles.
    pub absorber_ids: Vec<AbsorberId>,
    /// Internal level pressures, length `n_layers + 1`.
    pub ref_level_pressure: Vec<f64>,
    /// Internal layer pressures.
    pub ref_pressure: Vec<f64>,
    /// Reference temperature profile in K.
    pub ref_temperature: Vec<f64>,
    /// Reference absorber profiles, shape (`n_layers`, `n_absorbers`).
    pub ref_absorber: Array2<f64>,
    /// Smallest absorber amount seen in training, same shape as `ref_absorber`.
    pub min_absorber: Array2<f64>,
    /// Largest absorber amount seen in training, same shape as `ref_absorber`.
    pub max_absorber: Array2<f64>,
    /// Number of predictors, shape (`n_components`, `n_channels`).
    pub n_predictors: Array2<usize>,
    /// Start of each coefficient block in `c`, shape (`n_components`, `n_channels`).
    pub pos_index: Array2<usize>,
    /// Flat regression coefficients. Predictor `i` at layer `k` uses
    /// `c[pos + i * n_layers + k]`.
    pub c: Vec<f64>,
    /// OPTRAN water vapor line coefficients, if trained.
    pub optran: Option<OptranCoefficients>,
}

impl TauCoefficients {
    /// Number of internal layers.
    pub fn n_layers(&self) -> usize {
        self.ref_pressure.len()
    }

    /// Number of components.
    pub fn n_components(&self) -> usize {
        self.component_ids.len()
    }

    /// Column of the reference profiles holding species `id`.
    pub fn absorber_index(&self, id: AbsorberId) -> Option<usize> {
        self.absorber_ids.iter().position(|&a| a == id)
    }

    /// Check every size relation in the table, and that the reference
    /// absorber amounts are positive with ordered limits.
    pub fn validate(&self) -> Result<()> {
        let n_layers = self.n_layers();
        let n_absorbers = self.absorber_ids.len();
        let n_components = self.n_components();

        check_len("reference level pressure", n_layers + 1, self.ref_level_pressure.len())?;
        check_ascending("reference level pressure", &self.ref_level_pressure)?;
        if self.ref_level_pressure[0] <= 0. {
            return Err(OdpsError::NotAscending {
                what: "reference level pressure (non-positive)",
                index: 0,
            });
        }
        check_len("reference temperature", n_layers, self.ref_temperature.len())?;
        for (what, table) in [
            ("reference absorber", &self.ref_absorber),
            ("minimum absorber", &self.min_absorber),
            ("maximum absorber", &self.max_absorber),
        ] {
            check_len(what, n_layers, table.nrows())?;
            check_len(what, n_absorbers, table.ncols())?;
        }
        if let Some(((layer, column), _)) =
            self.ref_absorber.indexed_iter().find(|&(_, &q)| q <= 0. || q.is_nan())
        {
            return Err(OdpsError::NonPhysicalProfile {
                what: "reference absorber (non-positive)",
                layer,
                column,
            });
        }
        if let Some(((layer, column), _)) = self
            .min_absorber
            .indexed_iter()
            .find(|&(idx, &lo)| lo > self.max_absorber[idx])
        {
            return Err(OdpsError::NonPhysicalProfile {
                what: "absorber limits (minimum above maximum)",
                layer,
                column,
            });
        }
        for (what, table) in [
            ("predictor counts", &self.n_predictors),
            ("coefficient positions", &self.pos_index),
        ] {
            check_len(what, n_components, table.nrows())?;
            check_len(what, self.n_channels, table.ncols())?;
        }

        for (j, component) in self.component_ids.iter().enumerate() {
            if let Some(absorber) = component.absorber() {
                if self.absorber_index(absorber).is_none() {
                    return Err(OdpsError::InconsistentInputs {
                        what: "reference profile for a component's absorber",
                        expected: 1,
                        actual: 0,
                    });
                }
            }
            for l in 0..self.n_channels {
                let np = self.n_predictors[[j, l]];
                let max_np = crate::odps::predictor::max_predictors(*component);
                if np > max_np {
                    return Err(OdpsError::InconsistentInputs {
                        what: "predictor count",
                        expected: max_np,
                        actual: np,
                    });
                }
                if np > 0 {
                    let end = self.pos_index[[j, l]] + np * n_layers;
                    if end > self.c.len() {
                        return Err(OdpsError::InconsistentInputs {
                            what: "regression coefficients",
                            expected: end,
                            actual: self.c.len(),
                        });
                    }
                }
            }
        }

        if let Some(optran) = &self.optran {
            optran.validate(self.n_channels)?;
            if self.absorber_index(AbsorberId::H2O).is_none() {
                return Err(OdpsError::InconsistentInputs {
                    what: "water vapor for OPTRAN",
                    expected: 1,
                    actual: 0,
                });
            }
        }
        Ok(())
    }
}

impl OptranCoefficients {
    /// Number of OPTRAN predictors (not counting the intercept) for a channel.
    pub fn n_predictors(&self, channel: usize) -> usize {
        self.predictor_index[channel].len()
    }

    fn validate(&self, n_channels: usize) -> Result<()> {
        use crate::odps::predictor::{MAX_OPTRAN_ORDER, MAX_OPTRAN_PREDICTORS};

        check_len("OPTRAN significance", n_channels, self.significance.len())?;
        check_len("OPTRAN order", n_channels, self.order.len())?;
        check_len("OPTRAN predictor index", n_channels, self.predictor_index.len())?;
        check_len("OPTRAN coefficient positions", n_channels, self.pos_index.len())?;
        for l in 0..n_channels {
            let order = self.order[l];
            if order > MAX_OPTRAN_ORDER {
                return Err(OdpsError::InconsistentInputs {
                    what: "OPTRAN order",
                    expected: MAX_OPTRAN_ORDER,
                    actual: order,
                });
            }
            if let Some(&ip) = self
                .predictor_index[l]
                .iter()
                .find(|&&ip| ip >= MAX_OPTRAN_PREDICTORS)
            {
                return Err(OdpsError::InconsistentInputs {
                    what: "OPTRAN predictor index",
                    expected: MAX_OPTRAN_PREDICTORS,
                    actual: ip,
                });
            }
            let np = self.n_predictors(l);
            if np > 0 {
                let end = self.pos_index[l] + (np + 1) * (order + 1);
                if end > self.coefficients.len() {
                    return Err(OdpsError::InconsistentInputs {
                        what: "OPTRAN coefficients",
                        expected: end,
                        actual: self.coefficients.len(),
                    });
                }
            }
        }
        Ok(())
    }
}
