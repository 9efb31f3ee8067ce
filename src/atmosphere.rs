//! Caller-side atmosphere profile and viewing geometry.

use ndarray::Array2;

use crate::error::{check_ascending, check_len, OdpsError, Result};

/// Gaseous absorber species, numbered as in HITRAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AbsorberId {
    /// Water vapor, mass mixing ratio in g/kg
    H2O = 1,
    /// Carbon dioxide, ppmv
    CO2 = 2,
    /// Ozone, ppmv
    O3 = 3,
    /// Nitrous oxide, ppmv
    N2O = 4,
    /// Carbon monoxide, ppmv
    CO = 5,
    /// Methane, ppmv
    CH4 = 6,
}

impl TryFrom<u8> for AbsorberId {
    type Error = OdpsError;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            1 => Self::H2O,
            2 => Self::CO2,
            3 => Self::O3,
            4 => Self::N2O,
            5 => Self::CO,
            6 => Self::CH4,
            _ => {
                return Err(OdpsError::InconsistentInputs {
                    what: "absorber id",
                    expected: 6,
                    actual: id.into(),
                })
            }
        })
    }
}

/// An atmosphere profile on the caller's vertical grid.
///
/// Pressures are in hPa and ordered from the top of the atmosphere down to the
/// surface, so `level_pressure` is ascending and `level_pressure[n_layers]` is
/// the surface pressure. Layer `k` spans levels `k` and `k+1`.
///
/// The same type carries tangent-linear increments and adjoint accumulators.
/// In that role only `temperature` and `absorber` are meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct Atmosphere {
    /// Level pressures, length `n_layers + 1`
    pub level_pressure: Vec<f64>,
    /// Layer pressures, length `n_layers`
    pub pressure: Vec<f64>,
    /// Layer temperatures in K
    pub temperature: Vec<f64>,
    /// Layer absorber amounts, shape (`n_layers`, `n_absorbers`)
    pub absorber: Array2<f64>,
    /// Species in each column of `absorber`
    pub absorber_ids: Vec<AbsorberId>,
}

impl Atmosphere {
    /// Number of layers in the profile.
    pub fn n_layers(&self) -> usize {
        self.temperature.len()
    }

    /// Column of `absorber` holding species `id`, if the profile has it.
    pub fn absorber_index(&self, id: AbsorberId) -> Option<usize> {
        self.absorber_ids.iter().position(|&a| a == id)
    }

    /// A copy with the same shape and every perturbable value zeroed.
    pub fn zeroed_like(&self) -> Self {
        Self {
            level_pressure: self.level_pressure.clone(),
            pressure: self.pressure.clone(),
            temperature: vec![0.; self.temperature.len()],
            absorber: Array2::zeros(self.absorber.raw_dim()),
            absorber_ids: self.absorber_ids.clone(),
        }
    }

    /// Check the array sizes against each other and the pressure ordering.
    pub fn validate(&self) -> Result<()> {
        let n = self.n_layers();
        if n == 0 {
            return Err(OdpsError::InconsistentInputs {
                what: "atmosphere layers",
                expected: 1,
                actual: 0,
            });
        }
        check_len("level pressure", n + 1, self.level_pressure.len())?;
        check_len("layer pressure", n, self.pressure.len())?;
        check_len("absorber layers", n, self.absorber.nrows())?;
        check_len("absorber ids", self.absorber.ncols(), self.absorber_ids.len())?;
        if let Some(i) = self.level_pressure.iter().position(|&p| p <= 0.) {
            return Err(OdpsError::NotAscending {
                what: "level pressure (non-positive)",
                index: i,
            });
        }
        check_ascending("level pressure", &self.level_pressure)
    }
}

/// Viewing geometry for a single profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Sensor zenith angle at the surface in degrees, signed by scan side
    pub sensor_zenith_angle: f64,
    /// Surface altitude in m
    pub surface_altitude: f64,
}

impl Geometry {
    /// Secant of the sensor zenith angle at the surface.
    pub fn secant_zenith(&self) -> f64 {
        1. / self.sensor_zenith_angle.to_radians().cos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn three_layers() -> Atmosphere {
        Atmosphere {
            level_pressure: vec![100., 300., 700., 1000.],
            pressure: vec![200., 500., 850.],
            temperature: vec![220., 250., 280.],
            absorber: array![[0.01, 0.1], [1., 0.08], [8., 0.05]],
            absorber_ids: vec![AbsorberId::H2O, AbsorberId::O3],
        }
    }

    #[test]
    fn valid_profile() {
        let atm = three_layers();
        assert!(atm.validate().is_ok());
        assert_eq!(atm.absorber_index(AbsorberId::O3), Some(1));
        assert_eq!(atm.absorber_index(AbsorberId::CO2), None);
    }

    #[test]
    fn mismatched_sizes_are_reported() {
        let mut atm = three_layers();
        atm.pressure.pop();
        assert_eq!(
            atm.validate(),
            Err(OdpsError::InconsistentInputs {
                what: "layer pressure",
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn descending_levels_are_rejected() {
        let mut atm = three_layers();
        atm.level_pressure.reverse();
        assert!(matches!(atm.validate(), Err(OdpsError::NotAscending { .. })));
    }

    #[test]
    fn nadir_secant() {
        let geo = Geometry {
            sensor_zenith_angle: 0.,
            surface_altitude: 0.,
        };
        assert_relative_eq!(geo.secant_zenith(), 1.);
        let geo = Geometry {
            sensor_zenith_angle: 60.,
            surface_altitude: 0.,
        };
        assert_relative_eq!(geo.secant_zenith(), 2., epsilon = 1e-12);
    }

    #[test]
    fn absorber_id_from_number() {
        assert_eq!(AbsorberId::try_from(3).unwrap(), AbsorberId::O3);
        assert!(AbsorberId::try_from(9).is_err());
    }
}
