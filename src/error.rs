/// Possible ODPS errors.
///
/// Only precondition and configuration violations surface here. Optical depth
/// saturation and missing absorber species are handled internally.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OdpsError {
    /// Two related inputs don't have matching sizes
    #[error("inconsistent input size for {what}: expected {expected}, found {actual}")]
    InconsistentInputs {
        /// Which array or table entry is wrong
        what: &'static str,
        /// The size implied by the other inputs
        expected: usize,
        /// The size actually supplied
        actual: usize,
    },
    /// A pressure grid is not strictly ascending (top of atmosphere first)
    #[error("{what} is not strictly ascending at index {index}")]
    NotAscending {
        /// Which grid is wrong
        what: &'static str,
        /// First offending index
        index: usize,
    },
    /// A layer of zero (or near zero) width was found when averaging layers
    #[error("degenerate layer {index} in layer averaging (width {width:e})")]
    DegenerateLayer {
        /// Target layer index
        index: usize,
        /// The offending width or overlap sum
        width: f64,
    },
    /// A reference or limit profile in the coefficient table is not physical
    #[error("non-physical {what} at layer {layer}, absorber column {column}")]
    NonPhysicalProfile {
        /// Which profile is wrong
        what: &'static str,
        /// Internal layer index
        layer: usize,
        /// Absorber column
        column: usize,
    },
    /// The magnitude of the sensor zenith angle is outside [0, 90) degrees
    #[error("invalid sensor zenith angle {sensor_zenith_angle} degrees")]
    InvalidGeometry {
        /// Sensor zenith angle at the surface, in degrees
        sensor_zenith_angle: f64,
    },
    /// The requested channel is not in the coefficient table
    #[error("channel index {channel} out of range (table has {n_channels} channels)")]
    ChannelOutOfRange {
        /// Requested channel index
        channel: usize,
        /// Number of channels in the table
        n_channels: usize,
    },
    /// Tangent-linear or adjoint call without a persistent forward pass
    #[error("predictor was not created in persistent mode; run the forward pass with persistence first")]
    InactivePredictor,
    /// The sensor group needs a dedicated optical path model that wasn't registered
    #[error("no optical path model registered for sensor group {0:?}")]
    MissingPathModel(crate::coefficients::SensorGroup),
    /// An array is not contiguous when it was assumed to be
    #[error("array slice not contiguous in memory")]
    NotContiguous,
    /// The operation was aborted early
    #[error("operation cancelled early")]
    Cancelled,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, OdpsError>;

/// Check that `actual` matches `expected`, naming the array on failure.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(OdpsError::InconsistentInputs {
            what,
            expected,
            actual,
        })
    }
}

/// Check that a grid is strictly ascending.
pub(crate) fn check_ascending(what: &'static str, grid: &[f64]) -> Result<()> {
    match grid.windows(2).position(|w| w[1] <= w[0]) {
        Some(i) => Err(OdpsError::NotAscending { what, index: i + 1 }),
        None => Ok(()),
    }
}
