//! Runtime options for the absorption model.

/// Knobs for the ODPS absorption calculation.
///
/// The defaults reproduce the trained model's behavior; they are mostly
/// exposed for sensitivity experiments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdpsOptions {
    /// Upper bound applied to each layer optical depth before accumulation.
    pub max_od: f64,
    /// Saturation threshold on `ln(chi)` in the OPTRAN water vapor line model.
    pub limit_exp: f64,
    /// Value `chi` takes when `ln(chi)` exceeds `limit_exp`.
    pub limit_log: f64,
    /// Use the OPTRAN water vapor line model for channels that select it.
    pub allow_optran: bool,
    /// Clamp interpolated absorber amounts to the trained per-layer range.
    pub apply_absorber_limits: bool,
}

impl OdpsOptions {
    /// Largest layer optical depth allowed into the path accumulation
    pub const MAX_OD: f64 = 20.0;
    /// `|ln(tolerance)|` for the exponential in the OPTRAN model
    pub const LIMIT_EXP: f64 = 36.0436;
    /// `exp(LIMIT_EXP)`
    pub const LIMIT_LOG: f64 = 4.5e15;
}

impl Default for OdpsOptions {
    fn default() -> Self {
        Self {
            max_od: Self::MAX_OD,
            limit_exp: Self::LIMIT_EXP,
            limit_log: Self::LIMIT_LOG,
            allow_optran: true,
            apply_absorber_limits: true,
        }
    }
}
