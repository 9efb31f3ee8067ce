//! Level-to-space optical path on the internal grid, per sensor group.

use std::fmt::Debug;

use super::optran::OptranState;
use super::predictor::Predictor;
use crate::error::Result;

/// Forward optical path of one channel on the internal levels.
#[derive(Debug, Clone, PartialEq)]
pub struct OpticalPath {
    /// Cumulative optical depth at each internal level, `od_path[0] == 0`
    pub od_path: Vec<f64>,
    /// Raw (unclamped) layer optical depths, if the model exposes them
    pub(crate) od: Vec<f64>,
    /// OPTRAN intermediates, when the channel used OPTRAN
    pub(crate) optran: Option<OptranState>,
}

impl OpticalPath {
    /// Wrap a path computed by an external model.
    pub fn from_path(od_path: Vec<f64>) -> Self {
        Self {
            od_path,
            od: Vec::new(),
            optran: None,
        }
    }

    /// Raw layer optical depths before clamping. Empty for external models.
    pub fn layer_optical_depth(&self) -> &[f64] {
        &self.od
    }
}

/// A model producing the level-to-space optical path of a channel.
///
/// The generic regression model is [`OdpsPath`](super::absorption::OdpsPath).
/// Sensor families that need a dedicated treatment (SSMIS Zeeman channels)
/// plug in their own implementation with
/// [`Odps::with_zssmis_model`](super::Odps::with_zssmis_model).
///
/// Tangent-linear and adjoint methods receive the forward [`OpticalPath`]
/// returned for the same channel and predictor.
pub trait OpticalPathModel: Debug + Send + Sync {
    /// Forward optical path for `channel`.
    fn optical_path(&self, channel: usize, predictor: &Predictor) -> Result<OpticalPath>;

    /// Tangent-linear of the level optical path.
    fn optical_path_tl(
        &self,
        channel: usize,
        predictor: &Predictor,
        path: &OpticalPath,
        predictor_tl: &Predictor,
    ) -> Result<Vec<f64>>;

    /// Adjoint of [`OpticalPathModel::optical_path_tl`].
    ///
    /// Must zero `od_path_ad` and accumulate into `predictor_ad`.
    fn optical_path_ad(
        &self,
        channel: usize,
        predictor: &Predictor,
        path: &OpticalPath,
        od_path_ad: &mut [f64],
        predictor_ad: &mut Predictor,
    ) -> Result<()>;
}
