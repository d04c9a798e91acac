//! Two interchangeable strategies for producing an initial [`PairedPoseNetwork`]
//! from raw observations (§4.2, §9 "Dynamic dispatch between bootstrap
//! strategies"): a call-site-selected enum rather than an open-ended plugin
//! surface.

pub mod pnp;
pub mod stereocalibrate;

pub use pnp::PnpBootstrapConfig;
pub use stereocalibrate::StereocalibrateConfig;

use crate::camera::CameraArray;
use crate::pairwise::PairedPoseNetwork;
use crate::points::ImagePoints;

/// Selects which bootstrap algorithm produces the initial pose network.
#[derive(Debug, Clone)]
pub enum BootstrapStrategy {
    /// Legacy-compatible: deterministic frame sampling, classical stereo
    /// calibration per pair (§4.2.1).
    Stereocalibrate(StereocalibrateConfig),
    /// Deterministic per-frame PnP, robustly aggregated (§4.2.2).
    Pnp(PnpBootstrapConfig),
}

impl Default for BootstrapStrategy {
    fn default() -> Self {
        BootstrapStrategy::Pnp(PnpBootstrapConfig::default())
    }
}

/// Run the selected bootstrap strategy, producing a [`PairedPoseNetwork`]
/// over `array`'s cameras from `points`.
pub fn run(strategy: &BootstrapStrategy, points: &ImagePoints, array: &CameraArray<f64>) -> PairedPoseNetwork<f64> {
    match strategy {
        BootstrapStrategy::Stereocalibrate(config) => stereocalibrate::bootstrap(points, array, config),
        BootstrapStrategy::Pnp(config) => pnp::bootstrap(points, array, config),
    }
}
