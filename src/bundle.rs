//! [`PointDataBundle`]: the immutable composite that ties a calibrated
//! camera array to its observations and reconstructed points, and the
//! convenience methods that wrap the free functions in
//! [`crate::bundle_adjust`], [`crate::quality`] and [`crate::align`].

use crate::bundle_adjust::{self, BundleAdjustConfig, OptimizationStatus};
use crate::camera::CameraArray;
use crate::error::{CoreError, Result};
use crate::points::{ImagePoints, WorldPoints};
use crate::quality::{self, FilterScope, HoldoutResult, ReprojectionReport, ScaleAccuracyData};

/// Immutable composite over a posed-or-unposed `CameraArray`, its 2D
/// observations and its reconstructed 3D points, plus the status of the most
/// recent bundle adjustment (if any).
///
/// Every transformation (`optimize`, `filter_by_*`, [`crate::align::align_to_object`],
/// [`crate::align::rotate`]) returns a new bundle rather than mutating this one.
#[derive(Debug, Clone)]
pub struct PointDataBundle {
    array: CameraArray<f64>,
    image_points: ImagePoints,
    world_points: WorldPoints,
    optimization_status: Option<OptimizationStatus>,
    /// For each row of `image_points` (same order), the row index into
    /// `world_points` it matches, or `None` if there is no corresponding
    /// world point.
    img_to_obj_map: Vec<Option<usize>>,
}

impl PointDataBundle {
    /// Construct and validate a bundle. `optimization_status` starts `None`.
    pub fn new(array: CameraArray<f64>, image_points: ImagePoints, world_points: WorldPoints) -> Result<Self> {
        image_points.validate_ports(&array)?;

        if array.len() < 2 {
            return Err(CoreError::InvalidInput("PointDataBundle requires at least two cameras"));
        }
        if image_points.is_empty() {
            return Err(CoreError::InsufficientData("PointDataBundle requires at least one image observation"));
        }
        if world_points.is_empty() {
            return Err(CoreError::InsufficientData("PointDataBundle requires at least one world point"));
        }

        let img_to_obj_map: Vec<Option<usize>> = image_points
            .rows()
            .iter()
            .map(|row| world_points.index_of(row.sync_index, row.point_id))
            .collect();

        let has_matched_posed_observation = image_points.rows().iter().zip(&img_to_obj_map).any(|(row, matched)| {
            matched.is_some() && array.camera(row.port).map(|c| c.is_posed()).unwrap_or(false)
        });
        if !has_matched_posed_observation {
            return Err(CoreError::InsufficientData(
                "PointDataBundle requires at least one observation that matches a world point and comes from a posed camera",
            ));
        }

        Ok(Self {
            array,
            image_points,
            world_points,
            optimization_status: None,
            img_to_obj_map,
        })
    }

    pub fn array(&self) -> &CameraArray<f64> {
        &self.array
    }

    pub fn image_points(&self) -> &ImagePoints {
        &self.image_points
    }

    pub fn world_points(&self) -> &WorldPoints {
        &self.world_points
    }

    pub fn optimization_status(&self) -> Option<&OptimizationStatus> {
        self.optimization_status.as_ref()
    }

    /// Row index into `world_points` matched by each `image_points` row, in
    /// the same order, or `None` for an orphan observation.
    pub fn img_to_obj_map(&self) -> &[Option<usize>] {
        &self.img_to_obj_map
    }

    /// Per-camera and per-point reprojection error summary (§4.5). Computed
    /// on demand rather than cached, since the bundle is immutable.
    pub fn report(&self) -> ReprojectionReport {
        quality::compute_report(&self.array, &self.image_points, &self.world_points)
    }

    /// Run bundle adjustment (§4.4) and return a new bundle with the
    /// optimized extrinsics, refined world points, and a populated
    /// `OptimizationStatus`.
    pub fn optimize(&self, config: &BundleAdjustConfig) -> Result<Self> {
        let (array, world_points, status) = bundle_adjust::optimize(&self.array, &self.image_points, &self.world_points, config)?;
        let mut bundle = Self::new(array, self.image_points.clone(), world_points)?;
        bundle.optimization_status = Some(status);
        Ok(bundle)
    }

    /// Drop matched observations with euclidean error above `max_pixels`,
    /// restoring a per-camera safety floor and pruning orphaned world
    /// points. Resets `optimization_status` to `None` (§4.5).
    pub fn filter_by_absolute_error(&self, max_pixels: f64, min_per_camera: usize) -> Result<Self> {
        let (image_points, world_points) = quality::filter_by_absolute_error(&self.array, &self.image_points, &self.world_points, max_pixels, min_per_camera)?;
        Self::new(self.array.clone(), image_points, world_points)
    }

    /// Drop the worst `percentile`% of matched observations within `scope`,
    /// restoring a per-camera safety floor and pruning orphaned world
    /// points. Resets `optimization_status` to `None` (§4.5).
    pub fn filter_by_percentile_error(&self, percentile: f64, scope: FilterScope, min_per_camera: usize) -> Result<Self> {
        let (image_points, world_points) = quality::filter_by_percentile_error(&self.array, &self.image_points, &self.world_points, percentile, scope, min_per_camera)?;
        Self::new(self.array.clone(), image_points, world_points)
    }

    /// Out-of-sample reprojection error over frames not used in calibration
    /// (§4.5).
    pub fn compute_holdout_error(&self, holdout_sync_indices: &[u64], pnp_config: &crate::bootstrap::PnpBootstrapConfig) -> HoldoutResult {
        quality::compute_holdout_error(&self.array, &self.image_points, holdout_sync_indices, pnp_config)
    }

    /// How well the reconstruction's pairwise distances at `sync_index`
    /// match the board's known physical scale (§4.5).
    pub fn compute_scale_accuracy(&self, sync_index: u64) -> Result<ScaleAccuracyData> {
        quality::compute_scale_accuracy(&self.image_points, &self.world_points, sync_index)
    }
}
