//! Reprojection-error reporting, residual-based filtering, out-of-sample
//! holdout evaluation, and physical scale accuracy (§4.5).

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Point2;

use crate::camera::CameraArray;
use crate::error::{CoreError, Result};
use crate::points::{ImagePoints, WorldPoints};

/// One matched-and-posed observation's reprojection residual.
#[derive(Debug, Clone, Copy)]
pub struct RawError {
    pub sync_index: u64,
    pub port: i64,
    pub point_id: i64,
    pub error_x: f64,
    pub error_y: f64,
    pub euclidean_error: f64,
}

/// Lazily-computed, cacheable reprojection quality summary (§4.5).
#[derive(Debug, Clone)]
pub struct ReprojectionReport {
    pub overall_rmse: f64,
    pub by_camera: BTreeMap<i64, f64>,
    pub by_point_id: BTreeMap<i64, f64>,
    pub n_unmatched_observations: usize,
    pub unmatched_by_camera: BTreeMap<i64, usize>,
    pub raw_errors: Vec<RawError>,
    pub n_matched_observations: usize,
    pub n_total_observations: usize,
    pub n_cameras: usize,
    pub n_points: usize,
}

fn rmse(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    (values.map(|v| v * v).sum::<f64>() / n as f64).sqrt()
}

/// Compute the reprojection report for the matched-and-posed subset of
/// `image_points` against `world_points` through `array`.
pub fn compute_report(array: &CameraArray<f64>, image_points: &ImagePoints, world_points: &WorldPoints) -> ReprojectionReport {
    let mut raw_errors = Vec::new();
    let mut unmatched_by_camera: BTreeMap<i64, usize> = BTreeMap::new();
    let mut n_unmatched = 0usize;

    for row in image_points.rows() {
        let matched_point = world_points.index_of(row.sync_index, row.point_id).map(|idx| world_points.rows()[idx]);
        let Some(world_row) = matched_point else {
            n_unmatched += 1;
            *unmatched_by_camera.entry(row.port).or_insert(0) += 1;
            continue;
        };
        let Some(cam) = array.camera(row.port) else {
            n_unmatched += 1;
            *unmatched_by_camera.entry(row.port).or_insert(0) += 1;
            continue;
        };
        if !cam.is_posed() {
            n_unmatched += 1;
            *unmatched_by_camera.entry(row.port).or_insert(0) += 1;
            continue;
        }
        let Some(predicted) = cam.project_point(&world_row.coords) else {
            n_unmatched += 1;
            *unmatched_by_camera.entry(row.port).or_insert(0) += 1;
            continue;
        };
        let error_x = predicted.x - row.img_loc.x;
        let error_y = predicted.y - row.img_loc.y;
        raw_errors.push(RawError {
            sync_index: row.sync_index,
            port: row.port,
            point_id: row.point_id,
            error_x,
            error_y,
            euclidean_error: (error_x * error_x + error_y * error_y).sqrt(),
        });
    }

    let overall_rmse = rmse(raw_errors.iter().map(|e| e.euclidean_error));

    let mut by_camera_vals: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    let mut by_point_vals: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for e in &raw_errors {
        by_camera_vals.entry(e.port).or_default().push(e.euclidean_error);
        by_point_vals.entry(e.point_id).or_default().push(e.euclidean_error);
    }
    let by_camera = by_camera_vals.into_iter().map(|(k, v)| (k, rmse(v.into_iter()))).collect();
    let by_point_id = by_point_vals.into_iter().map(|(k, v)| (k, rmse(v.into_iter()))).collect();

    let n_cameras = array.posed_ports().len();
    let n_points = world_points.len();
    let n_matched_observations = raw_errors.len();
    let n_total_observations = image_points.len();

    ReprojectionReport {
        overall_rmse,
        by_camera,
        by_point_id,
        n_unmatched_observations: n_unmatched,
        unmatched_by_camera,
        raw_errors,
        n_matched_observations,
        n_total_observations,
        n_cameras,
        n_points,
    }
}

/// `(sync_index, port, point_id)` keys to drop, plus keys restored to meet
/// a per-camera safety floor.
fn restore_to_floor(
    report: &ReprojectionReport,
    mut dropped: BTreeSet<(u64, i64, i64)>,
    min_per_camera: usize,
) -> BTreeSet<(u64, i64, i64)> {
    let mut remaining_by_camera: BTreeMap<i64, usize> = BTreeMap::new();
    for e in &report.raw_errors {
        let key = (e.sync_index, e.port, e.point_id);
        if !dropped.contains(&key) {
            *remaining_by_camera.entry(e.port).or_insert(0) += 1;
        }
    }

    let snapshot = remaining_by_camera.clone();
    for (&port, &remaining) in &snapshot {
        if remaining >= min_per_camera {
            continue;
        }
        let deficit = min_per_camera - remaining;
        let mut candidates: Vec<&RawError> = report
            .raw_errors
            .iter()
            .filter(|e| e.port == port && dropped.contains(&(e.sync_index, e.port, e.point_id)))
            .collect();
        candidates.sort_by(|a, b| a.euclidean_error.partial_cmp(&b.euclidean_error).unwrap());
        for e in candidates.into_iter().take(deficit) {
            tracing::warn!(port, sync_index = e.sync_index, point_id = e.point_id, "filter safety floor: restoring observation");
            dropped.remove(&(e.sync_index, e.port, e.point_id));
        }
    }
    dropped
}

fn prune_orphans(image_points: &ImagePoints, world_points: &WorldPoints) -> WorldPoints {
    let referenced: BTreeSet<(u64, i64)> = image_points.rows().iter().map(|r| (r.sync_index, r.point_id)).collect();
    let rows = world_points
        .rows()
        .iter()
        .copied()
        .filter(|w| referenced.contains(&(w.sync_index, w.point_id)))
        .collect();
    WorldPoints::new(rows).expect("filtering preserves key uniqueness")
}

/// Drop matched observations with euclidean error above `max_pixels`,
/// restore the lowest-error dropped observations per camera until
/// `min_per_camera` is met, then prune orphaned world points.
pub fn filter_by_absolute_error(
    array: &CameraArray<f64>,
    image_points: &ImagePoints,
    world_points: &WorldPoints,
    max_pixels: f64,
    min_per_camera: usize,
) -> Result<(ImagePoints, WorldPoints)> {
    if max_pixels <= 0.0 {
        return Err(CoreError::InvalidInput("max_pixels must be > 0"));
    }
    tracing::info!(max_pixels, min_per_camera, "filter_by_absolute_error: starting");
    let report = compute_report(array, image_points, world_points);

    let mut dropped: BTreeSet<(u64, i64, i64)> = report
        .raw_errors
        .iter()
        .filter(|e| e.euclidean_error > max_pixels)
        .map(|e| (e.sync_index, e.port, e.point_id))
        .collect();
    dropped = restore_to_floor(&report, dropped, min_per_camera);

    let kept = image_points.filter(|r| !dropped.contains(&(r.sync_index, r.port, r.point_id)));
    let pruned_world = prune_orphans(&kept, world_points);
    tracing::info!(kept = kept.len(), total = image_points.len(), "filter_by_absolute_error: finished");
    Ok((kept, pruned_world))
}

/// Filter scope for [`filter_by_percentile_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// Each camera keeps its own `(100 - percentile)`-th percentile best.
    PerCamera,
    /// A single global error threshold across all cameras.
    Overall,
}

/// Drop the worst `percentile`% of observations, per `scope`, then apply
/// the same safety-floor restore and orphan pruning as
/// [`filter_by_absolute_error`].
pub fn filter_by_percentile_error(
    array: &CameraArray<f64>,
    image_points: &ImagePoints,
    world_points: &WorldPoints,
    percentile: f64,
    scope: FilterScope,
    min_per_camera: usize,
) -> Result<(ImagePoints, WorldPoints)> {
    if !(percentile > 0.0 && percentile <= 100.0) {
        return Err(CoreError::InvalidInput("percentile must be in (0, 100]"));
    }
    tracing::info!(percentile, min_per_camera, "filter_by_percentile_error: starting");
    let report = compute_report(array, image_points, world_points);

    let mut dropped: BTreeSet<(u64, i64, i64)> = BTreeSet::new();
    match scope {
        FilterScope::Overall => {
            let mut sorted: Vec<f64> = report.raw_errors.iter().map(|e| e.euclidean_error).collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let threshold = crate::geometry::percentile_sorted(&sorted, 100.0 - percentile);
            for e in &report.raw_errors {
                if e.euclidean_error > threshold {
                    dropped.insert((e.sync_index, e.port, e.point_id));
                }
            }
        }
        FilterScope::PerCamera => {
            let mut by_camera: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
            for e in &report.raw_errors {
                by_camera.entry(e.port).or_default().push(e.euclidean_error);
            }
            let mut thresholds: BTreeMap<i64, f64> = BTreeMap::new();
            for (port, mut errs) in by_camera {
                errs.sort_by(|a, b| a.partial_cmp(b).unwrap());
                thresholds.insert(port, crate::geometry::percentile_sorted(&errs, 100.0 - percentile));
            }
            for e in &report.raw_errors {
                if let Some(&threshold) = thresholds.get(&e.port) {
                    if e.euclidean_error > threshold {
                        dropped.insert((e.sync_index, e.port, e.point_id));
                    }
                }
            }
        }
    }

    dropped = restore_to_floor(&report, dropped, min_per_camera);
    let kept = image_points.filter(|r| !dropped.contains(&(r.sync_index, r.port, r.point_id)));
    let pruned_world = prune_orphans(&kept, world_points);
    tracing::info!(kept = kept.len(), total = image_points.len(), "filter_by_percentile_error: finished");
    Ok((kept, pruned_world))
}

/// Out-of-sample evaluation result (§4.5 `compute_holdout_error`).
#[derive(Debug, Clone)]
pub struct HoldoutResult {
    pub normalized_rmse: f64,
    pub approx_pixel_rmse: f64,
    pub per_frame_rmse: BTreeMap<u64, f64>,
    pub failed_frames: Vec<u64>,
}

/// For each holdout sync index: undistort the detected corners, solve that
/// frame's board pose via PnP, project the known 3D corners back, RMS the
/// residuals. The holdout set is caller-supplied (§9 Open Questions).
pub fn compute_holdout_error(
    array: &CameraArray<f64>,
    image_points: &ImagePoints,
    holdout_sync_indices: &[u64],
    pnp_config: &crate::bootstrap::PnpBootstrapConfig,
) -> HoldoutResult {
    use crate::bootstrap::pnp::{solve_frame_pose, PlanarObservation};

    let mut per_frame_rmse = BTreeMap::new();
    let mut failed_frames = Vec::new();
    let mut all_errors = Vec::new();

    for &sync_index in holdout_sync_indices {
        let mut frame_errors = Vec::new();
        for port in array.ports().collect::<Vec<_>>() {
            let Some(cam) = array.camera(port) else { continue };
            let observations: Vec<PlanarObservation> = image_points
                .rows()
                .iter()
                .filter(|r| r.port == port && r.sync_index == sync_index)
                .filter_map(|r| {
                    r.obj_loc.map(|obj| PlanarObservation {
                        object: obj,
                        normalized: cam.undistort_to_normalized(&r.img_loc),
                    })
                })
                .collect();
            if observations.len() < pnp_config.min_observations {
                continue;
            }
            if let Some((_, mean_err)) = solve_frame_pose(&observations, pnp_config) {
                frame_errors.push(mean_err);
            }
        }
        if frame_errors.is_empty() {
            failed_frames.push(sync_index);
            continue;
        }
        let frame_rmse = rmse(frame_errors.iter().copied());
        per_frame_rmse.insert(sync_index, frame_rmse);
        all_errors.push(frame_rmse);
    }

    let normalized_rmse = rmse(all_errors.iter().copied());
    let mean_focal_length = mean_focal_length(array);
    HoldoutResult {
        normalized_rmse,
        approx_pixel_rmse: normalized_rmse * mean_focal_length,
        per_frame_rmse,
        failed_frames,
    }
}

fn mean_focal_length(array: &CameraArray<f64>) -> f64 {
    let focals: Vec<f64> = array
        .cameras()
        .map(|(_, c)| (c.matrix()[(0, 0)] + c.matrix()[(1, 1)]) * 0.5)
        .collect();
    if focals.is_empty() {
        1.0
    } else {
        focals.iter().sum::<f64>() / focals.len() as f64
    }
}

/// Scale accuracy at a single sync index (§4.5 `compute_scale_accuracy`).
#[derive(Debug, Clone, Copy)]
pub struct ScaleAccuracyData {
    pub distance_rmse: f64,
    pub relative_error_percent: f64,
    pub n_pairs: usize,
}

/// For matched `(world point, board-frame object point)` pairs at
/// `sync_index`, compare all pairwise Euclidean distances in both spaces.
pub fn compute_scale_accuracy(image_points: &ImagePoints, world_points: &WorldPoints, sync_index: u64) -> Result<ScaleAccuracyData> {
    let mut matched: Vec<(Point2<f64>, nalgebra::Point3<f64>, nalgebra::Point3<f64>)> = Vec::new();
    for row in image_points.rows().iter().filter(|r| r.sync_index == sync_index) {
        let Some(obj) = row.obj_loc else { continue };
        let Some(idx) = world_points.index_of(row.sync_index, row.point_id) else {
            continue;
        };
        matched.push((row.img_loc, obj, world_points.rows()[idx].coords));
    }
    if matched.len() < 2 {
        return Err(CoreError::InsufficientData(
            "scale accuracy requires at least 2 matched points at the given sync index",
        ));
    }

    let mut world_distances = Vec::new();
    let mut object_distances = Vec::new();
    for i in 0..matched.len() {
        for j in (i + 1)..matched.len() {
            let world_d = (matched[i].2 - matched[j].2).norm();
            let object_d = (matched[i].1 - matched[j].1).norm();
            world_distances.push(world_d);
            object_distances.push(object_d);
        }
    }

    let n_pairs = world_distances.len();
    let diffs: Vec<f64> = world_distances.iter().zip(&object_distances).map(|(w, o)| w - o).collect();
    let distance_rmse = rmse(diffs.iter().copied());
    let mean_object_distance = object_distances.iter().sum::<f64>() / n_pairs as f64;
    let relative_error_percent = if mean_object_distance > 0.0 {
        100.0 * distance_rmse / mean_object_distance
    } else {
        0.0
    };

    Ok(ScaleAccuracyData {
        distance_rmse,
        relative_error_percent,
        n_pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::geometry::RigidTransform;
    use crate::points::{ImagePointRow, WorldPointRow};
    use nalgebra::{Matrix3, Point3};
    use std::collections::BTreeMap as StdBTreeMap;

    fn make_array() -> CameraArray<f64> {
        let mut cameras = StdBTreeMap::new();
        cameras.insert(
            0,
            Camera::new(0, 640, 480, Matrix3::identity(), None, 0).unwrap().with_pose(RigidTransform::identity()),
        );
        CameraArray::new(cameras).unwrap()
    }

    #[test]
    fn test_compute_report_matches_perfect_projection() {
        let array = make_array();
        let world_points = WorldPoints::new(vec![WorldPointRow {
            sync_index: 0,
            point_id: 0,
            coords: Point3::new(0.1, 0.2, 3.0),
        }])
        .unwrap();
        let image_points = ImagePoints::new(vec![ImagePointRow {
            sync_index: 0,
            port: 0,
            point_id: 0,
            img_loc: Point2::new(0.1 / 3.0, 0.2 / 3.0),
            obj_loc: None,
        }])
        .unwrap();
        let report = compute_report(&array, &image_points, &world_points);
        assert!(report.overall_rmse < 1e-9);
        assert_eq!(report.n_unmatched_observations, 0);
    }

    #[test]
    fn test_filter_by_absolute_error_respects_safety_floor() {
        let array = make_array();
        let mut world_rows = Vec::new();
        let mut image_rows = Vec::new();
        for i in 0..5 {
            let p = Point3::new(0.0, 0.0, 2.0 + i as f64 * 0.1);
            world_rows.push(WorldPointRow {
                sync_index: i as u64,
                point_id: 0,
                coords: p,
            });
            let error = if i < 2 { 10.0 } else { 0.0 };
            image_rows.push(ImagePointRow {
                sync_index: i as u64,
                port: 0,
                point_id: 0,
                img_loc: Point2::new(error, 0.0),
                obj_loc: None,
            });
        }
        let image_points = ImagePoints::new(image_rows).unwrap();
        let world_points = WorldPoints::new(world_rows).unwrap();
        let (kept, _) = filter_by_absolute_error(&array, &image_points, &world_points, 1.0, 4).unwrap();
        assert!(kept.len() >= 4);
    }
}
