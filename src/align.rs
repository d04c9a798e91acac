//! Similarity-transform alignment into object (real-world) coordinates, and
//! rigid rotation of a reconstruction about the origin (§4.6).
//!
//! The transform estimator is Umeyama's method, grounded on the host
//! workspace's `align_points` routine: centroid removal, a cross-covariance
//! SVD, and a determinant-sign check on `U . V^T` to reject reflections
//! (replaced here by a proper rotation whenever the naive SVD solution would
//! produce one).

use std::collections::BTreeSet;

use nalgebra::{Matrix3, Matrix3xX, Point3, Vector3};

use crate::bundle::PointDataBundle;
use crate::camera::CameraArray;
use crate::error::{CoreError, Result};
use crate::geometry::{Axis, RigidTransform};
use crate::points::WorldPointRow;

/// A similarity transform `target ~= scale * rotation * source + translation`.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityTransform {
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl SimilarityTransform {
    pub fn apply(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.scale * (self.rotation * p.coords) + self.translation)
    }
}

/// Estimate the similarity transform taking `source` onto `target` via
/// Umeyama's algorithm, given point-for-point correspondences.
///
/// Rejects reflections: the returned `rotation` always has `det = +1`, never
/// `-1`, even when the raw least-squares solution would be a reflection.
pub fn estimate_similarity_transform(source: &[Point3<f64>], target: &[Point3<f64>]) -> Result<SimilarityTransform> {
    if source.len() != target.len() {
        return Err(CoreError::InvalidInput(
            "estimate_similarity_transform: source and target must have equal length",
        ));
    }
    let n = source.len();
    if n < 3 {
        return Err(CoreError::InsufficientData(
            "estimate_similarity_transform requires at least 3 correspondences",
        ));
    }

    let mut x = Matrix3xX::from_columns(&source.iter().map(|p| p.coords).collect::<Vec<_>>());
    let mut y = Matrix3xX::from_columns(&target.iter().map(|p| p.coords).collect::<Vec<_>>());

    let mu_x: Vector3<f64> = x.column_mean();
    let mu_y: Vector3<f64> = y.column_mean();
    for mut col in x.column_iter_mut() {
        col -= mu_x;
    }
    for mut col in y.column_iter_mut() {
        col -= mu_y;
    }

    let cov_xy = (&y * x.transpose()) / n as f64;
    let svd = nalgebra::linalg::SVD::try_new(cov_xy, true, true, 1e-7, 0).ok_or(CoreError::SvdFailed)?;
    let u = svd.u.ok_or(CoreError::SvdFailed)?;
    let d = svd.singular_values;
    let v_t = svd.v_t.ok_or(CoreError::SvdFailed)?;

    let mut s = Matrix3::identity();
    if u.determinant() * v_t.determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }

    let var_x: f64 = x.iter().map(|v| v * v).sum::<f64>() / n as f64;
    let scale = (Matrix3::from_diagonal(&d) * s).trace() / var_x;
    let rotation = u * s * v_t;
    let translation = mu_y - (rotation * mu_x) * scale;

    Ok(SimilarityTransform { scale, rotation, translation })
}

/// Apply `transform` to every world point, and to every posed camera's
/// extrinsics, so that projections under the new poses still match the
/// original 2D observations (§4.6 "world points and camera poses are
/// transformed together").
fn apply_similarity(array: &CameraArray<f64>, world_rows: &[WorldPointRow], transform: &SimilarityTransform) -> (CameraArray<f64>, Vec<WorldPointRow>) {
    let new_rows = world_rows
        .iter()
        .map(|row| WorldPointRow {
            sync_index: row.sync_index,
            point_id: row.point_id,
            coords: transform.apply(&row.coords),
        })
        .collect();

    let mut new_array = array.clone();
    for port in array.posed_ports() {
        let cam = array.camera(port).expect("posed_ports only returns known ports");
        let pose = cam.pose().expect("posed_ports only returns posed cameras");
        let center = pose.camera_center();
        let new_center = transform.apply(&center);
        let new_rotation_matrix = pose.rotation_matrix() * transform.rotation.transpose();
        let new_pose = RigidTransform::from_rotation_matrix_center(&new_rotation_matrix, &new_center);
        new_array = new_array
            .with_pose(port, new_pose)
            .expect("port came from this array's own posed_ports");
    }
    (new_array, new_rows)
}

/// Estimate the world-to-object similarity transform from the points at
/// `sync_index` whose `obj_loc` is known, then apply it to every world point
/// and every posed camera in `bundle`.
pub fn align_to_object(bundle: &PointDataBundle, sync_index: u64) -> Result<PointDataBundle> {
    let mut seen_point_ids = BTreeSet::new();
    let mut source = Vec::new();
    let mut target = Vec::new();
    for row in bundle.image_points().by_sync_index(sync_index) {
        let Some(obj) = row.obj_loc else { continue };
        if !seen_point_ids.insert(row.point_id) {
            continue;
        }
        let Some(idx) = bundle.world_points().index_of(sync_index, row.point_id) else {
            continue;
        };
        source.push(bundle.world_points().rows()[idx].coords);
        target.push(obj);
    }

    let transform = estimate_similarity_transform(&source, &target)?;
    tracing::info!(sync_index, scale = transform.scale, "align_to_object: estimated similarity transform");

    let (new_array, new_rows) = apply_similarity(bundle.array(), bundle.world_points().rows(), &transform);
    PointDataBundle::new(new_array, bundle.image_points().clone(), new_rows)
}

/// Rotate a whole reconstruction -- every world point and every posed
/// camera -- by `degrees` around `axis`, about the origin.
pub fn rotate(bundle: &PointDataBundle, axis: Axis, degrees: f64) -> Result<PointDataBundle> {
    let transform = SimilarityTransform {
        scale: 1.0,
        rotation: crate::geometry::axis_rotation::<f64>(axis, degrees).rotation_matrix(),
        translation: Vector3::zeros(),
    };
    let (new_array, new_rows) = apply_similarity(bundle.array(), bundle.world_points().rows(), &transform);
    PointDataBundle::new(new_array, bundle.image_points().clone(), new_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_estimate_similarity_transform_recovers_known_transform() {
        let rotation = *UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3).to_rotation_matrix().matrix();
        let translation = Vector3::new(1.0, 2.0, -3.0);
        let scale = 2.5;

        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 1.0, 1.0),
        ];
        let target: Vec<Point3<f64>> = source
            .iter()
            .map(|p| Point3::from(scale * (rotation * p.coords) + translation))
            .collect();

        let transform = estimate_similarity_transform(&source, &target).unwrap();
        assert_relative_eq!(transform.scale, scale, epsilon = 1e-8);
        assert_relative_eq!(transform.rotation, rotation, epsilon = 1e-8);
        assert_relative_eq!(transform.translation, translation, epsilon = 1e-8);
        assert_relative_eq!(transform.rotation.determinant(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_estimate_similarity_transform_rejects_mismatched_lengths() {
        let err = estimate_similarity_transform(&[Point3::origin(); 3], &[Point3::origin(); 2]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
