//! Shared fixtures for the crate-level scenario tests in `tests/`.

use caliscope_core::{Camera, CameraArray, ImagePointRow, ImagePoints, RigidTransform, WorldPointRow, WorldPoints};
use nalgebra::{Matrix3, Point3, Vector3};
use std::collections::BTreeMap;

pub fn pinhole_intrinsics() -> Matrix3<f64> {
    Matrix3::new(800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0)
}

/// Eight unit-cube corners centered at the origin.
pub fn cube_corners() -> Vec<Point3<f64>> {
    let mut pts = Vec::new();
    for &x in &[-0.5, 0.5] {
        for &y in &[-0.5, 0.5] {
            for &z in &[-0.5, 0.5] {
                pts.push(Point3::new(x, y, z));
            }
        }
    }
    pts
}

/// A planar calibration-board-like grid of points in the `z == 0` plane,
/// spaced 100mm apart, suitable for both PnP-style bootstrap and scale
/// accuracy checks.
pub fn board_points_mm() -> Vec<Point3<f64>> {
    let mut pts = Vec::new();
    for row in 0..3 {
        for col in 0..4 {
            pts.push(Point3::new(col as f64 * 100.0, row as f64 * 100.0, 0.0));
        }
    }
    pts
}

/// Two posed cameras a few hundred mm apart, both looking roughly down +z
/// at a board several meters away.
pub fn two_camera_array(baseline_mm: f64) -> CameraArray<f64> {
    let intrinsics = pinhole_intrinsics();
    let pose_a = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.0, 0.0), &Vector3::new(0.0, 0.0, 2000.0));
    let pose_b = RigidTransform::from_rodrigues(
        &Vector3::new(0.0, 0.12, 0.0),
        &Vector3::new(baseline_mm, 0.0, 2000.0),
    );
    let mut cameras = BTreeMap::new();
    cameras.insert(0, Camera::new(0, 1280, 960, intrinsics, None, 0).unwrap().with_pose(pose_a));
    cameras.insert(1, Camera::new(1, 1280, 960, intrinsics, None, 0).unwrap().with_pose(pose_b));
    CameraArray::new(cameras).unwrap()
}

/// Project `points` (one `sync_index`) through every posed camera in
/// `array`, producing matched `ImagePoints` + `WorldPoints`. `obj_locs`, if
/// given, is attached row-for-row to every produced `ImagePointRow`.
pub fn project_bundle_inputs(
    array: &CameraArray<f64>,
    points: &[Point3<f64>],
    sync_index: u64,
    obj_locs: Option<&[Point3<f64>]>,
) -> (ImagePoints, WorldPoints) {
    let mut image_rows = Vec::new();
    let mut world_rows = Vec::new();
    for (pid, p) in points.iter().enumerate() {
        world_rows.push(WorldPointRow {
            sync_index,
            point_id: pid as i64,
            coords: *p,
        });
        for port in array.posed_ports() {
            let cam = array.camera(port).unwrap();
            if let Some(pixel) = cam.project_point(p) {
                image_rows.push(ImagePointRow {
                    sync_index,
                    port,
                    point_id: pid as i64,
                    img_loc: pixel,
                    obj_loc: obj_locs.map(|locs| locs[pid]),
                });
            }
        }
    }
    (ImagePoints::new(image_rows).unwrap(), WorldPoints::new(world_rows).unwrap())
}
