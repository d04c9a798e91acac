//! Multi-view DLT triangulation (§4.3).

use std::collections::BTreeMap;

use nalgebra::{DMatrix, Matrix3, Point3, Vector3};

use crate::camera::CameraArray;
use crate::points::{ImagePoints, WorldPointRow, WorldPoints};

/// For each `(sync_index, point_id)` seen by at least 2 posed cameras,
/// undistort each observation to the normalized image plane and stack
/// every camera-pair's two-view DLT estimate, then average the pair
/// estimates arithmetically (the aggregation rule preserved from the
/// original implementation's `get_point_estimates` helper -- the points
/// are *not* just taken from the first or lowest-error pair).
pub fn triangulate_all(points: &ImagePoints, array: &CameraArray<f64>) -> WorldPoints {
    tracing::info!("triangulation: starting");
    let groups = points.group_by_sync_and_point();
    let mut rows: Vec<WorldPointRow> = Vec::new();

    for ((sync_index, point_id), row_indices) in groups {
        let mut views: Vec<(Matrix3<f64>, Vector3<f64>, nalgebra::Point2<f64>)> = Vec::new();
        for &idx in &row_indices {
            let row = &points.rows()[idx];
            let Some(cam) = array.camera(row.port) else { continue };
            if !cam.is_posed() {
                continue;
            }
            let pose = cam.pose().expect("is_posed implies pose present");
            let normalized = cam.undistort_to_normalized(&row.img_loc);
            views.push((pose.rotation_matrix(), pose.translation(), normalized));
        }
        if views.len() < 2 {
            continue;
        }

        let mut pair_estimates: Vec<Point3<f64>> = Vec::new();
        for i in 0..views.len() {
            for j in (i + 1)..views.len() {
                if let Some(point) = triangulate_views(&[views[i].clone(), views[j].clone()]) {
                    pair_estimates.push(point);
                }
            }
        }
        if pair_estimates.is_empty() {
            continue;
        }

        let n = pair_estimates.len() as f64;
        let mean = pair_estimates
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords)
            / n;

        rows.push(WorldPointRow {
            sync_index,
            point_id,
            coords: Point3::from(mean),
        });
    }

    tracing::info!(points = rows.len(), "triangulation: finished");
    WorldPoints::new(rows).expect("sync_index/point_id pairs are unique by construction")
}

/// Linear triangulation (DLT) across an arbitrary number of views with
/// known `[R | t]` (identity intrinsics -- views are pre-normalized) and a
/// normalized-plane 2D observation each. Stacks each view's two independent
/// homogeneous equations and solves for the smallest right singular vector.
fn triangulate_views(views: &[(Matrix3<f64>, Vector3<f64>, nalgebra::Point2<f64>)]) -> Option<Point3<f64>> {
    let mut a = DMatrix::<f64>::zeros(2 * views.len(), 4);
    for (i, (r, t, uv)) in views.iter().enumerate() {
        // Projection matrix P = [R | t] (identity intrinsics).
        let p_row0 = r.row(0).into_owned();
        let p_row1 = r.row(1).into_owned();
        let p_row2 = r.row(2).into_owned();

        let row_u = [
            uv.x * p_row2[0] - p_row0[0],
            uv.x * p_row2[1] - p_row0[1],
            uv.x * p_row2[2] - p_row0[2],
            uv.x * t.z - t.x,
        ];
        let row_v = [
            uv.y * p_row2[0] - p_row1[0],
            uv.y * p_row2[1] - p_row1[1],
            uv.y * p_row2[2] - p_row1[2],
            uv.y * t.z - t.y,
        ];
        for (k, value) in row_u.iter().enumerate() {
            a[(2 * i, k)] = *value;
        }
        for (k, value) in row_v.iter().enumerate() {
            a[(2 * i + 1, k)] = *value;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(v_t.nrows() - 1).transpose();
    if h[3].abs() < 1e-12 {
        return None;
    }
    Some(Point3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}
