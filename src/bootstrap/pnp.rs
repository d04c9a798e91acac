//! Deterministic PnP bootstrap (§4.2.2): a per-`(port, sync_index)` pose
//! solve, then pairwise relative-pose derivation and robust aggregation
//! across all shared sync indices.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, UnitQuaternion, Vector3, Vector6};

use crate::camera::CameraArray;
use crate::geometry::{average_quaternions, iqr_filter_indices, median, RigidTransform};
use crate::pairwise::{PairedPoseNetwork, StereoPair};
use crate::points::ImagePoints;

/// Tunable thresholds for the PnP bootstrap strategy (§4.2.2).
#[derive(Debug, Clone, Copy)]
pub struct PnpBootstrapConfig {
    /// Minimum observed points required to attempt a per-frame PnP solve.
    pub min_observations: usize,
    /// Reject a per-frame solve whose mean normalized-plane reprojection
    /// error exceeds this threshold.
    pub max_mean_error: f64,
    /// Multiplier used by the IQR outlier rejection pass over aggregated
    /// relative poses.
    pub iqr_multiplier: f64,
    /// Fixed iteration count for the Gauss-Newton refinement of each
    /// per-frame pose.
    pub refine_iterations: usize,
}

impl Default for PnpBootstrapConfig {
    fn default() -> Self {
        Self {
            min_observations: 6,
            max_mean_error: 0.1,
            iqr_multiplier: 1.5,
            refine_iterations: 15,
        }
    }
}

/// One normalized 2D observation of a known board-frame 3D point.
#[derive(Debug, Clone, Copy)]
pub struct PlanarObservation {
    pub object: Point3<f64>,
    pub normalized: Point2<f64>,
}

/// Estimate the homography-based initial pose, then refine by damped
/// Gauss-Newton over the raw `[rodrigues, translation]` parameter vector.
/// Returns `None` if the homography is degenerate or the final mean error
/// exceeds `config.max_mean_error`, or any point is not in front of the
/// camera.
pub fn solve_frame_pose(observations: &[PlanarObservation], config: &PnpBootstrapConfig) -> Option<(RigidTransform<f64>, f64)> {
    if observations.len() < config.min_observations {
        return None;
    }

    let initial = homography_pose(observations).unwrap_or_else(|| RigidTransform::identity());
    let refined = refine_pose(&initial, observations, config.refine_iterations);

    let mean_err = mean_reprojection_error(&refined, observations);
    let all_in_front = observations
        .iter()
        .all(|obs| refined.apply_point(&obs.object).z > 0.0);

    if !all_in_front {
        tracing::debug!("pnp solve rejected: point behind camera");
        return None;
    }
    if mean_err > config.max_mean_error {
        tracing::debug!(mean_err, threshold = config.max_mean_error, "pnp solve rejected: reprojection error too high");
        return None;
    }
    Some((refined, mean_err))
}

/// Planar-target pose from a homography fit (an IPPE-style closed form),
/// assuming the object points are coplanar with `z == 0` in the board
/// frame. Returns `None` if the homography DLT's normal matrix has no
/// usable null space (degenerate point configuration).
fn homography_pose(observations: &[PlanarObservation]) -> Option<RigidTransform<f64>> {
    let n = observations.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, obs) in observations.iter().enumerate() {
        let x = obs.object.x;
        let y = obs.object.y;
        let u = obs.normalized.x;
        let v = obs.normalized.y;
        let row0 = 2 * i;
        a.set_row(row0, &DVector::from_vec(vec![-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]).transpose());
        a.set_row(row0 + 1, &DVector::from_vec(vec![0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]).transpose());
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(v_t.nrows() - 1).transpose();

    let h1 = Vector3::new(h[0], h[3], h[6]);
    let h2 = Vector3::new(h[1], h[4], h[7]);
    let h3 = Vector3::new(h[2], h[5], h[8]);
    if h1.norm() < 1e-12 {
        return None;
    }

    let mut lambda = 1.0 / h1.norm();
    let mut r1 = lambda * h1;
    let mut r2 = lambda * h2;
    let mut t = lambda * h3;
    if t.z < 0.0 {
        lambda = -lambda;
        r1 = lambda * h1;
        r2 = lambda * h2;
        t = lambda * h3;
    }
    let r3 = r1.cross(&r2);

    let raw = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = raw.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.set_column(2, &(-u.column(2)));
        rotation = u_fixed * v_t;
    }

    Some(RigidTransform::from_rotation_matrix_translation(&rotation, &t))
}

fn residuals(pose: &RigidTransform<f64>, observations: &[PlanarObservation]) -> DVector<f64> {
    let mut r = DVector::zeros(observations.len() * 2);
    for (i, obs) in observations.iter().enumerate() {
        let cam_point = pose.apply_point(&obs.object);
        let predicted = Point2::new(cam_point.x / cam_point.z, cam_point.y / cam_point.z);
        r[2 * i] = predicted.x - obs.normalized.x;
        r[2 * i + 1] = predicted.y - obs.normalized.y;
    }
    r
}

fn params_of(pose: &RigidTransform<f64>) -> Vector6<f64> {
    let rv = pose.rodrigues();
    let tv = pose.translation();
    Vector6::new(rv.x, rv.y, rv.z, tv.x, tv.y, tv.z)
}

fn pose_of(params: &Vector6<f64>) -> RigidTransform<f64> {
    RigidTransform::from_rodrigues(
        &Vector3::new(params[0], params[1], params[2]),
        &Vector3::new(params[3], params[4], params[5]),
    )
}

fn refine_pose(initial: &RigidTransform<f64>, observations: &[PlanarObservation], iterations: usize) -> RigidTransform<f64> {
    let mut params = params_of(initial);
    const STEP: f64 = 1e-6;
    const DAMPING: f64 = 1e-8;

    for _ in 0..iterations {
        let pose = pose_of(&params);
        let base_residuals = residuals(&pose, observations);
        let m = base_residuals.len();
        let mut jacobian = DMatrix::<f64>::zeros(m, 6);
        for col in 0..6 {
            let mut perturbed = params;
            perturbed[col] += STEP;
            let plus = residuals(&pose_of(&perturbed), observations);
            perturbed[col] -= 2.0 * STEP;
            let minus = residuals(&pose_of(&perturbed), observations);
            let deriv = (plus - minus) / (2.0 * STEP);
            jacobian.set_column(col, &deriv);
        }
        let jtj = jacobian.transpose() * &jacobian + DMatrix::<f64>::identity(6, 6) * DAMPING;
        let jtr = jacobian.transpose() * &base_residuals;
        let delta = match jtj.cholesky() {
            Some(chol) => chol.solve(&jtr),
            None => break,
        };
        let delta = Vector6::from_column_slice(delta.as_slice());
        params -= delta;
        if delta.norm() < 1e-12 {
            break;
        }
    }
    pose_of(&params)
}

fn mean_reprojection_error(pose: &RigidTransform<f64>, observations: &[PlanarObservation]) -> f64 {
    let r = residuals(pose, observations);
    let n = observations.len() as f64;
    let sum_sq: f64 = (0..observations.len())
        .map(|i| r[2 * i].powi(2) + r[2 * i + 1].powi(2))
        .sum();
    (sum_sq / n).sqrt()
}

/// Solve a board-to-camera pose for every `(port, sync_index)` with enough
/// observations. Observations without `obj_loc` cannot contribute to a PnP
/// solve and are skipped.
pub(crate) fn solve_all_frames(
    points: &ImagePoints,
    array: &CameraArray<f64>,
    config: &PnpBootstrapConfig,
) -> BTreeMap<(i64, u64), RigidTransform<f64>> {
    let mut grouped: BTreeMap<(i64, u64), Vec<PlanarObservation>> = BTreeMap::new();
    for row in points.rows() {
        let Some(obj) = row.obj_loc else { continue };
        let Some(cam) = array.camera(row.port) else { continue };
        let normalized = cam.undistort_to_normalized(&row.img_loc);
        grouped
            .entry((row.port, row.sync_index))
            .or_default()
            .push(PlanarObservation { object: obj, normalized });
    }

    let mut poses = BTreeMap::new();
    for (key, observations) in grouped {
        if let Some((pose, err)) = solve_frame_pose(&observations, config) {
            tracing::debug!(port = key.0, sync_index = key.1, mean_err = err, "pnp frame solved");
            poses.insert(key, pose);
        }
    }
    poses
}

/// Derive one [`StereoPair`] per unordered camera pair by composing their
/// per-frame board poses at every shared sync index, then robustly
/// aggregating: IQR-filter on translation magnitude and angular distance
/// from the quaternion median, average rotations by the eigenvector
/// method, average translations arithmetically.
pub fn bootstrap(points: &ImagePoints, array: &CameraArray<f64>, config: &PnpBootstrapConfig) -> PairedPoseNetwork<f64> {
    tracing::info!("pnp bootstrap: starting");
    let frame_poses = solve_all_frames(points, array, config);

    let mut by_sync: BTreeMap<u64, Vec<(i64, RigidTransform<f64>)>> = BTreeMap::new();
    for ((port, sync_index), pose) in &frame_poses {
        by_sync.entry(*sync_index).or_default().push((*port, *pose));
    }

    let ports: Vec<i64> = array.ports().collect();
    let mut network = PairedPoseNetwork::new();

    for (ai, &port_a) in ports.iter().enumerate() {
        for &port_b in &ports[ai + 1..] {
            let mut relative: Vec<RigidTransform<f64>> = Vec::new();
            for frames in by_sync.values() {
                let pose_a = frames.iter().find(|(p, _)| *p == port_a).map(|(_, t)| *t);
                let pose_b = frames.iter().find(|(p, _)| *p == port_b).map(|(_, t)| *t);
                if let (Some(pose_a), Some(pose_b)) = (pose_a, pose_b) {
                    relative.push(pose_a.inverse().compose(&pose_b));
                }
            }
            if relative.is_empty() {
                continue;
            }

            let translations: Vec<f64> = relative.iter().map(|t| t.translation().norm()).collect();
            let quats: Vec<UnitQuaternion<f64>> = relative.iter().map(|t| t.quaternion()).collect();
            let median_quat = median_quaternion(&quats);
            let angular: Vec<f64> = quats.iter().map(|q| q.angle_to(&median_quat)).collect();

            let kept_by_translation: std::collections::BTreeSet<usize> =
                iqr_filter_indices(&translations, config.iqr_multiplier).into_iter().collect();
            let kept_by_angle: std::collections::BTreeSet<usize> =
                iqr_filter_indices(&angular, config.iqr_multiplier).into_iter().collect();
            let kept: Vec<usize> = (0..relative.len())
                .filter(|i| kept_by_translation.contains(i) && kept_by_angle.contains(i))
                .collect();
            if kept.is_empty() {
                continue;
            }

            let retained_quats: Vec<UnitQuaternion<f64>> = kept.iter().map(|&i| quats[i]).collect();
            let avg_rotation = match average_quaternions(&retained_quats) {
                Some(q) => q,
                None => continue,
            };
            let avg_translation: Vector3<f64> = kept
                .iter()
                .map(|&i| relative[i].translation())
                .fold(Vector3::zeros(), |acc, t| acc + t)
                / kept.len() as f64;

            let error_score = median(&kept.iter().map(|&i| angular[i]).collect::<Vec<_>>()).unwrap_or(0.0);
            let transform = RigidTransform::from_quaternion_translation(avg_rotation, avg_translation);
            network.add(StereoPair::new(port_a, port_b, transform, error_score));
            tracing::debug!(port_a, port_b, retained = kept.len(), total = relative.len(), "pnp pair aggregated");
        }
    }
    tracing::info!(edges = network.len(), "pnp bootstrap: finished");
    network
}

fn median_quaternion(quats: &[UnitQuaternion<f64>]) -> UnitQuaternion<f64> {
    average_quaternions(quats).unwrap_or_else(UnitQuaternion::identity)
}
