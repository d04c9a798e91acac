//! Legacy-compatible stereocalibrate bootstrap (§4.2.1): deterministic
//! frame selection per camera pair, then a single joint nonlinear least
//! squares solve per pair over every selected frame simultaneously -- the
//! Rust analog of `cv2.stereoCalibrate(..., flags=CALIB_FIX_INTRINSIC)`,
//! which jointly refines one shared relative pose and one per-frame
//! board pose per selected frame, rather than averaging independently
//! solved per-frame relative poses the way [`crate::bootstrap::pnp`] does.
//!
//! Differs from `pnp` in both methodology and frame budget: it samples a
//! bounded, time-spread subset of frames per pair (matching the legacy
//! tool's "few good frames, trust them" design) and solves one coupled
//! optimization problem over that subset, rather than using every shared
//! frame and rejecting outliers statistically after the fact.

use nalgebra::{DMatrix, DVector, Dyn, Owned, Point2, Point3, UnitQuaternion, Vector3};

use crate::bootstrap::pnp::{solve_frame_pose, PlanarObservation, PnpBootstrapConfig};
use crate::camera::CameraArray;
use crate::geometry::{average_quaternions, RigidTransform};
use crate::pairwise::{PairedPoseNetwork, StereoPair};
use crate::points::ImagePoints;

/// Tunable thresholds for the stereocalibrate bootstrap strategy (§4.2.1).
#[derive(Debug, Clone, Copy)]
pub struct StereocalibrateConfig {
    /// Minimum shared, object-located points required for a sync index to
    /// be eligible for a pair.
    pub min_shared_points: usize,
    /// Maximum number of frames selected per camera pair.
    pub boards_sampled: usize,
    /// Reject a per-frame initial-guess solve whose mean normalized-plane
    /// reprojection error exceeds this threshold.
    pub max_mean_error: f64,
    /// Convergence tolerance for the joint per-pair solve.
    pub joint_ftol: f64,
}

impl Default for StereocalibrateConfig {
    fn default() -> Self {
        Self {
            min_shared_points: 6,
            boards_sampled: 25,
            max_mean_error: 0.1,
            joint_ftol: 1e-10,
        }
    }
}

#[derive(Clone)]
struct CandidateFrame {
    sync_index: u64,
    shared_point_count: usize,
}

/// Sort by `(point_count descending, sync_index ascending)`, then spread
/// across time by binning into `boards_sampled` temporal buckets and
/// taking the best-quality frame in each bucket, filling any shortfall
/// from the top-quality remainder.
fn select_frames(mut candidates: Vec<CandidateFrame>, boards_sampled: usize) -> Vec<u64> {
    candidates.sort_by(|a, b| {
        b.shared_point_count
            .cmp(&a.shared_point_count)
            .then_with(|| a.sync_index.cmp(&b.sync_index))
    });

    if candidates.len() <= boards_sampled {
        return candidates.into_iter().map(|c| c.sync_index).collect();
    }

    let mut by_time = candidates.clone();
    by_time.sort_by_key(|c| c.sync_index);
    let n = by_time.len();
    let mut selected: Vec<u64> = Vec::new();
    let mut used = std::collections::BTreeSet::new();

    for bucket in 0..boards_sampled {
        let lo = bucket * n / boards_sampled;
        let hi = ((bucket + 1) * n / boards_sampled).max(lo + 1).min(n);
        let best = by_time[lo..hi]
            .iter()
            .max_by_key(|c| c.shared_point_count)
            .map(|c| c.sync_index);
        if let Some(sync_index) = best {
            if used.insert(sync_index) {
                selected.push(sync_index);
            }
        }
    }

    if selected.len() < boards_sampled {
        for candidate in &candidates {
            if selected.len() >= boards_sampled {
                break;
            }
            if used.insert(candidate.sync_index) {
                selected.push(candidate.sync_index);
            }
        }
    }
    selected
}

/// Points seen by both cameras at one sync index, keyed by shared
/// `point_id`: the board-frame object coordinate plus each camera's own
/// undistorted normalized-plane observation.
fn shared_frame_correspondences(
    points: &ImagePoints,
    array: &CameraArray<f64>,
    port_a: i64,
    port_b: i64,
    sync_index: u64,
) -> Vec<(Point3<f64>, Point2<f64>, Point2<f64>)> {
    let (Some(cam_a), Some(cam_b)) = (array.camera(port_a), array.camera(port_b)) else {
        return Vec::new();
    };
    let mut by_id_a: std::collections::BTreeMap<i64, (Point3<f64>, Point2<f64>)> = std::collections::BTreeMap::new();
    for row in points.rows().iter().filter(|r| r.port == port_a && r.sync_index == sync_index) {
        if let Some(obj) = row.obj_loc {
            by_id_a.insert(row.point_id, (obj, cam_a.undistort_to_normalized(&row.img_loc)));
        }
    }
    let mut out = Vec::new();
    for row in points.rows().iter().filter(|r| r.port == port_b && r.sync_index == sync_index) {
        if row.obj_loc.is_none() {
            continue;
        }
        if let Some(&(obj, normalized_a)) = by_id_a.get(&row.point_id) {
            out.push((obj, normalized_a, cam_b.undistort_to_normalized(&row.img_loc)));
        }
    }
    out
}

/// All correspondences for one selected frame, in `(object, obs_a, obs_b)`
/// column order.
#[derive(Debug, Clone)]
struct FrameCorrespondences {
    objects: Vec<Point3<f64>>,
    obs_a: Vec<Point2<f64>>,
    obs_b: Vec<Point2<f64>>,
}

impl FrameCorrespondences {
    fn residual_count(&self) -> usize {
        self.objects.len() * 4
    }
}

/// The `levenberg_marquardt::LeastSquaresProblem` for one pair's joint
/// stereo calibration: a single shared relative pose `T_A->B` plus one
/// board pose per selected frame, refined together against every frame's
/// reprojection residuals in both cameras (the joint-optimization
/// counterpart of `cv2.stereoCalibrate`'s per-pair solve).
///
/// Parameter layout: `[r_shared, t_shared, r_frame_0, t_frame_0, ...]`.
#[derive(Debug, Clone)]
struct StereoJointProblem {
    frames: Vec<FrameCorrespondences>,
    params: DVector<f64>,
}

impl StereoJointProblem {
    fn new(frames: Vec<FrameCorrespondences>, initial_shared: RigidTransform<f64>, initial_frame_poses: Vec<RigidTransform<f64>>) -> Self {
        let n_frames = frames.len();
        let mut params = DVector::zeros(6 + 6 * n_frames);
        write_pose(&mut params, 0, &initial_shared);
        for (i, pose) in initial_frame_poses.iter().enumerate() {
            write_pose(&mut params, 6 + 6 * i, pose);
        }
        Self { frames, params }
    }

    fn shared_pose(&self, params: &DVector<f64>) -> RigidTransform<f64> {
        read_pose(params, 0)
    }

    fn frame_pose(&self, idx: usize, params: &DVector<f64>) -> RigidTransform<f64> {
        read_pose(params, 6 + 6 * idx)
    }

    fn residual_count(&self) -> usize {
        self.frames.iter().map(|f| f.residual_count()).sum()
    }

    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let shared = self.shared_pose(params);
        let mut r = DVector::zeros(self.residual_count());
        let mut idx = 0;
        for (fi, frame) in self.frames.iter().enumerate() {
            let pose_a = self.frame_pose(fi, params);
            let pose_b = pose_a.compose(&shared);
            for (j, object) in frame.objects.iter().enumerate() {
                let cam_a = pose_a.apply_point(object);
                r[idx] = cam_a.x / cam_a.z - frame.obs_a[j].x;
                r[idx + 1] = cam_a.y / cam_a.z - frame.obs_a[j].y;
                let cam_b = pose_b.apply_point(object);
                r[idx + 2] = cam_b.x / cam_b.z - frame.obs_b[j].x;
                r[idx + 3] = cam_b.y / cam_b.z - frame.obs_b[j].y;
                idx += 4;
            }
        }
        r
    }
}

fn write_pose(params: &mut DVector<f64>, base: usize, pose: &RigidTransform<f64>) {
    let rvec = pose.rodrigues();
    let tvec = pose.translation();
    params[base] = rvec.x;
    params[base + 1] = rvec.y;
    params[base + 2] = rvec.z;
    params[base + 3] = tvec.x;
    params[base + 4] = tvec.y;
    params[base + 5] = tvec.z;
}

fn read_pose(params: &DVector<f64>, base: usize) -> RigidTransform<f64> {
    RigidTransform::from_rodrigues(
        &Vector3::new(params[base], params[base + 1], params[base + 2]),
        &Vector3::new(params[base + 3], params[base + 4], params[base + 5]),
    )
}

impl levenberg_marquardt::LeastSquaresProblem<f64, Dyn, Dyn> for StereoJointProblem {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params = params.clone();
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<nalgebra::Matrix<f64, Dyn, Dyn, Self::JacobianStorage>> {
        // Small per-pair problem (6 + 6*n_frames parameters, n_frames bounded
        // by `boards_sampled`): central differences over every column are
        // cheap here, unlike the full multi-camera bundle in
        // `bundle_adjust.rs`, which restricts itself to each observation's 9
        // nonzero columns because its parameter count is much larger.
        const STEP: f64 = 1e-6;
        let n_params = self.params.len();
        let mut jac = DMatrix::<f64>::zeros(self.residual_count(), n_params);
        for col in 0..n_params {
            let mut plus = self.params.clone();
            plus[col] += STEP;
            let r_plus = self.residuals_at(&plus);
            let mut minus = self.params.clone();
            minus[col] -= STEP;
            let r_minus = self.residuals_at(&minus);
            jac.set_column(col, &((r_plus - r_minus) / (2.0 * STEP)));
        }
        Some(jac)
    }
}

/// Initial per-frame board pose (in camera A's frame) and per-frame
/// relative pose, from independent per-camera PnP solves -- used only to
/// seed the joint solve below, not as the final answer.
fn initial_guess(
    frame: &FrameCorrespondences,
    pnp_config: &PnpBootstrapConfig,
) -> Option<(RigidTransform<f64>, RigidTransform<f64>)> {
    let obs_a: Vec<PlanarObservation> = frame
        .objects
        .iter()
        .zip(&frame.obs_a)
        .map(|(&object, &normalized)| PlanarObservation { object, normalized })
        .collect();
    let obs_b: Vec<PlanarObservation> = frame
        .objects
        .iter()
        .zip(&frame.obs_b)
        .map(|(&object, &normalized)| PlanarObservation { object, normalized })
        .collect();
    let (pose_a, _) = solve_frame_pose(&obs_a, pnp_config)?;
    let (pose_b, _) = solve_frame_pose(&obs_b, pnp_config)?;
    Some((pose_a, pose_a.inverse().compose(&pose_b)))
}

/// Run classical stereo calibration for every unordered camera pair:
/// deterministic frame selection, then one joint nonlinear least squares
/// solve per pair over all selected frames (§4.2.1 step 4).
pub fn bootstrap(points: &ImagePoints, array: &CameraArray<f64>, config: &StereocalibrateConfig) -> PairedPoseNetwork<f64> {
    tracing::info!("stereocalibrate bootstrap: starting");
    let ports: Vec<i64> = array.ports().collect();
    let sync_indices: Vec<u64> = {
        let mut set = std::collections::BTreeSet::new();
        for row in points.rows() {
            set.insert(row.sync_index);
        }
        set.into_iter().collect()
    };

    let pnp_config = PnpBootstrapConfig {
        min_observations: config.min_shared_points,
        max_mean_error: config.max_mean_error,
        ..PnpBootstrapConfig::default()
    };

    let mut network = PairedPoseNetwork::new();

    for (ai, &port_a) in ports.iter().enumerate() {
        for &port_b in &ports[ai + 1..] {
            let mut per_sync: std::collections::BTreeMap<u64, Vec<(Point3<f64>, Point2<f64>, Point2<f64>)>> = std::collections::BTreeMap::new();
            for &sync_index in &sync_indices {
                let correspondences = shared_frame_correspondences(points, array, port_a, port_b, sync_index);
                if correspondences.len() >= config.min_shared_points {
                    per_sync.insert(sync_index, correspondences);
                }
            }
            if per_sync.is_empty() {
                tracing::warn!(port_a, port_b, "stereocalibrate: no shared frames, skipping pair");
                continue;
            }

            let candidates: Vec<CandidateFrame> = per_sync
                .iter()
                .map(|(&sync_index, rows)| CandidateFrame {
                    sync_index,
                    shared_point_count: rows.len(),
                })
                .collect();
            let selected = select_frames(candidates, config.boards_sampled);

            let mut frames = Vec::new();
            let mut initial_frame_poses = Vec::new();
            let mut initial_relative: Vec<RigidTransform<f64>> = Vec::new();
            for sync_index in selected {
                let rows = &per_sync[&sync_index];
                let frame = FrameCorrespondences {
                    objects: rows.iter().map(|r| r.0).collect(),
                    obs_a: rows.iter().map(|r| r.1).collect(),
                    obs_b: rows.iter().map(|r| r.2).collect(),
                };
                let Some((frame_pose, relative_pose)) = initial_guess(&frame, &pnp_config) else {
                    continue;
                };
                frames.push(frame);
                initial_frame_poses.push(frame_pose);
                initial_relative.push(relative_pose);
            }
            if frames.is_empty() {
                tracing::warn!(port_a, port_b, "stereocalibrate: no frame pair solved, skipping pair");
                continue;
            }

            let quats: Vec<UnitQuaternion<f64>> = initial_relative.iter().map(|t| t.quaternion()).collect();
            let Some(avg_rotation) = average_quaternions(&quats) else {
                continue;
            };
            let avg_translation: Vector3<f64> = initial_relative.iter().map(|t| t.translation()).fold(Vector3::zeros(), |acc, t| acc + t)
                / initial_relative.len() as f64;
            let initial_shared = RigidTransform::from_quaternion_translation(avg_rotation, avg_translation);

            let n_frames_used = frames.len();
            let problem = StereoJointProblem::new(frames, initial_shared, initial_frame_poses);
            let solver = levenberg_marquardt::LevenbergMarquardt::new()
                .with_ftol(config.joint_ftol)
                .with_xtol(config.joint_ftol)
                .with_gtol(config.joint_ftol);
            let (solved, report) = solver.minimize(problem);

            use levenberg_marquardt::LeastSquaresProblem;
            let final_residuals = solved.residuals().unwrap_or_else(|| DVector::zeros(0));
            let rms_error = if final_residuals.is_empty() {
                0.0
            } else {
                (final_residuals.iter().map(|v| v * v).sum::<f64>() / final_residuals.len() as f64).sqrt()
            };

            let transform = solved.shared_pose(&solved.params());
            network.add(StereoPair::new(port_a, port_b, transform, rms_error));
            tracing::debug!(
                port_a,
                port_b,
                frames_used = n_frames_used,
                rms_error,
                termination = ?report.termination,
                "stereocalibrate pair jointly solved"
            );
        }
    }
    tracing::info!(edges = network.len(), "stereocalibrate bootstrap: finished");
    network
}
