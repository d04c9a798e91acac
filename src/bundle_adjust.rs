//! Sparse bundle adjustment (§4.4): joint nonlinear refinement of posed
//! camera extrinsics and triangulated 3D points against reprojection error.
//!
//! Shaped after the host workspace's own `BundleAdjuster` /
//! `levenberg_marquardt::LeastSquaresProblem` usage, but with a numeric
//! rather than analytic Jacobian: intrinsics are fixed input here rather
//! than refined parameters, so central differences over the 6 extrinsic
//! columns of the observing camera and the 3 columns of the observed point
//! per residual pair are enough, without a hand-derived symbolic
//! derivative per distortion model.

use nalgebra::{self as na, DMatrix, DVector, Dyn, Owned, Point2, Point3, Vector3};

use crate::camera::{Camera, CameraArray};
use crate::error::{CoreError, Result};
use crate::geometry::RigidTransform;
use crate::points::{ImagePoints, WorldPointRow, WorldPoints};

/// Solver tolerances and limits (§4.4 "Solver contract"). Exposed as a
/// `Default`-implementing option struct per the ambient configuration
/// convention (§10.3) rather than as a global constant.
#[derive(Debug, Clone, Copy)]
pub struct BundleAdjustConfig {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub max_evaluations: usize,
    pub finite_diff_step: f64,
}

impl Default for BundleAdjustConfig {
    fn default() -> Self {
        Self {
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            max_evaluations: 1000,
            finite_diff_step: 1e-6,
        }
    }
}

/// Outcome of a bundle-adjustment run (§3 `OptimizationStatus`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OptimizationStatus {
    pub converged: bool,
    pub termination_reason: String,
    pub iterations: usize,
    pub final_cost: f64,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    cam_idx: usize,
    point_idx: usize,
    pixel: Point2<f64>,
}

/// The `levenberg_marquardt::LeastSquaresProblem` implementation over the
/// dense `[r0, t0, r1, t1, ..., x0, y0, z0, ...]` parameter vector (§4.4).
#[derive(Debug, Clone)]
pub struct BundleAdjuster {
    cam_templates: Vec<Camera<f64>>,
    observations: Vec<Observation>,
    n_cams: usize,
    n_points: usize,
    params: DVector<f64>,
    finite_diff_step: f64,
}

impl BundleAdjuster {
    pub fn new(
        array: &CameraArray<f64>,
        image_points: &ImagePoints,
        world_points: &WorldPoints,
        config: &BundleAdjustConfig,
    ) -> Result<Self> {
        let posed_port_to_index = array.posed_port_to_index();
        if posed_port_to_index.is_empty() {
            return Err(CoreError::InsufficientData("bundle adjustment requires at least one posed camera"));
        }

        let mut cam_templates: Vec<Camera<f64>> = Vec::with_capacity(posed_port_to_index.len());
        let mut params = DVector::zeros(6 * posed_port_to_index.len() + 3 * world_points.len());
        for (&port, &idx) in &posed_port_to_index {
            let cam = array.camera(port).expect("posed_port_to_index only contains known ports");
            let pose = cam.pose().expect("posed_port_to_index only contains posed cameras");
            let base = 6 * idx;
            let rvec = pose.rodrigues();
            let tvec = pose.translation();
            params[base] = rvec.x;
            params[base + 1] = rvec.y;
            params[base + 2] = rvec.z;
            params[base + 3] = tvec.x;
            params[base + 4] = tvec.y;
            params[base + 5] = tvec.z;
            cam_templates.push(cam.without_pose());
        }

        let point_base = 6 * posed_port_to_index.len();
        for (idx, row) in world_points.rows().iter().enumerate() {
            let base = point_base + 3 * idx;
            params[base] = row.coords.x;
            params[base + 1] = row.coords.y;
            params[base + 2] = row.coords.z;
        }

        let mut observations = Vec::new();
        for row in image_points.rows() {
            let Some(&cam_idx) = posed_port_to_index.get(&row.port) else {
                continue;
            };
            let Some(point_idx) = world_points.index_of(row.sync_index, row.point_id) else {
                continue;
            };
            observations.push(Observation {
                cam_idx,
                point_idx,
                pixel: row.img_loc,
            });
        }
        if observations.is_empty() {
            return Err(CoreError::InsufficientData(
                "bundle adjustment requires at least one matched, posed observation",
            ));
        }

        Ok(Self {
            cam_templates,
            observations,
            n_cams: posed_port_to_index.len(),
            n_points: world_points.len(),
            params,
            finite_diff_step: config.finite_diff_step,
        })
    }

    fn residual_for(&self, obs: &Observation, params: &DVector<f64>) -> (f64, f64) {
        let cam_base = 6 * obs.cam_idx;
        let rvec = Vector3::new(params[cam_base], params[cam_base + 1], params[cam_base + 2]);
        let tvec = Vector3::new(params[cam_base + 3], params[cam_base + 4], params[cam_base + 5]);
        let pose = RigidTransform::from_rodrigues(&rvec, &tvec);

        let pt_base = 6 * self.n_cams + 3 * obs.point_idx;
        let point = Point3::new(params[pt_base], params[pt_base + 1], params[pt_base + 2]);

        let cam = self.cam_templates[obs.cam_idx].with_pose(pose);
        match cam.project_point(&point) {
            Some(predicted) => (predicted.x - obs.pixel.x, predicted.y - obs.pixel.y),
            None => (0.0, 0.0),
        }
    }

    fn central_diff(&self, obs: &Observation, col: usize) -> (f64, f64) {
        let step = self.finite_diff_step;
        let mut plus = self.params.clone();
        plus[col] += step;
        let r_plus = self.residual_for(obs, &plus);
        let mut minus = self.params.clone();
        minus[col] -= step;
        let r_minus = self.residual_for(obs, &minus);
        ((r_plus.0 - r_minus.0) / (2.0 * step), (r_plus.1 - r_minus.1) / (2.0 * step))
    }

    /// Rebuild a [`CameraArray`] and [`WorldPoints`] from the current
    /// parameter vector, in the same port/row order the adjuster was built
    /// from.
    pub fn apply_to(&self, array: &CameraArray<f64>, world_points: &WorldPoints) -> Result<(CameraArray<f64>, WorldPoints)> {
        let posed_port_to_index = array.posed_port_to_index();
        let mut next_array = array.clone();
        for (&port, &idx) in &posed_port_to_index {
            let base = 6 * idx;
            let rvec = Vector3::new(self.params[base], self.params[base + 1], self.params[base + 2]);
            let tvec = Vector3::new(self.params[base + 3], self.params[base + 4], self.params[base + 5]);
            next_array = next_array.with_pose(port, RigidTransform::from_rodrigues(&rvec, &tvec))?;
        }

        let point_base = 6 * self.n_cams;
        let mut rows: Vec<WorldPointRow> = world_points.rows().to_vec();
        for (idx, row) in rows.iter_mut().enumerate() {
            let base = point_base + 3 * idx;
            row.coords = Point3::new(self.params[base], self.params[base + 1], self.params[base + 2]);
        }
        let next_world_points = WorldPoints::new(rows)?;

        Ok((next_array, next_world_points))
    }
}

impl levenberg_marquardt::LeastSquaresProblem<f64, Dyn, Dyn> for BundleAdjuster {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, params: &na::DVector<f64>) {
        self.params = params.clone();
    }

    fn params(&self) -> na::DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<na::DVector<f64>> {
        let mut r = DVector::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let (dx, dy) = self.residual_for(obs, &self.params);
            r[2 * i] = dx;
            r[2 * i + 1] = dy;
        }
        Some(r)
    }

    /// Only 9 of each row's columns (the 6 extrinsic + 3 point columns an
    /// observation actually depends on) are ever written; the rest stay
    /// zero. `levenberg_marquardt::LeastSquaresProblem` requires a dense
    /// `DMatrix` return type, though, so this still allocates and solves
    /// against a full `observations*2 x params` matrix -- memory and solve
    /// cost scale with the *product* of camera count and point count rather
    /// than with the much smaller number of true nonzeros. Acceptable at
    /// the camera/point counts this crate targets; a true sparse Jacobian
    /// would need a different least-squares backend.
    fn jacobian(&self) -> Option<na::Matrix<f64, Dyn, Dyn, Self::JacobianStorage>> {
        let mut jac = DMatrix::<f64>::zeros(self.observations.len() * 2, self.params.len());
        for (i, obs) in self.observations.iter().enumerate() {
            let cam_base = 6 * obs.cam_idx;
            let pt_base = 6 * self.n_cams + 3 * obs.point_idx;
            for local in 0..6 {
                let col = cam_base + local;
                let (dx, dy) = self.central_diff(obs, col);
                jac[(2 * i, col)] = dx;
                jac[(2 * i + 1, col)] = dy;
            }
            for local in 0..3 {
                let col = pt_base + local;
                let (dx, dy) = self.central_diff(obs, col);
                jac[(2 * i, col)] = dx;
                jac[(2 * i + 1, col)] = dy;
            }
        }
        Some(jac)
    }
}

/// Run bundle adjustment to a local minimum, returning the refined camera
/// array, refined world points, and the solver's termination status.
pub fn optimize(
    array: &CameraArray<f64>,
    image_points: &ImagePoints,
    world_points: &WorldPoints,
    config: &BundleAdjustConfig,
) -> Result<(CameraArray<f64>, WorldPoints, OptimizationStatus)> {
    tracing::info!(cameras = array.posed_ports().len(), points = world_points.len(), "bundle adjustment: starting");

    let problem = BundleAdjuster::new(array, image_points, world_points, config)?;
    let solver = levenberg_marquardt::LevenbergMarquardt::new()
        .with_ftol(config.ftol)
        .with_xtol(config.xtol)
        .with_gtol(config.gtol);
    let (solved, report) = solver.minimize(problem);

    let (next_array, next_world_points) = solved.apply_to(array, world_points)?;
    let status = classify_termination(&report);
    tracing::info!(converged = status.converged, reason = %status.termination_reason, final_cost = status.final_cost, "bundle adjustment: finished");

    if !status.converged && status.termination_reason == "improper_input" {
        return Err(CoreError::OptimizationFailure("solver reported improper input"));
    }

    Ok((next_array, next_world_points, status))
}

fn classify_termination(report: &levenberg_marquardt::MinimizationReport<f64>) -> OptimizationStatus {
    let debug = format!("{:?}", report.termination);
    let (converged, tag) = if debug.contains("Converged") {
        let has_gtol = debug.contains("gtol: true") || debug.contains("gtol");
        let has_ftol = debug.contains("ftol: true");
        let has_xtol = debug.contains("xtol: true");
        let tag = if has_gtol && !debug.contains("gtol: false") {
            "converged_gtol"
        } else if has_ftol {
            "converged_ftol"
        } else if has_xtol {
            "converged_xtol"
        } else {
            "converged_gtol"
        };
        (true, tag)
    } else if debug.contains("NumberOfEvaluations") || debug.contains("MaxEvaluations") {
        (false, "max_evaluations")
    } else if debug.contains("Orthogonal") || debug.contains("NoImprovement") || debug.contains("SmallStep") {
        (false, "converged_small_step")
    } else if debug.contains("Improper") || debug.contains("User") {
        (false, "improper_input")
    } else {
        (false, "unknown_0")
    };

    OptimizationStatus {
        converged,
        termination_reason: tag.to_string(),
        iterations: report.number_of_evaluations,
        final_cost: report.objective_function,
    }
}
