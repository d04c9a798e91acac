//! [`Camera`] and [`CameraArray`]: intrinsics, optional extrinsics, and the
//! stable port-to-parameter-index mapping that bundle adjustment relies on.

use std::collections::BTreeMap;

use cam_geom::ExtrinsicParameters;
use nalgebra::{Matrix3, Point2, Point3, RealField, Vector3, Vector5};
use num_traits::Float;
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::geometry::RigidTransform;

/// A single camera's intrinsics and, optionally, its pose in the world frame.
///
/// `port` is the stable identifier under which this camera is referenced
/// from `ImagePoints` rows; it need not be contiguous or zero-based. Image
/// and world point tables never reference a camera by array index -- only
/// by port -- so that cameras can be added, removed, or marked `ignore`
/// without invalidating observation data.
#[derive(Debug, Clone)]
pub struct Camera<R: RealField + Copy> {
    port: i64,
    width: usize,
    height: usize,
    matrix: Matrix3<R>,
    distortion: Option<Vector5<R>>,
    rotation_count: i8,
    pose: Option<RigidTransform<R>>,
    ignore: bool,
}

impl<R: RealField + Copy> Camera<R> {
    /// Construct an unposed camera from its intrinsics.
    pub fn new(
        port: i64,
        width: usize,
        height: usize,
        matrix: Matrix3<R>,
        distortion: Option<Vector5<R>>,
        rotation_count: i8,
    ) -> Result<Self> {
        if !(-3..=3).contains(&rotation_count) {
            return Err(CoreError::InvalidInput("rotation_count out of range -3..=3"));
        }
        Ok(Self {
            port,
            width,
            height,
            matrix,
            distortion,
            rotation_count,
            pose: None,
            ignore: false,
        })
    }

    pub fn port(&self) -> i64 {
        self.port
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn matrix(&self) -> &Matrix3<R> {
        &self.matrix
    }

    pub fn distortion(&self) -> Option<&Vector5<R>> {
        self.distortion.as_ref()
    }

    pub fn rotation_count(&self) -> i8 {
        self.rotation_count
    }

    pub fn ignore(&self) -> bool {
        self.ignore
    }

    pub fn pose(&self) -> Option<&RigidTransform<R>> {
        self.pose.as_ref()
    }

    /// `true` iff this camera has a pose and is not marked ignored.
    pub fn is_posed(&self) -> bool {
        self.pose.is_some() && !self.ignore
    }

    /// Functional update: return a copy of this camera with the pose set.
    pub fn with_pose(&self, pose: RigidTransform<R>) -> Self {
        let mut next = self.clone();
        next.pose = Some(pose);
        next
    }

    /// Functional update: return a copy of this camera with its pose cleared.
    pub fn without_pose(&self) -> Self {
        let mut next = self.clone();
        next.pose = None;
        next
    }

    /// Functional update: return a copy of this camera with `ignore` set.
    pub fn with_ignore(&self, ignore: bool) -> Self {
        let mut next = self.clone();
        next.ignore = ignore;
        next
    }

    /// 4x4 homogeneous world-to-camera transform, if posed.
    pub fn transformation(&self) -> Option<nalgebra::Matrix4<R>> {
        self.pose.map(|p| p.to_homogeneous())
    }

    fn intrinsics(&self) -> RosOpenCvIntrinsics<R> {
        let fx = self.matrix[(0, 0)];
        let fy = self.matrix[(1, 1)];
        let skew = self.matrix[(0, 1)];
        let cx = self.matrix[(0, 2)];
        let cy = self.matrix[(1, 2)];
        match self.distortion {
            Some(d) => {
                RosOpenCvIntrinsics::from_params_with_distortion(fx, skew, fy, cx, cy, Distortion::from_opencv_vec(d))
            }
            None => RosOpenCvIntrinsics::from_params(fx, skew, fy, cx, cy),
        }
    }

    fn cam_geom_camera(&self) -> Option<cam_geom::Camera<R, RosOpenCvIntrinsics<R>>> {
        let pose = self.pose?;
        // `ExtrinsicParameters` is parameterized by camera center and
        // rotation; our `RigidTransform` stores the world->camera rotation
        // and translation, so recover the camera center as `-R^-1 * t`.
        let camcenter = Point3::from(-(pose.quaternion().inverse() * pose.translation()));
        let extrinsics = ExtrinsicParameters::from_rotation_and_camcenter(pose.quaternion(), camcenter);
        Some(cam_geom::Camera::new(self.intrinsics(), extrinsics))
    }

    /// Project a 3D world point to a distorted pixel coordinate, if posed.
    pub fn project_point(&self, world_point: &Point3<R>) -> Option<Point2<R>> {
        let cam = self.cam_geom_camera()?;
        let pts = cam_geom::Points::new(nalgebra::Matrix1x3::new(world_point.x, world_point.y, world_point.z));
        let pix = cam.world_to_pixel(&pts);
        Some(Point2::new(pix.data[(0, 0)], pix.data[(0, 1)]))
    }

    /// Remove distortion and the intrinsic matrix, mapping a pixel to the
    /// camera's normalized (unit focal length) image plane.
    pub fn undistort_to_normalized(&self, pixel: &Point2<R>) -> Point2<R>
    where
        R: Float,
    {
        let intrinsics = self.intrinsics();
        let distorted = opencv_ros_camera::Pixels::new(nalgebra::Matrix1x2::new(pixel.x, pixel.y));
        let undistorted = intrinsics.undistort(&distorted);
        Point2::new(undistorted.data[(0, 0)], undistorted.data[(0, 1)])
    }
}

/// Ordered collection of [`Camera`]s keyed by stable port number.
///
/// Provides the `posed_port_to_index` mapping that every downstream
/// optimization-parameter-vector layout in this crate is built from --
/// never index a parameter vector by raw port number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraArray<R: RealField + Copy> {
    cameras: BTreeMap<i64, Camera<R>>,
}

impl<R: RealField + Copy> CameraArray<R> {
    pub fn new(cameras: BTreeMap<i64, Camera<R>>) -> Result<Self> {
        if cameras.is_empty() {
            return Err(CoreError::InvalidInput("camera array must contain at least one camera"));
        }
        Ok(Self { cameras })
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn camera(&self, port: i64) -> Option<&Camera<R>> {
        self.cameras.get(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = i64> + '_ {
        self.cameras.keys().copied()
    }

    pub fn cameras(&self) -> impl Iterator<Item = (&i64, &Camera<R>)> {
        self.cameras.iter()
    }

    /// Ports of cameras with a pose, not marked ignored, in ascending order.
    pub fn posed_ports(&self) -> Vec<i64> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.is_posed())
            .map(|(p, _)| *p)
            .collect()
    }

    /// Ports of cameras with neither a pose nor ignore set, in ascending order.
    pub fn unposed_ports(&self) -> Vec<i64> {
        self.cameras
            .iter()
            .filter(|(_, c)| !c.is_posed() && !c.ignore())
            .map(|(p, _)| *p)
            .collect()
    }

    /// Stable mapping from posed port number to contiguous parameter index
    /// `[0, n_posed)`, in ascending port order.
    pub fn posed_port_to_index(&self) -> BTreeMap<i64, usize> {
        self.posed_ports()
            .into_iter()
            .enumerate()
            .map(|(idx, port)| (port, idx))
            .collect()
    }

    /// Functional update: return a copy of this array with `port`'s camera
    /// replaced by `camera`. Errors if `port` is not present.
    pub fn with_camera(&self, port: i64, camera: Camera<R>) -> Result<Self> {
        if !self.cameras.contains_key(&port) {
            return Err(CoreError::UnknownCamera { port });
        }
        let mut next = self.cameras.clone();
        next.insert(port, camera);
        Ok(Self { cameras: next })
    }

    /// Functional update: set `port`'s pose.
    pub fn with_pose(&self, port: i64, pose: RigidTransform<R>) -> Result<Self> {
        let cam = self.camera(port).ok_or(CoreError::UnknownCamera { port })?;
        self.with_camera(port, cam.with_pose(pose))
    }

    /// Functional update: clear every camera's pose (e.g. before re-running
    /// a bootstrap strategy).
    pub fn without_poses(&self) -> Self {
        let cameras = self
            .cameras
            .iter()
            .map(|(p, c)| (*p, c.without_pose()))
            .collect();
        Self { cameras }
    }
}

impl<R: RealField + Copy + Serialize> Serialize for Camera<R> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Repr<'a, R: RealField + Copy> {
            port: i64,
            width: usize,
            height: usize,
            matrix: &'a Matrix3<R>,
            distortion: &'a Option<Vector5<R>>,
            rotation_count: i8,
            pose: &'a Option<RigidTransformRepr<R>>,
            ignore: bool,
        }
        #[derive(Serialize)]
        struct RigidTransformRepr<R: RealField + Copy> {
            rotation_matrix: Matrix3<R>,
            translation: Vector3<R>,
        }
        let pose = self.pose.map(|p| RigidTransformRepr {
            rotation_matrix: p.rotation_matrix(),
            translation: p.translation(),
        });
        Repr {
            port: self.port,
            width: self.width,
            height: self.height,
            matrix: &self.matrix,
            distortion: &self.distortion,
            rotation_count: self.rotation_count,
            pose: &pose,
            ignore: self.ignore,
        }
        .serialize(serializer)
    }
}

impl<'de, R: RealField + Copy + Deserialize<'de>> Deserialize<'de> for Camera<R> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RigidTransformRepr<R: RealField + Copy> {
            rotation_matrix: Matrix3<R>,
            translation: Vector3<R>,
        }
        #[derive(Deserialize)]
        struct Repr<R: RealField + Copy> {
            port: i64,
            width: usize,
            height: usize,
            matrix: Matrix3<R>,
            distortion: Option<Vector5<R>>,
            rotation_count: i8,
            pose: Option<RigidTransformRepr<R>>,
            ignore: bool,
        }
        let repr = Repr::<R>::deserialize(deserializer)?;
        let mut cam = Camera::new(
            repr.port,
            repr.width,
            repr.height,
            repr.matrix,
            repr.distortion,
            repr.rotation_count,
        )
        .map_err(serde::de::Error::custom)?;
        cam.ignore = repr.ignore;
        cam.pose = repr
            .pose
            .map(|p| RigidTransform::from_rotation_matrix_translation(&p.rotation_matrix, &p.translation));
        Ok(cam)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_intrinsics() -> Matrix3<f64> {
        Matrix3::new(1000.0, 0.0, 320.0, 0.0, 1000.0, 240.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_posed_port_to_index_skips_unposed_and_ignored() {
        let mut cameras = BTreeMap::new();
        for port in [5, 1, 9, 3] {
            cameras.insert(port, Camera::new(port, 640, 480, make_intrinsics(), None, 0).unwrap());
        }
        let mut array = CameraArray::new(cameras).unwrap();
        array = array.with_pose(5, RigidTransform::identity()).unwrap();
        array = array.with_pose(1, RigidTransform::identity()).unwrap();
        array = array.with_pose(9, RigidTransform::identity()).unwrap();
        let cam9 = array.camera(9).unwrap().with_ignore(true);
        array = array.with_camera(9, cam9).unwrap();

        let mapping = array.posed_port_to_index();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.get(&1), Some(&0));
        assert_eq!(mapping.get(&5), Some(&1));
        assert!(array.unposed_ports().contains(&3));
    }

    #[test]
    fn test_project_identity_camera_at_origin() {
        let pose = RigidTransform::identity();
        let cam = Camera::new(0, 640, 480, make_intrinsics(), None, 0)
            .unwrap()
            .with_pose(pose);
        let world_point = Point3::new(0.0, 0.0, 5.0);
        let pixel = cam.project_point(&world_point).unwrap();
        approx::assert_relative_eq!(pixel.x, 320.0, epsilon = 1e-9);
        approx::assert_relative_eq!(pixel.y, 240.0, epsilon = 1e-9);
    }
}
