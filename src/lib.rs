//! Multi-camera extrinsic calibration core: pose networks, triangulation,
//! bundle adjustment, quality filtering, and similarity alignment.
//!
//! This crate turns raw per-camera 2D point detections into a calibrated
//! [`CameraArray`] and a reconstructed [`WorldPoints`] cloud, bundled together
//! as a [`PointDataBundle`]. It builds on
//! [`cam-geom`](https://crates.io/crates/cam-geom) and
//! [`opencv-ros-camera`](https://crates.io/crates/opencv-ros-camera) for
//! intrinsics and projection, the same way
//! [`braid-mvg`](https://strawlab.org/braid) does, but the extrinsic pipeline
//! itself -- bootstrap pose estimation, pairwise pose bridging, bundle
//! adjustment and quality filtering -- is specific to this crate.
//!
//! ## Pipeline
//!
//! ```text
//! ImagePoints + CameraArray(intrinsics only)
//!   -> bootstrap::run            (PairedPoseNetwork)
//!   -> PairedPoseNetwork::apply_to (posed CameraArray)
//!   -> triangulate::triangulate_all (WorldPoints)
//!   -> PointDataBundle::new
//!   -> PointDataBundle::optimize   (bundle adjustment)
//!   -> PointDataBundle::filter_by_*
//!   -> align::align_to_object
//! ```
//!
//! ## Example
//!
//! A minimal two-camera round trip: project a known 3D point into both
//! cameras, triangulate it back, and check the reconstruction error.
//!
//! ```rust
//! use caliscope_core::{Camera, CameraArray, RigidTransform};
//! use caliscope_core::points::{ImagePointRow, ImagePoints};
//! use caliscope_core::triangulate::triangulate_all;
//! use nalgebra::{Matrix3, Point3, Vector3};
//! use std::collections::BTreeMap;
//!
//! let intrinsics = Matrix3::new(1000.0, 0.0, 320.0, 0.0, 1000.0, 240.0, 0.0, 0.0, 1.0);
//! let pose_a = RigidTransform::identity();
//! let pose_b = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.05, 0.0), &Vector3::new(0.5, 0.0, 0.0));
//!
//! let mut cameras = BTreeMap::new();
//! cameras.insert(0, Camera::new(0, 640, 480, intrinsics, None, 0).unwrap().with_pose(pose_a));
//! cameras.insert(1, Camera::new(1, 640, 480, intrinsics, None, 0).unwrap().with_pose(pose_b));
//! let array = CameraArray::new(cameras).unwrap();
//!
//! let world_point = Point3::new(0.1, -0.1, 4.0);
//! let pixel_a = array.camera(0).unwrap().project_point(&world_point).unwrap();
//! let pixel_b = array.camera(1).unwrap().project_point(&world_point).unwrap();
//!
//! let rows = vec![
//!     ImagePointRow { sync_index: 0, port: 0, point_id: 0, img_loc: pixel_a, obj_loc: None },
//!     ImagePointRow { sync_index: 0, port: 1, point_id: 0, img_loc: pixel_b, obj_loc: None },
//! ];
//! let points = ImagePoints::new(rows).unwrap();
//!
//! let world_points = triangulate_all(&points, &array);
//! let recovered = world_points.rows()[0].coords;
//! assert!((recovered - world_point).norm() < 1e-6);
//! ```

pub mod align;
pub mod bootstrap;
pub mod bundle;
pub mod bundle_adjust;
pub mod camera;
pub mod error;
pub mod geometry;
pub mod pairwise;
pub mod points;
pub mod quality;
pub mod triangulate;

pub use align::{align_to_object, estimate_similarity_transform, rotate, SimilarityTransform};
pub use bootstrap::{BootstrapStrategy, PnpBootstrapConfig, StereocalibrateConfig};
pub use bundle::PointDataBundle;
pub use bundle_adjust::{BundleAdjustConfig, OptimizationStatus};
pub use camera::{Camera, CameraArray};
pub use error::{CoreError, Result};
pub use geometry::{Axis, RigidTransform};
pub use pairwise::{PairedPoseNetwork, StereoPair};
pub use points::{ImagePointRow, ImagePoints, WorldPointRow, WorldPoints};
pub use quality::{FilterScope, HoldoutResult, ReprojectionReport, ScaleAccuracyData};
