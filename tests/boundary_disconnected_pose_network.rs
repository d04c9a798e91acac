//! Boundary behavior: a disconnected pose network leaves the cameras
//! outside the chosen component unposed, and picks the larger island (tied
//! islands broken by smallest minimum port).

use caliscope_core::{Camera, CameraArray, PairedPoseNetwork, RigidTransform, StereoPair};
use nalgebra::{Matrix3, Vector3};
use std::collections::BTreeMap;

fn four_camera_array() -> CameraArray<f64> {
    let intrinsics = Matrix3::identity();
    let mut cameras = BTreeMap::new();
    for port in [0, 1, 10, 11] {
        cameras.insert(port, Camera::new(port, 100, 100, intrinsics, None, 0).unwrap());
    }
    CameraArray::new(cameras).unwrap()
}

#[test]
fn test_apply_to_anchors_smaller_min_port_island_on_size_tie() {
    let array = four_camera_array();
    let mut network = PairedPoseNetwork::new();
    let t_01 = RigidTransform::from_rodrigues(&Vector3::new(0.1, 0.0, 0.0), &Vector3::new(1.0, 0.0, 0.0));
    let t_10_11 = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.1, 0.0), &Vector3::new(0.0, 1.0, 0.0));
    network.add(StereoPair::new(0, 1, t_01, 0.1));
    network.add(StereoPair::new(10, 11, t_10_11, 0.1));

    let posed = network.apply_to(&array, None);

    assert!(posed.camera(0).unwrap().is_posed());
    assert!(posed.camera(1).unwrap().is_posed());
    assert!(!posed.camera(10).unwrap().is_posed());
    assert!(!posed.camera(11).unwrap().is_posed());
    assert_eq!(posed.posed_ports(), vec![0, 1]);
}

#[test]
fn test_apply_to_favors_larger_island_over_smaller_regardless_of_port() {
    let array = four_camera_array();
    let mut network = PairedPoseNetwork::new();
    // A 3-camera island {10, 11, 1} versus a 1-edge island {0} alone (no
    // edges at all for port 0 -- it is simply absent from the graph).
    let t_10_11 = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.1, 0.0), &Vector3::new(0.0, 1.0, 0.0));
    let t_11_1 = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.0, 0.1), &Vector3::new(0.0, 0.0, 1.0));
    network.add(StereoPair::new(10, 11, t_10_11, 0.1));
    network.add(StereoPair::new(11, 1, t_11_1, 0.1));

    let posed = network.apply_to(&array, None);

    assert!(posed.camera(10).unwrap().is_posed());
    assert!(posed.camera(11).unwrap().is_posed());
    assert!(posed.camera(1).unwrap().is_posed());
    assert!(!posed.camera(0).unwrap().is_posed());
}
