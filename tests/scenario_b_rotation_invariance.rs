//! Scenario B: rotating a reconstruction by 90 degrees four times around any
//! single axis returns it to its starting state, with distinct intermediate
//! states along the way.

mod common;

use approx::assert_relative_eq;
use caliscope_core::{rotate, Axis, PointDataBundle};
use nalgebra::Matrix3;

fn make_bundle() -> PointDataBundle {
    let array = common::two_camera_array(400.0);
    let points = common::board_points_mm();
    let (image_points, world_points) = common::project_bundle_inputs(&array, &points, 0, None);
    PointDataBundle::new(array, image_points, world_points).unwrap()
}

fn assert_bundles_match(a: &PointDataBundle, b: &PointDataBundle, epsilon: f64) {
    for (row_a, row_b) in a.world_points().rows().iter().zip(b.world_points().rows()) {
        assert_relative_eq!(row_a.coords, row_b.coords, epsilon = epsilon);
    }
    for port in a.array().posed_ports() {
        let pose_a = a.array().camera(port).unwrap().pose().unwrap();
        let pose_b = b.array().camera(port).unwrap().pose().unwrap();
        assert_relative_eq!(pose_a.rotation_matrix(), pose_b.rotation_matrix(), epsilon = epsilon);
        assert_relative_eq!(pose_a.translation(), pose_b.translation(), epsilon = epsilon);
    }
}

fn check_axis(axis: Axis) {
    let original = make_bundle();

    let mut current = original.clone();
    let mut seen_distinct = false;
    for step in 0..4 {
        let next = rotate(&current, axis, 90.0).unwrap();
        if step == 0 {
            // One quarter turn should visibly move at least one world point.
            let moved = original
                .world_points()
                .rows()
                .iter()
                .zip(next.world_points().rows())
                .any(|(a, b)| (a.coords - b.coords).norm() > 1.0);
            seen_distinct = moved;
        }
        current = next;
    }
    assert!(seen_distinct, "a single 90 degree rotation should move the reconstruction");
    assert_bundles_match(&original, &current, 1e-6);
}

#[test]
fn test_four_quarter_turns_about_x_returns_to_original() {
    check_axis(Axis::X);
}

#[test]
fn test_four_quarter_turns_about_y_returns_to_original() {
    check_axis(Axis::Y);
}

#[test]
fn test_four_quarter_turns_about_z_returns_to_original() {
    check_axis(Axis::Z);
}

#[test]
fn test_single_quarter_turn_matches_axis_rotation_matrix() {
    let original = make_bundle();
    let rotated = rotate(&original, Axis::Z, 90.0).unwrap();
    let expected = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let world_point = original.world_points().rows()[0].coords;
    let rotated_point = rotated.world_points().rows()[0].coords;
    assert_relative_eq!(rotated_point, nalgebra::Point3::from(expected * world_point.coords), epsilon = 1e-8);
}
