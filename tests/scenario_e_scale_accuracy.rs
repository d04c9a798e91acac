//! Scenario E: on a noise-free planar board with known real-world spacing,
//! the reconstructed scale should match the board's physical scale closely.

mod common;

use caliscope_core::PointDataBundle;

#[test]
fn test_scale_accuracy_on_noise_free_planar_board() {
    let array = common::two_camera_array(450.0);
    let board = common::board_points_mm();
    let (image_points, world_points) = common::project_bundle_inputs(&array, &board, 0, Some(&board));
    let bundle = PointDataBundle::new(array, image_points, world_points).unwrap();

    let scale_data = bundle.compute_scale_accuracy(0).unwrap();

    assert!(scale_data.n_pairs > 0);
    assert!(scale_data.distance_rmse < 5.0, "distance_rmse_mm should be under 5mm, got {}", scale_data.distance_rmse);
    assert!(scale_data.relative_error_percent < 1.0);
}

#[test]
fn test_scale_accuracy_requires_minimum_matched_points() {
    let array = common::two_camera_array(450.0);
    let board = &common::board_points_mm()[..1];
    let (image_points, world_points) = common::project_bundle_inputs(&array, board, 0, Some(board));

    // A single point cannot form a PointDataBundle (needs at least one
    // matched, posed observation, which it has, but compute_scale_accuracy
    // itself needs at least 2 points at the sync index).
    let bundle = PointDataBundle::new(array, image_points, world_points).unwrap();
    assert!(bundle.compute_scale_accuracy(0).is_err());
}
