//! Rigid transforms and rotation conversions shared by the pose network,
//! bootstrap strategies, bundle adjustment and alignment.

use nalgebra::{Matrix3, Matrix4, Point3, RealField, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A rigid transform `x' = R*x + t`, used throughout the core to represent
/// one camera pose, one pairwise relative pose, or a similarity-transform
/// rotation component (scale is carried alongside, not inside this type).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform<R: RealField + Copy> {
    rotation: UnitQuaternion<R>,
    translation: Vector3<R>,
}

impl<R: RealField + Copy> RigidTransform<R> {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_rotation_matrix_translation(rotation: &Matrix3<R>, translation: &Vector3<R>) -> Self {
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation)),
            translation: *translation,
        }
    }

    pub fn from_quaternion_translation(rotation: UnitQuaternion<R>, translation: Vector3<R>) -> Self {
        Self { rotation, translation }
    }

    pub fn from_rodrigues(rvec: &Vector3<R>, tvec: &Vector3<R>) -> Self {
        let angle = rvec.norm();
        let rotation = if angle > R::default_epsilon() {
            let axis = nalgebra::Unit::new_normalize(*rvec);
            UnitQuaternion::from_axis_angle(&axis, angle)
        } else {
            UnitQuaternion::identity()
        };
        Self {
            rotation,
            translation: *tvec,
        }
    }

    /// Rodrigues rotation vector (axis scaled by angle in radians).
    pub fn rodrigues(&self) -> Vector3<R> {
        self.rotation.scaled_axis()
    }

    pub fn translation(&self) -> Vector3<R> {
        self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<R> {
        *self.rotation.to_rotation_matrix().matrix()
    }

    pub fn quaternion(&self) -> UnitQuaternion<R> {
        self.rotation
    }

    pub fn to_homogeneous(&self) -> Matrix4<R> {
        let mut m = self.rotation.to_homogeneous();
        m[(0, 3)] = self.translation.x;
        m[(1, 3)] = self.translation.y;
        m[(2, 3)] = self.translation.z;
        m
    }

    pub fn from_homogeneous(m: &Matrix4<R>) -> Result<Self> {
        let r = m.fixed_view::<3, 3>(0, 0).into_owned();
        let rotation = Rotation3::from_matrix_unchecked(r);
        let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Ok(Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rotation),
            translation,
        })
    }

    pub fn inverse(&self) -> Self {
        let inv_rotation = self.rotation.inverse();
        let inv_translation = -(inv_rotation * self.translation);
        Self {
            rotation: inv_rotation,
            translation: inv_translation,
        }
    }

    /// Compose `self = T_AB` with `next = T_BC`, returning `T_AC`.
    ///
    /// Matches the pairwise-pose composition rule `T_AC = T_BC . T_AB`.
    pub fn compose(&self, next: &Self) -> Self {
        let rotation = next.rotation * self.rotation;
        let translation = next.rotation * self.translation + next.translation;
        Self {
            rotation,
            translation,
        }
    }

    pub fn apply_point(&self, p: &Point3<R>) -> Point3<R> {
        self.rotation * p + self.translation
    }

    /// World-frame camera center, recovered from a world-to-camera pose as
    /// `-R^-1 * t`.
    pub fn camera_center(&self) -> Point3<R> {
        Point3::from(-(self.rotation.inverse() * self.translation))
    }

    /// Construct a world-to-camera pose from a rotation and a world-frame
    /// camera center (the inverse parameterization of [`Self::camera_center`]).
    pub fn from_rotation_matrix_center(rotation: &Matrix3<R>, center: &Point3<R>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation));
        let translation = -(rotation * center.coords);
        Self { rotation, translation }
    }

    pub fn apply_vector(&self, v: &Vector3<R>) -> Vector3<R> {
        self.rotation * v
    }
}

/// Axis used by [`crate::bundle::PointDataBundle::rotate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn unit_vector<R: RealField + Copy>(self) -> Vector3<R> {
        match self {
            Axis::X => Vector3::x(),
            Axis::Y => Vector3::y(),
            Axis::Z => Vector3::z(),
        }
    }
}

/// A right-hand-rule rotation of `degrees` around `axis`, as a [`RigidTransform`]
/// with zero translation.
pub fn axis_rotation<R: RealField + Copy>(axis: Axis, degrees: R) -> RigidTransform<R> {
    let radians = degrees * R::pi() / R::from_subset(&180.0);
    let axis_vec = nalgebra::Unit::new_normalize(axis.unit_vector::<R>());
    RigidTransform {
        rotation: UnitQuaternion::from_axis_angle(&axis_vec, radians),
        translation: Vector3::zeros(),
    }
}

/// Average a set of unit quaternions via the eigenvector method: the leading
/// eigenvector of `sum(q_i * q_i^T)`, sign-normalized so `w >= 0`.
///
/// Never use the arithmetic mean of quaternion components directly -- it is
/// not a valid rotation average and biases towards the identity for
/// near-antipodal samples.
pub fn average_quaternions<R: RealField + Copy>(
    quats: &[UnitQuaternion<R>],
) -> Option<UnitQuaternion<R>> {
    if quats.is_empty() {
        return None;
    }
    let mut accum = nalgebra::Matrix4::<R>::zeros();
    for q in quats {
        let v = q.as_vector();
        accum += v * v.transpose();
    }
    let eigen = nalgebra::SymmetricEigen::new(accum);
    let (max_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())?;
    let leading = eigen.eigenvectors.column(max_idx).into_owned();
    let leading = if leading[3] < R::zero() { -leading } else { leading };
    Some(UnitQuaternion::new_normalize(nalgebra::Quaternion::new(
        leading[3], leading[0], leading[1], leading[2],
    )))
}

/// Median of a non-empty slice of `R`, where `R` has a total order (no NaN).
pub fn median<R: RealField + Copy + num_traits::float::TotalOrder>(values: &[R]) -> Option<R> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n % 2 == 0 {
        Some((v[n / 2 - 1] + v[n / 2]) / R::from_subset(&2.0))
    } else {
        Some(v[n / 2])
    }
}

/// Reject outliers from `values` using Tukey's IQR rule with the given
/// multiplier, returning the indices into `values` that are retained.
pub fn iqr_filter_indices<R: RealField + Copy + num_traits::float::TotalOrder>(
    values: &[R],
    multiplier: R,
) -> Vec<usize> {
    let n = values.len();
    if n < 4 {
        return (0..n).collect();
    }
    let mut sorted: Vec<R> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = percentile_sorted(&sorted, R::from_subset(&25.0));
    let q3 = percentile_sorted(&sorted, R::from_subset(&75.0));
    let iqr = q3 - q1;
    let lo = q1 - multiplier * iqr;
    let hi = q3 + multiplier * iqr;
    (0..n).filter(|&i| values[i] >= lo && values[i] <= hi).collect()
}

/// Linear-interpolation percentile of an already-sorted slice, `pct` in `[0,100]`.
pub fn percentile_sorted<R: RealField + Copy>(sorted: &[R], pct: R) -> R {
    let n = sorted.len();
    if n == 0 {
        return R::zero();
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = pct / R::from_subset(&100.0) * R::from_subset(&((n - 1) as f64));
    let lo = num_traits::Float::floor(rank);
    let hi = num_traits::Float::ceil(rank);
    let lo_idx = nalgebra::convert::<R, f64>(lo) as usize;
    let hi_idx = nalgebra::convert::<R, f64>(hi) as usize;
    if lo_idx == hi_idx {
        sorted[lo_idx]
    } else {
        let frac = rank - lo;
        sorted[lo_idx] * (R::one() - frac) + sorted[hi_idx] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_inverse_roundtrip() {
        let t_ab = RigidTransform::from_rodrigues(
            &Vector3::new(0.1, 0.2, 0.05),
            &Vector3::new(1.0, 2.0, 3.0),
        );
        let inv = t_ab.inverse();
        let roundtrip = t_ab.compose(&inv);
        approx::assert_relative_eq!(roundtrip.rotation_matrix(), Matrix3::identity(), epsilon = 1e-10);
        approx::assert_relative_eq!(roundtrip.translation(), Vector3::zeros(), epsilon = 1e-10);
    }

    #[test]
    fn test_compose_matches_homogeneous_product() {
        let t_ab = RigidTransform::from_rodrigues(&Vector3::new(0.3, -0.1, 0.2), &Vector3::new(1.0, 0.0, 0.0));
        let t_bc = RigidTransform::from_rodrigues(&Vector3::new(-0.2, 0.4, 0.1), &Vector3::new(0.0, 2.0, 1.0));
        let composed = t_ab.compose(&t_bc);
        let expected = t_bc.to_homogeneous() * t_ab.to_homogeneous();
        approx::assert_relative_eq!(composed.to_homogeneous(), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_four_quarter_turns_is_identity() {
        let mut t = RigidTransform::<f64>::identity();
        for _ in 0..4 {
            t = t.compose(&axis_rotation(Axis::Z, 90.0));
        }
        approx::assert_relative_eq!(t.rotation_matrix(), Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_average_quaternions_agrees_for_identical_inputs() {
        let q = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let avg = average_quaternions(&[q, q, q]).unwrap();
        approx::assert_relative_eq!(avg.angle_to(&q), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_median_even_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
    }

    #[test]
    fn test_iqr_filter_drops_obvious_outlier() {
        let values = [1.0, 1.1, 0.9, 1.05, 0.95, 1.0, 50.0];
        let kept = iqr_filter_indices(&values, 1.5);
        assert!(!kept.contains(&6));
        assert!(kept.len() >= 5);
    }
}
