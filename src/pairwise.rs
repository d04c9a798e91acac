//! [`StereoPair`] and [`PairedPoseNetwork`]: the graph of directly and
//! transitively measured relative camera poses, from which a single
//! globally anchored [`CameraArray`] is built.
//!
//! There is no precedent for this bridging/anchoring algorithm in the host
//! workspace -- its self-calibration tooling delegates the equivalent step
//! to an external MATLAB/C solver (see `mcsc-structs`/`braidz-mcsc`). This
//! module is therefore built from first principles, in the idiom the rest
//! of this crate uses: `BTreeMap`-keyed graphs, `thiserror`-free `Result`
//! returns (the operations here cannot fail), and `tracing` for the
//! warnings a caller needs about disconnected components.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use nalgebra::RealField;
use serde::{Deserialize, Serialize};

use crate::camera::CameraArray;
use crate::geometry::RigidTransform;

/// A directly or transitively measured relative pose between two cameras.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StereoPair<R: RealField + Copy> {
    primary_port: i64,
    secondary_port: i64,
    transform: RigidTransform<R>,
    error_score: R,
}

impl<R: RealField + Copy> StereoPair<R> {
    pub fn new(primary_port: i64, secondary_port: i64, transform: RigidTransform<R>, error_score: R) -> Self {
        Self {
            primary_port,
            secondary_port,
            transform,
            error_score,
        }
    }

    pub fn primary_port(&self) -> i64 {
        self.primary_port
    }

    pub fn secondary_port(&self) -> i64 {
        self.secondary_port
    }

    pub fn transform(&self) -> &RigidTransform<R> {
        &self.transform
    }

    pub fn error_score(&self) -> R {
        self.error_score
    }

    pub fn inverse(&self) -> Self {
        Self {
            primary_port: self.secondary_port,
            secondary_port: self.primary_port,
            transform: self.transform.inverse(),
            error_score: self.error_score,
        }
    }

    /// Compose `self = pair(A,B)` with `next = pair(B,C)` into `pair(A,C)`.
    /// Panics (debug-only assertion) if `self.secondary_port != next.primary_port`.
    fn compose(&self, next: &Self) -> Self {
        debug_assert_eq!(self.secondary_port, next.primary_port);
        Self {
            primary_port: self.primary_port,
            secondary_port: next.secondary_port,
            transform: self.transform.compose(&next.transform),
            error_score: self.error_score + next.error_score,
        }
    }
}

/// Graph of [`StereoPair`] edges keyed by `(primary_port, secondary_port)`.
/// Every inserted edge is accompanied by its inverse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairedPoseNetwork<R: RealField + Copy> {
    pairs: BTreeMap<(i64, i64), StereoPair<R>>,
}

impl<R: RealField + Copy> PairedPoseNetwork<R> {
    pub fn new() -> Self {
        Self { pairs: BTreeMap::new() }
    }

    pub fn add(&mut self, pair: StereoPair<R>) {
        let inv = pair.inverse();
        self.pairs.insert((pair.primary_port, pair.secondary_port), pair);
        self.pairs.insert((inv.primary_port, inv.secondary_port), inv);
    }

    pub fn get(&self, a: i64, b: i64) -> Option<&StereoPair<R>> {
        self.pairs.get(&(a, b))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn ports(&self) -> BTreeSet<i64> {
        let mut ports = BTreeSet::new();
        for (a, b) in self.pairs.keys() {
            ports.insert(*a);
            ports.insert(*b);
        }
        ports
    }

    fn neighbors(&self, port: i64) -> impl Iterator<Item = i64> + '_ {
        self.pairs.keys().filter(move |(a, _)| *a == port).map(|(_, b)| *b)
    }

    /// Repeatedly fill missing pairs `(A, C)` by composing through any
    /// intermediate `X` with both `(A, X)` and `(X, C)` present, keeping the
    /// composition with the lowest summed `error_score`. Iterates to a fixed
    /// point: a full pass that adds no new edge terminates the loop.
    pub fn bridge_all(&self) -> Self {
        let mut network = self.clone();
        loop {
            let ports: Vec<i64> = network.ports().into_iter().collect();
            let mut additions: Vec<StereoPair<R>> = Vec::new();
            for &a in &ports {
                for &c in &ports {
                    if a == c || network.pairs.contains_key(&(a, c)) {
                        continue;
                    }
                    let mut best: Option<StereoPair<R>> = None;
                    for x in network.neighbors(a).collect::<Vec<_>>() {
                        if x == a || x == c {
                            continue;
                        }
                        if let (Some(ax), Some(xc)) = (network.get(a, x), network.get(x, c)) {
                            let candidate = ax.compose(xc);
                            best = match best {
                                Some(current) if current.error_score() <= candidate.error_score() => Some(current),
                                _ => Some(candidate),
                            };
                        }
                    }
                    if let Some(candidate) = best {
                        additions.push(candidate);
                    }
                }
            }
            if additions.is_empty() {
                break;
            }
            for pair in additions {
                network.add(pair);
            }
        }
        network
    }

    /// The largest connected component of the pose graph. Ties between
    /// equal-size components are broken by smallest minimum port.
    pub fn largest_component(&self) -> BTreeSet<i64> {
        let all_ports = self.ports();
        let mut visited: BTreeSet<i64> = BTreeSet::new();
        let mut components: Vec<BTreeSet<i64>> = Vec::new();

        for &start in &all_ports {
            if visited.contains(&start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::new();
            queue.push_back(start);
            visited.insert(start);
            while let Some(port) = queue.pop_front() {
                component.insert(port);
                for next in self.neighbors(port) {
                    if visited.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
            components.push(component);
        }

        components
            .into_iter()
            .max_by(|a, b| {
                a.len()
                    .cmp(&b.len())
                    .then_with(|| b.iter().next().cmp(&a.iter().next()))
            })
            .unwrap_or_default()
    }

    /// Build a [`CameraArray`] with `anchor` at the world origin and every
    /// other camera in the same connected component posed from the stored
    /// `(anchor, port)` pair. Cameras outside the component are left
    /// unposed. Returns the total `error_score` summed over the posed
    /// cameras, so callers can compare candidate anchors.
    pub fn anchored_array(&self, array: &CameraArray<R>, anchor: i64) -> (CameraArray<R>, R) {
        let mut next = array.without_poses();
        next = next.with_pose(anchor, RigidTransform::identity()).unwrap_or(next);
        let mut total_error = R::zero();
        for port in array.ports() {
            if port == anchor {
                continue;
            }
            if let Some(pair) = self.get(anchor, port) {
                if let Ok(updated) = next.with_pose(port, *pair.transform()) {
                    next = updated;
                    total_error += pair.error_score();
                }
            }
        }
        (next, total_error)
    }

    /// Pick the best anchor (lowest total error score) within the largest
    /// component -- or use the caller-supplied one -- and write the
    /// resulting poses into `array`. Cameras unreachable from the anchor
    /// remain unposed; this is a normal, non-error outcome (see
    /// `CoreError::DisconnectedGraph`-equivalent in `tracing::warn!`).
    pub fn apply_to(&self, array: &CameraArray<R>, anchor: Option<i64>) -> CameraArray<R> {
        let component = self.largest_component();
        if component.len() < array.len() {
            tracing::warn!(
                component_size = component.len(),
                total_cameras = array.len(),
                "pose network is disconnected; cameras outside the largest component remain unposed"
            );
        }

        let chosen_anchor = match anchor {
            Some(a) => a,
            None => component
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let err_a = self.anchored_array(array, a).1;
                    let err_b = self.anchored_array(array, b).1;
                    err_a.partial_cmp(&err_b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or_else(|| array.ports().next().unwrap_or_default()),
        };

        self.anchored_array(array, chosen_anchor).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::collections::BTreeMap as StdBTreeMap;

    fn identity_intrinsics() -> nalgebra::Matrix3<f64> {
        nalgebra::Matrix3::identity()
    }

    fn array_of_ports(ports: &[i64]) -> CameraArray<f64> {
        let mut cameras = StdBTreeMap::new();
        for &p in ports {
            cameras.insert(
                p,
                crate::camera::Camera::new(p, 100, 100, identity_intrinsics(), None, 0).unwrap(),
            );
        }
        CameraArray::new(cameras).unwrap()
    }

    #[test]
    fn test_add_inserts_inverse() {
        let mut net = PairedPoseNetwork::new();
        let t = RigidTransform::from_rodrigues(&Vector3::new(0.1, 0.0, 0.0), &Vector3::new(1.0, 0.0, 0.0));
        net.add(StereoPair::new(0, 1, t, 0.5));
        let fwd = net.get(0, 1).unwrap();
        let bwd = net.get(1, 0).unwrap();
        approx::assert_relative_eq!(
            fwd.transform().compose(bwd.transform()).rotation_matrix(),
            nalgebra::Matrix3::identity(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_bridge_all_fills_transitive_pair() {
        let mut net = PairedPoseNetwork::new();
        let t01 = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.1, 0.0), &Vector3::new(1.0, 0.0, 0.0));
        let t12 = RigidTransform::from_rodrigues(&Vector3::new(0.0, 0.0, 0.1), &Vector3::new(0.0, 1.0, 0.0));
        net.add(StereoPair::new(0, 1, t01, 0.1));
        net.add(StereoPair::new(1, 2, t12, 0.2));
        assert!(net.get(0, 2).is_none());
        let bridged = net.bridge_all();
        let pair_02 = bridged.get(0, 2).expect("bridged pair should exist");
        approx::assert_relative_eq!(
            pair_02.transform().to_homogeneous(),
            t01.compose(&t12).to_homogeneous(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_largest_component_tie_break_smallest_min_port() {
        let mut net = PairedPoseNetwork::new();
        let t = RigidTransform::identity();
        net.add(StereoPair::new(10, 11, t, 0.0));
        net.add(StereoPair::new(1, 2, t, 0.0));
        let component = net.largest_component();
        assert!(component.contains(&1));
        assert!(component.contains(&2));
        assert!(!component.contains(&10));
    }

    #[test]
    fn test_apply_to_anchor_has_identity_pose() {
        let array = array_of_ports(&[0, 1, 2]);
        let mut net = PairedPoseNetwork::new();
        let t01 = RigidTransform::from_rodrigues(&Vector3::new(0.1, 0.0, 0.0), &Vector3::new(2.0, 0.0, 0.0));
        net.add(StereoPair::new(0, 1, t01, 0.1));
        let posed = net.apply_to(&array, Some(0));
        let anchor_cam = posed.camera(0).unwrap();
        approx::assert_relative_eq!(
            anchor_cam.pose().unwrap().rotation_matrix(),
            nalgebra::Matrix3::identity(),
            epsilon = 1e-12
        );
        approx::assert_relative_eq!(anchor_cam.pose().unwrap().translation(), Vector3::zeros(), epsilon = 1e-12);
        assert!(posed.camera(2).unwrap().pose().is_none());
    }
}
