//! Tabular observation containers: [`ImagePoints`] (2D detections) and
//! [`WorldPoints`] (triangulated/refined 3D estimates).

use std::collections::{BTreeSet, HashMap};

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera::CameraArray;
use crate::error::{CoreError, Result};

/// One 2D detection of one calibration-target point in one camera at one
/// synchronized capture instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImagePointRow {
    pub sync_index: u64,
    pub port: i64,
    pub point_id: i64,
    pub img_loc: Point2<f64>,
    /// Board-frame coordinate of this corner, if known. `z` is often 0 for
    /// planar boards. Absent for trackers without known target geometry.
    pub obj_loc: Option<Point3<f64>>,
}

/// Long-form table of 2D detections; `(sync_index, port, point_id)` is the
/// primary key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePoints {
    rows: Vec<ImagePointRow>,
}

impl ImagePoints {
    pub fn new(rows: Vec<ImagePointRow>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for row in &rows {
            if !seen.insert((row.sync_index, row.port, row.point_id)) {
                return Err(CoreError::InvalidInput(
                    "duplicate (sync_index, port, point_id) in ImagePoints",
                ));
            }
        }
        Ok(Self { rows })
    }

    pub fn validate_ports<R: nalgebra::RealField + Copy>(&self, array: &CameraArray<R>) -> Result<()> {
        for row in &self.rows {
            if array.camera(row.port).is_none() {
                return Err(CoreError::UnknownCamera { port: row.port });
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> &[ImagePointRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn filter<F: Fn(&ImagePointRow) -> bool>(&self, keep: F) -> Self {
        Self {
            rows: self.rows.iter().copied().filter(|r| keep(r)).collect(),
        }
    }

    /// Rows for a given camera port.
    pub fn by_port(&self, port: i64) -> impl Iterator<Item = &ImagePointRow> {
        self.rows.iter().filter(move |r| r.port == port)
    }

    /// Rows for a given sync index.
    pub fn by_sync_index(&self, sync_index: u64) -> impl Iterator<Item = &ImagePointRow> {
        self.rows.iter().filter(move |r| r.sync_index == sync_index)
    }

    /// Group row indices by `(sync_index, point_id)`, for triangulation and
    /// bootstrap aggregation.
    pub fn group_by_sync_and_point(&self) -> HashMap<(u64, i64), Vec<usize>> {
        let mut groups: HashMap<(u64, i64), Vec<usize>> = HashMap::new();
        for (idx, row) in self.rows.iter().enumerate() {
            groups.entry((row.sync_index, row.point_id)).or_default().push(idx);
        }
        groups
    }
}

/// One triangulated/refined 3D estimate, keyed by `(sync_index, point_id)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorldPointRow {
    pub sync_index: u64,
    pub point_id: i64,
    pub coords: Point3<f64>,
}

/// Long-form table of 3D estimates; `(sync_index, point_id)` is the primary key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldPoints {
    rows: Vec<WorldPointRow>,
}

impl WorldPoints {
    pub fn new(rows: Vec<WorldPointRow>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for row in &rows {
            if !seen.insert((row.sync_index, row.point_id)) {
                return Err(CoreError::InvalidInput("duplicate (sync_index, point_id) in WorldPoints"));
            }
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[WorldPointRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn index_of(&self, sync_index: u64, point_id: i64) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.sync_index == sync_index && r.point_id == point_id)
    }

    pub fn filter<F: Fn(&WorldPointRow) -> bool>(&self, keep: F) -> Self {
        Self {
            rows: self.rows.iter().copied().filter(|r| keep(r)).collect(),
        }
    }
}
