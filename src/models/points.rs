//! Request/response shapes for the point query endpoints.

use serde::{Deserialize, Serialize};

/// Row-wise point list: `{"locations": [[x, y, z], ...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PointList {
    pub locations: Vec<[f64; 3]>,
}

/// Columnar point list: `{"x": [...], "y": [...], "z": [...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnPointList {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl ColumnPointList {
    /// Zip columns into points; trailing values in longer columns are
    /// dropped, matching a column-stack of the shortest length.
    pub fn into_points(self) -> Vec<[f64; 3]> {
        let n = self.x.len().min(self.y.len()).min(self.z.len());
        (0..n).map(|i| [self.x[i], self.y[i], self.z[i]]).collect()
    }
}

/// One mapped point: original position plus displacement.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MappedPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub dx: f32,
    pub dy: f32,
}
