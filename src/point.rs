use nalgebra::Point3;

/// Canonical LiDAR point, shared by every sensor variant.
///
/// `t_offset` is the time of this sample in seconds since the sweep began.
/// It is non-negative and monotonic per ring; after undistortion it is kept
/// so downstream consumers can still tell early returns from late ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub position: Point3<f32>,
    pub intensity: f32,
    pub t_offset: f32,
}

/// A dense, contiguous scan buffer.
pub type PointCloud = Vec<Point>;

impl Point {
    pub fn new(position: Point3<f32>, intensity: f32, t_offset: f32) -> Self {
        Self {
            position,
            intensity,
            t_offset,
        }
    }

    /// Squared range from the sensor origin.
    #[inline]
    pub fn range_squared(&self) -> f32 {
        self.position.coords.norm_squared()
    }
}

impl Default for Point {
    fn default() -> Self {
        Self {
            position: Point3::origin(),
            intensity: 0.0,
            t_offset: 0.0,
        }
    }
}
