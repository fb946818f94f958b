use std::hash::{Hash, Hasher};

use nalgebra::Point3;

/// Integer voxel key: `(i, j, k) = floor(point / resolution)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelIndex {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelIndex {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Key of the voxel containing `point` at the given resolution.
    #[inline]
    pub fn containing(point: &Point3<f32>, resolution: f32) -> Self {
        let scaled = point / resolution;
        Self {
            x: scaled.x.floor() as i32,
            y: scaled.y.floor() as i32,
            z: scaled.z.floor() as i32,
        }
    }

    #[inline]
    pub const fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }
}

impl Hash for VoxelIndex {
    /// see also Optimized Spatial Hashing for Collision Detection of Deformable Objects, Matthias Teschner et. al., VMV 2003
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        let x = self.x as i64;
        let y = self.y as i64;
        let z = self.z as i64;
        hasher.write_i64((x * 73856093) ^ (y * 471943) ^ (z * 83492791));
    }
}

/// The [`Hash`] implementation of [`VoxelIndex`] invokes
/// [`write_i64`](Hasher::write_i64) exactly once.
impl nohash_hasher::IsEnabled for VoxelIndex {}
