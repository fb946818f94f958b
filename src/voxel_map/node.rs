use nalgebra::Point3;

use super::index::VoxelIndex;

/// One occupied voxel: a bounded set of representative points plus the
/// intrusive links of the LRU list threaded through the arena.
///
/// `prev` walks toward the most recently touched voxel, `next` toward the
/// least recently touched one.
#[derive(Debug)]
pub(crate) struct VoxelNode {
    pub(crate) index: VoxelIndex,
    pub(crate) points: Vec<Point3<f32>>,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl VoxelNode {
    pub(crate) fn new(index: VoxelIndex, capacity: usize) -> Self {
        Self {
            index,
            points: Vec::with_capacity(capacity),
            prev: None,
            next: None,
        }
    }
}
