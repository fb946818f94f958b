//! Incremental voxel index over the accumulated map points.
//!
//! Occupied voxels live in a [`Slab`] arena and are threaded onto an
//! intrusive LRU list; the hash map from [`VoxelIndex`] to arena slot uses a
//! pass-through hasher over the spatial hash. Insertion is O(1) amortized,
//! nearest-neighbor queries scan a fixed surrounding voxel pattern.

pub mod index;
mod node;

use std::cmp::Ordering;

use nalgebra::Point3;
use nohash_hasher::IntMap;
use slab::Slab;

pub use index::VoxelIndex;
use node::VoxelNode;

/// Which voxels around the query's voxel are searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NearbyType {
    /// Only the voxel containing the query.
    Center,
    /// Center plus the six face neighbors.
    Nearby6,
    /// Center, faces and edges.
    #[default]
    Nearby18,
    /// The full 3x3x3 block.
    Nearby26,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Voxel side length in meters.
    pub resolution: f32,
    /// Neighborhood pattern used by [`VoxelMap::get_closest`].
    pub nearby_type: NearbyType,
    /// Maximum number of occupied voxels; the least recently touched voxel
    /// is dropped whole when exceeded.
    pub capacity: usize,
    /// Representative points kept per voxel; later arrivals are discarded.
    pub max_points_per_voxel: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolution: 0.2,
            nearby_type: NearbyType::Nearby18,
            capacity: 100_000,
            max_points_per_voxel: 32,
        }
    }
}

pub struct VoxelMap {
    grids: IntMap<VoxelIndex, usize>,
    nodes: Slab<VoxelNode>,
    /// Most recently touched voxel.
    head: Option<usize>,
    /// Least recently touched voxel, next eviction victim.
    tail: Option<usize>,
    nearby: Vec<(i32, i32, i32)>,
    config: Config,
}

impl VoxelMap {
    pub fn new(config: Config) -> Self {
        Self {
            grids: IntMap::default(),
            nodes: Slab::new(),
            head: None,
            tail: None,
            nearby: nearby_offsets(config.nearby_type),
            config,
        }
    }

    pub fn num_voxels(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Inserts points, refreshing the LRU position of every voxel touched.
    /// Points landing in a full voxel are discarded; duplicates are not
    /// detected.
    pub fn add_points<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = Point3<f32>>,
    {
        for point in points {
            let index = VoxelIndex::containing(&point, self.config.resolution);
            match self.grids.get(&index).copied() {
                Some(slot) => {
                    self.touch(slot);
                    let node = &mut self.nodes[slot];
                    if node.points.len() < self.config.max_points_per_voxel {
                        node.points.push(point);
                    }
                }
                None => {
                    let mut node = VoxelNode::new(index, self.config.max_points_per_voxel.min(8));
                    node.points.push(point);
                    let slot = self.nodes.insert(node);
                    self.grids.insert(index, slot);
                    self.link_front(slot);
                    if self.grids.len() > self.config.capacity {
                        self.evict_tail();
                    }
                }
            }
        }
    }

    /// Returns at most `k` map points from the neighborhood voxels of `q`,
    /// sorted ascending by squared distance. Fewer points are returned when
    /// the neighborhood is sparse.
    pub fn get_closest(&self, q: &Point3<f32>, k: usize) -> Vec<Point3<f32>> {
        let center = VoxelIndex::containing(q, self.config.resolution);
        let mut candidates: Vec<(f32, Point3<f32>)> = Vec::new();

        for &(dx, dy, dz) in &self.nearby {
            let Some(&slot) = self.grids.get(&center.offset(dx, dy, dz)) else {
                continue;
            };
            for point in &self.nodes[slot].points {
                candidates.push(((point - q).norm_squared(), *point));
            }
        }

        candidates
            .sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        candidates.truncate(k);
        candidates.into_iter().map(|(_, p)| p).collect()
    }

    pub fn reset(&mut self) {
        self.grids.clear();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Moves `slot` to the front of the LRU list.
    fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.link_front(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = &mut self.nodes[slot];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, slot: usize) {
        self.nodes[slot].prev = None;
        self.nodes[slot].next = self.head;
        if let Some(old) = self.head {
            self.nodes[old].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Drops the least recently touched voxel whole.
    fn evict_tail(&mut self) {
        let Some(slot) = self.tail else {
            return;
        };
        self.unlink(slot);
        let node = self.nodes.remove(slot);
        self.grids.remove(&node.index);
    }
}

fn nearby_offsets(nearby_type: NearbyType) -> Vec<(i32, i32, i32)> {
    let mut offsets = vec![(0, 0, 0)];
    if nearby_type == NearbyType::Center {
        return offsets;
    }

    // face neighbors
    offsets.extend([
        (1, 0, 0),
        (-1, 0, 0),
        (0, 1, 0),
        (0, -1, 0),
        (0, 0, 1),
        (0, 0, -1),
    ]);
    if nearby_type == NearbyType::Nearby6 {
        return offsets;
    }

    // edge neighbors
    offsets.extend([
        (1, 1, 0),
        (1, -1, 0),
        (-1, 1, 0),
        (-1, -1, 0),
        (1, 0, 1),
        (1, 0, -1),
        (-1, 0, 1),
        (-1, 0, -1),
        (0, 1, 1),
        (0, 1, -1),
        (0, -1, 1),
        (0, -1, -1),
    ]);
    if nearby_type == NearbyType::Nearby18 {
        return offsets;
    }

    // corner neighbors
    offsets.extend([
        (1, 1, 1),
        (1, 1, -1),
        (1, -1, 1),
        (1, -1, -1),
        (-1, 1, 1),
        (-1, 1, -1),
        (-1, -1, 1),
        (-1, -1, -1),
    ]);
    offsets
}
