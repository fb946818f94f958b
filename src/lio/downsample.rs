//! Voxel-grid downsampling of the undistorted scan.

use std::collections::HashMap;

use crate::point::{Point, PointCloud};
use crate::voxel_map::VoxelIndex;

/// Reduces a scan to one barycenter per voxel at the configured leaf size.
/// The grid is kept across scans to recycle its allocation.
pub(crate) struct Downsampler {
    resolution: f32,
    grid: HashMap<VoxelIndex, (usize, Point)>,
}

impl Downsampler {
    pub(crate) fn new(resolution: f32) -> Self {
        Self {
            resolution,
            grid: HashMap::new(),
        }
    }

    pub(crate) fn filter(&mut self, input: &[Point], out: &mut PointCloud) {
        self.grid.clear();

        for point in input {
            let index = VoxelIndex::containing(&point.position, self.resolution);
            self.grid
                .entry(index)
                .and_modify(|(count, barycenter)| {
                    *count += 1;
                    let alpha = (*count as f32).recip();
                    barycenter.position.coords +=
                        (point.position - barycenter.position) * alpha;
                    barycenter.intensity += (point.intensity - barycenter.intensity) * alpha;
                    barycenter.t_offset += (point.t_offset - barycenter.t_offset) * alpha;
                })
                .or_insert((1, *point));
        }

        out.clear();
        out.extend(self.grid.values().map(|(_, barycenter)| *barycenter));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn collapses_each_voxel_to_its_barycenter() {
        let mut downsampler = Downsampler::new(1.0);
        let input = vec![
            Point::new(Point3::new(0.2, 0.2, 0.2), 1.0, 0.0),
            Point::new(Point3::new(0.4, 0.4, 0.4), 3.0, 0.0),
            Point::new(Point3::new(5.5, 0.0, 0.0), 2.0, 0.0),
        ];
        let mut out = PointCloud::new();
        downsampler.filter(&input, &mut out);

        assert_eq!(out.len(), 2);
        let merged = out
            .iter()
            .find(|p| p.position.x < 1.0)
            .expect("merged voxel present");
        assert!((merged.position.x - 0.3).abs() < 1e-6);
        assert!((merged.intensity - 2.0).abs() < 1e-6);
    }

    #[test]
    fn reused_grid_is_cleared_between_scans() {
        let mut downsampler = Downsampler::new(1.0);
        let mut out = PointCloud::new();
        downsampler.filter(
            &[Point::new(Point3::new(0.5, 0.5, 0.5), 1.0, 0.0)],
            &mut out,
        );
        downsampler.filter(
            &[Point::new(Point3::new(9.5, 0.5, 0.5), 1.0, 0.0)],
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!((out[0].position.x - 9.5).abs() < 1e-6);
    }
}
