//! Decides which world-frame scan points enter the voxel map.
//!
//! Runs after the iterated update: every downsampled point is re-transformed
//! with the final state, then either inserted or skipped based on the
//! neighbors cached by the observation model. The decision loop is
//! data-parallel; the map itself is only mutated from the pipeline thread
//! once both accumulation lists are complete.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use super::observe::{Correspondence, NUM_MATCH_POINTS};
use crate::eskf::State;
use crate::point::Point;
use crate::voxel_map::VoxelMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// The cached neighbors sit outside the candidate's voxel, insert
    /// without a downsample check.
    AddDirect,
    /// Insert; the candidate improves on the neighbors.
    Add,
    Skip,
}

/// Transforms the scan with the final state and flushes the accepted points
/// into the map.
pub(crate) fn map_incremental(
    map: &mut VoxelMap,
    state: &State,
    scan_body: &[Point],
    corr: &mut [Correspondence],
    filter_size_map: f32,
    ekf_inited: bool,
) {
    debug_assert_eq!(scan_body.len(), corr.len());

    let rot_wl = (state.rot * state.rot_li)
        .to_rotation_matrix()
        .into_inner()
        .cast::<f32>();
    let t_wl = (state.rot * state.t_li + state.pos).cast::<f32>();

    let decisions: Vec<Decision> = corr
        .par_iter_mut()
        .zip(scan_body.par_iter())
        .map(|(slot, point)| {
            slot.world = Point3::from(rot_wl * point.position.coords + t_wl);
            decide(slot, filter_size_map, ekf_inited)
        })
        .collect();

    let mut points_to_add = Vec::with_capacity(corr.len());
    let mut points_no_downsample = Vec::with_capacity(corr.len());
    for (slot, decision) in corr.iter().zip(&decisions) {
        match decision {
            Decision::Add => points_to_add.push(slot.world),
            Decision::AddDirect => points_no_downsample.push(slot.world),
            Decision::Skip => {}
        }
    }

    map.add_points(points_to_add);
    map.add_points(points_no_downsample);
}

fn decide(slot: &Correspondence, filter_size_map: f32, ekf_inited: bool) -> Decision {
    if slot.nearest.is_empty() || !ekf_inited {
        return Decision::Add;
    }

    let center = voxel_center(&slot.world, filter_size_map);
    let half = 0.5 * filter_size_map;

    let to_center: Vector3<f32> = slot.nearest[0] - center;
    if to_center.x.abs() > half && to_center.y.abs() > half && to_center.z.abs() > half {
        return Decision::AddDirect;
    }

    let candidate_dist = (slot.world - center).norm_squared();
    if slot.nearest.len() >= NUM_MATCH_POINTS {
        for neighbor in &slot.nearest[..NUM_MATCH_POINTS] {
            if (neighbor - center).norm_squared() < candidate_dist + 1e-6 {
                return Decision::Skip;
            }
        }
    }
    Decision::Add
}

fn voxel_center(point: &Point3<f32>, resolution: f32) -> Point3<f32> {
    Point3::from(
        ((point.coords / resolution).map(f32::floor) + Vector3::repeat(0.5)) * resolution,
    )
}
