//! Point-to-plane observation model solved against the voxel map.
//!
//! Each IESKF iteration transforms the downsampled scan into the world
//! frame, associates every point with a local plane fitted through its map
//! neighbors, and stacks the signed distances and their Jacobians. The
//! per-point work is data-parallel; every index owns its slot in the
//! correspondence buffer.

use nalgebra::{DVector, Dyn, Matrix3, OMatrix, Point3, SMatrix, U12, Vector3, Vector4};
use rayon::prelude::*;
use tracing::warn;

use crate::eskf::{ObserveContext, State};
use crate::point::Point;
use crate::utils::{fit_plane, skew};
use crate::voxel_map::VoxelMap;

/// Neighbors requested per query point.
pub(crate) const NUM_MATCH_POINTS: usize = 5;
/// Neighbors required before a plane is fitted.
pub(crate) const MIN_NUM_MATCH_POINTS: usize = 3;

/// Per-point slot, owned by exactly one task inside the parallel regions.
#[derive(Debug, Clone)]
pub(crate) struct Correspondence {
    pub world: Point3<f32>,
    pub nearest: Vec<Point3<f32>>,
    pub plane: Vector4<f32>,
    pub residual: f32,
    /// A usable plane was fitted during the last refresh.
    pub has_plane: bool,
    /// The plane passed the residual gate this iteration.
    pub selected: bool,
}

impl Default for Correspondence {
    fn default() -> Self {
        Self {
            world: Point3::origin(),
            nearest: Vec::new(),
            plane: Vector4::zeros(),
            residual: 0.0,
            has_plane: false,
            selected: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ObserveOptions {
    pub esti_plane_threshold: f32,
    pub residual_gate: f32,
    pub extrinsic_est_en: bool,
}

/// An effective correspondence after compaction.
struct EffectiveCorr {
    body: Vector3<f64>,
    normal: Vector3<f64>,
    residual: f64,
}

/// Jacobian assembly over the 12 observed error columns, split by whether
/// the extrinsic block is estimated so the per-point kernel carries no
/// branch.
enum JacobianAssembler {
    WithExtrinsic(JacobianParams),
    FixedExtrinsic(JacobianParams),
}

struct JacobianParams {
    rot_t: Matrix3<f64>,
    rot_li: Matrix3<f64>,
    rot_li_t: Matrix3<f64>,
    t_li: Vector3<f64>,
}

type JacobianRow = [f64; 12];

impl JacobianAssembler {
    fn new(state: &State, extrinsic_est_en: bool) -> Self {
        let params = JacobianParams {
            rot_t: state.rot.to_rotation_matrix().into_inner().transpose(),
            rot_li: state.rot_li.to_rotation_matrix().into_inner(),
            rot_li_t: state.rot_li.to_rotation_matrix().into_inner().transpose(),
            t_li: state.t_li,
        };
        if extrinsic_est_en {
            Self::WithExtrinsic(params)
        } else {
            Self::FixedExtrinsic(params)
        }
    }

    fn rows(&self, effective: &[EffectiveCorr]) -> Vec<JacobianRow> {
        match self {
            Self::WithExtrinsic(p) => effective.par_iter().map(|e| p.row::<true>(e)).collect(),
            Self::FixedExtrinsic(p) => effective.par_iter().map(|e| p.row::<false>(e)).collect(),
        }
    }
}

impl JacobianParams {
    /// One row `[n | A | B | C]` over pos / rot / extrinsic-rot /
    /// extrinsic-trans error columns.
    fn row<const EXTRINSIC: bool>(&self, e: &EffectiveCorr) -> JacobianRow {
        let p_imu = self.rot_li * e.body + self.t_li;
        let c = self.rot_t * e.normal;
        let a = skew(&p_imu) * c;
        let b = if EXTRINSIC {
            skew(&e.body) * self.rot_li_t * c
        } else {
            Vector3::zeros()
        };
        [
            e.normal.x, e.normal.y, e.normal.z, a.x, a.y, a.z, b.x, b.y, b.z, c.x, c.y, c.z,
        ]
    }
}

/// Runs one observation pass. Returns the condition-number diagnostic when
/// the pass produced a usable measurement.
pub(crate) fn point_to_plane(
    state: &State,
    ctx: &mut ObserveContext,
    map: &VoxelMap,
    scan_body: &[Point],
    corr: &mut [Correspondence],
    opts: &ObserveOptions,
) -> Option<f64> {
    debug_assert_eq!(scan_body.len(), corr.len());

    let rot_wl = (state.rot * state.rot_li)
        .to_rotation_matrix()
        .into_inner()
        .cast::<f32>();
    let t_wl = (state.rot * state.t_li + state.pos).cast::<f32>();
    let refresh = !ctx.converge;

    corr.par_iter_mut()
        .zip(scan_body.par_iter())
        .for_each(|(slot, point)| {
            let p_body = point.position.coords;
            let world = rot_wl * p_body + t_wl;
            slot.world = Point3::from(world);

            if refresh {
                slot.nearest = map.get_closest(&slot.world, NUM_MATCH_POINTS);
                slot.has_plane = slot.nearest.len() >= MIN_NUM_MATCH_POINTS
                    && match fit_plane(&slot.nearest, opts.esti_plane_threshold) {
                        Some(plane) => {
                            slot.plane = plane;
                            true
                        }
                        None => false,
                    };
            }

            slot.selected = false;
            if slot.has_plane {
                let pd = slot.plane.x * world.x
                    + slot.plane.y * world.y
                    + slot.plane.z * world.z
                    + slot.plane.w;
                // distance-adaptive gate: close returns must fit tighter
                if p_body.norm_squared() > opts.residual_gate * pd * pd {
                    slot.selected = true;
                    slot.residual = pd;
                }
            }
        });

    let effective: Vec<EffectiveCorr> = corr
        .iter()
        .zip(scan_body)
        .filter(|(slot, _)| slot.selected)
        .map(|(slot, point)| EffectiveCorr {
            body: point.position.coords.cast::<f64>(),
            normal: Vector3::new(slot.plane.x, slot.plane.y, slot.plane.z).cast::<f64>(),
            residual: slot.residual as f64,
        })
        .collect();

    if effective.is_empty() {
        ctx.valid = false;
        warn!("no effective points");
        return None;
    }

    let assembler = JacobianAssembler::new(state, opts.extrinsic_est_en);
    let rows = assembler.rows(&effective);

    ctx.h = DVector::from_iterator(effective.len(), effective.iter().map(|e| -e.residual));
    ctx.h_x = OMatrix::<f64, Dyn, U12>::from_fn(rows.len(), |i, j| rows[i][j]);

    Some(condition_number(&rows))
}

/// Observability diagnostic: `sqrt(λ_max / (λ_min + 1e-7))` over the
/// translational Gram block of the measurement Jacobian.
fn condition_number(rows: &[JacobianRow]) -> f64 {
    let mut gram = SMatrix::<f64, 6, 6>::zeros();
    for row in rows {
        let j = SMatrix::<f64, 1, 6>::from_row_slice(&row[..6]);
        gram += j.transpose() * j;
    }
    let c = gram.fixed_view::<3, 3>(0, 0).into_owned();
    let ctc = c.transpose() * c;
    let eigenvalues = ctc.symmetric_eigen().eigenvalues;
    (eigenvalues.max() / (eigenvalues.min() + 1e-7)).sqrt()
}
