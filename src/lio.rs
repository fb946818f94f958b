//! The LiDAR-inertial odometry engine.
//!
//! One pipeline thread drains the synchronizer and runs, in order: IMU
//! propagation and undistortion, scan downsampling, the iterated
//! point-to-plane update, and incremental map maintenance. Producer
//! callbacks push into the synchronizer from any thread.
//!
//! ```text
//! push_lidar ──> preprocess ──┐
//!                             ├──> sync ──> imu ──> eskf <─> observe ──> map
//! push_imu ───────────────────┘
//! ```

pub mod config;
mod downsample;
mod imu;
mod mapping;
mod observe;
pub mod output;
mod preprocess;
pub mod sync;

use std::sync::Arc;

use nalgebra::Point3;
use tracing::{info, warn};

use crate::eskf::{Eskf, State};
use crate::point::{Point, PointCloud};
use crate::voxel_map::VoxelMap;

pub use config::{ConfigError, LioConfig};
pub use preprocess::{AviaPoint, OusterPoint, Preprocess, RawScan, VelodynePoint};
pub use sync::{ImuSample, MeasurementPackage, Synchronizer};

use downsample::Downsampler;
use imu::ImuProcess;
use mapping::map_incremental;
use observe::{point_to_plane, Correspondence, ObserveOptions};
use output::{remap_pose_covariance, Odometry, ScanOutput, TrajPoint};

/// Seconds of LiDAR data before the filter is considered initialized.
const INIT_TIME: f64 = 0.1;
/// Shared measurement covariance of every point-to-plane correspondence.
const LASER_POINT_COV: f64 = 0.001;
/// Per-component error-state convergence threshold of the iterated update.
const CONVERGE_EPS: f64 = 0.001;
/// Below this many downsampled points the scan is unusable.
const MIN_SCAN_POINTS: usize = 5;

/// Session state. While `Idle` the engine keeps emitting identity poses so
/// downstream consumers see liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Session {
    #[default]
    Idle,
    /// Armed; the next package seeds the map.
    FirstScan,
    Tracking,
}

pub struct Lio {
    config: LioConfig,
    preprocess: Preprocess,
    sync: Arc<Synchronizer>,
    imu: ImuProcess,
    eskf: Eskf,
    map: VoxelMap,
    downsampler: Downsampler,
    session: Session,
    first_lidar_time: f64,
    ekf_inited: bool,
    path: Vec<TrajPoint>,
    // per-scan buffers, resized once per package
    undistorted: PointCloud,
    scan_down_body: PointCloud,
    corr: Vec<Correspondence>,
}

impl Lio {
    pub fn new(config: LioConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let preprocess = Preprocess::new(
            config.preprocess.clone(),
            config.point_filter_num,
            config.feature_extract_enable,
        );
        Ok(Self {
            preprocess,
            sync: Arc::new(Synchronizer::new(config.common.time_sync_en)),
            imu: ImuProcess::new(&config.mapping),
            eskf: Eskf::new(),
            map: VoxelMap::new(config.voxel_map_config()),
            downsampler: Downsampler::new(config.filter_size_surf),
            session: Session::Idle,
            first_lidar_time: 0.0,
            ekf_inited: false,
            path: Vec::new(),
            undistorted: PointCloud::new(),
            scan_down_body: PointCloud::new(),
            corr: Vec::new(),
            config,
        })
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        Self::new(LioConfig::from_yaml_file(path)?)
    }

    pub fn config(&self) -> &LioConfig {
        &self.config
    }

    pub fn session(&self) -> Session {
        self.session
    }

    pub fn state(&self) -> &State {
        self.eskf.state()
    }

    pub fn path(&self) -> &[TrajPoint] {
        &self.path
    }

    /// Handle for producer threads; only touches the input FIFOs.
    pub fn synchronizer(&self) -> Arc<Synchronizer> {
        Arc::clone(&self.sync)
    }

    /// Normalizes a raw vendor sweep and queues it.
    pub fn push_lidar(&self, scan: &RawScan<'_>, stamp: f64) {
        let cloud = self.preprocess.process(scan);
        self.sync.push_lidar(cloud, stamp);
    }

    /// Queues an already-canonical sweep.
    pub fn push_points(&self, cloud: PointCloud, stamp: f64) {
        self.sync.push_lidar(cloud, stamp);
    }

    pub fn push_imu(&self, sample: ImuSample) {
        self.sync.push_imu(sample);
    }

    /// Arms the session: clears the path and seeds the map from the next
    /// package.
    pub fn start(&mut self) {
        self.path.clear();
        self.session = Session::FirstScan;
        info!("starting lidar odometry");
    }

    /// Disarms the session; identity poses keep flowing.
    pub fn stop(&mut self) {
        self.session = Session::Idle;
    }

    /// Clears the map, the buffers and the trajectory, and re-arms gravity
    /// initialization. The filter state itself is preserved.
    pub fn reset(&mut self) {
        self.map.reset();
        self.sync.reset();
        self.imu.reset();
        self.path.clear();
        self.ekf_inited = false;
        if self.session != Session::Idle {
            self.session = Session::FirstScan;
        }
    }

    /// Dumps the accumulated trajectory, one stamped pose per line.
    pub fn save_trajectory(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        output::save_trajectory(path, &self.path)
    }

    /// Drains one measurement package through the pipeline. Returns `None`
    /// when no package is ready or the scan was consumed without an output
    /// (seeding, starvation, input anomaly).
    pub fn run_once(&mut self) -> Option<ScanOutput> {
        let package = self.sync.sync()?;

        self.imu
            .process(&package, &mut self.eskf, &mut self.undistorted);
        if self.undistorted.is_empty() {
            warn!("no points, skip this scan");
            return None;
        }

        if self.session == Session::Idle {
            return Some(self.idle_output(package.end_time));
        }

        if self.session == Session::FirstScan {
            self.map
                .add_points(self.undistorted.iter().map(|p| p.position));
            self.first_lidar_time = package.bag_time;
            self.session = Session::Tracking;
            return None;
        }

        self.ekf_inited = package.bag_time - self.first_lidar_time >= INIT_TIME;

        self.downsampler
            .filter(&self.undistorted, &mut self.scan_down_body);
        if self.scan_down_body.len() < MIN_SCAN_POINTS {
            warn!(
                undistorted = self.undistorted.len(),
                downsampled = self.scan_down_body.len(),
                "too few points, skip this scan"
            );
            self.session = Session::Idle;
            return None;
        }

        self.corr.clear();
        self.corr
            .resize(self.scan_down_body.len(), Correspondence::default());

        let opts = ObserveOptions {
            esti_plane_threshold: self.config.esti_plane_threshold,
            residual_gate: self.config.residual_gate,
            extrinsic_est_en: self.config.mapping.extrinsic_est_en,
        };
        let mut condition_number = None;
        {
            let map = &self.map;
            let scan_down_body = &self.scan_down_body;
            let corr = &mut self.corr;
            let condition_number = &mut condition_number;
            self.eskf.update_iterated(
                LASER_POINT_COV,
                self.config.max_iteration,
                CONVERGE_EPS,
                |state, ctx| {
                    let cond = point_to_plane(state, ctx, map, scan_down_body, corr, &opts);
                    *condition_number = cond.or(*condition_number);
                },
            );
        }

        map_incremental(
            &mut self.map,
            self.eskf.state(),
            &self.scan_down_body,
            &mut self.corr,
            self.config.filter_size_map,
            self.ekf_inited,
        );

        let state = *self.eskf.state();
        let stamp = package.end_time;
        if self.config.path_save_en || self.config.publish.path_publish_en {
            self.path.push(TrajPoint {
                stamp,
                position: state.pos,
                rotation: state.rot,
            });
        }

        let odometry = Odometry {
            stamp,
            position: state.pos,
            rotation: state.rot,
            covariance: remap_pose_covariance(self.eskf.covariance()),
        };

        Some(ScanOutput {
            odometry,
            cloud_world: self.world_cloud(&state),
            cloud_body: self.body_cloud(&state),
            cloud_effect_world: self.effect_cloud(),
            condition_number,
        })
    }

    /// Liveness output while disarmed: identity pose, registered view with
    /// the current state, path cleared.
    fn idle_output(&mut self, stamp: f64) -> ScanOutput {
        self.downsampler
            .filter(&self.undistorted, &mut self.scan_down_body);
        self.path.clear();

        let state = *self.eskf.state();
        let cloud_world = self.config.publish.scan_publish_en.then(|| {
            self.scan_down_body
                .iter()
                .map(|p| point_body_to_world(&state, p))
                .collect::<PointCloud>()
        });

        ScanOutput {
            odometry: Odometry::identity(stamp),
            cloud_world,
            cloud_body: self.body_cloud(&state),
            cloud_effect_world: None,
            condition_number: None,
        }
    }

    fn world_cloud(&self, state: &State) -> Option<PointCloud> {
        if !self.config.publish.scan_publish_en {
            return None;
        }
        if self.config.publish.dense_publish_en {
            Some(
                self.undistorted
                    .iter()
                    .map(|p| point_body_to_world(state, p))
                    .collect(),
            )
        } else {
            Some(
                self.corr
                    .iter()
                    .zip(&self.scan_down_body)
                    .map(|(slot, p)| Point::new(slot.world, p.intensity, p.t_offset))
                    .collect(),
            )
        }
    }

    fn body_cloud(&self, state: &State) -> Option<PointCloud> {
        if !(self.config.publish.scan_publish_en && self.config.publish.scan_bodyframe_pub_en) {
            return None;
        }
        let rot_li = state.rot_li.to_rotation_matrix().into_inner().cast::<f32>();
        let t_li = state.t_li.cast::<f32>();
        Some(
            self.undistorted
                .iter()
                .map(|p| {
                    Point::new(
                        Point3::from(rot_li * p.position.coords + t_li),
                        p.intensity,
                        p.t_offset,
                    )
                })
                .collect(),
        )
    }

    fn effect_cloud(&self) -> Option<PointCloud> {
        if !self.config.publish.scan_effect_pub_en {
            return None;
        }
        Some(
            self.corr
                .iter()
                .filter(|slot| slot.selected)
                .map(|slot| Point::new(slot.world, 0.0, 0.0))
                .collect(),
        )
    }
}

/// `p_w = R_w (R_LI p_b + t_LI) + pos`
fn point_body_to_world(state: &State, point: &Point) -> Point {
    let p = point.position.cast::<f64>();
    let world = state.rot * (state.rot_li * p.coords + state.t_li) + state.pos;
    Point::new(
        Point3::from(world).cast::<f32>(),
        point.intensity,
        point.t_offset,
    )
}
