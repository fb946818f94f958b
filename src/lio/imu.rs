//! IMU propagation between scan ends, gravity initialization, and sweep
//! undistortion.

use nalgebra::{SMatrix, UnitQuaternion, Vector3};
use tracing::info;

use super::config::MappingConfig;
use super::sync::{ImuSample, MeasurementPackage};
use crate::eskf::state::{BA, BG, GRAV, ROT_LI, T_LI};
use crate::eskf::{Eskf, ProcessNoise, ERR_DIM};
use crate::point::PointCloud;

/// Accelerometer samples averaged before the filter is seeded.
const MAX_INIT_COUNT: usize = 20;

const GRAVITY_NORM: f64 = 9.81;

/// One recorded propagation step, used to interpolate the pose at any point
/// time inside the sweep.
#[derive(Debug, Clone)]
struct ImuStep {
    /// Seconds since the package bag time; negative for samples taken before
    /// the first return.
    offset: f64,
    acc_world: Vector3<f64>,
    /// Bias-corrected angular velocity.
    gyr: Vector3<f64>,
    vel: Vector3<f64>,
    pos: Vector3<f64>,
    rot: UnitQuaternion<f64>,
}

pub struct ImuProcess {
    extrinsic_t: Vector3<f64>,
    extrinsic_r: UnitQuaternion<f64>,
    process_noise: ProcessNoise,
    mean_acc: Vector3<f64>,
    mean_gyr: Vector3<f64>,
    init_count: usize,
    need_init: bool,
    /// Scales raw accelerometer readings to m/s^2.
    acc_scale: f64,
    last_imu: Option<ImuSample>,
    last_end_time: f64,
    steps: Vec<ImuStep>,
}

impl ImuProcess {
    pub fn new(mapping: &MappingConfig) -> Self {
        let mut process_noise = ProcessNoise::zeros();
        for i in 0..3 {
            process_noise[(i, i)] = mapping.gyr_cov;
            process_noise[(3 + i, 3 + i)] = mapping.acc_cov;
            process_noise[(6 + i, 6 + i)] = mapping.b_gyr_cov;
            process_noise[(9 + i, 9 + i)] = mapping.b_acc_cov;
        }
        Self {
            extrinsic_t: mapping.extrinsic_translation(),
            extrinsic_r: mapping.extrinsic_rotation(),
            process_noise,
            mean_acc: Vector3::zeros(),
            mean_gyr: Vector3::zeros(),
            init_count: 0,
            need_init: true,
            acc_scale: 1.0,
            last_imu: None,
            last_end_time: 0.0,
            steps: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.need_init
    }

    /// Re-arms gravity initialization; the filter state itself is left to
    /// the caller.
    pub fn reset(&mut self) {
        self.mean_acc = Vector3::zeros();
        self.mean_gyr = Vector3::zeros();
        self.init_count = 0;
        self.need_init = true;
        self.acc_scale = 1.0;
        self.last_imu = None;
        self.last_end_time = 0.0;
    }

    /// Runs prediction over the package's IMU run and writes the undistorted
    /// sweep (LiDAR frame at `end_time`) into `out`. During the gravity
    /// initialization window the raw sweep passes through unchanged.
    pub fn process(&mut self, package: &MeasurementPackage, kf: &mut Eskf, out: &mut PointCloud) {
        if package.imu.is_empty() {
            out.clear();
            return;
        }

        if self.need_init {
            self.try_init(package, kf);
            out.clone_from(&package.frame.points);
        } else {
            self.undistort(package, kf, out);
        }

        self.last_imu = package.imu.last().cloned();
        self.last_end_time = package.end_time;
    }

    /// Accumulates static-window means; assumes the platform is at rest.
    fn try_init(&mut self, package: &MeasurementPackage, kf: &mut Eskf) {
        for sample in &package.imu {
            if self.init_count == 0 {
                self.mean_acc = sample.acc;
                self.mean_gyr = sample.gyr;
            } else {
                let n = (self.init_count + 1) as f64;
                self.mean_acc += (sample.acc - self.mean_acc) / n;
                self.mean_gyr += (sample.gyr - self.mean_gyr) / n;
            }
            self.init_count += 1;
        }

        if self.init_count <= MAX_INIT_COUNT {
            return;
        }

        self.acc_scale = GRAVITY_NORM / self.mean_acc.norm();

        let state = kf.state_mut();
        state.grav = -self.mean_acc.normalize() * GRAVITY_NORM;
        state.bg = self.mean_gyr;
        state.rot_li = self.extrinsic_r;
        state.t_li = self.extrinsic_t;

        let mut cov = SMatrix::<f64, ERR_DIM, ERR_DIM>::identity();
        cov.fixed_view_mut::<3, 3>(ROT_LI, ROT_LI)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * 1e-5));
        cov.fixed_view_mut::<3, 3>(T_LI, T_LI)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * 1e-5));
        cov.fixed_view_mut::<3, 3>(BG, BG)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * 1e-4));
        cov.fixed_view_mut::<3, 3>(BA, BA)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * 1e-3));
        cov.fixed_view_mut::<2, 2>(GRAV, GRAV)
            .copy_from(&(SMatrix::<f64, 2, 2>::identity() * 1e-5));
        kf.set_covariance(cov);

        self.need_init = false;
        info!(
            samples = self.init_count,
            acc_scale = self.acc_scale,
            "imu initialized"
        );
    }

    fn undistort(&mut self, package: &MeasurementPackage, kf: &mut Eskf, out: &mut PointCloud) {
        // carry the last sample of the previous package so the first
        // interval spans the gap between scans
        let mut samples: Vec<ImuSample> = Vec::with_capacity(package.imu.len() + 1);
        if let Some(last) = &self.last_imu {
            samples.push(last.clone());
        }
        samples.extend(package.imu.iter().cloned());

        let state = *kf.state();
        self.steps.clear();
        self.steps.push(ImuStep {
            offset: self.last_end_time - package.bag_time,
            acc_world: Vector3::zeros(),
            gyr: samples[0].gyr - state.bg,
            vel: state.vel,
            pos: state.pos,
            rot: state.rot,
        });

        for pair in samples.windows(2) {
            let (head, tail) = (&pair[0], &pair[1]);
            if tail.stamp < self.last_end_time {
                continue;
            }

            let gyr_mid = (head.gyr + tail.gyr) * 0.5;
            let acc_mid = (head.acc + tail.acc) * 0.5 * self.acc_scale;
            let dt = tail.stamp - head.stamp.max(self.last_end_time);
            kf.predict(dt, gyr_mid, acc_mid, &self.process_noise);

            let s = kf.state();
            self.steps.push(ImuStep {
                offset: tail.stamp - package.bag_time,
                acc_world: s.rot * (acc_mid - s.ba) + s.grav,
                gyr: gyr_mid - s.bg,
                vel: s.vel,
                pos: s.pos,
                rot: s.rot,
            });
        }

        // close the gap between the last sample and the sweep end
        if let Some(last) = samples.last() {
            let dt = (package.end_time - last.stamp).max(0.0);
            if dt > 0.0 {
                let gyr_mid = last.gyr;
                let acc_mid = last.acc * self.acc_scale;
                kf.predict(dt, gyr_mid, acc_mid, &self.process_noise);
            }
        }

        let end = *kf.state();
        let rot_li_inv = end.rot_li.inverse();
        let rot_end_inv = end.rot.inverse();

        out.clone_from(&package.frame.points);
        out.sort_unstable_by(|a, b| {
            a.t_offset
                .partial_cmp(&b.t_offset)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // walk the recorded steps backwards, back-projecting every point
        // taken after the step's start into the end-of-sweep frame
        let mut idx = out.len();
        for window in self.steps.windows(2).rev() {
            let head = &window[0];
            while idx > 0 && out[idx - 1].t_offset as f64 > head.offset {
                let point = &mut out[idx - 1];
                let dt = point.t_offset as f64 - head.offset;

                let rot_tau = head.rot * UnitQuaternion::from_scaled_axis(head.gyr * dt);
                let pos_tau = head.pos + head.vel * dt + head.acc_world * (0.5 * dt * dt);

                let p_raw = point.position.cast::<f64>();
                let p_imu = end.rot_li * p_raw.coords + end.t_li;
                let p_world_rel = rot_tau * p_imu + pos_tau - end.pos;
                let p_lidar = rot_li_inv * (rot_end_inv * p_world_rel - end.t_li);

                point.position = nalgebra::Point3::from(p_lidar).cast::<f32>();
                idx -= 1;
            }
            if idx == 0 {
                break;
            }
        }
    }
}
