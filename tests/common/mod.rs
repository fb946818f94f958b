//! Synthetic trajectories, scenes and a feeding harness for the end-to-end
//! scenarios.

use nalgebra::{Point3, UnitQuaternion, Vector3};
use voxel_lio::lio::output::ScanOutput;
use voxel_lio::lio::ImuSample;
use voxel_lio::{Lio, Point, PointCloud};

pub const GRAVITY: f64 = 9.81;
pub const SCAN_PERIOD: f64 = 0.1;
pub const IMU_PERIOD: f64 = 0.01;

/// Ground-truth rigid motion of the sensor body.
pub trait Trajectory {
    fn rotation(&self, t: f64) -> UnitQuaternion<f64>;
    fn position(&self, t: f64) -> Vector3<f64>;
    /// Body-frame angular velocity.
    fn gyr(&self, t: f64) -> Vector3<f64>;
    /// World-frame linear acceleration.
    fn acc_world(&self, t: f64) -> Vector3<f64>;
}

pub struct StaticHold;

impl Trajectory for StaticHold {
    fn rotation(&self, _t: f64) -> UnitQuaternion<f64> {
        UnitQuaternion::identity()
    }
    fn position(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn gyr(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn acc_world(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Constant yaw rate about the sensor origin, starting at `start`.
pub struct YawSpin {
    pub rate: f64,
    pub start: f64,
}

impl Trajectory for YawSpin {
    fn rotation(&self, t: f64) -> UnitQuaternion<f64> {
        let yaw = self.rate * (t - self.start).max(0.0);
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw)
    }
    fn position(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn gyr(&self, t: f64) -> Vector3<f64> {
        if t >= self.start {
            Vector3::new(0.0, 0.0, self.rate)
        } else {
            Vector3::zeros()
        }
    }
    fn acc_world(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Constant acceleration along +x, starting at `start`.
pub struct AccelX {
    pub accel: f64,
    pub start: f64,
}

impl Trajectory for AccelX {
    fn rotation(&self, _t: f64) -> UnitQuaternion<f64> {
        UnitQuaternion::identity()
    }
    fn position(&self, t: f64) -> Vector3<f64> {
        let dt = (t - self.start).max(0.0);
        Vector3::new(0.5 * self.accel * dt * dt, 0.0, 0.0)
    }
    fn gyr(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn acc_world(&self, t: f64) -> Vector3<f64> {
        if t >= self.start {
            Vector3::new(self.accel, 0.0, 0.0)
        } else {
            Vector3::zeros()
        }
    }
}

/// Flat floor below the sensor, about `n_side^2` points.
pub fn floor_scene(half_extent: f64, n_side: usize, z: f64) -> Vec<Point3<f64>> {
    let step = 2.0 * half_extent / (n_side - 1) as f64;
    let mut scene = Vec::with_capacity(n_side * n_side);
    for i in 0..n_side {
        for j in 0..n_side {
            scene.push(Point3::new(
                -half_extent + i as f64 * step,
                -half_extent + j as f64 * step,
                z,
            ));
        }
    }
    scene
}

/// Rotationally symmetric scene: a cylinder wall around the sensor plus a
/// floor disk sampled on concentric rings.
pub fn cylinder_scene(radius: f64, n_angles: usize, n_heights: usize) -> Vec<Point3<f64>> {
    let mut scene = Vec::new();
    for a in 0..n_angles {
        let angle = std::f64::consts::TAU * a as f64 / n_angles as f64;
        let (sin, cos) = angle.sin_cos();
        for h in 0..n_heights {
            let z = -1.0 + 2.0 * h as f64 / (n_heights - 1) as f64;
            scene.push(Point3::new(radius * cos, radius * sin, z));
        }
        for ring in 1..=4 {
            let r = radius * ring as f64 / 5.0;
            scene.push(Point3::new(r * cos, r * sin, -1.0));
        }
    }
    scene
}

/// Corridor along +x: side walls, floor, and door-frame jambs every two
/// meters so forward translation stays observable.
pub fn corridor_scene() -> Vec<Point3<f64>> {
    let mut scene = Vec::new();
    let mut x = -2.0;
    while x <= 22.0 {
        let mut z = -1.0;
        while z <= 1.0 {
            scene.push(Point3::new(x, -2.0, z));
            scene.push(Point3::new(x, 2.0, z));
            z += 0.25;
        }
        let mut y = -2.0;
        while y <= 2.0 {
            scene.push(Point3::new(x, y, -1.0));
            y += 0.25;
        }
        x += 0.25;
    }
    // jambs facing the direction of travel
    let mut jamb_x = 0.0;
    while jamb_x <= 22.0 {
        for side in [-1.0, 1.0] {
            let mut y = 1.2;
            while y <= 2.0 {
                let mut z = -1.0;
                while z <= 1.0 {
                    scene.push(Point3::new(jamb_x, side * y, z));
                    z += 0.25;
                }
                y += 0.2;
            }
        }
        jamb_x += 2.0;
    }
    scene
}

/// Samples the scene through the moving sensor with a rolling shutter: the
/// i-th return is taken at its own time inside the sweep.
pub fn make_scan(
    trajectory: &impl Trajectory,
    scene: &[Point3<f64>],
    bag_time: f64,
) -> PointCloud {
    scene
        .iter()
        .enumerate()
        .map(|(i, p_world)| {
            let tau = 0.099 * i as f64 / scene.len() as f64;
            let t = bag_time + tau;
            let rotation = trajectory.rotation(t);
            let position = trajectory.position(t);
            let p_body = rotation.inverse_transform_vector(&(p_world.coords - position));
            Point::new(Point3::from(p_body).cast::<f32>(), 1.0, tau as f32)
        })
        .collect()
}

/// The accelerometer senses specific force: world acceleration minus
/// gravity, expressed in the body frame.
pub fn imu_at(trajectory: &impl Trajectory, t: f64) -> ImuSample {
    let specific_force = trajectory.acc_world(t) + Vector3::new(0.0, 0.0, GRAVITY);
    ImuSample {
        stamp: t,
        gyr: trajectory.gyr(t),
        acc: trajectory.rotation(t).inverse_transform_vector(&specific_force),
    }
}

/// Feeds scans and covering IMU into the engine, draining the pipeline
/// after every sweep.
pub struct Harness {
    pub scan_time: f64,
    imu_time: f64,
}

impl Harness {
    pub fn new(t0: f64) -> Self {
        Self {
            scan_time: t0,
            imu_time: t0 - 2.0 * IMU_PERIOD,
        }
    }

    pub fn step(
        &mut self,
        lio: &mut Lio,
        trajectory: &impl Trajectory,
        scene: &[Point3<f64>],
    ) -> Option<ScanOutput> {
        let bag_time = self.scan_time;
        lio.push_points(make_scan(trajectory, scene, bag_time), bag_time);
        while self.imu_time <= bag_time + SCAN_PERIOD + IMU_PERIOD {
            lio.push_imu(imu_at(trajectory, self.imu_time));
            self.imu_time += IMU_PERIOD;
        }
        self.scan_time += SCAN_PERIOD;

        let mut last = None;
        while let Some(output) = lio.run_once() {
            last = Some(output);
        }
        last
    }

    /// Runs `n` sweeps and returns the last published output.
    pub fn run(
        &mut self,
        lio: &mut Lio,
        trajectory: &impl Trajectory,
        scene: &[Point3<f64>],
        n: usize,
    ) -> Option<ScanOutput> {
        let mut last = None;
        for _ in 0..n {
            if let Some(output) = self.step(lio, trajectory, scene) {
                last = Some(output);
            }
        }
        last
    }
}
