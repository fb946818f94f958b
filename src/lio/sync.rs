//! Assembles measurement packages from asynchronous LiDAR and IMU streams.
//!
//! Both producer callbacks and the pipeline thread go through one mutex; a
//! package pairs a scan with the contiguous IMU run covering it, keyed on the
//! scan end time.

use std::collections::VecDeque;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::point::PointCloud;

/// One strapdown IMU sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ImuSample {
    pub stamp: f64,
    /// Angular velocity, rad/s.
    pub gyr: Vector3<f64>,
    /// Linear acceleration in the vendor unit (scaled to m/s^2 during
    /// gravity initialization).
    pub acc: Vector3<f64>,
}

/// One preprocessed sweep with the stamp of its earliest sample.
#[derive(Debug, Clone)]
pub struct LidarFrame {
    pub points: PointCloud,
    pub bag_time: f64,
}

/// A scan plus the IMU samples with `stamp < end_time` that precede it.
#[derive(Debug, Clone)]
pub struct MeasurementPackage {
    pub frame: LidarFrame,
    pub bag_time: f64,
    pub end_time: f64,
    pub imu: Vec<ImuSample>,
}

#[derive(Debug, Default)]
struct Buffers {
    lidar: VecDeque<LidarFrame>,
    imu: VecDeque<ImuSample>,
    last_lidar_stamp: f64,
    last_imu_stamp: f64,
    /// Sticky bit: the head frame's end time has been computed.
    lidar_pushed: bool,
    pending_end_time: f64,
    mean_scantime: f64,
    scan_count: usize,
    imu_time_offset: f64,
}

pub struct Synchronizer {
    inner: Mutex<Buffers>,
    time_sync_en: bool,
}

impl Synchronizer {
    pub fn new(time_sync_en: bool) -> Self {
        Self {
            inner: Mutex::new(Buffers::default()),
            time_sync_en,
        }
    }

    /// Offset added to IMU stamps when time synchronization is enabled.
    pub fn set_time_offset(&self, offset: f64) {
        self.inner.lock().imu_time_offset = offset;
    }

    pub fn push_lidar(&self, points: PointCloud, stamp: f64) {
        let mut buffers = self.inner.lock();
        if stamp < buffers.last_lidar_stamp {
            error!("lidar loop back, clearing buffer");
            buffers.lidar.clear();
            buffers.lidar_pushed = false;
        }
        buffers.last_lidar_stamp = stamp;
        buffers.lidar.push_back(LidarFrame {
            points,
            bag_time: stamp,
        });
    }

    pub fn push_imu(&self, mut sample: ImuSample) {
        let mut buffers = self.inner.lock();
        if self.time_sync_en {
            sample.stamp += buffers.imu_time_offset;
        }
        if sample.stamp < buffers.last_imu_stamp {
            warn!("imu loop back, clearing buffer");
            buffers.imu.clear();
        }
        buffers.last_imu_stamp = sample.stamp;
        buffers.imu.push_back(sample);
    }

    /// Emits the next package, or `None` while either queue is empty or the
    /// IMU stream has not yet covered the head scan. Emitted end times are
    /// strictly increasing.
    pub fn sync(&self) -> Option<MeasurementPackage> {
        let mut buffers = self.inner.lock();
        if buffers.lidar.is_empty() || buffers.imu.is_empty() {
            return None;
        }

        if !buffers.lidar_pushed {
            let (bag_time, last_offset, len) = {
                let frame = buffers.lidar.front()?;
                let last_offset = frame.points.last().map_or(0.0, |p| p.t_offset as f64);
                (frame.bag_time, last_offset, frame.points.len())
            };

            if len <= 1 {
                warn!("too few input points");
                buffers.pending_end_time = bag_time + buffers.mean_scantime;
            } else if last_offset < 0.5 * buffers.mean_scantime {
                // implausibly early last return, fall back to the mean sweep
                buffers.pending_end_time = bag_time + buffers.mean_scantime;
            } else {
                buffers.scan_count += 1;
                buffers.pending_end_time = bag_time + last_offset;
                buffers.mean_scantime +=
                    (last_offset - buffers.mean_scantime) / buffers.scan_count as f64;
            }
            buffers.lidar_pushed = true;
        }

        if buffers.last_imu_stamp < buffers.pending_end_time {
            return None;
        }

        let end_time = buffers.pending_end_time;
        let mut imu = Vec::new();
        while buffers.imu.front().is_some_and(|s| s.stamp < end_time) {
            if let Some(sample) = buffers.imu.pop_front() {
                imu.push(sample);
            }
        }

        let frame = buffers.lidar.pop_front()?;
        buffers.lidar_pushed = false;

        Some(MeasurementPackage {
            bag_time: frame.bag_time,
            end_time,
            frame,
            imu,
        })
    }

    /// Clears both buffers and the sticky bit.
    pub fn reset(&self) {
        let mut buffers = self.inner.lock();
        buffers.lidar.clear();
        buffers.imu.clear();
        buffers.lidar_pushed = false;
    }
}
