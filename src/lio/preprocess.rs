//! Normalizes decoded vendor points into the canonical [`Point`] stream.

use std::f64::consts::TAU;

use nalgebra::Point3;
use tracing::warn;

use super::config::PreprocessConfig;
use crate::point::{Point, PointCloud};

/// Nominal mechanical scan rate used when per-point timestamps are absent.
const SCAN_RATE_HZ: f64 = 10.0;

/// Solid-state (non-repeating pattern) return.
#[derive(Debug, Clone, Copy)]
pub struct AviaPoint {
    pub position: Point3<f32>,
    pub reflectivity: f32,
    /// Nanoseconds since sweep start.
    pub offset_time_ns: u32,
    pub line: u8,
    pub tag: u8,
}

/// Mechanical 32-ring return.
#[derive(Debug, Clone, Copy)]
pub struct VelodynePoint {
    pub position: Point3<f32>,
    pub intensity: f32,
    /// Per-point time in the vendor unit; zero for every point when the
    /// device does not populate it.
    pub time: f32,
    pub ring: u16,
}

/// 64-ring spinner return.
#[derive(Debug, Clone, Copy)]
pub struct OusterPoint {
    pub position: Point3<f32>,
    pub intensity: f32,
    /// Nanoseconds since sweep start.
    pub t_ns: u32,
    pub ring: u16,
}

/// One decoded raw sweep.
pub enum RawScan<'a> {
    Avia(&'a [AviaPoint]),
    Velodyne(&'a [VelodynePoint]),
    Ouster(&'a [OusterPoint]),
}

pub struct Preprocess {
    config: PreprocessConfig,
    point_filter_num: usize,
}

impl Preprocess {
    pub fn new(config: PreprocessConfig, point_filter_num: usize, feature_extract: bool) -> Self {
        if feature_extract {
            warn!("feature extraction is not supported, processing full clouds");
        }
        Self {
            config,
            point_filter_num: point_filter_num.max(1),
        }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Converts a raw sweep into a dense canonical cloud: per-point
    /// `t_offset` in seconds, blind-zone returns dropped, stride applied.
    pub fn process(&self, scan: &RawScan<'_>) -> PointCloud {
        match scan {
            RawScan::Avia(points) => self.process_avia(points),
            RawScan::Velodyne(points) => self.process_velodyne(points),
            RawScan::Ouster(points) => self.process_ouster(points),
        }
    }

    fn keep(&self, index: usize, position: &Point3<f32>) -> bool {
        index % self.point_filter_num == 0
            && position.coords.norm_squared() as f64 > self.config.blind * self.config.blind
    }

    fn process_avia(&self, points: &[AviaPoint]) -> PointCloud {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                (p.line as usize) < self.config.scan_line
                    && matches!(p.tag & 0x30, 0x00 | 0x10)
            })
            .filter(|(i, p)| self.keep(*i, &p.position))
            .map(|(_, p)| {
                Point::new(
                    p.position,
                    p.reflectivity,
                    p.offset_time_ns as f32 * 1e-9,
                )
            })
            .collect()
    }

    fn process_velodyne(&self, points: &[VelodynePoint]) -> PointCloud {
        let has_time = points.iter().any(|p| p.time != 0.0);
        if has_time {
            points
                .iter()
                .enumerate()
                .filter(|(i, p)| self.keep(*i, &p.position))
                .map(|(_, p)| {
                    Point::new(
                        p.position,
                        p.intensity,
                        (p.time as f64 * self.config.time_scale) as f32,
                    )
                })
                .collect()
        } else {
            self.velodyne_from_azimuth(points)
        }
    }

    /// Reconstructs per-ring offsets from azimuth when the device does not
    /// stamp points: the head moves clockwise at the nominal scan rate, so
    /// the angle swept since the first return of the ring is the elapsed
    /// time.
    fn velodyne_from_azimuth(&self, points: &[VelodynePoint]) -> PointCloud {
        let mut first_yaw: Vec<Option<f64>> = vec![None; self.config.scan_line.max(32)];
        let mut out = PointCloud::with_capacity(points.len() / self.point_filter_num + 1);

        for (i, p) in points.iter().enumerate() {
            let ring = p.ring as usize;
            if ring >= first_yaw.len() {
                continue;
            }
            let yaw = (p.position.y as f64).atan2(p.position.x as f64);
            let reference = *first_yaw[ring].get_or_insert(yaw);
            let mut swept = reference - yaw;
            if swept < 0.0 {
                swept += TAU;
            }
            if !self.keep(i, &p.position) {
                continue;
            }
            let t_offset = swept / (TAU * SCAN_RATE_HZ);
            out.push(Point::new(p.position, p.intensity, t_offset as f32));
        }
        out
    }

    fn process_ouster(&self, points: &[OusterPoint]) -> PointCloud {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| (p.ring as usize) < self.config.scan_line)
            .filter(|(i, p)| self.keep(*i, &p.position))
            .map(|(_, p)| Point::new(p.position, p.intensity, p.t_ns as f32 * 1e-9))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lio::config::LidarType;
    use approx::assert_relative_eq;

    fn preprocess(config: PreprocessConfig, stride: usize) -> Preprocess {
        Preprocess::new(config, stride, false)
    }

    fn avia_point(x: f32, offset_ns: u32, line: u8, tag: u8) -> AviaPoint {
        AviaPoint {
            position: Point3::new(x, 0.0, 0.0),
            reflectivity: 50.0,
            offset_time_ns: offset_ns,
            line,
            tag,
        }
    }

    #[test]
    fn avia_converts_offsets_and_filters_tags() {
        let config = PreprocessConfig {
            lidar_type: LidarType::Avia,
            scan_line: 4,
            ..PreprocessConfig::default()
        };
        let points = [
            avia_point(1.0, 0, 0, 0x10),
            avia_point(2.0, 1_000_000, 1, 0x20), // bad return tag
            avia_point(3.0, 2_000_000, 5, 0x10), // line out of range
            avia_point(4.0, 3_000_000, 2, 0x00),
        ];
        let cloud = preprocess(config, 1).process(&RawScan::Avia(&points));
        assert_eq!(cloud.len(), 2);
        assert_relative_eq!(cloud[0].t_offset, 0.0);
        assert_relative_eq!(cloud[1].t_offset, 3e-3, epsilon = 1e-9);
    }

    #[test]
    fn blind_zone_and_stride_are_applied() {
        let config = PreprocessConfig {
            blind: 1.0,
            ..PreprocessConfig::default()
        };
        let points: Vec<AviaPoint> = (0..10)
            .map(|i| avia_point(if i == 4 { 0.5 } else { 2.0 }, i * 1000, 0, 0x10))
            .collect();
        // stride 2 keeps even indices, blind drops index 4
        let cloud = preprocess(config, 2).process(&RawScan::Avia(&points));
        assert_eq!(cloud.len(), 4);
    }

    #[test]
    fn velodyne_scales_given_time() {
        let config = PreprocessConfig {
            lidar_type: LidarType::Velo32,
            time_scale: 1e-3,
            ..PreprocessConfig::default()
        };
        let points = [VelodynePoint {
            position: Point3::new(5.0, 0.0, 0.0),
            intensity: 1.0,
            time: 42.0, // milliseconds
            ring: 0,
        }];
        let cloud = preprocess(config, 1).process(&RawScan::Velodyne(&points));
        assert_eq!(cloud.len(), 1);
        assert_relative_eq!(cloud[0].t_offset, 0.042, epsilon = 1e-6);
    }

    #[test]
    fn velodyne_reconstructs_time_from_azimuth() {
        let config = PreprocessConfig {
            lidar_type: LidarType::Velo32,
            scan_line: 32,
            ..PreprocessConfig::default()
        };
        // a quarter turn clockwise is a quarter of the 0.1 s sweep
        let points = [
            VelodynePoint {
                position: Point3::new(5.0, 0.0, 0.0),
                intensity: 1.0,
                time: 0.0,
                ring: 0,
            },
            VelodynePoint {
                position: Point3::new(0.0, -5.0, 0.0),
                intensity: 1.0,
                time: 0.0,
                ring: 0,
            },
        ];
        let cloud = preprocess(config, 1).process(&RawScan::Velodyne(&points));
        assert_eq!(cloud.len(), 2);
        assert_relative_eq!(cloud[0].t_offset, 0.0);
        assert_relative_eq!(cloud[1].t_offset, 0.025, epsilon = 1e-6);
    }

    #[test]
    fn ouster_drops_rings_out_of_range() {
        let config = PreprocessConfig {
            lidar_type: LidarType::Oust64,
            scan_line: 64,
            ..PreprocessConfig::default()
        };
        let points = [
            OusterPoint {
                position: Point3::new(5.0, 0.0, 0.0),
                intensity: 1.0,
                t_ns: 500_000,
                ring: 63,
            },
            OusterPoint {
                position: Point3::new(5.0, 0.0, 0.0),
                intensity: 1.0,
                t_ns: 600_000,
                ring: 64,
            },
        ];
        let cloud = preprocess(config, 1).process(&RawScan::Ouster(&points));
        assert_eq!(cloud.len(), 1);
        assert_relative_eq!(cloud[0].t_offset, 5e-4, epsilon = 1e-9);
    }
}
