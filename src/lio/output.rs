//! Plain-data outputs for the external transport layer.

use std::io::{self, BufWriter, Write};
use std::path::Path;

use nalgebra::{SMatrix, UnitQuaternion, Vector3};

use crate::eskf::ERR_DIM;
use crate::point::PointCloud;

/// Pose estimate for one scan, with the pose covariance reordered to the
/// downstream `[rotation; translation]` convention.
#[derive(Debug, Clone)]
pub struct Odometry {
    pub stamp: f64,
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
    pub covariance: SMatrix<f64, 6, 6>,
}

impl Odometry {
    pub fn identity(stamp: f64) -> Self {
        Self {
            stamp,
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            covariance: SMatrix::zeros(),
        }
    }
}

/// One pose of the cumulative trajectory.
#[derive(Debug, Clone)]
pub struct TrajPoint {
    pub stamp: f64,
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

/// Everything published for one processed scan. Cloud views are `None` when
/// the corresponding publish flag is off.
#[derive(Debug, Clone)]
pub struct ScanOutput {
    pub odometry: Odometry,
    /// World-frame registered cloud (downsampled, or dense if configured).
    pub cloud_world: Option<PointCloud>,
    /// Undistorted cloud re-expressed in the IMU body frame.
    pub cloud_body: Option<PointCloud>,
    /// World-frame points of the effective correspondences.
    pub cloud_effect_world: Option<PointCloud>,
    /// Observability diagnostic, absent while idle or starved.
    pub condition_number: Option<f64>,
}

/// Copies the pose block of the filter covariance, remapping
/// `[p; R] -> [R; p]` to match the downstream convention.
pub(crate) fn remap_pose_covariance(
    cov: &SMatrix<f64, ERR_DIM, ERR_DIM>,
) -> SMatrix<f64, 6, 6> {
    let mut out = SMatrix::<f64, 6, 6>::zeros();
    for i in 0..6 {
        let k = if i < 3 { i + 3 } else { i - 3 };
        for j in 0..3 {
            out[(i, j)] = cov[(k, 3 + j)];
            out[(i, 3 + j)] = cov[(k, j)];
        }
    }
    out
}

/// Writes the trajectory as `timestamp x y z q_x q_y q_z q_w`, one pose per
/// line after a header comment.
pub fn save_trajectory(path: impl AsRef<Path>, trajectory: &[TrajPoint]) -> io::Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "#timestamp x y z q_x q_y q_z q_w")?;
    for pose in trajectory {
        let q = pose.rotation.coords;
        writeln!(
            writer,
            "{:.6} {:.15} {:.15} {:.15} {:.15} {:.15} {:.15} {:.15}",
            pose.stamp,
            pose.position.x,
            pose.position.y,
            pose.position.z,
            q.x,
            q.y,
            q.z,
            q.w,
        )?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covariance_remap_swaps_pose_blocks() {
        let mut cov = SMatrix::<f64, ERR_DIM, ERR_DIM>::zeros();
        // distinct markers: pos-pos, rot-rot, pos-rot
        for i in 0..3 {
            for j in 0..3 {
                cov[(i, j)] = 1.0 + (i * 3 + j) as f64;
                cov[(3 + i, 3 + j)] = 100.0 + (i * 3 + j) as f64;
                cov[(i, 3 + j)] = 50.0 + (i * 3 + j) as f64;
                cov[(3 + i, j)] = 70.0 + (i * 3 + j) as f64;
            }
        }

        let out = remap_pose_covariance(&cov);
        // rotation block leads
        assert_eq!(out[(0, 0)], 100.0);
        assert_eq!(out[(0, 3)], 70.0);
        assert_eq!(out[(3, 0)], 50.0);
        assert_eq!(out[(3, 3)], 1.0);
    }

    #[test]
    fn trajectory_file_has_header_and_one_line_per_pose() {
        let dir = std::env::temp_dir().join("voxel_lio_traj_test");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("traj.txt");

        let trajectory = vec![
            TrajPoint {
                stamp: 1.25,
                position: Vector3::new(1.0, 2.0, 3.0),
                rotation: UnitQuaternion::identity(),
            },
            TrajPoint {
                stamp: 1.35,
                position: Vector3::new(4.0, 5.0, 6.0),
                rotation: UnitQuaternion::identity(),
            },
        ];
        save_trajectory(&path, &trajectory).expect("trajectory written");

        let contents = std::fs::read_to_string(&path).expect("trajectory readable");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "#timestamp x y z q_x q_y q_z q_w");
        assert!(lines[1].starts_with("1.250000 1."));
        let fields: Vec<&str> = lines[2].split(' ').collect();
        assert_eq!(fields.len(), 8);
        assert!(fields[7].starts_with("1.")); // identity q_w
    }
}
