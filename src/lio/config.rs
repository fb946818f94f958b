//! Engine configuration, mirroring the deployment YAML layout.

use std::fs::File;
use std::path::Path;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::Deserialize;
use thiserror::Error;

use crate::voxel_map::{self, NearbyType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown lidar_type {0}, expected 1 (Avia), 2 (Velodyne-32) or 3 (Ouster-64)")]
    UnknownLidarType(i64),
    #[error("unknown ivox_nearby_type {0}, expected 0, 6, 18 or 26")]
    UnknownNearbyType(i64),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sensor variant selecting the timing extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum LidarType {
    /// Solid-state, non-repeating scan pattern.
    Avia,
    /// Mechanical 32-ring spinner.
    Velo32,
    /// 64-ring spinner.
    Oust64,
}

impl TryFrom<i64> for LidarType {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Avia),
            2 => Ok(Self::Velo32),
            3 => Ok(Self::Oust64),
            other => Err(ConfigError::UnknownLidarType(other)),
        }
    }
}

/// Serde shim for [`NearbyType`], which is spelled 0/6/18/26 in the YAML.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "i64")]
pub struct NearbyTypeCode(pub NearbyType);

impl TryFrom<i64> for NearbyTypeCode {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self(NearbyType::Center)),
            6 => Ok(Self(NearbyType::Nearby6)),
            18 => Ok(Self(NearbyType::Nearby18)),
            26 => Ok(Self(NearbyType::Nearby26)),
            other => Err(ConfigError::UnknownNearbyType(other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub time_sync_en: bool,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            time_sync_en: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Blind radius in meters; closer returns are dropped.
    pub blind: f64,
    /// Scale from the vendor's per-point time unit to seconds.
    pub time_scale: f64,
    pub lidar_type: LidarType,
    pub scan_line: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            blind: 0.01,
            time_scale: 1e-3,
            lidar_type: LidarType::Avia,
            scan_line: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Reserved for a future map-trim policy.
    pub det_range: f32,
    pub gyr_cov: f64,
    pub acc_cov: f64,
    pub b_gyr_cov: f64,
    pub b_acc_cov: f64,
    pub extrinsic_est_en: bool,
    #[serde(rename = "extrinsic_T")]
    pub extrinsic_t: [f64; 3],
    /// Row-major 3x3 rotation.
    #[serde(rename = "extrinsic_R")]
    pub extrinsic_r: [f64; 9],
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            det_range: 300.0,
            gyr_cov: 0.1,
            acc_cov: 0.1,
            b_gyr_cov: 1e-4,
            b_acc_cov: 1e-4,
            extrinsic_est_en: true,
            extrinsic_t: [0.0; 3],
            extrinsic_r: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl MappingConfig {
    pub fn extrinsic_translation(&self) -> Vector3<f64> {
        Vector3::from_row_slice(&self.extrinsic_t)
    }

    pub fn extrinsic_rotation(&self) -> UnitQuaternion<f64> {
        let m = Matrix3::from_row_slice(&self.extrinsic_r);
        UnitQuaternion::from_matrix(&m)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub path_publish_en: bool,
    pub scan_publish_en: bool,
    pub dense_publish_en: bool,
    pub scan_bodyframe_pub_en: bool,
    pub scan_effect_pub_en: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            path_publish_en: true,
            scan_publish_en: true,
            dense_publish_en: false,
            scan_bodyframe_pub_en: true,
            scan_effect_pub_en: false,
        }
    }
}

/// Carried for the external PCD writer; the core does not consume it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PcdSaveConfig {
    pub pcd_save_en: bool,
    pub interval: i32,
}

impl Default for PcdSaveConfig {
    fn default() -> Self {
        Self {
            pcd_save_en: false,
            interval: -1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LioConfig {
    pub max_iteration: usize,
    pub esti_plane_threshold: f32,
    /// Scan downsampling leaf size in meters.
    pub filter_size_surf: f32,
    /// Map insertion voxel size in meters.
    pub filter_size_map: f32,
    /// Reserved for a future map-trim policy.
    pub cube_side_length: f64,
    pub point_filter_num: usize,
    /// Reserved; surface-feature extraction is not part of this core.
    pub feature_extract_enable: bool,
    pub path_save_en: bool,
    /// Distance-adaptive outlier gate: a correspondence is kept only when
    /// `|p_body|^2 > residual_gate * pd^2`.
    pub residual_gate: f32,
    pub ivox_grid_resolution: f32,
    pub ivox_nearby_type: NearbyTypeCode,
    pub ivox_capacity: usize,
    pub common: CommonConfig,
    pub preprocess: PreprocessConfig,
    pub mapping: MappingConfig,
    pub publish: PublishConfig,
    pub pcd_save: PcdSaveConfig,
}

impl Default for LioConfig {
    fn default() -> Self {
        Self {
            max_iteration: 4,
            esti_plane_threshold: 0.1,
            filter_size_surf: 0.5,
            filter_size_map: 0.5,
            cube_side_length: 200.0,
            point_filter_num: 2,
            feature_extract_enable: false,
            path_save_en: true,
            residual_gate: 81.0,
            ivox_grid_resolution: 0.2,
            ivox_nearby_type: NearbyTypeCode(NearbyType::Nearby18),
            ivox_capacity: 100_000,
            common: CommonConfig::default(),
            preprocess: PreprocessConfig::default(),
            mapping: MappingConfig::default(),
            publish: PublishConfig::default(),
            pcd_save: PcdSaveConfig::default(),
        }
    }
}

impl LioConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path.as_ref())?;
        let config: Self = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iteration == 0 {
            return Err(ConfigError::Invalid("max_iteration must be >= 1".into()));
        }
        if self.point_filter_num == 0 {
            return Err(ConfigError::Invalid("point_filter_num must be >= 1".into()));
        }
        if !(self.filter_size_surf > 0.0) || !(self.filter_size_map > 0.0) {
            return Err(ConfigError::Invalid(
                "filter sizes must be positive".into(),
            ));
        }
        if !(self.ivox_grid_resolution > 0.0) {
            return Err(ConfigError::Invalid(
                "ivox_grid_resolution must be positive".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn voxel_map_config(&self) -> voxel_map::Config {
        voxel_map::Config {
            resolution: self.ivox_grid_resolution,
            nearby_type: self.ivox_nearby_type.0,
            capacity: self.ivox_capacity,
            ..voxel_map::Config::default()
        }
    }
}
