//! Tightly-coupled LiDAR-inertial odometry on an incremental voxel map.
//!
//! The crate fuses a spinning or solid-state LiDAR stream with a strapdown
//! IMU into a 6-DoF pose and an incrementally maintained point-cloud map.
//! Three subsystems carry the weight:
//!
//! - [`lio::Synchronizer`] assembles measurement packages from the
//!   asynchronous sensor streams, keyed on scan end time;
//! - an IMU propagator predicts the filter between scan ends and
//!   back-projects each sweep onto its end instant;
//! - an iterated error-state Kalman filter ([`eskf::Eskf`]) solves a batched
//!   point-to-plane observation against the [`voxel_map::VoxelMap`].
//!
//! Transport, visualization and file writers stay outside; the engine
//! ([`lio::Lio`]) consumes decoded sensor data and returns plain outputs.
#![deny(clippy::unwrap_used)]

pub mod eskf;
pub mod lio;
pub mod point;
pub mod utils;
pub mod voxel_map;

pub use lio::{Lio, LioConfig, Session};
pub use point::{Point, PointCloud};
