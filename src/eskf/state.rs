//! Nominal state and its 23-D error manifold.
//!
//! Error-state layout (columns of the covariance):
//!
//! ```text
//! ├ pos ┤├ rot ┤├ rot_li ┤├ t_li ┤├ vel ┤├ bg ┤├ ba ┤├ grav ┤
//! 0      3      6          9       12     15    18    21    23
//! ```
//!
//! Rotations compose by right perturbation. Gravity lives on the sphere of
//! fixed norm, so its error is the 2-D tangent spanned by [`s2_basis`].

use nalgebra::{Matrix3x2, SVector, UnitQuaternion, Vector3};

/// Dimension of the error space.
pub const ERR_DIM: usize = 23;

pub(crate) const POS: usize = 0;
pub(crate) const ROT: usize = 3;
pub(crate) const ROT_LI: usize = 6;
pub(crate) const T_LI: usize = 9;
pub(crate) const VEL: usize = 12;
pub(crate) const BG: usize = 15;
pub(crate) const BA: usize = 18;
pub(crate) const GRAV: usize = 21;

pub type ErrorVector = SVector<f64, ERR_DIM>;

/// Nominal filter state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct State {
    /// IMU position in the world frame.
    pub pos: Vector3<f64>,
    /// IMU orientation in the world frame.
    pub rot: UnitQuaternion<f64>,
    /// LiDAR-to-IMU extrinsic rotation.
    pub rot_li: UnitQuaternion<f64>,
    /// LiDAR-to-IMU extrinsic translation.
    pub t_li: Vector3<f64>,
    pub vel: Vector3<f64>,
    /// Gyro bias.
    pub bg: Vector3<f64>,
    /// Accelerometer bias.
    pub ba: Vector3<f64>,
    /// Gravity in the world frame, norm fixed at initialization.
    pub grav: Vector3<f64>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            rot_li: UnitQuaternion::identity(),
            t_li: Vector3::zeros(),
            vel: Vector3::zeros(),
            bg: Vector3::zeros(),
            ba: Vector3::zeros(),
            grav: Vector3::new(0.0, 0.0, -9.81),
        }
    }
}

impl State {
    /// `self ⊞ dx`: retract an error vector onto the nominal state.
    /// Quaternions are renormalized after every composition.
    pub fn boxplus(&mut self, dx: &ErrorVector) {
        self.pos += dx.fixed_rows::<3>(POS);

        self.rot *= UnitQuaternion::from_scaled_axis(dx.fixed_rows::<3>(ROT).into_owned());
        self.rot.renormalize();

        self.rot_li *= UnitQuaternion::from_scaled_axis(dx.fixed_rows::<3>(ROT_LI).into_owned());
        self.rot_li.renormalize();

        self.t_li += dx.fixed_rows::<3>(T_LI);
        self.vel += dx.fixed_rows::<3>(VEL);
        self.bg += dx.fixed_rows::<3>(BG);
        self.ba += dx.fixed_rows::<3>(BA);

        let theta = s2_basis(&self.grav) * dx.fixed_rows::<2>(GRAV).into_owned();
        self.grav = UnitQuaternion::from_scaled_axis(theta) * self.grav;
    }

    /// `self ⊟ other`: the error vector taking `other` to `self`.
    pub fn boxminus(&self, other: &State) -> ErrorVector {
        let mut dx = ErrorVector::zeros();

        dx.fixed_rows_mut::<3>(POS).copy_from(&(self.pos - other.pos));
        dx.fixed_rows_mut::<3>(ROT)
            .copy_from(&(other.rot.inverse() * self.rot).scaled_axis());
        dx.fixed_rows_mut::<3>(ROT_LI)
            .copy_from(&(other.rot_li.inverse() * self.rot_li).scaled_axis());
        dx.fixed_rows_mut::<3>(T_LI)
            .copy_from(&(self.t_li - other.t_li));
        dx.fixed_rows_mut::<3>(VEL).copy_from(&(self.vel - other.vel));
        dx.fixed_rows_mut::<3>(BG).copy_from(&(self.bg - other.bg));
        dx.fixed_rows_mut::<3>(BA).copy_from(&(self.ba - other.ba));
        dx.fixed_rows_mut::<2>(GRAV)
            .copy_from(&(s2_basis(&other.grav).transpose() * s2_log(&other.grav, &self.grav)));

        dx
    }
}

/// Orthonormal basis of the tangent plane of the gravity sphere at `g`,
/// returned as the two columns of a 3x2 matrix.
pub(crate) fn s2_basis(g: &Vector3<f64>) -> Matrix3x2<f64> {
    let gn = g.normalize();
    let pick = if gn.z.abs() < 0.9 {
        Vector3::z()
    } else {
        Vector3::x()
    };
    let b1 = gn.cross(&pick).normalize();
    let b2 = gn.cross(&b1);
    Matrix3x2::from_columns(&[b1, b2])
}

/// Rotation vector taking `from` to `to` along the sphere (both non-zero,
/// equal norm).
fn s2_log(from: &Vector3<f64>, to: &Vector3<f64>) -> Vector3<f64> {
    let cross = from.cross(to);
    let norm = cross.norm();
    if norm < 1e-12 {
        return Vector3::zeros();
    }
    let angle = norm.atan2(from.dot(to));
    cross * (angle / norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn boxplus_boxminus_roundtrip() {
        let mut dx = ErrorVector::zeros();
        for (i, v) in dx.iter_mut().enumerate() {
            *v = 0.01 * (i as f64 + 1.0) * if i % 2 == 0 { 1.0 } else { -1.0 };
        }

        let base = State::default();
        let mut perturbed = base;
        perturbed.boxplus(&dx);
        let recovered = perturbed.boxminus(&base);

        assert_relative_eq!(recovered, dx, epsilon = 1e-9);
    }

    #[test]
    fn boxplus_preserves_unit_quaternions_and_gravity_norm() {
        let mut state = State::default();
        let mut dx = ErrorVector::zeros();
        dx.fixed_rows_mut::<3>(ROT)
            .copy_from(&Vector3::new(0.3, -0.2, 0.1));
        dx.fixed_rows_mut::<2>(GRAV)
            .copy_from(&nalgebra::Vector2::new(0.05, -0.02));

        let grav_norm = state.grav.norm();
        for _ in 0..100 {
            state.boxplus(&dx);
        }

        assert_relative_eq!(state.rot.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(state.rot_li.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(state.grav.norm(), grav_norm, epsilon = 1e-9);
    }

    #[test]
    fn s2_basis_is_orthonormal_and_tangent() {
        for g in [
            Vector3::new(0.0, 0.0, -9.81),
            Vector3::new(3.0, -4.0, 1.0),
            Vector3::new(0.1, 0.1, 9.8),
        ] {
            let b = s2_basis(&g);
            let b1: Vector3<f64> = b.column(0).into_owned();
            let b2: Vector3<f64> = b.column(1).into_owned();
            assert_relative_eq!(b1.norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(b2.norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(b1.dot(&b2), 0.0, epsilon = 1e-12);
            assert_relative_eq!(b1.dot(&g), 0.0, epsilon = 1e-9);
            assert_relative_eq!(b2.dot(&g), 0.0, epsilon = 1e-9);
        }
    }
}
