//! Iterated error-state Kalman filter on the rigid-body manifold.
//!
//! The observation model is a caller-supplied closure invoked once per
//! iteration; it fills an [`ObserveContext`] with the stacked innovation and
//! the measurement Jacobian over the 12 pose/extrinsic error columns. The
//! remaining columns (velocity, biases, gravity) are corrected through the
//! cross-covariance only.

pub mod state;

use nalgebra::{DVector, Dyn, OMatrix, SMatrix, U12, Vector3};
use tracing::warn;

pub use state::{ErrorVector, State, ERR_DIM};
use state::{s2_basis, BA, BG, GRAV, POS, ROT, VEL};

use crate::utils::skew;

type Cov = SMatrix<f64, ERR_DIM, ERR_DIM>;

/// Process noise dimension: gyro, accel, gyro bias walk, accel bias walk.
const NOISE_DIM: usize = 12;
pub type ProcessNoise = SMatrix<f64, NOISE_DIM, NOISE_DIM>;

/// Scratch shared between the filter and its observation model.
///
/// `converge` is a hint to the model: while `false` the model must refresh
/// its nearest-neighbor caches; once the state is converging the cached
/// correspondences are reused and only residuals and Jacobians are
/// recomputed. The model clears `valid` when it found no usable
/// correspondences, which keeps the state of that iteration untouched.
pub struct ObserveContext {
    pub valid: bool,
    pub converge: bool,
    /// Stacked innovation, one row per effective correspondence.
    pub h: DVector<f64>,
    /// Measurement Jacobian over the pos/rot/extrinsic error columns.
    pub h_x: OMatrix<f64, Dyn, U12>,
}

impl Default for ObserveContext {
    fn default() -> Self {
        Self {
            valid: false,
            converge: false,
            h: DVector::zeros(0),
            h_x: OMatrix::<f64, Dyn, U12>::zeros(0),
        }
    }
}

pub struct Eskf {
    state: State,
    cov: Cov,
}

impl Default for Eskf {
    fn default() -> Self {
        Self::new()
    }
}

impl Eskf {
    pub fn new() -> Self {
        Self {
            state: State::default(),
            cov: Cov::identity(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn covariance(&self) -> &Cov {
        &self.cov
    }

    pub fn set_covariance(&mut self, cov: Cov) {
        self.cov = cov;
    }

    /// Propagates the nominal state and the covariance over one IMU interval
    /// with the bias-corrected measurements `gyr`, `acc`.
    pub fn predict(&mut self, dt: f64, gyr: Vector3<f64>, acc: Vector3<f64>, q: &ProcessNoise) {
        let s = self.state;
        let omega = gyr - s.bg;
        let a_body = acc - s.ba;
        let rot_mat = s.rot.to_rotation_matrix().into_inner();
        let acc_world = rot_mat * a_body + s.grav;

        let mut fx = Cov::identity();
        fx.fixed_view_mut::<3, 3>(POS, VEL)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * dt));
        fx.fixed_view_mut::<3, 3>(ROT, ROT)
            .copy_from(nalgebra::Rotation3::new(omega * -dt).matrix());
        fx.fixed_view_mut::<3, 3>(ROT, BG)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * -dt));
        fx.fixed_view_mut::<3, 3>(VEL, ROT)
            .copy_from(&(rot_mat * skew(&a_body) * -dt));
        fx.fixed_view_mut::<3, 3>(VEL, BA)
            .copy_from(&(rot_mat * -dt));
        fx.fixed_view_mut::<3, 2>(VEL, GRAV)
            .copy_from(&(skew(&s.grav) * s2_basis(&s.grav) * -dt));

        let mut fw = SMatrix::<f64, ERR_DIM, NOISE_DIM>::zeros();
        fw.fixed_view_mut::<3, 3>(ROT, 0)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * -dt));
        fw.fixed_view_mut::<3, 3>(VEL, 3)
            .copy_from(&(rot_mat * -dt));
        fw.fixed_view_mut::<3, 3>(BG, 6)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * dt));
        fw.fixed_view_mut::<3, 3>(BA, 9)
            .copy_from(&(SMatrix::<f64, 3, 3>::identity() * dt));

        self.state.rot *= nalgebra::UnitQuaternion::from_scaled_axis(omega * dt);
        self.state.rot.renormalize();
        self.state.pos += s.vel * dt + acc_world * (0.5 * dt * dt);
        self.state.vel += acc_world * dt;

        self.cov = fx * self.cov * fx.transpose() + fw * q * fw.transpose();
    }

    /// Iterated update against a point-cloud observation model.
    ///
    /// `r` is the scalar measurement covariance shared by all
    /// correspondences, `epsi` the per-component convergence threshold.
    /// Iteration stops after the second converged pass or `max_iter`.
    pub fn update_iterated<F>(&mut self, r: f64, max_iter: usize, epsi: f64, mut obs: F)
    where
        F: FnMut(&State, &mut ObserveContext),
    {
        let x_propagated = self.state;
        let mut ctx = ObserveContext::default();
        let mut converged_count = 0u32;

        for i in 0..max_iter {
            ctx.valid = true;
            obs(&self.state, &mut ctx);
            if !ctx.valid {
                continue;
            }

            let dx_prior = self.state.boxminus(&x_propagated);

            let mut hth = Cov::zeros();
            hth.fixed_view_mut::<12, 12>(0, 0)
                .copy_from(&(ctx.h_x.tr_mul(&ctx.h_x) / r));

            let Some(p_inv) = self.cov.try_inverse() else {
                warn!("state covariance is singular, skipping update");
                return;
            };
            let Some(k_front) = (hth + p_inv).try_inverse() else {
                warn!("information matrix is singular, skipping update");
                return;
            };

            // K only needs the 12 observed columns of (HᵀH/r + P⁻¹)⁻¹.
            let kalman_gain = k_front.fixed_view::<ERR_DIM, 12>(0, 0) * (ctx.h_x.transpose() / r);
            let mut kh = Cov::zeros();
            kh.fixed_view_mut::<ERR_DIM, 12>(0, 0)
                .copy_from(&(&kalman_gain * &ctx.h_x));

            let dx: ErrorVector = &kalman_gain * &ctx.h + (kh - Cov::identity()) * dx_prior;
            self.state.boxplus(&dx);

            ctx.converge = dx.iter().all(|v| v.abs() < epsi);
            if ctx.converge {
                converged_count += 1;
            }

            if converged_count > 1 || i + 1 == max_iter {
                self.cov = (Cov::identity() - kh) * self.cov;
                break;
            }
        }

        // enforce symmetry after the manifold retractions
        self.cov = (self.cov + self.cov.transpose()) * 0.5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn process_noise() -> ProcessNoise {
        let mut q = ProcessNoise::zeros();
        for i in 0..3 {
            q[(i, i)] = 0.1;
            q[(3 + i, 3 + i)] = 0.1;
            q[(6 + i, 6 + i)] = 1e-4;
            q[(9 + i, 9 + i)] = 1e-4;
        }
        q
    }

    fn min_eigenvalue(cov: &SMatrix<f64, ERR_DIM, ERR_DIM>) -> f64 {
        let sym = (cov + cov.transpose()) * 0.5;
        sym.symmetric_eigen().eigenvalues.min()
    }

    #[test]
    fn predict_keeps_covariance_symmetric_positive() {
        let mut kf = Eskf::new();
        let q = process_noise();
        for _ in 0..200 {
            kf.predict(
                0.005,
                Vector3::new(0.01, -0.02, 0.5),
                Vector3::new(0.1, 0.0, 9.81),
                &q,
            );
        }
        let asym = (kf.cov - kf.cov.transpose()).abs().max();
        assert!(asym < 1e-9, "covariance asymmetry {asym}");
        assert!(min_eigenvalue(&kf.cov) > -1e-9);
    }

    #[test]
    fn static_predict_stays_put() {
        let mut kf = Eskf::new();
        let q = process_noise();
        // accelerometer reading exactly cancels the seeded gravity
        for _ in 0..100 {
            kf.predict(0.01, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81), &q);
        }
        assert_relative_eq!(kf.state.pos, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(kf.state.vel, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn update_pulls_position_toward_plane() {
        let mut kf = Eskf::new();
        // true position is 0.1 m above the estimate along +z; observe three
        // horizontal-plane correspondences with residual n·p + d = -0.1.
        kf.update_iterated(0.001, 4, 1e-3, |_, ctx| {
            let m = 3;
            ctx.h = DVector::from_element(m, 0.1);
            ctx.h_x = OMatrix::<f64, Dyn, U12>::from_fn(m, |_, j| if j == 2 { 1.0 } else { 0.0 });
        });

        assert!(kf.state.pos.z > 0.05, "z barely moved: {}", kf.state.pos.z);
        assert_relative_eq!(kf.state.rot.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(kf.state.rot_li.norm(), 1.0, epsilon = 1e-9);

        let asym = (kf.cov - kf.cov.transpose()).abs().max();
        assert!(asym < 1e-12, "covariance asymmetry {asym}");
        assert!(min_eigenvalue(&kf.cov) > -1e-9);
        // observed direction must have shrunk
        assert!(kf.cov[(2, 2)] < 1.0);
    }

    #[test]
    fn starved_update_is_a_no_op() {
        let mut kf = Eskf::new();
        let before_state = *kf.state();
        let before_cov = kf.cov;
        kf.update_iterated(0.001, 4, 1e-3, |_, ctx| {
            ctx.valid = false;
        });
        assert_eq!(*kf.state(), before_state);
        assert_relative_eq!(kf.cov, before_cov, epsilon = 1e-12);
    }

    #[test]
    fn first_iteration_requests_correspondence_refresh() {
        let mut kf = Eskf::new();
        let mut first_flag = None;
        kf.update_iterated(0.001, 2, 1e-3, |_, ctx| {
            if first_flag.is_none() {
                first_flag = Some(ctx.converge);
            }
            ctx.valid = false;
        });
        assert_eq!(first_flag, Some(false));
    }
}
