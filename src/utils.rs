use nalgebra::{Matrix3, Point3, RealField, Vector3, Vector4};

/// Cross-product matrix of `v`, so that `skew(v) * w == v.cross(&w)`.
#[inline]
pub fn skew<T: RealField + Copy>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z,
        v.y,
        v.z,
        T::zero(),
        -v.x,
        -v.y,
        v.x,
        T::zero(),
    )
}

/// Fits a plane `n·x + d = 0` through `points` and returns `(n, d)` packed as
/// a `Vector4`, or `None` when the samples do not form a plane.
///
/// The normal is the smallest-eigenvalue direction of the centered sample
/// covariance. The fit is rejected when any point sits further than
/// `threshold` from the plane.
pub fn fit_plane(points: &[Point3<f32>], threshold: f32) -> Option<Vector4<f32>> {
    if points.len() < 3 {
        return None;
    }

    let inv_n = 1.0 / points.len() as f32;
    let centroid: Vector3<f32> = points.iter().map(|p| p.coords).sum::<Vector3<f32>>() * inv_n;

    let mut covariance = Matrix3::zeros();
    for p in points {
        let centered = p.coords - centroid;
        covariance += centered * centered.transpose();
    }
    covariance *= inv_n;

    let eigen = covariance.symmetric_eigen();
    let min_index = eigen.eigenvalues.imin();
    let normal: Vector3<f32> = eigen.eigenvectors.column(min_index).into_owned();
    let d = -normal.dot(&centroid);

    for p in points {
        if (normal.dot(&p.coords) + d).abs() > threshold {
            return None;
        }
    }

    Some(Vector4::new(normal.x, normal.y, normal.z, d))
}
