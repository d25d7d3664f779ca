//! Vector form of the laws of refraction and reflection
//!
//! With $\vec n$ the unit normal oriented against the incident direction
//! $\vec d$ and $\eta=n_1/n_2$:
//! $$\vec{d^\prime}=\eta\vec d+\left(\eta\cos\theta_1-\sqrt{1-\eta^2\sin^2\theta_1}\right)\vec n,\quad \cos\theta_1=-\vec d\cdot\vec n$$
//! for refraction and $\vec{d^\prime}=\vec d-2(\vec d\cdot\vec n)\vec n$ for reflection.

use crate::{ray::RayFailure, surface::Vector};

fn against(d: &Vector, normal: &Vector) -> Vector {
    if d.dot(normal) > 0. {
        -normal
    } else {
        *normal
    }
}

/// Refracted unit direction from index `n1` into index `n2` (absolute values)
pub fn refract(d: &Vector, normal: &Vector, n1: f64, n2: f64) -> Result<Vector, RayFailure> {
    let n = against(d, normal);
    let eta = n1.abs() / n2.abs();
    let cos1 = -d.dot(&n);
    let sin2_sq = eta * eta * (1. - cos1 * cos1);
    if sin2_sq > 1. {
        return Err(RayFailure::Tir);
    }
    let out = d * eta + n * (eta * cos1 - (1. - sin2_sq).sqrt());
    Ok(out.normalize())
}

/// Reflected unit direction
pub fn reflect(d: &Vector, normal: &Vector) -> Vector {
    (d - normal * (2. * d.dot(normal))).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snell_law() {
        let theta = 30f64.to_radians();
        let d = Vector::new(theta.sin(), 0., theta.cos());
        let out = refract(&d, &Vector::z(), 1., 1.5).unwrap();
        assert!((out.x - theta.sin() / 1.5).abs() < 1e-15);
        assert!((out.norm() - 1.).abs() < 1e-15);
        // orientation of the normal does not matter
        let out_ = refract(&d, &-Vector::z(), 1., 1.5).unwrap();
        assert!((out - out_).norm() < 1e-15);
    }

    #[test]
    fn total_internal_reflection() {
        let theta = 45f64.to_radians();
        let d = Vector::new(theta.sin(), 0., theta.cos());
        assert_eq!(refract(&d, &Vector::z(), 1.5, 1.), Err(RayFailure::Tir));
    }

    #[test]
    fn mirror() {
        let d = Vector::new(0., 1., 1.).normalize();
        let out = reflect(&d, &Vector::z());
        assert!((out - Vector::new(0., 1., -1.).normalize()).norm() < 1e-15);
    }

    #[test]
    fn normal_incidence_unchanged() {
        let out = refract(&Vector::z(), &Vector::z(), 1., 1.7).unwrap();
        assert!((out - Vector::z()).norm() < 1e-15);
    }
}
