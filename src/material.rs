//! Hyperelastic constitutive laws for myocardium.

use serde::{Deserialize, Serialize};

use crate::{microstructure::FiberBasis, Mat3, Vec3};

/// A hyperelastic material with an active fiber contribution.
pub trait Material {
    /// First Piola-Kirchhoff stress for deformation gradient `f`,
    /// local material directions `basis` and activation level `activation`.
    fn first_piola(&self, f: &Mat3, basis: &FiberBasis, activation: f64) -> Mat3;

    /// Cauchy stress `P F^T / J`.
    fn cauchy_stress(&self, f: &Mat3, basis: &FiberBasis, activation: f64) -> Mat3 {
        let j = f.determinant();
        self.first_piola(f, basis, activation) * f.transpose() / j
    }
}

/// The transversely isotropic Holzapfel-Ogden law
/// with an active stress along the fibers
/// and a penalty on volume change.
///
/// ```text
/// psi = a/(2b) (exp(b(I1 - 3)) - 1)
///     + sum over i = f, s of a_i/(2b_i) (exp(b_i (I4i - 1)^2) - 1), only in tension
///     + a_fs/(2b_fs) (exp(b_fs I8fs^2) - 1)
///     - a ln J + kappa/2 (ln J)^2
/// ```
///
/// The active part adds `activation * f0 x f0`
/// to the second Piola-Kirchhoff stress.
/// Defaults are fitted to rat myocardium.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolzapfelOgden {
    /// Isotropic stiffness.
    pub a: f64,
    /// Isotropic exponent.
    pub b: f64,
    /// Fiber stiffness.
    pub a_f: f64,
    /// Fiber exponent.
    pub b_f: f64,
    /// Sheet stiffness.
    pub a_s: f64,
    /// Sheet exponent.
    pub b_s: f64,
    /// Fiber-sheet coupling stiffness.
    pub a_fs: f64,
    /// Fiber-sheet coupling exponent.
    pub b_fs: f64,
    /// Bulk modulus of the volumetric penalty.
    pub kappa: f64,
}

impl Default for HolzapfelOgden {
    fn default() -> Self {
        Self {
            a: 10.726,
            b: 2.118,
            a_f: 7.048,
            b_f: 0.001,
            a_s: 0.,
            b_s: 0.,
            a_fs: 0.,
            b_fs: 0.,
            kappa: 1e3,
        }
    }
}

impl HolzapfelOgden {
    /// Strain energy density.
    pub fn strain_energy(&self, f: &Mat3, basis: &FiberBasis) -> f64 {
        let c = f.transpose() * f;
        let ln_j = f.determinant().ln();
        let i1 = c.trace();
        let i4 = |v: &Vec3| v.dot(&(c * v));
        let i8 = basis.f.dot(&(c * basis.s));

        // a/(2b) (exp(b x) - 1), continuous as b -> 0
        let exp_term = |a: f64, b: f64, x: f64| {
            if b.abs() < 1e-12 {
                0.5 * a * x
            } else {
                a / (2. * b) * ((b * x).exp() - 1.)
            }
        };
        let aniso = |a: f64, b: f64, i4: f64| {
            let stretch = (i4 - 1.).max(0.);
            exp_term(a, b, stretch * stretch)
        };

        exp_term(self.a, self.b, i1 - 3.)
            + aniso(self.a_f, self.b_f, i4(&basis.f))
            + aniso(self.a_s, self.b_s, i4(&basis.s))
            + exp_term(self.a_fs, self.b_fs, i8 * i8)
            - self.a * ln_j
            + 0.5 * self.kappa * ln_j * ln_j
    }

    /// Second Piola-Kirchhoff stress for right Cauchy-Green tensor `c`.
    pub fn second_piola(&self, c: &Mat3, basis: &FiberBasis, activation: f64) -> Mat3 {
        let Some(c_inv) = c.try_inverse() else {
            return Mat3::repeat(f64::NAN);
        };
        let ln_j = 0.5 * c.determinant().ln();
        let (f0, s0) = (basis.f, basis.s);
        let i1 = c.trace();
        let i4f = f0.dot(&(c * f0));
        let i4s = s0.dot(&(c * s0));
        let i8 = f0.dot(&(c * s0));

        let mut s = self.a * (self.b * (i1 - 3.)).exp() * Mat3::identity();
        // fibers and sheets only resist stretching
        if i4f > 1. {
            let e = i4f - 1.;
            s += 2. * self.a_f * e * (self.b_f * e * e).exp() * f0 * f0.transpose();
        }
        if i4s > 1. {
            let e = i4s - 1.;
            s += 2. * self.a_s * e * (self.b_s * e * e).exp() * s0 * s0.transpose();
        }
        if self.a_fs != 0. {
            let sym = f0 * s0.transpose() + s0 * f0.transpose();
            s += self.a_fs * i8 * (self.b_fs * i8 * i8).exp() * sym;
        }
        s += (self.kappa * ln_j - self.a) * c_inv;
        s += activation * f0 * f0.transpose();
        s
    }
}

impl Material for HolzapfelOgden {
    fn first_piola(&self, f: &Mat3, basis: &FiberBasis, activation: f64) -> Mat3 {
        let c = f.transpose() * f;
        f * self.second_piola(&c, basis, activation)
    }
}
