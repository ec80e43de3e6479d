//! Unit cell and crystal orientation.

use crate::error::{Error, Result};
use crate::math::{require_orthonormal, Mat3, Vec3};
use crate::scan_varying::Interpolate;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Direct-space cell parameters: lengths in Å, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "[f64; 6]", into = "[f64; 6]"))]
pub struct UnitCell {
    a: f64,
    b: f64,
    c: f64,
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl UnitCell {
    /// Creates a cell from `(a, b, c, alpha, beta, gamma)`.
    ///
    /// # Errors
    /// Returns `InvalidModel` for non-positive lengths, angles outside
    /// `(0, 180)` or a combination of angles that encloses no volume.
    pub fn new(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Result<Self> {
        let lengths_ok = [a, b, c].iter().all(|v| v.is_finite() && *v > 0.0);
        let angles_ok = [alpha, beta, gamma]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0 && *v < 180.0);
        if !lengths_ok || !angles_ok {
            return Err(Error::InvalidModel(format!(
                "invalid unit cell ({a}, {b}, {c}, {alpha}, {beta}, {gamma})"
            )));
        }
        let cell = Self {
            a,
            b,
            c,
            alpha,
            beta,
            gamma,
        };
        if cell.volume_factor() <= 0.0 {
            return Err(Error::InvalidModel(format!(
                "unit cell angles ({alpha}, {beta}, {gamma}) enclose no volume"
            )));
        }
        Ok(cell)
    }

    /// Recovers a cell from a direct-space metric tensor `G`.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `G` is not a valid metric.
    pub fn from_metric(g: &Mat3) -> Result<Self> {
        let (a2, b2, c2) = (g[(0, 0)], g[(1, 1)], g[(2, 2)]);
        if a2 <= 0.0 || b2 <= 0.0 || c2 <= 0.0 {
            return Err(Error::InvalidModel(format!(
                "metric tensor has non-positive diagonal: {g:?}"
            )));
        }
        let (a, b, c) = (a2.sqrt(), b2.sqrt(), c2.sqrt());
        let angle = |cos: f64| cos.clamp(-1.0, 1.0).acos().to_degrees();
        Self::new(
            a,
            b,
            c,
            angle(g[(1, 2)] / (b * c)),
            angle(g[(0, 2)] / (a * c)),
            angle(g[(0, 1)] / (a * b)),
        )
    }

    /// `(a, b, c, alpha, beta, gamma)`.
    #[must_use]
    pub fn parameters(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.alpha, self.beta, self.gamma]
    }

    fn cosines(&self) -> (f64, f64, f64) {
        (
            self.alpha.to_radians().cos(),
            self.beta.to_radians().cos(),
            self.gamma.to_radians().cos(),
        )
    }

    fn volume_factor(&self) -> f64 {
        let (ca, cb, cg) = self.cosines();
        1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg
    }

    /// Cell volume in Å³.
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.a * self.b * self.c * self.volume_factor().max(0.0).sqrt()
    }

    /// Direct-space metric tensor `G = OᵀO`.
    #[must_use]
    pub fn metric(&self) -> Mat3 {
        let o = self.orthogonalization_matrix();
        o.transpose() * o
    }

    /// Orthogonalization matrix `O`, with `a` along x and `b` in the xy plane.
    ///
    /// Columns are the direct-space cell vectors in Cartesian coordinates.
    #[must_use]
    pub fn orthogonalization_matrix(&self) -> Mat3 {
        let (ca, cb, cg) = self.cosines();
        let sg = self.gamma.to_radians().sin();
        Mat3::new(
            self.a,
            self.b * cg,
            self.c * cb,
            0.0,
            self.b * sg,
            self.c * (ca - cb * cg) / sg,
            0.0,
            0.0,
            self.volume() / (self.a * self.b * sg),
        )
    }

    /// Fractionalization matrix `F = O⁻¹`.
    #[must_use]
    pub fn fractionalization_matrix(&self) -> Mat3 {
        // O is upper triangular with a positive diagonal for any valid cell.
        self.orthogonalization_matrix()
            .try_inverse()
            .unwrap_or_else(Mat3::zeros)
    }

    /// Reciprocal basis `B = Fᵀ`; its columns are `a*`, `b*`, `c*`.
    #[must_use]
    pub fn b_matrix(&self) -> Mat3 {
        self.fractionalization_matrix().transpose()
    }

    /// Interplanar spacing `d` (Å) of reflection `hkl`.
    #[must_use]
    pub fn d_spacing(&self, hkl: [i32; 3]) -> f64 {
        let h = Vec3::new(f64::from(hkl[0]), f64::from(hkl[1]), f64::from(hkl[2]));
        1.0 / (self.b_matrix() * h).norm()
    }
}

impl TryFrom<[f64; 6]> for UnitCell {
    type Error = Error;

    fn try_from(p: [f64; 6]) -> Result<Self> {
        Self::new(p[0], p[1], p[2], p[3], p[4], p[5])
    }
}

impl From<UnitCell> for [f64; 6] {
    fn from(cell: UnitCell) -> Self {
        cell.parameters()
    }
}

/// A crystal: unit cell, orientation and space group.
///
/// The setting matrix `A = U·B` maps Miller indices to lab-frame reciprocal
/// lattice vectors at zero rotation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "CrystalLayout"))]
pub struct Crystal {
    u: Mat3,
    unit_cell: UnitCell,
    space_group: String,
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct CrystalLayout {
    u: Mat3,
    unit_cell: UnitCell,
    space_group: String,
}

#[cfg(feature = "serde")]
impl TryFrom<CrystalLayout> for Crystal {
    type Error = Error;

    fn try_from(layout: CrystalLayout) -> Result<Self> {
        Self::new(layout.u, layout.unit_cell, layout.space_group)
    }
}

impl Crystal {
    /// Creates a crystal from an orientation matrix and cell.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `u` is not a proper rotation.
    pub fn new(u: Mat3, unit_cell: UnitCell, space_group: impl Into<String>) -> Result<Self> {
        require_orthonormal(&u, "crystal orientation U")?;
        Ok(Self {
            u,
            unit_cell,
            space_group: space_group.into(),
        })
    }

    /// Decomposes a setting matrix into orientation and cell.
    ///
    /// The cell comes from the reciprocal metric `G* = AᵀA`; then
    /// `U = A·B⁻¹`.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `A` is singular or left-handed.
    pub fn from_a_matrix(a: &Mat3, space_group: impl Into<String>) -> Result<Self> {
        let reciprocal_metric = a.transpose() * a;
        let metric = reciprocal_metric
            .try_inverse()
            .ok_or_else(|| Error::InvalidModel("setting matrix A is singular".to_string()))?;
        let unit_cell = UnitCell::from_metric(&metric)?;
        let b_inverse = unit_cell.orthogonalization_matrix().transpose();
        Self::new(a * b_inverse, unit_cell, space_group)
    }

    #[must_use]
    pub fn u_matrix(&self) -> Mat3 {
        self.u
    }

    #[must_use]
    pub fn b_matrix(&self) -> Mat3 {
        self.unit_cell.b_matrix()
    }

    /// `A = U·B`.
    #[must_use]
    pub fn a_matrix(&self) -> Mat3 {
        self.u * self.unit_cell.b_matrix()
    }

    #[must_use]
    pub fn unit_cell(&self) -> &UnitCell {
        &self.unit_cell
    }

    #[must_use]
    pub fn space_group(&self) -> &str {
        &self.space_group
    }

    /// Lab-frame direct-space vectors `[a, b, c]` at zero rotation.
    #[must_use]
    pub fn real_space_vectors(&self) -> [Vec3; 3] {
        let direct = self.u * self.unit_cell.orthogonalization_matrix();
        [
            direct.column(0).into_owned(),
            direct.column(1).into_owned(),
            direct.column(2).into_owned(),
        ]
    }

    /// Rotates the orientation by a lab-frame rotation.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `rotation` is not a proper rotation.
    pub fn rotated(&self, rotation: &Mat3) -> Result<Self> {
        require_orthonormal(rotation, "crystal rotation")?;
        Self::new(rotation * self.u, self.unit_cell, self.space_group.clone())
    }
}

impl Interpolate for Crystal {
    /// Interpolates `A` and re-derives cell and orientation.
    fn interpolate(&self, other: &Self, t: f64) -> Result<Self> {
        let a = self.a_matrix() + (other.a_matrix() - self.a_matrix()) * t;
        Self::from_a_matrix(&a, self.space_group.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::rotation_about;
    use approx::assert_relative_eq;

    fn monoclinic() -> UnitCell {
        UnitCell::new(50.0, 60.0, 70.0, 90.0, 105.0, 90.0).unwrap()
    }

    #[test]
    fn test_cubic_cell() {
        let cell = UnitCell::new(10.0, 10.0, 10.0, 90.0, 90.0, 90.0).unwrap();
        assert_relative_eq!(cell.volume(), 1000.0, epsilon = 1e-9);
        assert_relative_eq!(cell.b_matrix(), Mat3::identity() * 0.1, epsilon = 1e-12);
        assert_relative_eq!(cell.d_spacing([1, 1, 0]), 10.0 / 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_cells() {
        assert!(UnitCell::new(0.0, 1.0, 1.0, 90.0, 90.0, 90.0).is_err());
        assert!(UnitCell::new(1.0, 1.0, 1.0, 180.0, 90.0, 90.0).is_err());
        assert!(UnitCell::new(1.0, 1.0, 1.0, 120.0, 120.0, 120.0).is_err());
    }

    #[test]
    fn test_reciprocal_metric_matches_b() {
        let cell = monoclinic();
        let b = cell.b_matrix();
        let g_star = b.transpose() * b;
        let g = g_star.try_inverse().unwrap();
        assert_relative_eq!(g, cell.metric(), max_relative = 1e-9);
        let back = UnitCell::from_metric(&g).unwrap();
        for (x, y) in back.parameters().iter().zip(cell.parameters()) {
            assert_relative_eq!(*x, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_from_a_matrix_recovers_u_and_cell() {
        let u = rotation_about(&Vec3::new(1.0, 2.0, 3.0), 37.0);
        let crystal = Crystal::new(u, monoclinic(), "P 1 2 1").unwrap();
        let copy = Crystal::from_a_matrix(&crystal.a_matrix(), "P 1 2 1").unwrap();
        assert_relative_eq!(copy.u_matrix(), u, epsilon = 1e-9);
        for (x, y) in copy.unit_cell().parameters().iter().zip(monoclinic().parameters()) {
            assert_relative_eq!(*x, y, epsilon = 1e-8);
        }
        assert_eq!(copy.space_group(), "P 1 2 1");
    }

    #[test]
    fn test_from_a_matrix_rejects_singular() {
        assert!(Crystal::from_a_matrix(&Mat3::zeros(), "P 1").is_err());
        let mut flipped = Mat3::identity() * 0.1;
        flipped[(0, 0)] = -0.1;
        assert!(Crystal::from_a_matrix(&flipped, "P 1").is_err());
    }

    #[test]
    fn test_interpolate_rotation() {
        let cell = monoclinic();
        let a = Crystal::new(Mat3::identity(), cell, "P 2").unwrap();
        let b = Crystal::new(rotation_about(&Vec3::z(), 2.0), cell, "P 2").unwrap();
        let mid = a.interpolate(&b, 0.5).unwrap();
        // A small rotation interpolates to (nearly) the half rotation.
        let half = rotation_about(&Vec3::z(), 1.0);
        assert_relative_eq!(mid.u_matrix(), half, epsilon = 1e-3);
        for (x, y) in mid.unit_cell().parameters().iter().zip(cell.parameters()) {
            assert_relative_eq!(*x, y, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_interpolate_through_singular_setting_fails() {
        let cell = UnitCell::new(10.0, 10.0, 10.0, 90.0, 90.0, 90.0).unwrap();
        let a = Crystal::new(Mat3::identity(), cell, "P 1").unwrap();
        let b = Crystal::new(rotation_about(&Vec3::z(), 180.0), cell, "P 1").unwrap();
        // half way the x and y rows of A cancel
        assert!(matches!(a.interpolate(&b, 0.5), Err(Error::InvalidModel(_))));
        assert!(a.interpolate(&b, 0.25).is_ok());
    }

    #[test]
    fn test_real_space_vectors() {
        let cell = UnitCell::new(10.0, 20.0, 30.0, 90.0, 90.0, 90.0).unwrap();
        let crystal = Crystal::new(Mat3::identity(), cell, "P 1").unwrap();
        let [a, b, c] = crystal.real_space_vectors();
        assert_relative_eq!(a, Vec3::new(10.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(b, Vec3::new(0.0, 20.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(c, Vec3::new(0.0, 0.0, 30.0), epsilon = 1e-12);
    }
}
