//! Goniometer kinematics.
//!
//! Axes are stored innermost first. The lab-frame rotation of the sample is
//! `S · R[n-1] · … · R[0] · F`, where `F` is the fixed rotation mounted on
//! the innermost axis and `S` is the setting matrix of the whole stage.

use crate::error::{Error, Result};
use crate::math::{normalized, require_orthonormal, rotation_about, Mat3, Vec3};
use crate::scan::Scan;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One rotation degree of freedom.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GoniometerAxis {
    pub name: String,
    pub direction: Vec3,
    /// Current angle in degrees.
    pub angle: f64,
}

impl GoniometerAxis {
    /// # Errors
    /// Returns `InvalidModel` for a zero-length direction.
    pub fn new(name: impl Into<String>, direction: Vec3, angle: f64) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            direction: normalized(&direction, "goniometer axis")?,
            angle,
        })
    }

    #[must_use]
    pub fn rotation(&self, angle: f64) -> Mat3 {
        rotation_about(&self.direction, angle)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "GoniometerLayout"))]
pub struct Goniometer {
    axes: Vec<GoniometerAxis>,
    scan_axis: usize,
    fixed_rotation: Mat3,
    setting_matrix: Mat3,
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct GoniometerLayout {
    axes: Vec<GoniometerAxis>,
    scan_axis: usize,
    fixed_rotation: Mat3,
    setting_matrix: Mat3,
}

#[cfg(feature = "serde")]
impl TryFrom<GoniometerLayout> for Goniometer {
    type Error = Error;

    fn try_from(layout: GoniometerLayout) -> Result<Self> {
        let axes = layout
            .axes
            .into_iter()
            .map(|axis| GoniometerAxis::new(axis.name, axis.direction, axis.angle))
            .collect::<Result<Vec<_>>>()?;
        Self::multi_axis(axes, layout.scan_axis)?
            .with_fixed_rotation(layout.fixed_rotation)?
            .with_setting_matrix(layout.setting_matrix)
    }
}

impl Goniometer {
    /// Single-axis goniometer rotating about `axis`.
    ///
    /// # Errors
    /// Returns `InvalidModel` for a zero-length axis.
    pub fn new(axis: Vec3) -> Result<Self> {
        Self::multi_axis(vec![GoniometerAxis::new("omega", axis, 0.0)?], 0)
    }

    /// Multi-axis goniometer; `axes` innermost first.
    ///
    /// # Errors
    /// Returns `InvalidModel` for an empty axis list or an out-of-range scan
    /// axis.
    pub fn multi_axis(axes: Vec<GoniometerAxis>, scan_axis: usize) -> Result<Self> {
        if axes.is_empty() {
            return Err(Error::InvalidModel(
                "goniometer needs at least one axis".to_string(),
            ));
        }
        if scan_axis >= axes.len() {
            return Err(Error::InvalidModel(format!(
                "scan axis {scan_axis} out of range for {} axes",
                axes.len()
            )));
        }
        Ok(Self {
            axes,
            scan_axis,
            fixed_rotation: Mat3::identity(),
            setting_matrix: Mat3::identity(),
        })
    }

    /// Sets the fixed rotation `F`.
    ///
    /// # Errors
    /// Returns `InvalidModel` unless `f` is a proper rotation.
    pub fn with_fixed_rotation(mut self, f: Mat3) -> Result<Self> {
        require_orthonormal(&f, "fixed rotation")?;
        self.fixed_rotation = f;
        Ok(self)
    }

    /// Sets the setting matrix `S`.
    ///
    /// # Errors
    /// Returns `InvalidModel` unless `s` is a proper rotation.
    pub fn with_setting_matrix(mut self, s: Mat3) -> Result<Self> {
        require_orthonormal(&s, "setting matrix")?;
        self.setting_matrix = s;
        Ok(self)
    }

    /// Sets the current angle of every axis, innermost first.
    ///
    /// # Errors
    /// Returns `InvalidModel` if the count differs from the number of axes.
    pub fn with_angles(mut self, angles: &[f64]) -> Result<Self> {
        if angles.len() != self.axes.len() {
            return Err(Error::InvalidModel(format!(
                "{} angles for {} axes",
                angles.len(),
                self.axes.len()
            )));
        }
        for (axis, angle) in self.axes.iter_mut().zip(angles) {
            axis.angle = *angle;
        }
        Ok(self)
    }

    #[must_use]
    pub fn axes(&self) -> &[GoniometerAxis] {
        &self.axes
    }

    /// Position of an axis by name.
    #[must_use]
    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|axis| axis.name == name)
    }

    #[must_use]
    pub fn scan_axis(&self) -> usize {
        self.scan_axis
    }

    #[must_use]
    pub fn fixed_rotation(&self) -> Mat3 {
        self.fixed_rotation
    }

    #[must_use]
    pub fn setting_matrix(&self) -> Mat3 {
        self.setting_matrix
    }

    /// Scan axis direction in its own datum frame.
    #[must_use]
    pub fn rotation_axis_datum(&self) -> Vec3 {
        self.axes[self.scan_axis].direction
    }

    /// Lab-frame scan axis: the datum rotated by all outer axes and `S`.
    #[must_use]
    pub fn rotation_axis(&self) -> Vec3 {
        let outer = self.axes[self.scan_axis + 1..]
            .iter()
            .fold(Mat3::identity(), |acc, axis| axis.rotation(axis.angle) * acc);
        self.setting_matrix * outer * self.rotation_axis_datum()
    }

    /// Composite rotation with the scan axis at `scan_angle` degrees and
    /// every other axis at its current angle.
    #[must_use]
    pub fn rotation_at_angle(&self, scan_angle: f64) -> Mat3 {
        let stage = self
            .axes
            .iter()
            .enumerate()
            .fold(Mat3::identity(), |acc, (index, axis)| {
                let angle = if index == self.scan_axis {
                    scan_angle
                } else {
                    axis.angle
                };
                axis.rotation(angle) * acc
            });
        self.setting_matrix * stage * self.fixed_rotation
    }

    /// Sample rotation at a (possibly fractional) image index.
    ///
    /// Without a scan the scan axis stays at its current angle.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for indices outside the scan and
    /// `InvalidModel` if the composed rotation is not orthonormal.
    pub fn setting_rotation(&self, scan: Option<&Scan>, image_index: f64) -> Result<Mat3> {
        let angle = match scan {
            Some(scan) => scan.angle_from_image_index(image_index)?,
            None => self.axes[self.scan_axis].angle,
        };
        let rotation = self.rotation_at_angle(angle);
        require_orthonormal(&rotation, "composed goniometer rotation")?;
        Ok(rotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{is_orthonormal, ORTHONORMAL_TOLERANCE};
    use approx::assert_relative_eq;

    fn kappa() -> Goniometer {
        let alpha = 50.0_f64.to_radians();
        Goniometer::multi_axis(
            vec![
                GoniometerAxis::new("phi", Vec3::x(), 0.0).unwrap(),
                GoniometerAxis::new(
                    "kappa",
                    Vec3::new(alpha.cos(), 0.0, alpha.sin()),
                    0.0,
                )
                .unwrap(),
                GoniometerAxis::new("omega", Vec3::x(), 0.0).unwrap(),
            ],
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_single_axis_rotation_at_image() {
        let g = Goniometer::new(Vec3::x()).unwrap();
        let scan = Scan::new((1, 10), (0.0, 1.0)).unwrap();
        let r = g.setting_rotation(Some(&scan), 5.0).unwrap();
        assert_relative_eq!(r, rotation_about(&Vec3::x(), 4.0), epsilon = 1e-12);
        assert!(matches!(
            g.setting_rotation(Some(&scan), 11.0),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert_relative_eq!(g.setting_rotation(None, 0.0).unwrap(), Mat3::identity());
    }

    #[test]
    fn test_composition_order() {
        let f = rotation_about(&Vec3::z(), 15.0);
        let s = rotation_about(&Vec3::y(), -7.0);
        let g = kappa()
            .with_angles(&[10.0, 30.0, 0.0])
            .unwrap()
            .with_fixed_rotation(f)
            .unwrap()
            .with_setting_matrix(s)
            .unwrap();
        let axes = g.axes();
        let expected = s
            * axes[2].rotation(25.0)
            * axes[1].rotation(30.0)
            * axes[0].rotation(10.0)
            * f;
        assert_relative_eq!(g.rotation_at_angle(25.0), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_axis_follows_outer_axes() {
        let g = Goniometer::multi_axis(
            vec![
                GoniometerAxis::new("phi", Vec3::x(), 0.0).unwrap(),
                GoniometerAxis::new("chi", Vec3::z(), 90.0).unwrap(),
            ],
            0,
        )
        .unwrap();
        assert_relative_eq!(g.rotation_axis(), Vec3::y(), epsilon = 1e-12);
        assert_eq!(g.axis_index("chi"), Some(1));
    }

    #[test]
    fn test_composed_rotation_is_orthonormal() {
        let scan = Scan::new((1, 360), (-180.0, 1.0)).unwrap();
        for phi in [-170.0, -33.3, 0.0, 12.5, 91.0] {
            for kappa_angle in [-120.0, 0.0, 45.0, 178.0] {
                let g = kappa().with_angles(&[phi, kappa_angle, 0.0]).unwrap();
                for image in [1.0, 47.25, 180.5, 360.0] {
                    let r = g.setting_rotation(Some(&scan), image).unwrap();
                    assert!(is_orthonormal(&r, ORTHONORMAL_TOLERANCE));
                    assert_relative_eq!(r.transpose() * r, Mat3::identity(), epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_invalid_goniometers() {
        assert!(Goniometer::multi_axis(Vec::new(), 0).is_err());
        assert!(Goniometer::new(Vec3::zeros()).is_err());
        assert!(kappa().with_angles(&[1.0]).is_err());
        assert!(Goniometer::new(Vec3::x())
            .unwrap()
            .with_fixed_rotation(Mat3::identity() * 2.0)
            .is_err());
        let three = kappa().axes().to_vec();
        assert!(Goniometer::multi_axis(three, 3).is_err());
    }
}
