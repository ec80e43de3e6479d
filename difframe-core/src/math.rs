//! Vector and matrix helpers shared by the geometry model.

use crate::error::{Error, Result};
use nalgebra::{Matrix3, Rotation3, Unit, Vector3};

/// Lab-frame 3-vector.
pub type Vec3 = Vector3<f64>;

/// 3x3 matrix.
pub type Mat3 = Matrix3<f64>;

/// Tolerance on `det = 1` and `RᵀR = I` for rotation matrices.
pub const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// Tolerance for unit-length and orthogonality checks on axis vectors.
pub const AXIS_TOLERANCE: f64 = 1e-6;

/// Right-handed rotation about `axis` by `angle_deg` degrees.
#[must_use]
pub fn rotation_about(axis: &Vec3, angle_deg: f64) -> Mat3 {
    Rotation3::from_axis_angle(&Unit::new_normalize(*axis), angle_deg.to_radians()).into_inner()
}

/// Returns true if `m` is a proper rotation within `tolerance`.
#[must_use]
pub fn is_orthonormal(m: &Mat3, tolerance: f64) -> bool {
    (m.determinant() - 1.0).abs() <= tolerance
        && (m.transpose() * m - Mat3::identity()).amax() <= tolerance
}

/// Normalizes `v`, rejecting zero-length or non-finite vectors.
pub(crate) fn normalized(v: &Vec3, what: &str) -> Result<Vec3> {
    let norm = v.norm();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return Err(Error::InvalidModel(format!(
            "{what} must be a non-zero finite vector, got {v:?}"
        )));
    }
    Ok(v / norm)
}

/// Rejects matrices that are not proper rotations.
pub(crate) fn require_orthonormal(m: &Mat3, what: &str) -> Result<()> {
    if is_orthonormal(m, ORTHONORMAL_TOLERANCE) {
        Ok(())
    } else {
        Err(Error::InvalidModel(format!(
            "{what} is not orthonormal (det = {:.9})",
            m.determinant()
        )))
    }
}

/// Parses a signed axis label such as `"+x"` or `"-y"`.
///
/// # Errors
/// Returns `InvalidModel` for anything other than `[+-]?[xyz]`.
pub fn parse_axis_direction(label: &str) -> Result<Vec3> {
    let trimmed = label.trim();
    let (sign, axis) = match trimmed.as_bytes() {
        [b'+', axis] => (1.0, *axis),
        [b'-', axis] => (-1.0, *axis),
        [axis] => (1.0, *axis),
        _ => {
            return Err(Error::InvalidModel(format!(
                "unrecognised axis direction {label:?}"
            )))
        }
    };
    let unit = match axis.to_ascii_lowercase() {
        b'x' => Vec3::x(),
        b'y' => Vec3::y(),
        b'z' => Vec3::z(),
        _ => {
            return Err(Error::InvalidModel(format!(
                "unrecognised axis direction {label:?}"
            )))
        }
    };
    Ok(unit * sign)
}
