//! Pixel calibration: pixel↔millimetre transforms and parallax correction.
//!
//! Millimetre positions are panel-local 2D coordinates measured along the
//! fast and slow axes from the panel origin. Lab positions are obtained as
//! `origin + x·fast + y·slow`.
//!
//! Parallax correction accounts for the finite absorption depth of the
//! sensor: a photon arriving at an oblique angle is absorbed, on average,
//! some distance below the surface, so the recorded position is displaced
//! along the in-plane projection of its direction of travel.
#![allow(clippy::cast_precision_loss)]

use crate::error::{Error, Result};
use crate::math::Vec3;

/// Slack allowed on domain checks, in pixels.
const PIXEL_EPSILON: f64 = 1e-9;

/// Convergence threshold (mm) for the iterative position-derived inverse.
const PARALLAX_CONVERGENCE_MM: f64 = 1e-12;

/// Iteration cap for the position-derived inverse.
const PARALLAX_MAX_ITERATIONS: usize = 100;

/// A millimetre position in a panel's local frame, `(fast, slow)`.
pub type MmPosition = (f64, f64);

/// Geometry required by the calibration transforms.
///
/// Implemented by [`crate::Panel`]; every accessor is lab frame.
pub trait PixelGeometry {
    /// Lab position of the corner of pixel (0, 0), in mm.
    fn origin(&self) -> Vec3;

    /// Unit vector along increasing fast (column) index.
    fn fast_axis(&self) -> Vec3;

    /// Unit vector along increasing slow (row) index.
    fn slow_axis(&self) -> Vec3;

    /// Pixel size `(fast, slow)` in mm.
    fn pixel_size(&self) -> (f64, f64);

    /// Image size `(fast, slow)` in pixels.
    fn image_size(&self) -> (usize, usize);

    /// Sensor thickness in mm (0 disables parallax correction).
    fn thickness(&self) -> f64;

    /// Linear attenuation coefficient of the sensor in 1/mm.
    fn mu(&self) -> f64;

    /// Unit normal `fast × slow`.
    #[inline]
    fn normal(&self) -> Vec3 {
        self.fast_axis().cross(&self.slow_axis())
    }

    /// Panel extent `(fast, slow)` in mm.
    #[inline]
    fn image_size_mm(&self) -> (f64, f64) {
        let (nx, ny) = self.image_size();
        let (sx, sy) = self.pixel_size();
        (nx as f64 * sx, ny as f64 * sy)
    }
}

fn check_pixel<G: PixelGeometry + ?Sized>(panel: &G, px: f64, py: f64) -> Result<()> {
    let (nx, ny) = panel.image_size();
    let in_range = |v: f64, n: usize| {
        v.is_finite() && v >= -PIXEL_EPSILON && v <= n as f64 + PIXEL_EPSILON
    };
    if in_range(px, nx) && in_range(py, ny) {
        Ok(())
    } else {
        Err(Error::OutOfBounds(format!(
            "pixel ({px}, {py}) outside panel of {nx} x {ny} pixels"
        )))
    }
}

fn check_mm<G: PixelGeometry + ?Sized>(panel: &G, mm: MmPosition, margin: f64) -> Result<()> {
    let (sx, sy) = panel.pixel_size();
    let (wx, wy) = panel.image_size_mm();
    let tx = margin + PIXEL_EPSILON * sx;
    let ty = margin + PIXEL_EPSILON * sy;
    let ok = mm.0.is_finite()
        && mm.1.is_finite()
        && mm.0 >= -tx
        && mm.0 <= wx + tx
        && mm.1 >= -ty
        && mm.1 <= wy + ty;
    if ok {
        Ok(())
    } else {
        Err(Error::OutOfBounds(format!(
            "position ({}, {}) mm outside panel of {wx} x {wy} mm",
            mm.0, mm.1
        )))
    }
}

/// Maps a fractional pixel coordinate to a panel-local millimetre position.
///
/// # Errors
/// Returns `OutOfBounds` if the pixel lies outside `[0, nx] x [0, ny]`.
pub fn pixel_to_lab_mm<G: PixelGeometry + ?Sized>(
    panel: &G,
    px: f64,
    py: f64,
) -> Result<MmPosition> {
    check_pixel(panel, px, py)?;
    let (sx, sy) = panel.pixel_size();
    Ok((px * sx, py * sy))
}

/// Exact inverse of [`pixel_to_lab_mm`].
///
/// # Errors
/// Returns `OutOfBounds` if the position lies outside the panel.
pub fn lab_mm_to_pixel<G: PixelGeometry + ?Sized>(panel: &G, mm: MmPosition) -> Result<(f64, f64)> {
    check_mm(panel, mm, 0.0)?;
    let (sx, sy) = panel.pixel_size();
    Ok((mm.0 / sx, mm.1 / sy))
}

/// Lab-frame position of a panel-local millimetre position.
#[must_use]
pub fn mm_to_lab<G: PixelGeometry + ?Sized>(panel: &G, mm: MmPosition) -> Vec3 {
    panel.origin() + panel.fast_axis() * mm.0 + panel.slow_axis() * mm.1
}

/// Lab-frame position of a fractional pixel coordinate.
///
/// # Errors
/// Returns `OutOfBounds` if the pixel lies outside the panel.
pub fn pixel_to_lab_position<G: PixelGeometry + ?Sized>(
    panel: &G,
    px: f64,
    py: f64,
) -> Result<Vec3> {
    pixel_to_lab_mm(panel, px, py).map(|mm| mm_to_lab(panel, mm))
}

/// Mean path length travelled inside a sensor of thickness `t0` before
/// absorption, for a ray entering at `cos_theta` to the normal.
///
/// Returns 0 when either `mu` or `t0` is non-positive.
#[must_use]
pub fn attenuation_length(mu: f64, t0: f64, cos_theta: f64) -> f64 {
    if mu <= 0.0 || t0 <= 0.0 {
        return 0.0;
    }
    let path = t0 / cos_theta;
    (1.0 / mu) - (path + 1.0 / mu) * (-mu * path).exp()
}

/// In-plane displacement `(fast, slow)` of the mean absorption point for a
/// ray travelling along `incident_direction`.
///
/// The in-plane length equals `depth · tan(theta)`, where `depth` is the mean
/// absorption depth measured along the normal.
///
/// # Errors
/// Returns `OutOfBounds` if the ray does not enter the sensor face.
pub fn parallax_shift<G: PixelGeometry + ?Sized>(
    panel: &G,
    incident_direction: &Vec3,
) -> Result<MmPosition> {
    let norm = incident_direction.norm();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return Err(Error::OutOfBounds(format!(
            "incident direction {incident_direction:?} has no length"
        )));
    }
    let direction = incident_direction / norm;

    // Orient the normal away from the sample.
    let mut normal = panel.normal();
    if panel.origin().dot(&normal) < 0.0 {
        normal = -normal;
    }
    let cos_theta = direction.dot(&normal);
    if cos_theta <= f64::EPSILON {
        return Err(Error::OutOfBounds(format!(
            "incident direction {direction:?} does not enter the sensor face"
        )));
    }

    let o = attenuation_length(panel.mu(), panel.thickness(), cos_theta);
    Ok((o * direction.dot(&panel.fast_axis()), o * direction.dot(&panel.slow_axis())))
}

/// Maps an observed position to the point where the photon crossed the
/// sensor surface.
///
/// # Errors
/// Returns `OutOfBounds` if the position lies outside the panel (extended by
/// the shift) or the direction does not enter the sensor.
pub fn parallax_correct<G: PixelGeometry + ?Sized>(
    panel: &G,
    mm: MmPosition,
    incident_direction: &Vec3,
) -> Result<MmPosition> {
    let shift = parallax_shift(panel, incident_direction)?;
    check_mm(panel, mm, shift.0.hypot(shift.1))?;
    Ok((mm.0 - shift.0, mm.1 - shift.1))
}

/// Inverse of [`parallax_correct`] for the same incident direction.
///
/// # Errors
/// Same conditions as [`parallax_correct`].
pub fn parallax_uncorrect<G: PixelGeometry + ?Sized>(
    panel: &G,
    mm: MmPosition,
    incident_direction: &Vec3,
) -> Result<MmPosition> {
    let shift = parallax_shift(panel, incident_direction)?;
    check_mm(panel, mm, shift.0.hypot(shift.1))?;
    Ok((mm.0 + shift.0, mm.1 + shift.1))
}

/// Parallax correction with the incident direction taken from the sample
/// position (lab origin) to the observed point.
///
/// # Errors
/// Same conditions as [`parallax_correct`].
pub fn parallax_correct_from_sample<G: PixelGeometry + ?Sized>(
    panel: &G,
    mm: MmPosition,
) -> Result<MmPosition> {
    let direction = mm_to_lab(panel, mm);
    parallax_correct(panel, mm, &direction)
}

/// Inverse of [`parallax_correct_from_sample`].
///
/// The incident direction depends on the (unknown) observed position, so the
/// inverse is found by fixed-point iteration.
///
/// # Errors
/// Same conditions as [`parallax_correct`], or `OutOfBounds` if the
/// iteration does not converge.
pub fn parallax_uncorrect_from_sample<G: PixelGeometry + ?Sized>(
    panel: &G,
    mm: MmPosition,
) -> Result<MmPosition> {
    let mut observed = parallax_uncorrect(panel, mm, &mm_to_lab(panel, mm))?;
    for _ in 0..PARALLAX_MAX_ITERATIONS {
        let shift = parallax_shift(panel, &mm_to_lab(panel, observed))?;
        let next = (mm.0 + shift.0, mm.1 + shift.1);
        let delta = (next.0 - observed.0).hypot(next.1 - observed.1);
        observed = next;
        if delta < PARALLAX_CONVERGENCE_MM {
            return Ok(observed);
        }
    }
    Err(Error::OutOfBounds(format!(
        "parallax inverse did not converge at ({}, {}) mm",
        mm.0, mm.1
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Flat {
        thickness: f64,
        mu: f64,
    }

    impl PixelGeometry for Flat {
        fn origin(&self) -> Vec3 {
            Vec3::new(0.0, 0.0, 100.0)
        }
        fn fast_axis(&self) -> Vec3 {
            Vec3::x()
        }
        fn slow_axis(&self) -> Vec3 {
            Vec3::y()
        }
        fn pixel_size(&self) -> (f64, f64) {
            (0.1, 0.1)
        }
        fn image_size(&self) -> (usize, usize) {
            (100, 200)
        }
        fn thickness(&self) -> f64 {
            self.thickness
        }
        fn mu(&self) -> f64 {
            self.mu
        }
    }

    const SILICON: Flat = Flat {
        thickness: 0.32,
        mu: 3.96,
    };

    #[test]
    fn test_pixel_to_mm_scenario() {
        let mm = pixel_to_lab_mm(&SILICON, 10.0, 10.0).unwrap();
        assert_relative_eq!(mm.0, 1.0, epsilon = 1e-12);
        assert_relative_eq!(mm.1, 1.0, epsilon = 1e-12);
        let lab = mm_to_lab(&SILICON, mm);
        assert_relative_eq!(lab, Vec3::new(1.0, 1.0, 100.0), epsilon = 1e-12);
    }

    #[test]
    fn test_pixel_mm_round_trip_over_grid() {
        let xs = [0.0, 0.25, 17.3, 50.5, 99.99, 100.0];
        let ys = [0.0, 0.5, 33.3, 123.456, 199.5, 200.0];
        for &px in &xs {
            for &py in &ys {
                let mm = pixel_to_lab_mm(&SILICON, px, py).unwrap();
                let back = lab_mm_to_pixel(&SILICON, mm).unwrap();
                assert!((back.0 - px).abs() < 1e-9);
                assert!((back.1 - py).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_out_of_bounds_is_error() {
        assert!(matches!(
            pixel_to_lab_mm(&SILICON, -1.0, 0.0),
            Err(Error::OutOfBounds(_))
        ));
        assert!(matches!(
            pixel_to_lab_mm(&SILICON, 0.0, 200.5),
            Err(Error::OutOfBounds(_))
        ));
        assert!(matches!(
            lab_mm_to_pixel(&SILICON, (10.5, 0.0)),
            Err(Error::OutOfBounds(_))
        ));
        assert!(pixel_to_lab_mm(&SILICON, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_normal_incidence_has_no_shift() {
        let shift = parallax_shift(&SILICON, &Vec3::z()).unwrap();
        assert_relative_eq!(shift.0, 0.0, epsilon = 1e-15);
        assert_relative_eq!(shift.1, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_shift_equals_depth_tan_theta() {
        let theta = 30.0_f64.to_radians();
        let dir = Vec3::new(theta.sin(), 0.0, theta.cos());
        let shift = parallax_shift(&SILICON, &dir).unwrap();
        let path = attenuation_length(SILICON.mu, SILICON.thickness, theta.cos());
        let depth = path * theta.cos();
        assert_relative_eq!(shift.0, depth * theta.tan(), epsilon = 1e-12);
        assert_relative_eq!(shift.1, 0.0, epsilon = 1e-15);
        assert!(shift.0 > 0.0);
    }

    #[test]
    fn test_parallax_inverse_law() {
        let mm = (5.0, 10.0);
        for deg in (0..89).step_by(4) {
            let theta = f64::from(deg).to_radians();
            let dir = Vec3::new(theta.sin() * 0.6, theta.sin() * 0.8, theta.cos());
            let corrected = parallax_correct(&SILICON, mm, &dir).unwrap();
            let back = parallax_uncorrect(&SILICON, corrected, &dir).unwrap();
            assert!((back.0 - mm.0).abs() < 1e-9, "angle {deg}");
            assert!((back.1 - mm.1).abs() < 1e-9, "angle {deg}");
        }
    }

    #[test]
    fn test_parallax_rejects_grazing_direction() {
        let err = parallax_correct(&SILICON, (1.0, 1.0), &Vec3::x()).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds(_)));
        assert!(parallax_correct(&SILICON, (1.0, 1.0), &-Vec3::z()).is_err());
    }

    #[test]
    fn test_sample_derived_round_trip() {
        let mm = (9.0, 17.5);
        let corrected = parallax_correct_from_sample(&SILICON, mm).unwrap();
        assert!(corrected.0 < mm.0 && corrected.1 < mm.1);
        let back = parallax_uncorrect_from_sample(&SILICON, corrected).unwrap();
        assert!((back.0 - mm.0).abs() < 1e-9);
        assert!((back.1 - mm.1).abs() < 1e-9);
    }

    #[test]
    fn test_zero_thickness_is_identity() {
        let thin = Flat { thickness: 0.0, mu: 3.96 };
        let dir = Vec3::new(0.5, 0.0, 1.0);
        let corrected = parallax_correct(&thin, (3.0, 4.0), &dir).unwrap();
        assert_eq!(corrected, (3.0, 4.0));
    }
}
