//! Detector panel model.

use crate::error::{Error, Result};
use crate::math::{normalized, Mat3, Vec3, AXIS_TOLERANCE};
use crate::pixel::{
    lab_mm_to_pixel, mm_to_lab, parallax_correct_from_sample, parallax_uncorrect_from_sample,
    pixel_to_lab_mm, MmPosition, PixelGeometry,
};
use crate::sensor::SensorMaterial;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How a panel maps between pixel and millimetre coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PxMmStrategy {
    /// Plain scaling by pixel size.
    #[default]
    Simple,
    /// Scaling followed by parallax correction for rays from the sample.
    ParallaxCorrected,
}

/// One planar rectangular pixel array.
///
/// Inside a [`crate::Detector`] the origin and axes of a node are relative to
/// its parent group; panels handed out by the detector are resolved to the
/// lab frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Panel {
    name: String,
    panel_type: String,
    origin: Vec3,
    fast_axis: Vec3,
    slow_axis: Vec3,
    pixel_size: (f64, f64),
    image_size: (usize, usize),
    trusted_range: (f64, f64),
    gain: f64,
    pedestal: f64,
    thickness: f64,
    mu: f64,
    material: SensorMaterial,
    px_mm: PxMmStrategy,
}

pub(crate) fn check_axes(fast: &Vec3, slow: &Vec3) -> Result<(Vec3, Vec3)> {
    let fast = normalized(fast, "fast axis")?;
    let slow = normalized(slow, "slow axis")?;
    if fast.dot(&slow).abs() > AXIS_TOLERANCE {
        return Err(Error::InvalidModel(format!(
            "fast axis {fast:?} and slow axis {slow:?} are not orthogonal"
        )));
    }
    Ok((fast, slow))
}

impl Panel {
    /// Creates a panel with default calibration (full `i32` trusted range,
    /// unit gain, no sensor).
    ///
    /// # Errors
    /// Returns `InvalidModel` for non-orthogonal axes, non-positive pixel
    /// sizes or an empty image.
    pub fn new(
        name: impl Into<String>,
        origin: Vec3,
        fast_axis: Vec3,
        slow_axis: Vec3,
        pixel_size: (f64, f64),
        image_size: (usize, usize),
    ) -> Result<Self> {
        let (fast_axis, slow_axis) = check_axes(&fast_axis, &slow_axis)?;
        if !(pixel_size.0 > 0.0 && pixel_size.1 > 0.0) {
            return Err(Error::InvalidModel(format!(
                "pixel size must be positive, got {pixel_size:?}"
            )));
        }
        if image_size.0 == 0 || image_size.1 == 0 {
            return Err(Error::InvalidModel(format!(
                "image size must be non-empty, got {image_size:?}"
            )));
        }
        if !origin.iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidModel(format!("origin {origin:?} is not finite")));
        }
        Ok(Self {
            name: name.into(),
            panel_type: String::new(),
            origin,
            fast_axis,
            slow_axis,
            pixel_size,
            image_size,
            trusted_range: (f64::from(i32::MIN), f64::from(i32::MAX)),
            gain: 1.0,
            pedestal: 0.0,
            thickness: 0.0,
            mu: 0.0,
            material: SensorMaterial::Unknown,
            px_mm: PxMmStrategy::Simple,
        })
    }

    /// Sets the panel type label (e.g. `"SENSOR_PAD"`).
    #[must_use]
    pub fn with_type(mut self, panel_type: impl Into<String>) -> Self {
        self.panel_type = panel_type.into();
        self
    }

    /// Sets the inclusive trusted intensity range.
    ///
    /// # Errors
    /// Returns `InvalidModel` if `min > max`.
    pub fn with_trusted_range(mut self, min: f64, max: f64) -> Result<Self> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(Error::InvalidModel(format!(
                "trusted range [{min}, {max}] is empty"
            )));
        }
        self.trusted_range = (min, max);
        Ok(self)
    }

    #[must_use]
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    #[must_use]
    pub fn with_pedestal(mut self, pedestal: f64) -> Self {
        self.pedestal = pedestal;
        self
    }

    /// Sets sensor material, thickness (mm) and attenuation (1/mm).
    ///
    /// # Errors
    /// Returns `InvalidModel` for negative thickness or attenuation.
    pub fn with_sensor(
        mut self,
        material: SensorMaterial,
        thickness: f64,
        mu: f64,
    ) -> Result<Self> {
        if !(thickness >= 0.0 && mu >= 0.0) {
            return Err(Error::InvalidModel(format!(
                "sensor thickness {thickness} and mu {mu} must be non-negative"
            )));
        }
        self.material = material;
        self.thickness = thickness;
        self.mu = mu;
        Ok(self)
    }

    /// Sets the sensor with `mu` taken from the material's attenuation table.
    ///
    /// # Errors
    /// Propagates table lookup failures.
    pub fn with_sensor_at_wavelength(
        self,
        material: SensorMaterial,
        thickness: f64,
        wavelength: f64,
    ) -> Result<Self> {
        let mu = material.mu_per_mm(wavelength)?;
        self.with_sensor(material, thickness, mu)
    }

    #[must_use]
    pub fn with_px_mm_strategy(mut self, strategy: PxMmStrategy) -> Self {
        self.px_mm = strategy;
        self
    }

    /// Replaces origin and axes; used when resolving a hierarchy.
    pub(crate) fn with_frame(mut self, origin: Vec3, fast: Vec3, slow: Vec3) -> Self {
        self.origin = origin;
        self.fast_axis = fast;
        self.slow_axis = slow;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn panel_type(&self) -> &str {
        &self.panel_type
    }

    #[must_use]
    pub fn trusted_range(&self) -> (f64, f64) {
        self.trusted_range
    }

    #[must_use]
    pub fn gain(&self) -> f64 {
        self.gain
    }

    #[must_use]
    pub fn pedestal(&self) -> f64 {
        self.pedestal
    }

    #[must_use]
    pub fn material(&self) -> SensorMaterial {
        self.material
    }

    #[must_use]
    pub fn px_mm_strategy(&self) -> PxMmStrategy {
        self.px_mm
    }

    /// Number of pixels.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.image_size.0 * self.image_size.1
    }

    /// `D = [fast | slow | origin]`, mapping `(x_mm, y_mm, 1)` to the lab.
    #[must_use]
    pub fn d_matrix(&self) -> Mat3 {
        Mat3::from_columns(&[self.fast_axis, self.slow_axis, self.origin])
    }

    /// Signed distance from the sample to the panel plane along the normal.
    #[must_use]
    pub fn directed_distance(&self) -> f64 {
        self.origin.dot(&self.normal())
    }

    /// Lab position of a panel-local millimetre position.
    #[must_use]
    pub fn get_lab_coord(&self, mm: MmPosition) -> Vec3 {
        mm_to_lab(self, mm)
    }

    /// Point where the ray `s1` from the sample meets the panel plane, in
    /// panel-local millimetres.
    ///
    /// # Errors
    /// Returns `OutOfBounds` for rays parallel to the panel or pointing away
    /// from it. The point itself may lie outside the panel.
    pub fn ray_intersection(&self, s1: &Vec3) -> Result<MmPosition> {
        let d_inverse = self.d_matrix().try_inverse().ok_or_else(|| {
            Error::OutOfBounds(format!("panel {} plane passes through the sample", self.name))
        })?;
        let v = d_inverse * s1;
        if v.z <= 0.0 || !v.z.is_finite() {
            return Err(Error::OutOfBounds(format!(
                "ray {s1:?} does not intersect panel {}",
                self.name
            )));
        }
        Ok((v.x / v.z, v.y / v.z))
    }

    /// Panel-local millimetre position where the beam `s0` meets the plane.
    ///
    /// # Errors
    /// Same conditions as [`Panel::ray_intersection`].
    pub fn beam_centre(&self, s0: &Vec3) -> Result<MmPosition> {
        self.ray_intersection(s0)
    }

    /// Scattering angle 2θ (radians) at a pixel.
    ///
    /// # Errors
    /// Returns `OutOfBounds` for pixels outside the panel.
    pub fn two_theta_at_pixel(&self, s0: &Vec3, px: f64, py: f64) -> Result<f64> {
        let mm = self.pixel_to_millimeter(px, py)?;
        let s1 = self.get_lab_coord(mm);
        Ok(s0.angle(&s1))
    }

    /// Resolution `d = λ / (2 sin θ)` (Å) at a pixel; infinite at 2θ = 0.
    ///
    /// # Errors
    /// Returns `OutOfBounds` for pixels outside the panel.
    pub fn resolution_at_pixel(&self, s0: &Vec3, px: f64, py: f64) -> Result<f64> {
        let wavelength = 1.0 / s0.norm();
        let sin_theta = (self.two_theta_at_pixel(s0, px, py)? / 2.0).sin();
        if sin_theta <= 0.0 {
            return Ok(f64::INFINITY);
        }
        Ok(wavelength / (2.0 * sin_theta))
    }

    /// Pixel → millimetre, honouring the panel's strategy.
    ///
    /// # Errors
    /// Returns `OutOfBounds` for pixels outside the panel.
    pub fn pixel_to_millimeter(&self, px: f64, py: f64) -> Result<MmPosition> {
        let mm = pixel_to_lab_mm(self, px, py)?;
        match self.px_mm {
            PxMmStrategy::Simple => Ok(mm),
            PxMmStrategy::ParallaxCorrected => parallax_correct_from_sample(self, mm),
        }
    }

    /// Millimetre → pixel, inverse of [`Panel::pixel_to_millimeter`].
    ///
    /// # Errors
    /// Returns `OutOfBounds` for positions outside the panel.
    pub fn millimeter_to_pixel(&self, mm: MmPosition) -> Result<(f64, f64)> {
        let observed = match self.px_mm {
            PxMmStrategy::Simple => mm,
            PxMmStrategy::ParallaxCorrected => parallax_uncorrect_from_sample(self, mm)?,
        };
        lab_mm_to_pixel(self, observed)
    }

    /// Lab-frame corners of the panel, in pixel order (0,0), (nx,0), (0,ny), (nx,ny).
    #[must_use]
    pub fn corners(&self) -> [Vec3; 4] {
        let (wx, wy) = self.image_size_mm();
        [
            self.get_lab_coord((0.0, 0.0)),
            self.get_lab_coord((wx, 0.0)),
            self.get_lab_coord((0.0, wy)),
            self.get_lab_coord((wx, wy)),
        ]
    }

    /// True if `value` lies within the inclusive trusted range.
    #[must_use]
    pub fn is_trusted(&self, value: f64) -> bool {
        value >= self.trusted_range.0 && value <= self.trusted_range.1
    }
}

impl PixelGeometry for Panel {
    fn origin(&self) -> Vec3 {
        self.origin
    }

    fn fast_axis(&self) -> Vec3 {
        self.fast_axis
    }

    fn slow_axis(&self) -> Vec3 {
        self.slow_axis
    }

    fn pixel_size(&self) -> (f64, f64) {
        self.pixel_size
    }

    fn image_size(&self) -> (usize, usize) {
        self.image_size
    }

    fn thickness(&self) -> f64 {
        self.thickness
    }

    fn mu(&self) -> f64 {
        self.mu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn panel() -> Panel {
        Panel::new(
            "p0",
            Vec3::new(-10.0, -10.0, 100.0),
            Vec3::x(),
            Vec3::y(),
            (0.1, 0.1),
            (200, 200),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let o = Vec3::new(0.0, 0.0, 100.0);
        let skewed = Vec3::new(1.0, 1.0, 0.0);
        assert!(Panel::new("p", o, Vec3::x(), skewed, (0.1, 0.1), (10, 10)).is_err());
        assert!(Panel::new("p", o, Vec3::x(), Vec3::y(), (0.0, 0.1), (10, 10)).is_err());
        assert!(Panel::new("p", o, Vec3::x(), Vec3::y(), (0.1, 0.1), (0, 10)).is_err());
        assert!(Panel::new("p", o, Vec3::zeros(), Vec3::y(), (0.1, 0.1), (10, 10)).is_err());
        assert!(panel().with_trusted_range(10.0, 0.0).is_err());
        assert!(panel().with_sensor(SensorMaterial::Si, -1.0, 1.0).is_err());
    }

    #[test]
    fn test_beam_centre_and_distance() {
        let p = panel();
        let (x, y) = p.beam_centre(&Vec3::new(0.0, 0.0, 1.0)).unwrap();
        assert_relative_eq!(x, 10.0, epsilon = 1e-12);
        assert_relative_eq!(y, 10.0, epsilon = 1e-12);
        assert_relative_eq!(p.directed_distance(), 100.0);
        assert!(p.ray_intersection(&Vec3::new(0.0, 0.0, -1.0)).is_err());
        assert!(p.ray_intersection(&Vec3::x()).is_err());
    }

    #[test]
    fn test_two_theta_and_resolution() {
        let p = panel();
        let s0 = Vec3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(p.two_theta_at_pixel(&s0, 100.0, 100.0).unwrap(), 0.0, epsilon = 1e-12);
        assert!(p.resolution_at_pixel(&s0, 100.0, 100.0).unwrap().is_infinite());
        // 10 mm off axis at 100 mm: tan(2θ) = 0.1
        let two_theta = p.two_theta_at_pixel(&s0, 200.0, 100.0).unwrap();
        assert_relative_eq!(two_theta, 0.1_f64.atan(), epsilon = 1e-12);
        let d = p.resolution_at_pixel(&s0, 200.0, 100.0).unwrap();
        assert_relative_eq!(d, 1.0 / (2.0 * (two_theta / 2.0).sin()), epsilon = 1e-9);
        assert!(p.two_theta_at_pixel(&s0, 201.0, 0.0).is_err());
    }

    #[test]
    fn test_parallax_strategy_round_trip() {
        let p = panel()
            .with_sensor(SensorMaterial::Si, 0.45, 3.9)
            .unwrap()
            .with_px_mm_strategy(PxMmStrategy::ParallaxCorrected);
        let simple = panel();
        let mm = p.pixel_to_millimeter(150.0, 170.0).unwrap();
        let plain = simple.pixel_to_millimeter(150.0, 170.0).unwrap();
        assert!(mm.0 < plain.0 && mm.1 < plain.1);
        let (px, py) = p.millimeter_to_pixel(mm).unwrap();
        assert_relative_eq!(px, 150.0, epsilon = 1e-8);
        assert_relative_eq!(py, 170.0, epsilon = 1e-8);
    }

    #[test]
    fn test_trusted_range_is_inclusive() {
        let p = panel().with_trusted_range(0.0, 100.0).unwrap();
        assert!(p.is_trusted(0.0));
        assert!(p.is_trusted(100.0));
        assert!(!p.is_trusted(100.5));
        assert!(!p.is_trusted(-1.0));
    }
}
