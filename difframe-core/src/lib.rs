//! difframe-core: Geometry model and pixel calibration for diffraction experiments.
//!
//! This crate provides the beam, detector, goniometer, scan and crystal
//! models, scan-varying value resolution, and the pixel↔millimetre and
//! parallax transforms every geometry consumer depends on.
//!

pub mod beam;
pub mod crystal;
pub mod detector;
pub mod error;
pub mod goniometer;
pub mod math;
pub mod panel;
pub mod pixel;
pub mod scan;
pub mod scan_varying;
pub mod sensor;
pub mod spectrum;

pub use beam::{Beam, WavelengthCalibration};
pub use crystal::{Crystal, UnitCell};
pub use detector::{Detector, DetectorBuilder, DetectorFactory, DetectorNode, Frame};
pub use error::{Error, Result};
pub use goniometer::{Goniometer, GoniometerAxis};
pub use math::{Mat3, Vec3};
pub use panel::{Panel, PxMmStrategy};
pub use pixel::{
    lab_mm_to_pixel, parallax_correct, parallax_uncorrect, pixel_to_lab_mm, MmPosition,
    PixelGeometry,
};
pub use scan::Scan;
pub use scan_varying::{Interpolate, ScanVarying};
pub use sensor::SensorMaterial;
pub use spectrum::{Spectrum, SpectrumCheck};
