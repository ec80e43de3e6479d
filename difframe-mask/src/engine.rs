//! Combination of mask layers into per-panel usability grids.
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use difframe_core::{pixel_to_lab_mm, Detector, Panel, PixelGeometry, Vec3};
use ndarray::Array2;
use rayon::prelude::*;

use crate::config::MaskConfig;
use crate::error::{Error, Result};
use crate::region::Region;

/// Masking engine: static masks, trusted range, sentinels and regions.
///
/// Grids are indexed `[[slow, fast]]`; `true` marks a usable pixel. Every
/// call returns a fresh grid and the layers are combined with logical AND,
/// so their order does not matter.
#[derive(Debug, Clone, Default)]
pub struct MaskEngine {
    config: MaskConfig,
    static_masks: BTreeMap<usize, Array2<bool>>,
    regions: Vec<Region>,
}

fn panel_shape(panel: &Panel) -> (usize, usize) {
    let (nx, ny) = panel.image_size();
    (ny, nx)
}

impl MaskEngine {
    /// Engine with the layers of `config`.
    ///
    /// # Errors
    /// Returns `InvalidRegion` if a configured region is degenerate.
    pub fn new(config: MaskConfig) -> Result<Self> {
        let config = config.validated()?;
        let regions = config.regions.iter().cloned().map(Region::from).collect();
        Ok(Self {
            config,
            static_masks: BTreeMap::new(),
            regions,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MaskConfig {
        &self.config
    }

    /// Adds a region (including closures not expressible in the config).
    ///
    /// # Errors
    /// Returns `InvalidRegion` for a degenerate serializable region.
    pub fn with_region(mut self, region: Region) -> Result<Self> {
        region.validate()?;
        self.regions.push(region);
        Ok(self)
    }

    /// ANDs a static bad-pixel mask into the layer for `panel`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if a mask for the panel already exists with a
    /// different shape.
    pub fn add_static_mask(&mut self, panel: usize, mask: Array2<bool>) -> Result<()> {
        match self.static_masks.get_mut(&panel) {
            Some(existing) => {
                if existing.dim() != mask.dim() {
                    return Err(Error::ShapeMismatch {
                        panel,
                        expected: existing.dim(),
                        got: mask.dim(),
                    });
                }
                existing.zip_mut_with(&mask, |a, &b| *a = *a && b);
            }
            None => {
                self.static_masks.insert(panel, mask);
            }
        }
        Ok(())
    }

    /// Builder form of [`MaskEngine::add_static_mask`].
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if a mask for the panel already exists with a
    /// different shape.
    pub fn with_static_mask(mut self, panel: usize, mask: Array2<bool>) -> Result<Self> {
        self.add_static_mask(panel, mask)?;
        Ok(self)
    }

    #[must_use]
    pub fn static_mask(&self, panel: usize) -> Option<&Array2<bool>> {
        self.static_masks.get(&panel)
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// True if some layer needs the incident beam.
    #[must_use]
    pub fn needs_beam(&self) -> bool {
        self.regions.iter().any(Region::needs_beam)
    }

    /// Usability grid for one panel.
    ///
    /// `s0` is required only by resolution regions.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `raw` or the static mask does not match the
    /// panel, and `InvalidRegion` if a resolution region has no beam.
    pub fn compute_mask(
        &self,
        panel_index: usize,
        panel: &Panel,
        raw: &Array2<i64>,
        s0: Option<&Vec3>,
    ) -> Result<Array2<bool>> {
        let shape = panel_shape(panel);
        if raw.dim() != shape {
            return Err(Error::ShapeMismatch {
                panel: panel_index,
                expected: shape,
                got: raw.dim(),
            });
        }

        let mut mask = match self.static_masks.get(&panel_index) {
            Some(static_mask) if static_mask.dim() != shape => {
                return Err(Error::ShapeMismatch {
                    panel: panel_index,
                    expected: shape,
                    got: static_mask.dim(),
                })
            }
            Some(static_mask) => static_mask.clone(),
            None => Array2::from_elem(shape, true),
        };

        let (min, max) = panel.trusted_range();
        mask.zip_mut_with(raw, |usable, &value| {
            if self.config.use_trusted_range {
                let v = value as f64;
                *usable = *usable && v >= min && v <= max;
            }
            if self.config.is_sentinel(value) {
                *usable = false;
            }
        });

        let regions: Vec<&Region> = self
            .regions
            .iter()
            .filter(|region| region.applies_to(panel_index))
            .collect();
        if regions.is_empty() {
            return Ok(mask);
        }
        for ((y, x), usable) in mask.indexed_iter_mut() {
            if !*usable {
                continue;
            }
            let centre = (x as f64 + 0.5, y as f64 + 0.5);
            let mm = pixel_to_lab_mm(panel, centre.0, centre.1)?;
            for region in &regions {
                if region.excludes(panel_index, panel, centre, mm, s0)? {
                    *usable = false;
                    break;
                }
            }
        }
        Ok(mask)
    }

    /// Usability grids for every panel of a detector, computed in parallel.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the number of frames differs from the
    /// number of panels, or any per-panel error.
    pub fn compute_detector_mask(
        &self,
        detector: &Detector,
        raw: &[Array2<i64>],
        s0: Option<&Vec3>,
    ) -> Result<Vec<Array2<bool>>> {
        if raw.len() != detector.num_panels() {
            return Err(Error::ShapeMismatch {
                panel: raw.len(),
                expected: (detector.num_panels(), 0),
                got: (raw.len(), 0),
            });
        }
        log::debug!(
            "computing masks for {} panels ({} regions)",
            raw.len(),
            self.regions.len()
        );
        detector
            .panels()
            .par_iter()
            .zip(raw.par_iter())
            .enumerate()
            .map(|(index, (panel, data))| self.compute_mask(index, panel, data, s0))
            .collect()
    }
}
