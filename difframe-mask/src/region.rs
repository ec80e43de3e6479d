//! Geometric exclusion regions.

use std::fmt;
use std::sync::Arc;

use difframe_core::{MmPosition, Panel, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Predicate over `(panel index, panel, millimetre position)`; returning
/// true excludes the pixel.
pub type RegionPredicate = Arc<dyn Fn(usize, &Panel, MmPosition) -> bool + Send + Sync>;

/// Serializable exclusion region.
///
/// Circle and rectangle are in pixel coordinates, polygon in panel-local
/// millimetres. A missing `panel` applies the region to every panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionSpec {
    Circle {
        #[serde(default)]
        panel: Option<usize>,
        centre: [f64; 2],
        radius: f64,
    },
    /// Half-open `[x0, x1) x [y0, y1)`.
    Rectangle {
        #[serde(default)]
        panel: Option<usize>,
        x0: f64,
        x1: f64,
        y0: f64,
        y1: f64,
    },
    Polygon {
        #[serde(default)]
        panel: Option<usize>,
        vertices: Vec<[f64; 2]>,
    },
    /// Excludes pixels with resolution beyond the limits.
    ResolutionLimits {
        #[serde(default)]
        d_min: Option<f64>,
        #[serde(default)]
        d_max: Option<f64>,
    },
    /// Excludes pixels with `d_min <= d <= d_max` (e.g. an ice ring).
    ResolutionRange { d_min: f64, d_max: f64 },
}

impl RegionSpec {
    /// Checks the parameters of the region.
    ///
    /// # Errors
    /// Returns `InvalidRegion` for degenerate or non-finite parameters.
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            Self::Circle { centre, radius, .. } => {
                centre.iter().all(|v| v.is_finite()) && radius.is_finite() && *radius > 0.0
            }
            Self::Rectangle { x0, x1, y0, y1, .. } => x0 < x1 && y0 < y1,
            Self::Polygon { vertices, .. } => {
                vertices.len() >= 3 && vertices.iter().flatten().all(|v| v.is_finite())
            }
            Self::ResolutionLimits { d_min, d_max } => match (d_min, d_max) {
                (Some(lo), Some(hi)) => *lo > 0.0 && lo < hi,
                (Some(lo), None) => *lo > 0.0,
                (None, Some(hi)) => *hi > 0.0,
                (None, None) => false,
            },
            Self::ResolutionRange { d_min, d_max } => *d_min > 0.0 && d_min < d_max,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidRegion(format!("{self:?}")))
        }
    }

    fn applies_to(&self, panel_index: usize) -> bool {
        match self {
            Self::Circle { panel, .. }
            | Self::Rectangle { panel, .. }
            | Self::Polygon { panel, .. } => panel.map_or(true, |p| p == panel_index),
            Self::ResolutionLimits { .. } | Self::ResolutionRange { .. } => true,
        }
    }

    fn needs_beam(&self) -> bool {
        matches!(
            self,
            Self::ResolutionLimits { .. } | Self::ResolutionRange { .. }
        )
    }
}

/// Even-odd point-in-polygon test.
fn point_in_polygon(point: MmPosition, vertices: &[[f64; 2]]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let (x, y) = point;
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let [xi, yi] = vertices[i];
        let [xj, yj] = vertices[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// One exclusion layer of the masking engine.
#[derive(Clone)]
pub enum Region {
    Spec(RegionSpec),
    Predicate {
        name: String,
        excludes: RegionPredicate,
    },
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spec(spec) => f.debug_tuple("Spec").field(spec).finish(),
            Self::Predicate { name, .. } => f
                .debug_struct("Predicate")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

impl From<RegionSpec> for Region {
    fn from(spec: RegionSpec) -> Self {
        Self::Spec(spec)
    }
}

impl Region {
    /// Wraps a closure as a region.
    pub fn predicate<F>(name: impl Into<String>, excludes: F) -> Self
    where
        F: Fn(usize, &Panel, MmPosition) -> bool + Send + Sync + 'static,
    {
        Self::Predicate {
            name: name.into(),
            excludes: Arc::new(excludes),
        }
    }

    /// Checks the parameters of a serializable region; closures always pass.
    ///
    /// # Errors
    /// Returns `InvalidRegion` for degenerate or non-finite parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Spec(spec) => spec.validate(),
            Self::Predicate { .. } => Ok(()),
        }
    }

    /// True if evaluating the region requires the incident beam.
    #[must_use]
    pub fn needs_beam(&self) -> bool {
        match self {
            Self::Spec(spec) => spec.needs_beam(),
            Self::Predicate { .. } => false,
        }
    }

    #[must_use]
    pub fn applies_to(&self, panel_index: usize) -> bool {
        match self {
            Self::Spec(spec) => spec.applies_to(panel_index),
            Self::Predicate { .. } => true,
        }
    }

    /// Returns true if the pixel centred at `(px, py)`, at millimetre
    /// position `mm`, is excluded.
    ///
    /// # Errors
    /// Returns `InvalidRegion` for resolution regions without a beam and
    /// propagates geometry errors.
    pub fn excludes(
        &self,
        panel_index: usize,
        panel: &Panel,
        (px, py): (f64, f64),
        mm: MmPosition,
        s0: Option<&Vec3>,
    ) -> Result<bool> {
        let spec = match self {
            Self::Predicate { excludes, .. } => return Ok(excludes(panel_index, panel, mm)),
            Self::Spec(spec) => spec,
        };
        let resolution = || -> Result<f64> {
            let s0 = s0.ok_or_else(|| {
                Error::InvalidRegion("resolution region needs an incident beam".to_string())
            })?;
            Ok(panel.resolution_at_pixel(s0, px, py)?)
        };
        Ok(match spec {
            RegionSpec::Circle { centre, radius, .. } => {
                (px - centre[0]).hypot(py - centre[1]) <= *radius
            }
            RegionSpec::Rectangle { x0, x1, y0, y1, .. } => {
                px >= *x0 && px < *x1 && py >= *y0 && py < *y1
            }
            RegionSpec::Polygon { vertices, .. } => point_in_polygon(mm, vertices),
            RegionSpec::ResolutionLimits { d_min, d_max } => {
                let d = resolution()?;
                d_min.is_some_and(|lo| d < lo) || d_max.is_some_and(|hi| d > hi)
            }
            RegionSpec::ResolutionRange { d_min, d_max } => {
                let d = resolution()?;
                d >= *d_min && d <= *d_max
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_in_polygon() {
        let square = [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]];
        assert!(point_in_polygon((1.0, 1.0), &square));
        assert!(!point_in_polygon((3.0, 1.0), &square));
        let triangle = [[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]];
        assert!(point_in_polygon((1.0, 1.0), &triangle));
        assert!(!point_in_polygon((3.0, 3.0), &triangle));
    }

    #[test]
    fn test_validate() {
        assert!(RegionSpec::Circle { panel: None, centre: [1.0, 1.0], radius: 0.0 }
            .validate()
            .is_err());
        assert!(RegionSpec::Rectangle { panel: None, x0: 5.0, x1: 5.0, y0: 0.0, y1: 1.0 }
            .validate()
            .is_err());
        assert!(RegionSpec::Polygon { panel: None, vertices: vec![[0.0, 0.0], [1.0, 1.0]] }
            .validate()
            .is_err());
        assert!(RegionSpec::ResolutionLimits { d_min: None, d_max: None }.validate().is_err());
        assert!(RegionSpec::ResolutionRange { d_min: 3.9, d_max: 3.8 }.validate().is_err());
        assert!(RegionSpec::ResolutionLimits { d_min: Some(1.5), d_max: None }.validate().is_ok());
    }

    #[test]
    fn test_spec_json_tagging() {
        let json = r#"{"kind": "circle", "centre": [10.0, 20.0], "radius": 5.0}"#;
        let spec: RegionSpec = serde_json::from_str(json).unwrap();
        assert_eq!(
            spec,
            RegionSpec::Circle {
                panel: None,
                centre: [10.0, 20.0],
                radius: 5.0
            }
        );
        let json = r#"{"kind": "resolution_range", "d_min": 3.87, "d_max": 3.93}"#;
        let spec: RegionSpec = serde_json::from_str(json).unwrap();
        assert!(matches!(spec, RegionSpec::ResolutionRange { .. }));
    }
}
