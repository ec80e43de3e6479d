//! Mask configuration and its JSON schema.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::region::RegionSpec;

/// Sentinel values written by detectors for gaps and defective pixels.
pub const DEFAULT_SENTINELS: [i64; 2] = [-1, -2];

/// Configured mask layers.
///
/// JSON documents wrap the configuration in a `"mask"` object; every field
/// is optional and falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Mask pixels outside the panel's trusted range.
    pub use_trusted_range: bool,
    /// Mask pixels holding one of `sentinel_values`.
    pub mask_sentinels: bool,
    pub sentinel_values: Vec<i64>,
    /// Geometric exclusion regions.
    pub regions: Vec<RegionSpec>,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            use_trusted_range: true,
            mask_sentinels: true,
            sentinel_values: DEFAULT_SENTINELS.to_vec(),
            regions: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Default)]
struct JsonConfig {
    #[serde(default)]
    mask: MaskConfig,
}

impl MaskConfig {
    /// Disable the trusted-range layer.
    #[must_use]
    pub fn without_trusted_range(mut self) -> Self {
        self.use_trusted_range = false;
        self
    }

    /// Add an exclusion region.
    #[must_use]
    pub fn with_region(mut self, region: RegionSpec) -> Self {
        self.regions.push(region);
        self
    }

    /// Set the sentinel values.
    #[must_use]
    pub fn with_sentinels(mut self, values: Vec<i64>) -> Self {
        self.sentinel_values = values;
        self
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns I/O, JSON or region validation errors.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let json_config: JsonConfig = serde_json::from_reader(BufReader::new(file))?;
        json_config.mask.validated()
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns JSON or region validation errors.
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        json_config.mask.validated()
    }

    /// Serialize to the JSON schema read by [`MaskConfig::from_json`].
    ///
    /// # Errors
    /// Returns JSON serialization errors.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&JsonConfig { mask: self.clone() })?)
    }

    pub(crate) fn validated(self) -> Result<Self> {
        for region in &self.regions {
            region.validate()?;
        }
        Ok(self)
    }

    /// True if `value` is one of the configured sentinels.
    #[must_use]
    pub fn is_sentinel(&self, value: i64) -> bool {
        self.mask_sentinels && self.sentinel_values.contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn test_json_full_config() {
        let json = r#"{
            "mask": {
                "use_trusted_range": false,
                "sentinel_values": [-1, -2, -3],
                "regions": [
                    {"kind": "rectangle", "panel": 0, "x0": 0, "x1": 10, "y0": 0, "y1": 5},
                    {"kind": "resolution_limits", "d_min": 1.8}
                ]
            }
        }"#;
        let config = MaskConfig::from_json(json).unwrap();
        assert!(!config.use_trusted_range);
        assert!(config.mask_sentinels);
        assert!(config.is_sentinel(-3));
        assert_eq!(config.regions.len(), 2);
    }

    #[test]
    fn test_json_empty_mask_uses_defaults() {
        let config = MaskConfig::from_json(r#"{ "mask": {} }"#).unwrap();
        assert_eq!(config, MaskConfig::default());
        let config = MaskConfig::from_json("{}").unwrap();
        assert_eq!(config, MaskConfig::default());
    }

    #[test]
    fn test_json_rejects_invalid_region() {
        let json = r#"{"mask": {"regions": [{"kind": "circle", "centre": [1, 1], "radius": -4}]}}"#;
        assert!(matches!(
            MaskConfig::from_json(json),
            Err(Error::InvalidRegion(_))
        ));
        assert!(matches!(MaskConfig::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let config = MaskConfig::default()
            .with_region(RegionSpec::Circle {
                panel: Some(1),
                centre: [50.0, 60.0],
                radius: 12.0,
            })
            .with_sentinels(vec![-1]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();
        let loaded = MaskConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(!loaded.is_sentinel(-2));
    }
}
