//! difframe-mask: Multi-layer pixel masking for detector frames.
//!
//! A [`MaskEngine`] combines, with logical AND:
//! - static per-panel bad-pixel masks
//! - the panel trusted range and detector sentinel values
//! - geometric exclusion [`Region`]s in pixel, millimetre or resolution space
//!
//! Layers can be configured from JSON through [`MaskConfig`].

mod config;
mod engine;
mod error;
mod region;

pub use config::{MaskConfig, DEFAULT_SENTINELS};
pub use engine::MaskEngine;
pub use error::{Error, Result};
pub use region::{Region, RegionPredicate, RegionSpec};
