//! difframe-io: Format readers, image sets and experiment lists.
//!
//! Raw frames come from a [`FormatReader`] chosen once by magic-byte
//! detection. An [`ImageSet`] binds a reader to its geometry and decodes,
//! calibrates and masks frames on request; an [`ExperimentList`] collects
//! validated [`Experiment`]s that may share models.
//!

pub mod cbf;
mod error;
mod experiment;
mod imageset;
#[cfg(feature = "hdf5")]
pub mod nexus;
mod options;
mod reader;
mod registry;
pub mod smv;

pub use cbf::{write_minicbf, CbfReader, PilatusHeader};
pub use error::{Error, Result};
pub use experiment::{Experiment, ExperimentBuilder, ExperimentList};
pub use imageset::{GeometrySnapshot, ImageFrame, ImageSet};
#[cfg(feature = "hdf5")]
pub use nexus::NexusReader;
pub use options::FormatOptions;
pub use reader::{FormatReader, InMemoryReader, MappedFile, RawFrame, RawPanel};
pub use registry::{detect_format, open_reader, open_source, FormatKind, ImageSource};
pub use smv::{write_smv, SmvHeader, SmvReader};
