//! Validated experiment bundles and ordered experiment lists.
//!
//! Models are held behind [`Arc`] so several experiments can share one
//! beam, detector, goniometer, scan or image set. Sharing is tracked by
//! pointer identity and survives JSON persistence: each distinct model is
//! stored once in a table and experiments refer to it by position.

use std::fs::File;
use std::io::BufReader;
use std::ops::Index;
use std::path::Path;
use std::sync::Arc;

use difframe_core::{Beam, Crystal, Detector, Goniometer, Mat3, Scan, ScanVarying};
use difframe_mask::MaskConfig;
use serde::{Deserialize, Serialize};

use crate::imageset::ImageSet;
use crate::registry::{open_source, ImageSource};
use crate::{Error, Result};

/// One consistent set of models and the frames they describe.
#[derive(Debug, Clone)]
pub struct Experiment {
    identifier: String,
    beam: Option<Arc<ScanVarying<Beam>>>,
    detector: Option<Arc<Detector>>,
    goniometer: Option<Arc<Goniometer>>,
    scan: Option<Arc<Scan>>,
    crystal: Option<Arc<ScanVarying<Crystal>>>,
    imageset: Option<Arc<ImageSet>>,
    independent_models: bool,
}

/// Collects the parts of an [`Experiment`]; nothing is observable until
/// [`ExperimentBuilder::build`] has validated them.
#[derive(Debug, Clone, Default)]
pub struct ExperimentBuilder {
    identifier: String,
    beam: Option<Arc<ScanVarying<Beam>>>,
    detector: Option<Arc<Detector>>,
    goniometer: Option<Arc<Goniometer>>,
    scan: Option<Arc<Scan>>,
    crystal: Option<Arc<ScanVarying<Crystal>>>,
    imageset: Option<Arc<ImageSet>>,
    independent_models: bool,
}

fn same_model<T: PartialEq>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::ptr_eq(a, b) || **a == **b
}

fn check_shared<T: PartialEq>(
    name: &str,
    experiment: Option<&Arc<T>>,
    imageset: Option<&Arc<T>>,
) -> Result<()> {
    match (experiment, imageset) {
        (Some(a), Some(b)) if !same_model(a, b) => Err(Error::InconsistentExperiment(format!(
            "{name} differs from the {name} of the image set"
        ))),
        _ => Ok(()),
    }
}

fn check_samples<T: difframe_core::Interpolate>(
    name: &str,
    value: Option<&Arc<ScanVarying<T>>>,
    scan: Option<&Arc<Scan>>,
) -> Result<()> {
    let Some(value) = value.filter(|value| value.is_scan_varying()) else {
        return Ok(());
    };
    let scan = scan.ok_or_else(|| {
        Error::InconsistentExperiment(format!("scan-varying {name} without a scan"))
    })?;
    value
        .check_against(scan)
        .map_err(|err| Error::InconsistentExperiment(format!("{name}: {err}")))
}

impl ExperimentBuilder {
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn beam(mut self, beam: Arc<ScanVarying<Beam>>) -> Self {
        self.beam = Some(beam);
        self
    }

    #[must_use]
    pub fn detector(mut self, detector: Arc<Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    #[must_use]
    pub fn goniometer(mut self, goniometer: Arc<Goniometer>) -> Self {
        self.goniometer = Some(goniometer);
        self
    }

    #[must_use]
    pub fn scan(mut self, scan: Arc<Scan>) -> Self {
        self.scan = Some(scan);
        self
    }

    #[must_use]
    pub fn crystal(mut self, crystal: Arc<ScanVarying<Crystal>>) -> Self {
        self.crystal = Some(crystal);
        self
    }

    #[must_use]
    pub fn imageset(mut self, imageset: Arc<ImageSet>) -> Self {
        self.imageset = Some(imageset);
        self
    }

    /// Declares the models as copies that need only be equal in value, not
    /// shared, with siblings reading the same image set.
    #[must_use]
    pub fn independent_models(mut self) -> Self {
        self.independent_models = true;
        self
    }

    /// Validates and assembles the experiment.
    ///
    /// # Errors
    /// Returns `InconsistentExperiment` for an empty identifier, a scan
    /// whose length differs from the image set, scan-varying models that do
    /// not fit the scan, or models that disagree with the image set's.
    pub fn build(self) -> Result<Experiment> {
        if self.identifier.is_empty() {
            return Err(Error::InconsistentExperiment(
                "experiment identifier is empty".to_string(),
            ));
        }
        if let Some(imageset) = &self.imageset {
            if let Some(scan) = &self.scan {
                if scan.num_images() != imageset.len() {
                    return Err(Error::InconsistentExperiment(format!(
                        "{}: scan {:?} has {} images, image set has {}",
                        self.identifier,
                        scan.image_range(),
                        scan.num_images(),
                        imageset.len()
                    )));
                }
            }
            check_shared("beam", self.beam.as_ref(), imageset.beam())?;
            check_shared("detector", self.detector.as_ref(), Some(imageset.detector()))?;
            check_shared("goniometer", self.goniometer.as_ref(), imageset.goniometer())?;
            check_shared("scan", self.scan.as_ref(), imageset.scan())?;
        }
        check_samples("beam", self.beam.as_ref(), self.scan.as_ref())?;
        check_samples("crystal", self.crystal.as_ref(), self.scan.as_ref())?;

        Ok(Experiment {
            identifier: self.identifier,
            beam: self.beam,
            detector: self.detector,
            goniometer: self.goniometer,
            scan: self.scan,
            crystal: self.crystal,
            imageset: self.imageset,
            independent_models: self.independent_models,
        })
    }
}

impl Experiment {
    /// Builder preloaded with the image set and the models it carries.
    #[must_use]
    pub fn from_imageset(
        identifier: impl Into<String>,
        imageset: Arc<ImageSet>,
    ) -> ExperimentBuilder {
        let mut builder =
            ExperimentBuilder::new(identifier).detector(Arc::clone(imageset.detector()));
        builder.beam = imageset.beam().cloned();
        builder.goniometer = imageset.goniometer().cloned();
        builder.scan = imageset.scan().cloned();
        builder.imageset(imageset)
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn beam(&self) -> Option<&Arc<ScanVarying<Beam>>> {
        self.beam.as_ref()
    }

    #[must_use]
    pub fn detector(&self) -> Option<&Arc<Detector>> {
        self.detector.as_ref()
    }

    #[must_use]
    pub fn goniometer(&self) -> Option<&Arc<Goniometer>> {
        self.goniometer.as_ref()
    }

    #[must_use]
    pub fn scan(&self) -> Option<&Arc<Scan>> {
        self.scan.as_ref()
    }

    #[must_use]
    pub fn crystal(&self) -> Option<&Arc<ScanVarying<Crystal>>> {
        self.crystal.as_ref()
    }

    #[must_use]
    pub fn imageset(&self) -> Option<&Arc<ImageSet>> {
        self.imageset.as_ref()
    }

    #[must_use]
    pub fn has_independent_models(&self) -> bool {
        self.independent_models
    }

    /// Beam at a (possibly fractional) image index.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` (core) for indices outside the scan.
    pub fn get_beam(&self, image_index: f64) -> Result<Option<Beam>> {
        let scan = self.scan.as_deref();
        Ok(self
            .beam
            .as_ref()
            .map(|beam| beam.at_image(scan, image_index))
            .transpose()?)
    }

    /// Crystal at a (possibly fractional) image index.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` (core) for indices outside the scan and
    /// `InvalidModel` (core) when the interpolated setting matrix does not
    /// decompose into a cell and orientation.
    pub fn get_crystal(&self, image_index: f64) -> Result<Option<Crystal>> {
        let scan = self.scan.as_deref();
        Ok(self
            .crystal
            .as_ref()
            .map(|crystal| crystal.at_image(scan, image_index))
            .transpose()?)
    }

    /// Goniometer rotation at a (possibly fractional) image index.
    ///
    /// # Errors
    /// Returns core errors for indices outside the scan.
    pub fn setting_rotation(&self, image_index: f64) -> Result<Option<Mat3>> {
        let scan = self.scan.as_deref();
        Ok(self
            .goniometer
            .as_ref()
            .map(|goniometer| goniometer.setting_rotation(scan, image_index))
            .transpose()?)
    }
}

/// Ordered experiments with unique identifiers.
#[derive(Debug, Clone, Default)]
pub struct ExperimentList {
    experiments: Vec<Experiment>,
}

fn shares<T>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => true,
    }
}

fn unique<'a, T: 'a>(items: impl Iterator<Item = &'a Arc<T>>) -> Vec<Arc<T>> {
    let mut found: Vec<Arc<T>> = Vec::new();
    for item in items {
        if !found.iter().any(|known| Arc::ptr_eq(known, item)) {
            found.push(Arc::clone(item));
        }
    }
    found
}

fn position<T>(table: &[Arc<T>], item: Option<&Arc<T>>) -> Option<usize> {
    item.and_then(|item| table.iter().position(|known| Arc::ptr_eq(known, item)))
}

impl ExperimentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an experiment after validating it against the list.
    ///
    /// # Errors
    /// Returns `InconsistentExperiment` for a duplicate identifier, or when
    /// an experiment reading the same image set holds different model
    /// objects without declaring independent copies.
    pub fn append(&mut self, experiment: Experiment) -> Result<()> {
        if self.find(&experiment.identifier).is_some() {
            return Err(Error::InconsistentExperiment(format!(
                "duplicate experiment identifier '{}'",
                experiment.identifier
            )));
        }
        if let Some(imageset) = &experiment.imageset {
            for sibling in self.where_imageset(imageset) {
                if experiment.independent_models || sibling.independent_models {
                    continue;
                }
                let shared = shares(experiment.beam(), sibling.beam())
                    && shares(experiment.detector(), sibling.detector())
                    && shares(experiment.goniometer(), sibling.goniometer())
                    && shares(experiment.scan(), sibling.scan());
                if !shared {
                    return Err(Error::InconsistentExperiment(format!(
                        "'{}' and '{}' read the same image set through different models",
                        experiment.identifier, sibling.identifier
                    )));
                }
            }
        }
        log::info!(
            "appended experiment '{}' ({} in list)",
            experiment.identifier,
            self.experiments.len() + 1
        );
        self.experiments.push(experiment);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Experiment> {
        self.experiments.iter()
    }

    /// Experiment with the given identifier.
    #[must_use]
    pub fn find(&self, identifier: &str) -> Option<&Experiment> {
        self.experiments
            .iter()
            .find(|experiment| experiment.identifier == identifier)
    }

    #[must_use]
    pub fn identifiers(&self) -> Vec<&str> {
        self.experiments.iter().map(Experiment::identifier).collect()
    }

    /// Experiments reading `imageset` (by identity).
    #[must_use]
    pub fn where_imageset(&self, imageset: &Arc<ImageSet>) -> Vec<&Experiment> {
        self.experiments
            .iter()
            .filter(|experiment| {
                experiment
                    .imageset
                    .as_ref()
                    .is_some_and(|own| Arc::ptr_eq(own, imageset))
            })
            .collect()
    }

    /// Distinct beams, in order of first use.
    #[must_use]
    pub fn beams(&self) -> Vec<Arc<ScanVarying<Beam>>> {
        unique(self.experiments.iter().filter_map(Experiment::beam))
    }

    #[must_use]
    pub fn detectors(&self) -> Vec<Arc<Detector>> {
        unique(self.experiments.iter().filter_map(Experiment::detector))
    }

    #[must_use]
    pub fn goniometers(&self) -> Vec<Arc<Goniometer>> {
        unique(self.experiments.iter().filter_map(Experiment::goniometer))
    }

    #[must_use]
    pub fn scans(&self) -> Vec<Arc<Scan>> {
        unique(self.experiments.iter().filter_map(Experiment::scan))
    }

    #[must_use]
    pub fn crystals(&self) -> Vec<Arc<ScanVarying<Crystal>>> {
        unique(self.experiments.iter().filter_map(Experiment::crystal))
    }

    #[must_use]
    pub fn imagesets(&self) -> Vec<Arc<ImageSet>> {
        unique(self.experiments.iter().filter_map(Experiment::imageset))
    }

    fn to_document(&self) -> ExperimentListDocument {
        let beams = self.beams();
        let detectors = self.detectors();
        let goniometers = self.goniometers();
        let scans = self.scans();
        let crystals = self.crystals();
        let imagesets = self.imagesets();
        let experiments = self
            .experiments
            .iter()
            .map(|experiment| ExperimentEntry {
                identifier: experiment.identifier.clone(),
                beam: position(&beams, experiment.beam()),
                detector: position(&detectors, experiment.detector()),
                goniometer: position(&goniometers, experiment.goniometer()),
                scan: position(&scans, experiment.scan()),
                crystal: position(&crystals, experiment.crystal()),
                imageset: position(&imagesets, experiment.imageset()),
                independent_models: experiment.independent_models,
            })
            .collect();
        ExperimentListDocument {
            experiments,
            beams: beams.iter().map(|beam| (**beam).clone()).collect(),
            detectors: detectors.iter().map(|detector| (**detector).clone()).collect(),
            goniometers: goniometers.iter().map(|goniometer| (**goniometer).clone()).collect(),
            scans: scans.iter().map(|scan| (**scan).clone()).collect(),
            crystals: crystals.iter().map(|crystal| (**crystal).clone()).collect(),
            imagesets: imagesets
                .iter()
                .map(|imageset| ImageSetEntry {
                    source: imageset.source(),
                    indices: imageset.reader_indices().to_vec(),
                    mask: imageset.mask_engine().config().clone(),
                })
                .collect(),
        }
    }

    /// Serializes the list with each shared model stored once.
    ///
    /// Closure regions added to an image set's mask engine are not
    /// persisted; the mask configuration is.
    ///
    /// # Errors
    /// Returns `Json` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    /// Rebuilds a list written by [`ExperimentList::to_json`].
    ///
    /// With `open_imagesets` the image sets are re-opened from their
    /// recorded sources and bound to the experiments' models; otherwise the
    /// experiments carry models only.
    ///
    /// # Errors
    /// Returns `Json` for malformed documents, `InvalidFormat` for dangling
    /// table references or image sets without a source, reader errors, and
    /// validation errors from the experiments.
    pub fn from_json(json: &str, open_imagesets: bool) -> Result<Self> {
        let document: ExperimentListDocument = serde_json::from_str(json)?;
        document.into_list(open_imagesets)
    }

    /// Reads a list from a JSON file.
    ///
    /// # Errors
    /// Returns I/O errors and the errors of [`ExperimentList::from_json`].
    pub fn from_file<P: AsRef<Path>>(path: P, open_imagesets: bool) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let document: ExperimentListDocument = serde_json::from_reader(reader)?;
        document.into_list(open_imagesets)
    }
}

impl Index<usize> for ExperimentList {
    type Output = Experiment;

    fn index(&self, index: usize) -> &Experiment {
        &self.experiments[index]
    }
}

impl<'a> IntoIterator for &'a ExperimentList {
    type Item = &'a Experiment;
    type IntoIter = std::slice::Iter<'a, Experiment>;

    fn into_iter(self) -> Self::IntoIter {
        self.experiments.iter()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentEntry {
    identifier: String,
    #[serde(default)]
    beam: Option<usize>,
    #[serde(default)]
    detector: Option<usize>,
    #[serde(default)]
    goniometer: Option<usize>,
    #[serde(default)]
    scan: Option<usize>,
    #[serde(default)]
    crystal: Option<usize>,
    #[serde(default)]
    imageset: Option<usize>,
    #[serde(default)]
    independent_models: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageSetEntry {
    source: Option<ImageSource>,
    indices: Vec<usize>,
    #[serde(default)]
    mask: MaskConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ExperimentListDocument {
    experiments: Vec<ExperimentEntry>,
    beams: Vec<ScanVarying<Beam>>,
    detectors: Vec<Detector>,
    goniometers: Vec<Goniometer>,
    scans: Vec<Scan>,
    crystals: Vec<ScanVarying<Crystal>>,
    imagesets: Vec<ImageSetEntry>,
}

fn lookup<T>(table: &[Arc<T>], index: Option<usize>, name: &str) -> Result<Option<Arc<T>>> {
    index
        .map(|index| {
            table.get(index).cloned().ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "{name} {index} referenced but only {} stored",
                    table.len()
                ))
            })
        })
        .transpose()
}

fn shared_table<T>(items: Vec<T>) -> Vec<Arc<T>> {
    items.into_iter().map(Arc::new).collect()
}

impl ExperimentListDocument {
    fn into_list(self, open_imagesets: bool) -> Result<ExperimentList> {
        let beams = shared_table(self.beams);
        let detectors = shared_table(self.detectors);
        let goniometers = shared_table(self.goniometers);
        let scans = shared_table(self.scans);
        let crystals = shared_table(self.crystals);
        let mut opened: Vec<Option<Arc<ImageSet>>> = vec![None; self.imagesets.len()];

        let mut list = ExperimentList::new();
        for entry in self.experiments {
            let beam = lookup(&beams, entry.beam, "beam")?;
            let detector = lookup(&detectors, entry.detector, "detector")?;
            let goniometer = lookup(&goniometers, entry.goniometer, "goniometer")?;
            let scan = lookup(&scans, entry.scan, "scan")?;
            let crystal = lookup(&crystals, entry.crystal, "crystal")?;

            let mut builder = ExperimentBuilder::new(entry.identifier);
            builder.beam.clone_from(&beam);
            builder.detector.clone_from(&detector);
            builder.goniometer.clone_from(&goniometer);
            builder.scan.clone_from(&scan);
            builder.crystal = crystal;
            builder.independent_models = entry.independent_models;

            if let (true, Some(index)) = (open_imagesets, entry.imageset) {
                let description = self.imagesets.get(index).ok_or_else(|| {
                    Error::InvalidFormat(format!("image set {index} referenced but not stored"))
                })?;
                let imageset = match &opened[index] {
                    Some(imageset) => Arc::clone(imageset),
                    None => {
                        let imageset = Arc::new(reopen(
                            description,
                            beam.as_ref(),
                            detector.as_ref(),
                            goniometer.as_ref(),
                            scan.as_ref(),
                        )?);
                        opened[index] = Some(Arc::clone(&imageset));
                        imageset
                    }
                };
                builder.imageset = Some(imageset);
            }
            list.append(builder.build()?)?;
        }
        Ok(list)
    }
}

fn reopen(
    description: &ImageSetEntry,
    beam: Option<&Arc<ScanVarying<Beam>>>,
    detector: Option<&Arc<Detector>>,
    goniometer: Option<&Arc<Goniometer>>,
    scan: Option<&Arc<Scan>>,
) -> Result<ImageSet> {
    let source = description
        .source
        .as_ref()
        .ok_or_else(|| Error::InvalidFormat("image set has no recorded source".to_string()))?;
    let reader = open_source(source)?;
    let mut imageset = ImageSet::new(Arc::from(reader))?
        .with_reader_indices(description.indices.clone())?
        .with_mask_config(description.mask.clone())?;
    if let Some(beam) = beam {
        imageset = imageset.with_beam(Arc::clone(beam));
    }
    if let Some(detector) = detector {
        imageset = imageset.with_detector(Arc::clone(detector));
    }
    if let Some(goniometer) = goniometer {
        imageset = imageset.with_goniometer(Arc::clone(goniometer));
    }
    if let Some(scan) = scan {
        imageset = imageset.with_scan(Arc::clone(scan));
    }
    Ok(imageset)
}
