use std::path::PathBuf;
use std::sync::Arc;

use approx::assert_relative_eq;
use difframe_core::math::rotation_about;
use difframe_core::{
    Beam, Crystal, DetectorFactory, Goniometer, Mat3, Scan, ScanVarying, UnitCell, Vec3,
};
use difframe_io::{
    write_smv, Error, Experiment, ExperimentList, FormatOptions, ImageSet, InMemoryReader,
};
use ndarray::Array2;
use serde_json::{json, Value};
use tempfile::TempDir;

fn smv_sequence(dir: &TempDir, count: u16) -> Vec<PathBuf> {
    let records = [
        ("PIXEL_SIZE", "0.1".to_string()),
        ("DISTANCE", "150.0".to_string()),
        ("WAVELENGTH", "1.54".to_string()),
        ("BEAM_CENTER_X", "0.5".to_string()),
        ("BEAM_CENTER_Y", "0.5".to_string()),
        ("OSC_START", "0.0".to_string()),
        ("OSC_RANGE", "0.2".to_string()),
    ];
    (1..=count)
        .map(|i| {
            let path = dir.path().join(format!("trypsin_{i:04}.img"));
            let pixels: Vec<u16> = (0..100).map(|p| (p * 7 + i) % 1000).collect();
            write_smv(&path, &records, (10, 10), &pixels).unwrap();
            path
        })
        .collect()
}

fn crystal(a: f64) -> Crystal {
    let cell = UnitCell::new(a, 58.0, 67.0, 90.0, 90.0, 90.0).unwrap();
    Crystal::new(Mat3::identity(), cell, "P 21 21 21").unwrap()
}

fn in_memory_set(frames: usize, scan: (i32, i32)) -> Arc<ImageSet> {
    let detector =
        DetectorFactory::simple(100.0, (0.5, 0.5), "+x", "-y", (0.1, 0.1), (10, 10), (0.0, 1e6))
            .unwrap();
    let mut reader = InMemoryReader::new(detector)
        .with_beam(Beam::simple(0.9).unwrap())
        .with_goniometer(Goniometer::new(Vec3::x()).unwrap())
        .with_scan(Scan::new(scan, (0.0, 1.0)).unwrap());
    for _ in 0..frames {
        reader.push_frame(&[Array2::zeros((10, 10))]).unwrap();
    }
    Arc::new(ImageSet::new(Arc::new(reader)).unwrap())
}

#[test]
fn test_scan_longer_than_imageset_is_inconsistent() {
    let set = in_memory_set(99, (1, 100));
    let result = Experiment::from_imageset("short", set).build();
    assert!(matches!(result, Err(Error::InconsistentExperiment(_))));
}

#[test]
fn test_fixed_beam_across_scan() {
    let set = in_memory_set(10, (1, 10));
    let experiment = Experiment::from_imageset("fixed", set).build().unwrap();
    let beam = experiment.get_beam(5.0).unwrap().unwrap();
    assert_relative_eq!(beam.wavelength(), 0.9);
    assert_eq!(experiment.get_beam(1.0).unwrap(), experiment.get_beam(10.0).unwrap());
    assert!(matches!(
        experiment.get_beam(11.0),
        Err(Error::Core(difframe_core::Error::IndexOutOfRange { .. }))
    ));

    let rotation = experiment.setting_rotation(3.5).unwrap().unwrap();
    let expected = Goniometer::new(Vec3::x()).unwrap().rotation_at_angle(2.5);
    assert_relative_eq!(rotation, expected, epsilon = 1e-12);
}

#[test]
fn test_frames_in_scan_range_succeed() {
    let set = in_memory_set(5, (11, 15));
    let experiment = Experiment::from_imageset("range", Arc::clone(&set)).build().unwrap();
    let (first, last) = experiment.scan().unwrap().image_range();
    for image in first..=last {
        let frame = experiment.imageset().unwrap().frame_for_image(image).unwrap();
        assert_eq!(frame.image, image);
    }
}

#[test]
fn test_scan_varying_crystal_interpolated() {
    let set = in_memory_set(4, (1, 4));
    let samples = (0..5).map(|k| crystal(50.0 + f64::from(k))).collect();
    let experiment = Experiment::from_imageset("sv", set)
        .crystal(Arc::new(ScanVarying::sampled(samples).unwrap()))
        .build()
        .unwrap();
    let halfway = experiment.get_crystal(2.5).unwrap().unwrap();
    assert_relative_eq!(halfway.unit_cell().parameters()[0], 51.5, epsilon = 0.01);
    assert!(experiment.get_crystal(0.5).is_err());
}

#[test]
fn test_json_round_trip_reopens_shared_imagesets() {
    let dir = TempDir::new().unwrap();
    let paths = smv_sequence(&dir, 6);
    let full = ImageSet::open(&paths, &FormatOptions::default()).unwrap();
    let sweep = Arc::new(full.subset(2..5).unwrap());

    let mut list = ExperimentList::new();
    for (id, a) in [("lattice-1", 54.0), ("lattice-2", 61.0)] {
        let experiment = Experiment::from_imageset(id, Arc::clone(&sweep))
            .crystal(Arc::new(ScanVarying::Fixed(crystal(a))))
            .build()
            .unwrap();
        list.append(experiment).unwrap();
    }
    assert_eq!(list.imagesets().len(), 1);

    let json = list.to_json().unwrap();
    let path = dir.path().join("experiments.json");
    std::fs::write(&path, &json).unwrap();
    let restored = ExperimentList::from_file(&path, true).unwrap();

    assert_eq!(restored.identifiers(), vec!["lattice-1", "lattice-2"]);
    let set = restored[0].imageset().unwrap();
    assert!(Arc::ptr_eq(set, restored[1].imageset().unwrap()));
    assert!(Arc::ptr_eq(set.detector(), restored[1].detector().unwrap()));
    assert!(Arc::ptr_eq(restored[0].beam().unwrap(), restored[1].beam().unwrap()));
    assert_eq!(restored.crystals().len(), 2);
    assert_eq!(set.reader_indices(), &[2, 3, 4]);
    assert_eq!(set.scan().unwrap().image_range(), (3, 5));

    let original = sweep.frame_for_image(4).unwrap();
    let reopened = set.frame_for_image(4).unwrap();
    assert_eq!(original.data, reopened.data);
    assert_eq!(original.mask, reopened.mask);

    let models_only = ExperimentList::from_json(&json, false).unwrap();
    assert!(models_only[0].imageset().is_none());
    assert_eq!(**models_only[1].scan().unwrap(), **list[1].scan().unwrap());
}

#[test]
fn test_append_requires_shared_models_for_one_imageset() {
    let set = in_memory_set(3, (1, 3));
    let mut list = ExperimentList::new();
    list.append(Experiment::from_imageset("a", Arc::clone(&set)).build().unwrap())
        .unwrap();

    let separate_scan = Arc::new((**set.scan().unwrap()).clone());
    let b = Experiment::from_imageset("b", Arc::clone(&set))
        .scan(separate_scan)
        .build()
        .unwrap();
    assert!(matches!(list.append(b), Err(Error::InconsistentExperiment(_))));
    assert_eq!(list.len(), 1);

    let other = in_memory_set(3, (1, 3));
    list.append(Experiment::from_imageset("c", other).build().unwrap())
        .unwrap();
    assert_eq!(list.detectors().len(), 2);
}

#[test]
fn test_crystal_that_fails_to_interpolate_is_an_error() {
    let set = in_memory_set(3, (1, 3));
    let cell = UnitCell::new(40.0, 40.0, 40.0, 90.0, 90.0, 90.0).unwrap();
    let flipped = Crystal::new(rotation_about(&Vec3::z(), 180.0), cell, "P 1").unwrap();
    let samples = vec![
        Crystal::new(Mat3::identity(), cell, "P 1").unwrap(),
        flipped.clone(),
        flipped,
    ];
    let experiment = Experiment::from_imageset("flip", set)
        .crystal(Arc::new(ScanVarying::sampled(samples).unwrap()))
        .build()
        .unwrap();
    assert!(experiment.get_crystal(1.0).is_ok());
    assert!(matches!(
        experiment.get_crystal(1.5),
        Err(Error::Core(difframe_core::Error::InvalidModel(_)))
    ));
    assert!(experiment.get_crystal(2.5).is_ok());
}

fn edited_list_json(edit: impl FnOnce(&mut Value)) -> String {
    let mut list = ExperimentList::new();
    let experiment = Experiment::from_imageset("edit", in_memory_set(4, (1, 4)))
        .crystal(Arc::new(ScanVarying::Fixed(crystal(52.0))))
        .build()
        .unwrap();
    list.append(experiment).unwrap();
    let mut document: Value = serde_json::from_str(&list.to_json().unwrap()).unwrap();
    edit(&mut document);
    document.to_string()
}

#[test]
fn test_from_json_rejects_invalid_models() {
    let untouched = edited_list_json(|_| {});
    assert_eq!(ExperimentList::from_json(&untouched, false).unwrap().len(), 1);

    let edits: Vec<Box<dyn FnOnce(&mut Value)>> = vec![
        Box::new(|doc| doc["beams"][0]["Fixed"]["wavelength"] = json!(-2.0)),
        Box::new(|doc| doc["scans"][0]["image_range"] = json!([3, 1])),
        Box::new(|doc| doc["scans"][0]["width_overrides"] = json!([])),
        Box::new(|doc| doc["scans"][0]["exposure_times"] = json!([0.1, 0.2])),
        Box::new(|doc| doc["goniometers"][0]["axes"] = json!([])),
        Box::new(|doc| doc["goniometers"][0]["scan_axis"] = json!(3)),
        Box::new(|doc| doc["crystals"][0] = json!({ "Sampled": [] })),
        Box::new(|doc| {
            doc["crystals"][0]["Fixed"]["unit_cell"] = json!([0.0, 1.0, 1.0, 90.0, 90.0, 90.0]);
        }),
    ];
    for edit in edits {
        let json = edited_list_json(edit);
        assert!(
            matches!(ExperimentList::from_json(&json, false), Err(Error::Json(_))),
            "accepted {json}"
        );
    }
}
