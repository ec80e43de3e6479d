use std::path::PathBuf;
use std::sync::Arc;

use approx::assert_relative_eq;
use difframe_core::{Beam, DetectorFactory, PixelGeometry, SensorMaterial};
use difframe_io::{
    write_minicbf, write_smv, Error, FormatOptions, ImageSet, InMemoryReader, PilatusHeader,
};
use difframe_mask::{MaskConfig, RegionSpec};
use ndarray::Array2;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn smv_sequence(dir: &TempDir, count: u16) -> Vec<PathBuf> {
    let records = [
        ("DETECTOR_SN", "916".to_string()),
        ("PIXEL_SIZE", "0.1".to_string()),
        ("DISTANCE", "120.0".to_string()),
        ("WAVELENGTH", "0.98".to_string()),
        ("BEAM_CENTER_X", "0.3".to_string()),
        ("BEAM_CENTER_Y", "0.4".to_string()),
        ("OSC_START", "10.0".to_string()),
        ("OSC_RANGE", "1.0".to_string()),
    ];
    (1..=count)
        .map(|i| {
            let path = dir.path().join(format!("insulin_{i:03}.img"));
            let mut pixels: Vec<u16> = (0..48).map(|p| p * 10 + i).collect();
            pixels[47] = u16::MAX;
            write_smv(&path, &records, (8, 6), &pixels).unwrap();
            path
        })
        .collect()
}

fn pilatus_header() -> PilatusHeader {
    PilatusHeader {
        detector: Some("PILATUS 300K".to_string()),
        pixel_size_m: Some((172e-6, 172e-6)),
        sensor: Some((SensorMaterial::Si, 0.001)),
        exposure_time: Some(0.2),
        count_cutoff: Some(100_000.0),
        wavelength: Some(1.2),
        distance_m: Some(0.25),
        beam_xy: Some((3.0, 2.0)),
        start_angle: Some(0.0),
        angle_increment: Some(0.25),
    }
}

fn cbf_sequence(dir: &TempDir, count: i64) -> Vec<PathBuf> {
    (1..=count)
        .map(|i| {
            let path = dir.path().join(format!("thaum_{i:05}.cbf"));
            let mut values: Vec<i64> = (0..30).map(|p| p * 1000 * i).collect();
            values[0] = -1;
            values[13] = 100_001;
            values[29] = 250_000;
            write_minicbf(&path, &pilatus_header(), (6, 5), &values).unwrap();
            path
        })
        .collect()
}

#[test]
fn test_smv_sequence_through_imageset() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let paths = smv_sequence(&dir, 4);
    let set = ImageSet::open(&paths, &FormatOptions::default())
        .unwrap()
        .with_mask_config(MaskConfig::default().with_region(RegionSpec::Rectangle {
            panel: None,
            x0: 0.0,
            x1: 2.0,
            y0: 0.0,
            y1: 1.0,
        }))
        .unwrap();
    assert_eq!(set.format_name(), "smv");
    assert_eq!(set.len(), 4);

    let frame = set.get_frame(3).unwrap();
    assert_eq!(frame.image, 4);
    assert_eq!(frame.data[0].dim(), (6, 8));
    assert_eq!(frame.data[0][[1, 2]], 104);
    // full-scale pixel sits at the edge of the trusted range
    assert!(frame.mask[0][[5, 7]]);
    assert!(!frame.mask[0][[0, 0]]);
    assert!(!frame.mask[0][[0, 1]]);
    assert!(frame.mask[0][[0, 2]]);

    let (start, width) = frame.geometry.oscillation.unwrap();
    assert_relative_eq!(start, 13.0);
    assert_relative_eq!(width, 1.0);
    assert_relative_eq!(frame.geometry.beam.unwrap().wavelength(), 0.98);
}

#[test]
fn test_cbf_sentinels_and_overloads_masked() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let paths = cbf_sequence(&dir, 2);
    let set = ImageSet::open(&paths, &FormatOptions::default()).unwrap();
    assert_eq!(set.format_name(), "cbf");
    assert_eq!(set.scan().unwrap().image_range(), (1, 2));
    assert_eq!(set.detector().panel(0).unwrap().image_size(), (6, 5));

    let frame = set.get_frame(1).unwrap();
    assert_eq!(frame.data[0][[0, 0]], -1);
    assert_eq!(frame.data[0][[2, 3]], 30_000);
    assert!(!frame.mask[0][[0, 0]]);
    assert!(!frame.mask[0][[2, 1]]);
    assert!(!frame.mask[0][[4, 5]]);
    assert_eq!(frame.mask[0].iter().filter(|&&usable| !usable).count(), 3);
}

#[test]
fn test_corrupt_frame_is_local() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let paths = cbf_sequence(&dir, 3);
    let set = ImageSet::open(&paths, &FormatOptions::default()).unwrap();

    let bytes = std::fs::read(&paths[1]).unwrap();
    let marker = bytes
        .windows(4)
        .position(|w| w == [0x0c, 0x1a, 0x04, 0xd5])
        .unwrap();
    std::fs::write(&paths[1], &bytes[..marker + 4 + 20]).unwrap();

    assert!(matches!(
        set.get_frame(1),
        Err(Error::Codec(difframe_codec::Error::CorruptStream { .. }))
    ));
    assert!(set.get_frame(0).is_ok());
    assert!(set.get_frame(2).is_ok());

    std::fs::remove_file(&paths[2]).unwrap();
    assert!(matches!(
        set.get_frame(2),
        Err(Error::SourceUnavailable { index: 2, .. })
    ));
    let frames = set.par_frames();
    assert!(frames[0].is_ok());
    assert!(frames[1].is_err());
    assert!(frames[2].is_err());
}

#[test]
fn test_missing_in_memory_frame_is_source_unavailable() {
    let detector =
        DetectorFactory::simple(80.0, (0.2, 0.2), "+x", "-y", (0.1, 0.1), (4, 4), (0.0, 10.0))
            .unwrap();
    let mut reader = InMemoryReader::new(detector).with_beam(Beam::simple(1.0).unwrap());
    reader.push_frame(&[Array2::from_elem((4, 4), 3)]).unwrap();
    reader.push_missing_frame();
    reader.push_frame(&[Array2::from_elem((4, 4), 4)]).unwrap();
    let set = ImageSet::new(Arc::new(reader)).unwrap();

    assert!(matches!(
        set.get_frame(1),
        Err(Error::SourceUnavailable { index: 1, .. })
    ));
    assert_eq!(set.get_frame(2).unwrap().data[0][[3, 3]], 4);
    assert!(matches!(
        set.get_frame(3),
        Err(Error::IndexOutOfRange { index: 3, len: 3 })
    ));
}
