// tests/test_flow.rs — FlowField behavior and Burkitt file I/O.

use std::io::Cursor;

use denseflow::error::FlowError;
use denseflow::flow::{FlowField, FlowVector, Region, BURKITT_INVALID};

fn header(values: [f32; 6]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn pair(bytes: &mut Vec<u8>, vx: f32, vy: f32) {
    bytes.extend_from_slice(&vx.to_le_bytes());
    bytes.extend_from_slice(&vy.to_le_bytes());
}

fn sample_field() -> FlowField {
    let mut f = FlowField::new(5, 4);
    f.set(1, 1, FlowVector::full(0.5, -0.25));
    f.set(2, 1, FlowVector::normal(1.0, 0.0));
    f.set(4, 3, FlowVector::full(-3.0, 2.0));
    f
}

// ===== Burkitt round trip =====

#[test]
fn file_round_trip_keeps_vectors_and_invalid_cells() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.bin");
    let field = sample_field();
    field.save(&path).unwrap();

    let bytes = std::fs::metadata(&path).unwrap().len();
    assert_eq!(bytes, 24 + 5 * 4 * 8);

    let back = FlowField::load(&path).unwrap();
    assert_eq!((back.width(), back.height()), (5, 4));
    assert_eq!(back.get(1, 1), FlowVector::full(0.5, -0.25));
    assert_eq!(back.get(4, 3), FlowVector::full(-3.0, 2.0));
    // The format cannot mark a vector as normal.
    assert_eq!(back.get(2, 1), FlowVector::full(1.0, 0.0));
    assert!(back.get(0, 0).is_invalid());
    assert_eq!(back.iter().filter(|(_, _, v)| !v.is_invalid()).count(), 3);
}

#[test]
fn invalid_cells_are_written_as_the_sentinel() {
    let mut out = Vec::new();
    FlowField::new(1, 1).write_burkitt(&mut out).unwrap();
    assert_eq!(out.len(), 32);
    let vx = f32::from_le_bytes([out[24], out[25], out[26], out[27]]);
    assert_eq!(vx, BURKITT_INVALID);
}

#[test]
fn cells_outside_the_computed_rectangle_read_as_invalid() {
    let mut bytes = header([3.0, 2.0, 1.0, 1.0, 1.0, 1.0]);
    for _ in 0..6 {
        pair(&mut bytes, 0.25, 0.75);
    }
    let f = FlowField::read_burkitt(Cursor::new(bytes)).unwrap();
    assert_eq!(f.get(1, 1), FlowVector::full(0.25, 0.75));
    assert_eq!(f.count_full(), 1);
}

// ===== Malformed input =====

#[test]
fn stream_ending_on_a_row_boundary_is_accepted() {
    let mut bytes = header([2.0, 3.0, 2.0, 3.0, 0.0, 0.0]);
    pair(&mut bytes, 1.0, 1.0);
    pair(&mut bytes, 2.0, 2.0);
    let f = FlowField::read_burkitt(Cursor::new(bytes)).unwrap();
    assert_eq!(f.count_full(), 2);
    assert!(f.get(0, 1).is_invalid());
    assert!(f.get(1, 2).is_invalid());
}

#[test]
fn truncated_row_is_rejected() {
    let mut bytes = header([2.0, 2.0, 2.0, 2.0, 0.0, 0.0]);
    pair(&mut bytes, 1.0, 1.0);
    bytes.extend_from_slice(&1.0f32.to_le_bytes());
    assert!(matches!(
        FlowField::read_burkitt(Cursor::new(bytes)),
        Err(FlowError::Format(msg)) if msg.contains("row 0")
    ));
}

#[test]
fn corrupt_headers_are_rejected() {
    let short = header([4.0, 4.0, 4.0, 4.0, 0.0, 0.0])[..20].to_vec();
    assert!(matches!(FlowField::read_burkitt(Cursor::new(short)), Err(FlowError::Format(_))));

    for bad in [
        [-1.0, 4.0, 4.0, 4.0, 0.0, 0.0],
        [4.0, f32::NAN, 4.0, 4.0, 0.0, 0.0],
        [1e9, 1e9, 4.0, 4.0, 0.0, 0.0],
    ] {
        assert!(matches!(
            FlowField::read_burkitt(Cursor::new(header(bad))),
            Err(FlowError::Format(_))
        ));
    }
}

#[test]
fn oversized_header_is_rejected_before_allocating() {
    let bytes = header([16384.0, 16384.0, 16384.0, 16384.0, 0.0, 0.0]);
    assert!(matches!(
        FlowField::read_burkitt(Cursor::new(bytes)),
        Err(FlowError::Format(msg)) if msg.contains("too large")
    ));
}

#[test]
fn header_only_stream_reads_as_an_empty_field() {
    let f = FlowField::read_burkitt(Cursor::new(header([3.0, 2.0, 3.0, 2.0, 0.0, 0.0]))).unwrap();
    assert_eq!((f.width(), f.height()), (3, 2));
    assert!(f.iter().all(|(_, _, v)| v.is_invalid()));
}

#[test]
fn file_longer_than_its_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("padded.bin");
    let mut bytes = Vec::new();
    sample_field().write_burkitt(&mut bytes).unwrap();
    bytes.extend_from_slice(&[0u8; 8]);
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(FlowField::load(&path), Err(FlowError::Format(_))));

    // A file cut short on a row boundary still loads.
    bytes.truncate(24 + 2 * 5 * 8);
    std::fs::write(&path, &bytes).unwrap();
    let f = FlowField::load(&path).unwrap();
    assert_eq!(f.get(1, 1), FlowVector::full(0.5, -0.25));
    assert!(f.get(4, 3).is_invalid());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        FlowField::load(dir.path().join("absent.bin")),
        Err(FlowError::Io(_))
    ));
}

// ===== Field queries =====

#[test]
fn density_and_average() {
    let f = sample_field();
    assert_eq!(f.count_full(), 2);
    assert!((f.density() - 2.0 / 20.0).abs() < 1e-6);
    assert_eq!(f.average(None), Some((-1.25, 0.875)));
    assert_eq!(f.average(Some(Region::new(0, 0, 3, 3))), Some((0.5, -0.25)));
    assert_eq!(f.magnitude(2, 1), Some(1.0));
    assert_eq!(f.magnitude(0, 0), None);
}

#[test]
fn rotation_field_respects_region() {
    let region = Region::new(2, 2, 4, 4);
    let f = FlowField::rotation(8, 8, 4.0, 4.0, 0.1, Some(region));
    for (x, y, v) in f.iter() {
        assert_eq!(v.is_full(), region.contains(x, y), "cell ({x}, {y})");
    }
}
