// tests/test_image.rs — Integration tests for Image<T> and the Pixel trait.

use denseflow::image::{Image, Pixel};

// ===== Construction & access =====

#[test]
fn new_is_zero_initialized() {
    let img: Image<u16> = Image::new(7, 3);
    assert_eq!(img.dimensions(), (7, 3));
    assert!(img.pixels().all(|(_, _, v)| v == 0));
}

#[test]
fn from_vec_is_row_major() {
    // 3×2 image:
    //  [10, 20, 30]
    //  [40, 50, 60]
    let img = Image::from_vec(3, 2, vec![10u8, 20, 30, 40, 50, 60]);
    assert_eq!(img.get(2, 0), 30);
    assert_eq!(img.get(0, 1), 40);
    assert_eq!(img.row(1), &[40, 50, 60]);
}

#[test]
#[should_panic(expected = "must equal width * height")]
fn from_vec_rejects_wrong_length() {
    let _ = Image::from_vec(3, 3, vec![0u8; 8]);
}

#[test]
fn set_then_get() {
    let mut img: Image<f32> = Image::new(4, 4);
    img.set(3, 2, -1.5);
    assert_eq!(img.get(3, 2), -1.5);
    assert_eq!(img.as_slice()[2 * 4 + 3], -1.5);
}

// ===== Pixel conversions =====

#[test]
fn raw_intensities_are_preserved() {
    let a = Image::from_fn(2, 1, |x, _| if x == 0 { 0u8 } else { 255 });
    assert_eq!(a.to_f32_vec(), vec![0.0, 255.0]);
    let b = Image::from_fn(1, 1, |_, _| 4095u16);
    assert_eq!(b.to_f32_vec(), vec![4095.0]);
}

#[test]
fn from_f32_rounds_and_clamps() {
    assert_eq!(u16::from_f32(70000.0), 65535);
    assert_eq!(u16::from_f32(-1.0), 0);
    assert_eq!(u8::from_f32(2.5), 3);
    assert_eq!(f32::from_f32(-7.25), -7.25);
}

/// A sample type with no ordering, e.g. a tagged sensor reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Reading {
    level: f32,
}

impl Pixel for Reading {
    fn to_f32(self) -> f32 {
        self.level
    }

    fn from_f32(v: f32) -> Self {
        Reading { level: v }
    }
}

#[test]
fn unordered_sample_types_are_pixels() {
    let img = Image::from_fn(3, 1, |x, _| Reading::from_f32(x as f32 * 0.5));
    assert_eq!(img.to_f32_vec(), vec![0.0, 0.5, 1.0]);
    assert_eq!(img.get(2, 0), Reading { level: 1.0 });
}

#[test]
fn debug_prints_small_images() {
    let img = Image::from_vec(2, 2, vec![1u8, 2, 3, 4]);
    let s = format!("{img:?}");
    assert!(s.contains("2×2"));
    assert!(s.contains("[3, 4]"));

    let big: Image<u8> = Image::new(64, 64);
    assert_eq!(format!("{big:?}").lines().count(), 1);
}
