// image.rs — Grayscale frame container, generic over pixel type.
//
// A flow computation consumes a *stack*: an ordered slice of equally sized
// frames, `&[Image<T>]`. Frames are only ever read, converted to f32 as they
// are pulled into a Volume (see volume.rs), so the container stays small:
// row-major, contiguous, no stride padding.
//
//   data index:  0  1  2  3  4  5  6  7  8  9 10 11
//   pixel:       ■  ■  ■  ■  ■  ■  ■  ■  ■  ■  ■  ■
//   row:         |-- row 0 --|  |-- row 1 --|  |-- row 2 --|   (width = 4)
//
// The estimators also hand results back as images (FlowField::to_images), so
// the f32 specialisation doubles as a plain 2D scalar field.

use std::fmt;

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------
// Frames arrive as 8-bit, 16-bit or float data. Every algorithm in the crate
// works on raw intensities (no [0,1] normalisation): thresholds such as the
// Lucas-Kanade eigenvalue floor are expressed in squared intensity units.

/// A frame sample type. Conversion to f32 is lossless for every
/// implementation; the way back rounds and saturates.
pub trait Pixel: Copy + Default + Send + Sync + 'static {
    /// Raw intensity, no rescaling.
    fn to_f32(self) -> f32;

    /// Nearest representable sample, saturating at the type's range.
    fn from_f32(v: f32) -> Self;
}

macro_rules! integer_pixel {
    ($($t:ty),*) => {$(
        impl Pixel for $t {
            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }

            #[inline]
            fn from_f32(v: f32) -> Self {
                // `as` truncates toward zero; round inside the range first.
                v.clamp(<$t>::MIN as f32, <$t>::MAX as f32).round() as $t
            }
        }
    )*};
}

integer_pixel!(u8, u16);

impl Pixel for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// One grayscale frame.
#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    /// Row-major samples, `width * height` of them.
    data: Vec<T>,
    width: usize,
    height: usize,
}

impl<T: Pixel> Image<T> {
    /// All-zero frame.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![T::default(); width * height],
            width,
            height,
        }
    }

    /// Wrap row-major samples.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    /// Create an image by evaluating `f(x, y)` at every pixel.
    ///
    /// Handy for synthetic sequences: a translating pattern is
    /// `Image::from_fn(w, h, |x, y| pattern(x as f32 - vx * t, y as f32 - vy * t))`.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image { data, width, height }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`, the quantity every frame of a stack must agree on.
    #[inline]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Sample at column `x`, row `y`.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Row `y` as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// `(x, y, value)` in raster order.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let w = self.width;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % w, i / w, v))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Copy the frame into a new f32 buffer of raw intensities.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.iter().map(|p| p.to_f32()).collect()
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

// Debug formatting: prints the dimensions, plus the pixels for small images.
impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image<{}> {}×{}", std::any::type_name::<T>(), self.width, self.height)?;
        if self.width <= 16 && self.height <= 16 {
            for y in 0..self.height {
                writeln!(f, "  {:?}", self.row(y))?;
            }
        }
        Ok(())
    }
}
