use image::{Rgb, RgbImage};
use std::fmt;
use std::sync::Arc;

/// Presentation-time marker of a captured frame.
///
/// Sources hand out a new marker every time the underlying image advances, so two
/// frames with the same marker are the same picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameMarker(pub u64);

impl fmt::Display for FrameMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A decoded video frame.
///
/// Cloning is cheap: the pixels are shared.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    marker: FrameMarker,
}

impl Frame {
    pub fn new(image: RgbImage, marker: FrameMarker) -> Self {
        Self {
            image: Arc::new(image),
            marker,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn marker(&self) -> FrameMarker {
        self.marker
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Alpha matte: 0.0 = background, 1.0 = foreground, row-major.
///
/// May be at frame resolution or at the model's native resolution; the compositor
/// resamples before matting.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    alpha: Vec<f32>,
}

impl Mask {
    /// Returns `None` when the buffer length does not match the dimensions.
    pub fn new(width: u32, height: u32, alpha: Vec<f32>) -> Option<Self> {
        if alpha.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            alpha,
        })
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            alpha: vec![value.clamp(0.0, 1.0); (width as usize) * (height as usize)],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn values(&self) -> &[f32] {
        &self.alpha
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.alpha[(y * self.width + x) as usize]
    }

    /// Nearest-neighbour resample to the target resolution.
    ///
    /// Every output pixel maps to exactly one source sample: `src = dst * src_len / dst_len`,
    /// which stays in range for all `dst < dst_len`.
    pub fn resample_nearest(&self, width: u32, height: u32) -> Mask {
        if (width, height) == (self.width, self.height) {
            return self.clone();
        }
        if self.width == 0 || self.height == 0 {
            return Mask::filled(width, height, 0.0);
        }

        let columns: Vec<usize> = (0..width as u64)
            .map(|x| (x * self.width as u64 / width as u64) as usize)
            .collect();

        let mut alpha = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height as u64 {
            let src_row = (y * self.height as u64 / height as u64) as usize;
            let row = &self.alpha[src_row * self.width as usize..][..self.width as usize];
            alpha.extend(columns.iter().map(|&sx| row[sx]));
        }

        Mask {
            width,
            height,
            alpha,
        }
    }

    /// Grayscale visualization of the matte.
    pub fn to_rgb(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let value = (self.get(x, y) * 255.0).clamp(0.0, 255.0) as u8;
            Rgb([value, value, value])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Mask::new(4, 4, vec![0.0; 15]).is_none());
        assert!(Mask::new(4, 4, vec![0.0; 16]).is_some());
    }

    #[test]
    fn upsample_maps_every_pixel_to_one_sample() {
        // 2x2 quadrants -> 5x3 target, odd sizes exercise the boundary rows/columns
        let mask = Mask::new(2, 2, vec![0.0, 1.0, 0.25, 0.75]).unwrap();
        let up = mask.resample_nearest(5, 3);

        assert_eq!(up.dimensions(), (5, 3));
        assert_eq!(up.values().len(), 15);
        assert_eq!(up.get(0, 0), 0.0);
        assert_eq!(up.get(4, 0), 1.0);
        assert_eq!(up.get(0, 2), 0.25);
        assert_eq!(up.get(4, 2), 0.75);
        for value in up.values() {
            assert!(mask.values().contains(value));
        }
    }

    #[test]
    fn downsample_keeps_only_source_values() {
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 63.0).collect();
        let mask = Mask::new(8, 8, values).unwrap();
        let down = mask.resample_nearest(3, 5);

        assert_eq!(down.dimensions(), (3, 5));
        assert_eq!(down.get(0, 0), mask.get(0, 0));
        assert_eq!(down.get(2, 4), mask.get(5, 6));
    }

    #[test]
    fn matte_visualization_is_grayscale() {
        let mask = Mask::new(2, 1, vec![0.0, 1.0]).unwrap();
        let rgb = mask.to_rgb();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }
}
