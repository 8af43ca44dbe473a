use image::{imageops, RgbImage};
use ndarray::{Array2, Array4};

/// Converts frames into the tensors segmentation models consume.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    fn resized(&self, image: &RgbImage) -> RgbImage {
        if image.dimensions() == (self.target_width, self.target_height) {
            image.clone()
        } else {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        }
    }

    /// Resize, normalize to [0, 1] and lay out as NCHW.
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn to_nchw(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess_nchw").entered();

        let resized = self.resized(image);
        let (width, height) = resized.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        tensor
    }

    /// Resize and convert to a luma plane in [0, 255], shape [height, width].
    pub fn to_luma(&self, image: &RgbImage) -> Array2<f32> {
        let _span = tracing::debug_span!("preprocess_luma").entered();

        let resized = self.resized(image);
        let (width, height) = resized.dimensions();
        Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            let p = resized.get_pixel(x as u32, y as u32);
            0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn nchw_layout_and_range() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
        let tensor = Preprocessor::new(4, 2).to_nchw(&image);
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert_eq!(tensor[[0, 0, 1, 3]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 0.0);
        assert!((tensor[[0, 2, 1, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn luma_resizes_to_target() {
        let image = RgbImage::from_pixel(64, 48, Rgb([100, 100, 100]));
        let luma = Preprocessor::new(16, 12).to_luma(&image);
        assert_eq!(luma.dim(), (12, 16));
        assert!((luma[[5, 5]] - 100.0).abs() < 0.5);
    }
}
