//! Final frame assembly: background treatment, matting and mirroring.

use crate::background::BackgroundSpec;
use crate::frame::Mask;
use image::{imageops, Rgb, RgbImage};

/// What the segmentation stage produced for the frame being drawn.
#[derive(Debug, Clone, Copy)]
pub enum CompositeInput<'a> {
    /// Foreground matte, at any resolution.
    Mask(&'a Mask),
    /// The backend already drew the final picture.
    Composited(&'a RgbImage),
    /// No usable result for this tick; draw the source unchanged.
    Raw,
}

/// Why a tick showed the raw source instead of the requested effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    NoResult,
    ImageNotLoaded(String),
    SizeMismatch,
}

#[derive(Debug, Clone)]
pub struct Rendered {
    pub image: RgbImage,
    pub fallback: Option<Fallback>,
}

/// Draws output frames.
///
/// Mirroring lives here and only here: backends never flip their input, and every
/// frame leaving the compositor (fallbacks included) is flipped the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCompositor {
    mirror: bool,
    show_matte: bool,
}

impl FrameCompositor {
    pub fn new(mirror: bool) -> Self {
        Self {
            mirror,
            show_matte: false,
        }
    }

    /// Draw the matte itself instead of compositing (diagnostic view).
    pub fn with_matte_view(mut self, show_matte: bool) -> Self {
        self.show_matte = show_matte;
        self
    }

    pub fn render(
        &self,
        source: &RgbImage,
        input: CompositeInput<'_>,
        spec: &BackgroundSpec,
    ) -> Rendered {
        let _span = tracing::debug_span!("composite", spec = %spec.label()).entered();

        let (image, fallback) = match input {
            CompositeInput::Raw => (source.clone(), Some(Fallback::NoResult)),
            CompositeInput::Composited(output) => {
                if output.dimensions() == source.dimensions() {
                    (output.clone(), None)
                } else {
                    (source.clone(), Some(Fallback::SizeMismatch))
                }
            }
            CompositeInput::Mask(mask) if self.show_matte => {
                let (width, height) = source.dimensions();
                (mask.resample_nearest(width, height).to_rgb(), None)
            }
            CompositeInput::Mask(mask) => self.apply_background(source, mask, spec),
        };

        let mut image = image;
        if self.mirror {
            imageops::flip_horizontal_in_place(&mut image);
        }

        Rendered { image, fallback }
    }

    fn apply_background(
        &self,
        source: &RgbImage,
        mask: &Mask,
        spec: &BackgroundSpec,
    ) -> (RgbImage, Option<Fallback>) {
        let (width, height) = source.dimensions();
        match spec {
            BackgroundSpec::None => (source.clone(), None),
            BackgroundSpec::Blur(radius) => {
                let background = blur_background(source, *radius);
                let mask = mask.resample_nearest(width, height);
                (matte(source, &background, &mask), None)
            }
            BackgroundSpec::StaticImage(handle) | BackgroundSpec::UploadedImage(handle) => {
                let Some(image) = handle.get() else {
                    if handle.should_warn_pending() {
                        tracing::warn!(
                            "Background image {} not loaded yet, showing camera frame",
                            handle.name()
                        );
                    }
                    return (
                        source.clone(),
                        Some(Fallback::ImageNotLoaded(handle.name().to_string())),
                    );
                };
                let background = fit_background(&image, width, height);
                let mask = mask.resample_nearest(width, height);
                (matte(source, &background, &mask), None)
            }
        }
    }
}

/// Gaussian blur of the whole frame, used as the replacement background.
pub fn blur_background(source: &RgbImage, radius: u32) -> RgbImage {
    if radius == 0 {
        return source.clone();
    }
    imageops::blur(source, radius as f32 / 2.0)
}

/// Scale a background image to cover the frame, cropping the overflow.
pub fn fit_background(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    let (src_w, src_h) = image.dimensions();
    let scale = f64::max(
        width as f64 / src_w.max(1) as f64,
        height as f64 / src_h.max(1) as f64,
    );
    let scaled_w = ((src_w as f64 * scale).ceil() as u32).max(width);
    let scaled_h = ((src_h as f64 * scale).ceil() as u32).max(height);
    let scaled = imageops::resize(image, scaled_w, scaled_h, imageops::FilterType::Triangle);
    let x = (scaled_w - width) / 2;
    let y = (scaled_h - height) / 2;
    imageops::crop_imm(&scaled, x, y, width, height).to_image()
}

/// Blend `foreground` over `background` using `mask` (frame resolution).
///
/// Alpha 1.0 keeps the foreground pixel bit-exact, 0.0 takes the background
/// pixel, anything in between is a linear blend (soft edge).
pub fn matte(foreground: &RgbImage, background: &RgbImage, mask: &Mask) -> RgbImage {
    let (width, height) = foreground.dimensions();
    debug_assert_eq!(mask.dimensions(), (width, height));
    debug_assert_eq!(background.dimensions(), (width, height));

    let mut out = RgbImage::new(width, height);
    for ((dst, (fg, bg)), &alpha) in out
        .pixels_mut()
        .zip(foreground.pixels().zip(background.pixels()))
        .zip(mask.values())
    {
        *dst = if alpha >= 1.0 {
            *fg
        } else if alpha <= 0.0 {
            *bg
        } else {
            let blend = |f: u8, b: u8| (f as f32 * alpha + b as f32 * (1.0 - alpha)).round() as u8;
            Rgb([
                blend(fg[0], bg[0]),
                blend(fg[1], bg[1]),
                blend(fg[2], bg[2]),
            ])
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::ImageHandle;

    fn noise(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 37 % 256) as u8, (y * 91 % 256) as u8, ((x ^ y) * 13 % 256) as u8])
        })
    }

    #[test]
    fn none_passes_source_through() {
        let source = noise(16, 8);
        let mask = Mask::filled(4, 2, 0.0);
        let out = FrameCompositor::default().render(
            &source,
            CompositeInput::Mask(&mask),
            &BackgroundSpec::None,
        );
        assert_eq!(out.image, source);
        assert!(out.fallback.is_none());
    }

    #[test]
    fn full_foreground_blur_is_identity() {
        let source = noise(32, 24);
        let mask = Mask::filled(8, 6, 1.0);
        let out = FrameCompositor::default().render(
            &source,
            CompositeInput::Mask(&mask),
            &BackgroundSpec::Blur(15),
        );
        assert_eq!(out.image, source);
    }

    #[test]
    fn full_background_blur_differs_from_source() {
        let source = noise(32, 24);
        let mask = Mask::filled(32, 24, 0.0);
        let out = FrameCompositor::default().render(
            &source,
            CompositeInput::Mask(&mask),
            &BackgroundSpec::Blur(6),
        );
        assert_eq!(out.image, blur_background(&source, 6));
        assert_ne!(out.image, source);
    }

    #[test]
    fn image_background_replaces_masked_pixels() {
        let source = RgbImage::from_pixel(4, 2, Rgb([200, 10, 10]));
        let handle = ImageHandle::ready("blue", RgbImage::from_pixel(8, 4, Rgb([0, 0, 255])));
        // left half foreground, right half background, at half resolution
        let mask = Mask::new(2, 1, vec![1.0, 0.0]).unwrap();
        let out = FrameCompositor::default().render(
            &source,
            CompositeInput::Mask(&mask),
            &BackgroundSpec::StaticImage(handle),
        );
        assert_eq!(out.image.get_pixel(0, 0).0, [200, 10, 10]);
        assert_eq!(out.image.get_pixel(1, 1).0, [200, 10, 10]);
        assert_eq!(out.image.get_pixel(2, 0).0, [0, 0, 255]);
        assert_eq!(out.image.get_pixel(3, 1).0, [0, 0, 255]);
    }

    #[test]
    fn pending_image_falls_back_to_source() {
        let source = noise(8, 8);
        let handle = ImageHandle::pending("upload.png");
        let mask = Mask::filled(8, 8, 0.0);
        let spec = BackgroundSpec::UploadedImage(handle.clone());
        let compositor = FrameCompositor::default();

        let out = compositor.render(&source, CompositeInput::Mask(&mask), &spec);
        assert_eq!(out.image, source);
        assert_eq!(out.fallback, Some(Fallback::ImageNotLoaded("upload.png".into())));

        handle.fulfil(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])));
        let out = compositor.render(&source, CompositeInput::Mask(&mask), &spec);
        assert!(out.fallback.is_none());
        assert_eq!(out.image.get_pixel(4, 4).0, [1, 2, 3]);
    }

    // Hard edges are acceptable, soft edges preferred: partial alpha blends.
    #[test]
    fn partial_alpha_blends_at_edges() {
        let fg = RgbImage::from_pixel(1, 1, Rgb([200, 200, 200]));
        let bg = RgbImage::from_pixel(1, 1, Rgb([0, 100, 200]));
        let mask = Mask::new(1, 1, vec![0.5]).unwrap();
        assert_eq!(matte(&fg, &bg, &mask).get_pixel(0, 0).0, [100, 150, 200]);
    }

    #[test]
    fn self_composited_output_skips_matting() {
        let source = noise(6, 6);
        let composited = RgbImage::from_pixel(6, 6, Rgb([9, 9, 9]));
        let out = FrameCompositor::default().render(
            &source,
            CompositeInput::Composited(&composited),
            &BackgroundSpec::Blur(15),
        );
        assert_eq!(out.image, composited);
    }

    #[test]
    fn mirror_applies_to_fallbacks_too() {
        let source = RgbImage::from_fn(2, 1, |x, _| Rgb([x as u8, 0, 0]));
        let out = FrameCompositor::new(true).render(&source, CompositeInput::Raw, &BackgroundSpec::None);
        assert_eq!(out.image.get_pixel(0, 0).0, [1, 0, 0]);
        assert_eq!(out.fallback, Some(Fallback::NoResult));
    }

    #[test]
    fn cover_fit_matches_frame_size() {
        let image = noise(10, 3);
        assert_eq!(fit_background(&image, 4, 4).dimensions(), (4, 4));
        assert_eq!(fit_background(&image, 20, 2).dimensions(), (20, 2));
    }
}
