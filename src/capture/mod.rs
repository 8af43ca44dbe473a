#[cfg(feature = "webcam")]
mod webcam;

#[cfg(feature = "webcam")]
pub use webcam::WebcamCapture;

use crate::error::MediaError;
use crate::frame::{Frame, FrameMarker};
use image::{Rgb, RgbImage};

/// Source of camera frames for the capture loop.
///
/// `latest_frame` never blocks on the device: it hands back the most recent frame,
/// which is the same frame (same marker) until the camera produces a new one.
pub trait CaptureSource: Send {
    fn latest_frame(&mut self) -> Result<Frame, MediaError>;

    /// Resolution of captured frames.
    fn resolution(&self) -> (u32, u32);

    /// Rate the device delivers at; fps readings are clamped to this.
    fn native_fps(&self) -> f64;
}

impl<C: CaptureSource + ?Sized> CaptureSource for Box<C> {
    fn latest_frame(&mut self) -> Result<Frame, MediaError> {
        (**self).latest_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }

    fn native_fps(&self) -> f64 {
        (**self).native_fps()
    }
}

/// Camera stand-in: a moving test pattern, or a fixed list of images.
///
/// Every `repeat` calls the marker advances, which is how a camera slower than
/// the tick rate looks from the loop.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    fps: f64,
    images: Vec<RgbImage>,
    repeat: u64,
    limit: Option<u64>,
    calls: u64,
    current: Option<Frame>,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        tracing::info!("Using synthetic camera at {}x{} ({} fps)", width, height, fps);
        Self {
            width,
            height,
            fps,
            images: Vec::new(),
            repeat: 1,
            limit: None,
            calls: 0,
            current: None,
        }
    }

    /// Cycle through `images` instead of drawing a pattern. All must share one size.
    pub fn from_images(images: Vec<RgbImage>, fps: f64) -> Self {
        let (width, height) = images.first().map_or((0, 0), |i| i.dimensions());
        Self {
            images,
            ..Self::new(width, height, fps)
        }
    }

    /// Hand out each frame `repeat` times before advancing.
    pub fn with_repeat(mut self, repeat: u64) -> Self {
        self.repeat = repeat.max(1);
        self
    }

    /// Stop the stream after `frames` distinct frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn draw(&self, index: u64) -> RgbImage {
        if !self.images.is_empty() {
            return self.images[(index as usize) % self.images.len()].clone();
        }
        // A bright block sweeping over a gradient
        let offset = (index * 4) as u32 % self.width.max(1);
        let block = (self.width / 4).max(1);
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let inside = (x + self.width - offset) % self.width.max(1) < block
                && y > self.height / 4
                && y < self.height * 3 / 4;
            if inside {
                Rgb([230, 190, 160])
            } else {
                Rgb([(x * 255 / self.width.max(1)) as u8, 60, (y * 255 / self.height.max(1)) as u8])
            }
        })
    }
}

impl CaptureSource for SyntheticCapture {
    fn latest_frame(&mut self) -> Result<Frame, MediaError> {
        let index = self.calls / self.repeat;
        self.calls += 1;

        if self.limit.is_some_and(|limit| index >= limit) {
            return Err(MediaError::CameraStopped);
        }

        match &self.current {
            Some(frame) if frame.marker() == FrameMarker(index) => Ok(frame.clone()),
            _ => {
                let frame = Frame::new(self.draw(index), FrameMarker(index));
                self.current = Some(frame.clone());
                Ok(frame)
            }
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn native_fps(&self) -> f64 {
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_holds_the_marker() {
        let mut capture = SyntheticCapture::new(32, 24, 30.0).with_repeat(3);
        let markers: Vec<u64> = (0..7)
            .map(|_| capture.latest_frame().unwrap().marker().0)
            .collect();
        assert_eq!(markers, [0, 0, 0, 1, 1, 1, 2]);
    }

    #[test]
    fn limit_stops_the_stream() {
        let mut capture = SyntheticCapture::new(8, 8, 30.0).with_limit(2);
        assert!(capture.latest_frame().is_ok());
        assert!(capture.latest_frame().is_ok());
        assert!(matches!(capture.latest_frame(), Err(MediaError::CameraStopped)));
    }

    #[test]
    fn images_cycle() {
        let red = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(4, 4, Rgb([0, 0, 255]));
        let mut capture = SyntheticCapture::from_images(vec![red.clone(), blue.clone()], 15.0);
        assert_eq!(capture.resolution(), (4, 4));
        assert_eq!(*capture.latest_frame().unwrap().image(), red);
        assert_eq!(*capture.latest_frame().unwrap().image(), blue);
        assert_eq!(*capture.latest_frame().unwrap().image(), red);
    }
}
