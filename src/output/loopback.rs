use super::{AudioTrack, CallTransport, TrackSource, VideoSender};
use crate::error::MediaError;
use crate::frame::FrameMarker;
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Publishes the outgoing track to a v4l2loopback device, so any video-call
/// application can pick it up as a camera.
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
    source: TrackSource,
    replacements: u64,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self, MediaError> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path).map_err(|err| {
            MediaError::Transport(format!("failed to open {}: {}", path.display(), err))
        })?;
        let format = Format::new(width, height, FourCC::new(b"YUYV"));
        device
            .set_format(&format)
            .map_err(|err| MediaError::Transport(format!("failed to set YUYV format: {}", err)))?;

        // v4l2loopback accepts raw frames written to the device file
        let file = File::options().write(true).open(path).map_err(|err| {
            MediaError::Transport(format!("failed to open {} for writing: {}", path.display(), err))
        })?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width,
            height,
            source: TrackSource::Camera,
            replacements: 0,
        })
    }
}

/// Packs RGB into YUV 4:2:2 (YUYV); chroma is averaged over each pixel pair.
fn rgb_to_yuyv(rgb_image: &RgbImage) -> Vec<u8> {
    let (width, height) = rgb_image.dimensions();
    let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let pixel1 = rgb_image.get_pixel(x, y);
            let pixel2 = if x + 1 < width {
                rgb_image.get_pixel(x + 1, y)
            } else {
                pixel1
            };

            let (y1, u1, v1) = rgb_to_yuv(pixel1[0], pixel1[1], pixel1[2]);
            let (y2, u2, v2) = rgb_to_yuv(pixel2[0], pixel2[1], pixel2[2]);

            let u = ((u1 as u16 + u2 as u16) / 2) as u8;
            let v = ((v1 as u16 + v2 as u16) / 2) as u8;

            yuyv.extend_from_slice(&[y1, u, y2, v]);
        }
    }

    yuyv
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl CallTransport for V4L2Output {
    fn replace_outgoing_video(&mut self, source: TrackSource) -> Result<(), MediaError> {
        tracing::debug!("Loopback now fed by {:?}", source);
        self.source = source;
        self.replacements += 1;
        Ok(())
    }

    fn attach_audio_tracks(&mut self, tracks: &[AudioTrack]) -> Result<(), MediaError> {
        if !tracks.is_empty() {
            tracing::debug!("Loopback carries video only, ignoring {} audio tracks", tracks.len());
        }
        Ok(())
    }

    fn outgoing_video_sender(&self) -> VideoSender {
        VideoSender {
            source: self.source,
            replacements: self.replacements,
        }
    }

    fn write_frame(&mut self, frame: &RgbImage, _marker: FrameMarker) -> Result<(), MediaError> {
        let yuyv = if frame.dimensions() != (self.width, self.height) {
            let resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            rgb_to_yuyv(&resized)
        } else {
            rgb_to_yuyv(frame)
        };

        self.file
            .write_all(&yuyv)
            .map_err(|err| MediaError::Transport(format!("failed to write frame: {}", err)))
    }
}
