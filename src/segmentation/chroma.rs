use super::{ProcessOutput, SegmentationBackend, SegmentationOutput};
use crate::background::BackgroundSpec;
use crate::compositor::{blur_background, matte};
use crate::error::{InitError, ProcessError};
use crate::frame::{Frame, Mask};
use crate::registry::{self, Resolution};
use async_trait::async_trait;
use image::{imageops, RgbImage};
use tokio::time::Instant;

/// Green-screen keying.
///
/// Cheap enough to finish the blur itself, so for `Blur` it hands back a fully
/// composited frame; for every other background it returns the matte.
#[derive(Debug, Clone, Copy)]
pub struct ChromaKey {
    resolution: Resolution,
    key: [f32; 3],
    tolerance: f32,
    softness: f32,
    ready: bool,
}

impl ChromaKey {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            key: [0.0, 177.0, 64.0],
            tolerance: 90.0,
            softness: 40.0,
            ready: false,
        }
    }

    pub fn with_key(mut self, rgb: [u8; 3]) -> Self {
        self.key = rgb.map(f32::from);
        self
    }

    fn key_mask(&self, image: &RgbImage) -> Mask {
        let small = if image.dimensions() == (self.resolution.width, self.resolution.height) {
            image.clone()
        } else {
            imageops::resize(
                image,
                self.resolution.width,
                self.resolution.height,
                imageops::FilterType::Triangle,
            )
        };

        let alpha = small
            .pixels()
            .map(|p| {
                let distance = p
                    .0
                    .iter()
                    .zip(self.key.iter())
                    .map(|(&c, &k)| (c as f32 - k).powi(2))
                    .sum::<f32>()
                    .sqrt();
                ((distance - self.tolerance) / self.softness).clamp(0.0, 1.0)
            })
            .collect();

        Mask::new(self.resolution.width, self.resolution.height, alpha)
            .unwrap_or_else(|| Mask::filled(self.resolution.width, self.resolution.height, 1.0))
    }
}

#[async_trait]
impl SegmentationBackend for ChromaKey {
    fn id(&self) -> &str {
        registry::CHROMA
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn init(&mut self) -> Result<(), InitError> {
        if self.resolution.area() == 0 {
            return Err(InitError::Runtime {
                backend: registry::CHROMA.to_string(),
                reason: format!("invalid key resolution {}", self.resolution),
            });
        }
        self.ready = true;
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: &Frame,
        background: &BackgroundSpec,
    ) -> Result<ProcessOutput, ProcessError> {
        if !self.ready {
            return Err(ProcessError::NotReady);
        }

        let started = Instant::now();
        let keyer = *self;
        let frame = frame.clone();
        let blur = match background {
            BackgroundSpec::Blur(radius) => Some(*radius),
            _ => None,
        };

        let (output, segmentation_latency) = tokio::task::spawn_blocking(move || {
            let _span = tracing::debug_span!("chroma_key").entered();
            let segment_start = Instant::now();
            let mask = keyer.key_mask(frame.image());
            let segmentation_latency = segment_start.elapsed();

            let output = match blur {
                Some(radius) => {
                    let (width, height) = frame.dimensions();
                    let mask = mask.resample_nearest(width, height);
                    let background = blur_background(frame.image(), radius);
                    SegmentationOutput::Composited(matte(frame.image(), &background, &mask))
                }
                None => SegmentationOutput::Mask(mask),
            };
            (output, segmentation_latency)
        })
        .await
        .map_err(|err| ProcessError::Worker(err.to_string()))?;

        Ok(ProcessOutput {
            output,
            segmentation_latency,
            total_latency: started.elapsed(),
        })
    }

    async fn dispose(&mut self) {
        self.ready = false;
    }
}
