use super::preprocess::Preprocessor;
use super::{ProcessOutput, SegmentationBackend, SegmentationOutput};
use crate::background::BackgroundSpec;
use crate::error::{Feature, InitError, ProcessError};
use crate::frame::{Frame, Mask};
use crate::registry::{self, Resolution};
use async_trait::async_trait;
use ndarray::{Array2, Zip};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

/// Luma distance below which a pixel counts as background.
const DEFAULT_THRESHOLD: f32 = 28.0;
/// Width of the soft edge around the threshold, in luma levels.
const DEFAULT_SOFTNESS: f32 = 12.0;
/// How quickly background pixels follow lighting changes.
const DEFAULT_LEARNING_RATE: f32 = 0.05;

#[derive(Debug, Clone, Copy)]
struct DiffParams {
    threshold: f32,
    softness: f32,
    learning_rate: f32,
}

/// Running-average background subtraction.
///
/// The first frame seeds the background plate (everything is treated as
/// foreground until then). Afterwards pixels far from the plate are foreground,
/// and only background pixels feed back into the plate, so a subject that
/// stands still is not absorbed.
///
/// The plate lives behind a shared slot that the blocking worker updates
/// itself, so an abandoned request still leaves it in place.
pub struct DifferenceSegmenter {
    preprocessor: Preprocessor,
    parallel: bool,
    params: DiffParams,
    plate: Arc<Mutex<Option<Array2<f32>>>>,
    ready: bool,
}

impl DifferenceSegmenter {
    pub fn new(resolution: Resolution, parallel: bool) -> Self {
        Self {
            preprocessor: Preprocessor::new(resolution.width, resolution.height),
            parallel,
            params: DiffParams {
                threshold: DEFAULT_THRESHOLD,
                softness: DEFAULT_SOFTNESS,
                learning_rate: DEFAULT_LEARNING_RATE,
            },
            plate: Arc::default(),
            ready: false,
        }
    }
}

#[async_trait]
impl SegmentationBackend for DifferenceSegmenter {
    fn id(&self) -> &str {
        registry::DIFFERENCE
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn init(&mut self) -> Result<(), InitError> {
        if self.ready {
            return Ok(());
        }
        if self.parallel && rayon::current_num_threads() < 2 {
            return Err(InitError::MissingFeature {
                backend: registry::DIFFERENCE.to_string(),
                feature: Feature::ParallelExtension,
            });
        }
        let (width, height) = self.preprocessor.target_size();
        tracing::info!(
            "Background difference ready at {}x{} (parallel={})",
            width,
            height,
            self.parallel
        );
        self.ready = true;
        Ok(())
    }

    async fn process_frame(
        &mut self,
        frame: &Frame,
        _background: &BackgroundSpec,
    ) -> Result<ProcessOutput, ProcessError> {
        if !self.ready {
            return Err(ProcessError::NotReady);
        }
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(ProcessError::InvalidFrame { width, height });
        }

        let started = Instant::now();
        let frame = frame.clone();
        let preprocessor = self.preprocessor;
        let params = self.params;
        let parallel = self.parallel;
        let slot = Arc::clone(&self.plate);

        let (mask, segmentation_latency) = tokio::task::spawn_blocking(move || {
            let _span = tracing::debug_span!("difference_segment").entered();
            let luma = preprocessor.to_luma(frame.image());
            let segment_start = Instant::now();
            let mut plate = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let mask = segment(&mut plate, luma, params, parallel);
            (mask, segment_start.elapsed())
        })
        .await
        .map_err(|err| ProcessError::Worker(err.to_string()))?;

        Ok(ProcessOutput {
            output: SegmentationOutput::Mask(mask),
            segmentation_latency,
            total_latency: started.elapsed(),
        })
    }

    async fn dispose(&mut self) {
        if self.ready {
            tracing::debug!("Releasing background plate");
        }
        // A worker still running keeps its own handle to the old plate
        self.plate = Arc::default();
        self.ready = false;
    }
}

fn segment(
    plate: &mut Option<Array2<f32>>,
    luma: Array2<f32>,
    params: DiffParams,
    parallel: bool,
) -> Mask {
    let (height, width) = luma.dim();
    if !plate.as_ref().is_some_and(|bg| bg.dim() == luma.dim()) {
        *plate = Some(luma);
        return Mask::filled(width as u32, height as u32, 1.0);
    }
    let Some(bg) = plate.as_mut() else {
        return Mask::filled(width as u32, height as u32, 1.0);
    };

    let mut alpha = Array2::<f32>::zeros((height, width));
    let update = |a: &mut f32, bg: &mut f32, &px: &f32| {
        let diff = (px - *bg).abs();
        *a = ((diff - params.threshold) / params.softness + 0.5).clamp(0.0, 1.0);
        if *a < 0.5 {
            *bg += (px - *bg) * params.learning_rate;
        }
    };
    let zip = Zip::from(&mut alpha).and(bg).and(&luma);
    if parallel {
        zip.par_for_each(update);
    } else {
        zip.for_each(update);
    }

    let values: Vec<f32> = alpha.iter().copied().collect();
    Mask::new(width as u32, height as u32, values)
        .unwrap_or_else(|| Mask::filled(width as u32, height as u32, 1.0))
}
