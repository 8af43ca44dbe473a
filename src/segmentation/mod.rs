//! Segmentation backends: one adapter per technology behind a single capability.
//!
//! The set of adapters is closed ([`Backend`]); the capture loop only sees
//! `Box<dyn SegmentationBackend>` produced by a [`BackendFactory`], which is
//! what lets tests swap in stubs.

mod chroma;
mod difference;
mod preprocess;
#[cfg(feature = "onnx")]
mod rvm;

pub use chroma::ChromaKey;
pub use difference::DifferenceSegmenter;
pub use preprocess::Preprocessor;
#[cfg(feature = "onnx")]
pub use rvm::RobustVideoMatting;

use crate::background::BackgroundSpec;
use crate::error::{InitError, ProcessError};
use crate::frame::{Frame, Mask};
use crate::registry::{self, Selection};
use async_trait::async_trait;
use image::RgbImage;
use std::path::PathBuf;
use std::time::Duration;

/// Result of segmenting one frame.
#[derive(Debug, Clone)]
pub enum SegmentationOutput {
    /// Foreground matte; the compositor finishes the frame.
    Mask(Mask),
    /// Final picture, already composited by the backend.
    Composited(RgbImage),
    /// Inference is still catching up; show the previous result again.
    ReuseLast,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub output: SegmentationOutput,
    pub segmentation_latency: Duration,
    pub total_latency: Duration,
}

/// Capability every segmentation technology implements.
///
/// All calls are asynchronous. Backends whose inference blocks must move it off
/// the calling task (e.g. `spawn_blocking`) so that a call never stalls the loop
/// for longer than a tick before yielding.
#[async_trait]
pub trait SegmentationBackend: Send {
    fn id(&self) -> &str;

    fn is_ready(&self) -> bool;

    /// Acquire the inference resource.
    ///
    /// Idempotent: a second call on a ready backend allocates nothing. Dropping the
    /// returned future mid-way must not leak the resource.
    async fn init(&mut self) -> Result<(), InitError>;

    async fn process_frame(
        &mut self,
        frame: &Frame,
        background: &BackgroundSpec,
    ) -> Result<ProcessOutput, ProcessError>;

    /// Release everything. Safe before `init` completed and safe to repeat.
    async fn dispose(&mut self);
}

/// The closed set of built-in adapters.
pub enum Backend {
    Difference(DifferenceSegmenter),
    Chroma(ChromaKey),
    #[cfg(feature = "onnx")]
    Rvm(RobustVideoMatting),
}

#[async_trait]
impl SegmentationBackend for Backend {
    fn id(&self) -> &str {
        match self {
            Backend::Difference(backend) => backend.id(),
            Backend::Chroma(backend) => backend.id(),
            #[cfg(feature = "onnx")]
            Backend::Rvm(backend) => backend.id(),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Backend::Difference(backend) => backend.is_ready(),
            Backend::Chroma(backend) => backend.is_ready(),
            #[cfg(feature = "onnx")]
            Backend::Rvm(backend) => backend.is_ready(),
        }
    }

    async fn init(&mut self) -> Result<(), InitError> {
        match self {
            Backend::Difference(backend) => backend.init().await,
            Backend::Chroma(backend) => backend.init().await,
            #[cfg(feature = "onnx")]
            Backend::Rvm(backend) => backend.init().await,
        }
    }

    async fn process_frame(
        &mut self,
        frame: &Frame,
        background: &BackgroundSpec,
    ) -> Result<ProcessOutput, ProcessError> {
        match self {
            Backend::Difference(backend) => backend.process_frame(frame, background).await,
            Backend::Chroma(backend) => backend.process_frame(frame, background).await,
            #[cfg(feature = "onnx")]
            Backend::Rvm(backend) => backend.process_frame(frame, background).await,
        }
    }

    async fn dispose(&mut self) {
        match self {
            Backend::Difference(backend) => backend.dispose().await,
            Backend::Chroma(backend) => backend.dispose().await,
            #[cfg(feature = "onnx")]
            Backend::Rvm(backend) => backend.dispose().await,
        }
    }
}

/// Builds uninitialized backends for a resolved selection.
pub trait BackendFactory: Send + Sync {
    fn create(&self, selection: &Selection) -> Result<Box<dyn SegmentationBackend>, InitError>;
}

/// Factory for the built-in adapters.
#[derive(Debug, Clone, Default)]
pub struct DefaultBackendFactory {
    #[cfg_attr(not(feature = "onnx"), allow(dead_code))]
    model_path: Option<PathBuf>,
}

impl DefaultBackendFactory {
    pub fn new(model_path: Option<PathBuf>) -> Self {
        Self { model_path }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, selection: &Selection) -> Result<Box<dyn SegmentationBackend>, InitError> {
        let variant = &selection.variant;
        let backend = match selection.backend_id.as_str() {
            registry::DIFFERENCE => Backend::Difference(DifferenceSegmenter::new(
                variant.resolution,
                variant.requires_parallel_extension,
            )),
            registry::CHROMA => Backend::Chroma(ChromaKey::new(variant.resolution)),
            #[cfg(feature = "onnx")]
            registry::RVM => {
                let Some(path) = self.model_path.clone() else {
                    return Err(InitError::Asset {
                        backend: selection.backend_id.clone(),
                        asset: "model".to_string(),
                        reason: "no model path configured (use --model)".to_string(),
                    });
                };
                Backend::Rvm(RobustVideoMatting::new(path, variant.resolution, variant.kind))
            }
            other => {
                return Err(InitError::Runtime {
                    backend: other.to_string(),
                    reason: "not available in this build".to_string(),
                })
            }
        };
        tracing::debug!(
            "Created {} backend ({} {})",
            selection.backend_id,
            variant.resolution,
            variant.kind
        );
        Ok(Box::new(backend))
    }
}
