use super::preprocess::Preprocessor;
use super::{ProcessOutput, SegmentationBackend, SegmentationOutput};
use crate::background::BackgroundSpec;
use crate::error::{InitError, ProcessError};
use crate::frame::{Frame, Mask};
use crate::registry::{self, BackendKind, Resolution};
use async_trait::async_trait;
use ndarray::{Array1, Array4, Ix4};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use tokio::time::Instant;

/// Hidden states are kept at this fraction of the input resolution.
const DOWNSAMPLE_RATIO: f32 = 0.25;

/// RobustVideoMatting through ONNX Runtime.
///
/// This model uses recurrent connections to maintain temporal consistency.
/// Hidden states (r1-r4) are carried between frames for smooth results.
///
/// The session is only ever locked on the blocking pool. Async callers never
/// wait for it: a hung inference can outlive a request, and dispose must not
/// stall a runtime worker behind it.
pub struct RobustVideoMatting {
    model_path: PathBuf,
    kind: BackendKind,
    preprocessor: Preprocessor,
    state: Arc<Mutex<Option<RvmState>>>,
    ready: bool,
}

struct RvmState {
    session: Session,
    // Recurrent hidden states, fed back in on the next frame
    r1: Array4<f32>,
    r2: Array4<f32>,
    r3: Array4<f32>,
    r4: Array4<f32>,
}

impl RvmState {
    fn new(session: Session) -> Self {
        // RVM accepts 1x1x1x1 zero states on the first frame and grows them itself
        let zeros = || Array4::<f32>::zeros((1, 1, 1, 1));
        Self {
            session,
            r1: zeros(),
            r2: zeros(),
            r3: zeros(),
            r4: zeros(),
        }
    }

    fn infer(&mut self, input: Array4<f32>) -> Result<Mask, ort::Error> {
        let ratio = Array1::from_elem(1, DOWNSAMPLE_RATIO);
        let outputs = self.session.run(ort::inputs![
            "src" => Tensor::from_array(input)?,
            "r1i" => Tensor::from_array(self.r1.clone())?,
            "r2i" => Tensor::from_array(self.r2.clone())?,
            "r3i" => Tensor::from_array(self.r3.clone())?,
            "r4i" => Tensor::from_array(self.r4.clone())?,
            "downsample_ratio" => Tensor::from_array(ratio)?,
        ])?;

        let hidden = |name: &str| -> Result<Array4<f32>, ort::Error> {
            outputs[name]
                .try_extract_array::<f32>()?
                .to_owned()
                .into_dimensionality::<Ix4>()
                .map_err(|err| ort::Error::new(err.to_string()))
        };
        let r1 = hidden("r1o")?;
        let r2 = hidden("r2o")?;
        let r3 = hidden("r3o")?;
        let r4 = hidden("r4o")?;

        // Alpha matte, shape [1, 1, H, W]
        let pha = outputs["pha"].try_extract_array::<f32>()?;
        let shape = pha.shape().to_vec();
        let (height, width) = (shape[2] as u32, shape[3] as u32);
        let matte: Vec<f32> = pha.iter().copied().collect();
        drop(outputs);

        self.r1 = r1;
        self.r2 = r2;
        self.r3 = r3;
        self.r4 = r4;

        Mask::new(width, height, matte)
            .ok_or_else(|| ort::Error::new(format!("matte shape {shape:?} does not match data")))
    }
}

impl RobustVideoMatting {
    pub fn new(model_path: PathBuf, resolution: Resolution, kind: BackendKind) -> Self {
        Self {
            model_path,
            kind,
            preprocessor: Preprocessor::new(resolution.width, resolution.height),
            state: Arc::default(),
            ready: false,
        }
    }

    fn build_session(path: &PathBuf, kind: BackendKind) -> Result<Session, ort::Error> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        let builder = match kind {
            BackendKind::Cpu => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])?
            }
            BackendKind::Cuda => builder.with_execution_providers([CUDAExecutionProvider::default()
                .build()
                .error_on_failure()])?,
            BackendKind::TensorRt => builder.with_execution_providers([
                TensorRTExecutionProvider::default().build().error_on_failure(),
                CUDAExecutionProvider::default().build(),
            ])?,
        };

        builder.commit_from_file(path)
    }
}

#[async_trait]
impl SegmentationBackend for RobustVideoMatting {
    fn id(&self) -> &str {
        registry::RVM
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn init(&mut self) -> Result<(), InitError> {
        if self.ready {
            return Ok(());
        }

        let path = self.model_path.clone();
        let kind = self.kind;
        tracing::info!("Loading RVM model from {} ({})", path.display(), kind);

        // If the caller drops this future, the blocking load still finishes and
        // its session is dropped with the closure result.
        let session = tokio::task::spawn_blocking(move || Self::build_session(&path, kind))
            .await
            .map_err(|err| InitError::Runtime {
                backend: registry::RVM.to_string(),
                reason: err.to_string(),
            })?
            .map_err(|err| InitError::Asset {
                backend: registry::RVM.to_string(),
                asset: self.model_path.display().to_string(),
                reason: err.to_string(),
            })?;

        // Fresh slot: nothing else holds a handle to it yet
        self.state = Arc::new(Mutex::new(Some(RvmState::new(session))));
        self.ready = true;
        tracing::info!("RVM model loaded successfully");
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

        let started = Instant::now();
        let state = Arc::clone(&self.state);
        let preprocessor = self.preprocessor;
        let frame = frame.clone();

        let (mask, segmentation_latency) = tokio::task::spawn_blocking(move || {
            let _span = tracing::debug_span!("rvm_segment").entered();
            let input = preprocessor.to_nchw(frame.image());

            let mut guard = state
                .lock()
                .map_err(|_| ProcessError::Worker("state lock poisoned".into()))?;
            let rvm = guard.as_mut().ok_or(ProcessError::NotReady)?;

            let _infer_span = tracing::debug_span!("inference").entered();
            let infer_start = Instant::now();
            let mask = rvm
                .infer(input)
                .map_err(|err| ProcessError::Inference(err.to_string()))?;
            Ok::<_, ProcessError>((mask, infer_start.elapsed()))
        })
        .await
        .map_err(|err| ProcessError::Worker(err.to_string()))??;

        Ok(ProcessOutput {
            output: SegmentationOutput::Mask(mask),
            segmentation_latency,
            total_latency: started.elapsed(),
        })
    }

    async fn dispose(&mut self) {
        self.ready = false;
        let state = std::mem::take(&mut self.state);
        let busy = match state.try_lock() {
            Ok(mut slot) => {
                if slot.take().is_some() {
                    tracing::info!("Released RVM session and hidden states");
                }
                false
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
                false
            }
            Err(TryLockError::WouldBlock) => true,
        };

        if busy {
            tracing::warn!("RVM inference still running, session is released when it returns");
            tokio::task::spawn_blocking(move || {
                state.lock().unwrap_or_else(PoisonError::into_inner).take();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[tokio::test]
    async fn dispose_does_not_wait_for_running_inference() {
        let mut backend = RobustVideoMatting::new(
            PathBuf::from("rvm_mobilenetv3_fp32.onnx"),
            Resolution::new(256, 256),
            BackendKind::Cpu,
        );
        backend.ready = true;

        // Stands in for an inference stuck inside the session lock
        let state = Arc::clone(&backend.state);
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            let _guard = state.lock().unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();

        tokio::time::timeout(Duration::from_secs(1), backend.dispose())
            .await
            .expect("dispose blocked on the session lock");
        assert!(!backend.is_ready());

        release_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn dispose_before_init_and_twice() {
        let mut backend = RobustVideoMatting::new(
            PathBuf::from("missing.onnx"),
            Resolution::new(256, 256),
            BackendKind::Cpu,
        );
        backend.dispose().await;
        backend.dispose().await;
        assert!(!backend.is_ready());
        assert!(backend.init().await.is_err());
        assert!(!backend.is_ready());
    }
}
