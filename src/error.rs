use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Host capability a backend variant may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ParallelExtension,
    GpuAcceleration,
    GpuTier2,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Feature::ParallelExtension => "parallel compute extension",
            Feature::GpuAcceleration => "GPU acceleration",
            Feature::GpuTier2 => "tier-2 GPU acceleration",
        };
        f.write_str(label)
    }
}

/// A backend could not acquire its inference resource.
#[derive(Debug, Clone, Error)]
pub enum InitError {
    #[error("{backend} needs {feature}, which this host lacks")]
    MissingFeature { backend: String, feature: Feature },

    #[error("{backend} could not load {asset}: {reason}")]
    Asset {
        backend: String,
        asset: String,
        reason: String,
    },

    #[error("{backend} did not initialize within {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("{backend} failed to start: {reason}")]
    Runtime { backend: String, reason: String },
}

/// A single frame could not be segmented or composited.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error("backend is not initialized")]
    NotReady,

    #[error("frame is {width}x{height}, which the backend cannot process")]
    InvalidFrame { width: u32, height: u32 },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference worker stopped: {0}")]
    Worker(String),

    #[error("inference did not finish within {0:?}")]
    Timeout(Duration),
}

/// A backend choice could not be resolved against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    #[error("backend `{0}` is planned but not implemented")]
    Planned(String),

    #[error("backend `{backend}` has no variant matching {requested}")]
    UnknownVariant { backend: String, requested: String },

    #[error("backend `{backend}` variant {variant} needs {feature}, which this host lacks")]
    CapabilityMismatch {
        backend: String,
        variant: String,
        feature: Feature,
    },

    #[error("no implemented backend is supported on this host")]
    NoneSupported,
}

/// A hot-swap did not complete.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("could not start {backend}: {source}")]
    Init {
        backend: String,
        #[source]
        source: InitError,
        /// Backend that was restored after the failure, if any.
        reverted_to: Option<String>,
    },

    #[error("switch was superseded by a newer request")]
    Superseded,

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Errors surfaced to the UI by the background-effect controls.
#[derive(Debug, Error)]
pub enum EffectError {
    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl From<SelectionError> for EffectError {
    fn from(err: SelectionError) -> Self {
        EffectError::Switch(SwitchError::Selection(err))
    }
}

/// Camera or transport failures. Fatal to a call, and kept distinct from
/// background-effect errors.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("camera stream ended")]
    CameraStopped,

    #[error("transport error: {0}")]
    Transport(String),
}
