//! Real-time background segmentation for video calls.
//!
//! A [`controller::EffectsController`] owns one call's [`capture_loop::CaptureLoop`]:
//! camera frames go through a pluggable segmentation backend and the compositor
//! before being published on the outgoing track. Backends can be swapped while
//! the call runs; the [`coordinator::SwitchCoordinator`] makes that safe.

pub mod background;
pub mod capture;
pub mod capture_loop;
pub mod compositor;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod output;
pub mod policy;
pub mod registry;
pub mod segmentation;
pub mod signaling;

pub use background::{BackgroundSpec, ImageHandle};
pub use capture_loop::{EffectEvent, LoopState, TickOutcome};
pub use config::EffectsConfig;
pub use controller::{EffectsController, FrameTicker, IntervalTicker};
pub use error::{EffectError, MediaError};
pub use registry::{BackendChoice, Registry, Selection};
