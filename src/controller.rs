//! What the call UI talks to.

use crate::background::BackgroundSpec;
use crate::capture::CaptureSource;
use crate::capture_loop::{CaptureLoop, EffectEvent, LoopState, TickOutcome};
use crate::config::EffectsConfig;
use crate::coordinator::SwitchCoordinator;
use crate::error::{EffectError, MediaError};
use crate::metrics::{ComparisonTable, MetricsSnapshot};
use crate::output::{AudioTrack, CallTransport, VideoSender};
use crate::policy::InferencePolicy;
use crate::registry::{BackendChoice, BackendDescriptor, Capabilities, Registry, Selection};
use crate::segmentation::BackendFactory;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Paces the capture loop, standing in for the display refresh signal.
#[async_trait]
pub trait FrameTicker: Send {
    async fn next_tick(&mut self);
}

/// Fixed-rate ticker. Late ticks are skipped, never bunched up.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn from_fps(fps: f64) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / fps.max(1.0)))
    }
}

#[async_trait]
impl FrameTicker for IntervalTicker {
    async fn next_tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Background effects for one call.
pub struct EffectsController {
    capture_loop: Arc<Mutex<CaptureLoop>>,
    coordinator: Arc<SwitchCoordinator>,
    events: broadcast::Sender<EffectEvent>,
    shutdown: watch::Sender<bool>,
    driver: Option<JoinHandle<Result<u64, MediaError>>>,
}

impl EffectsController {
    /// Attach the raw camera and audio to the call; effects start disabled.
    ///
    /// Fails with a [`MediaError`] when the camera or transport is unusable.
    pub fn start_call(
        capture: Box<dyn CaptureSource>,
        transport: Box<dyn CallTransport>,
        registry: Registry,
        factory: Arc<dyn BackendFactory>,
        config: EffectsConfig,
        audio: &[AudioTrack],
    ) -> Result<Self, MediaError> {
        let (events, _) = broadcast::channel(32);
        let mut capture_loop = CaptureLoop::new(capture, transport, config.clone(), events.clone());
        capture_loop.start_call(audio)?;

        let coordinator = SwitchCoordinator::new(
            Arc::new(RwLock::new(registry)),
            factory,
            config,
            events.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            capture_loop: Arc::new(Mutex::new(capture_loop)),
            coordinator: Arc::new(coordinator),
            events,
            shutdown,
            driver: None,
        })
    }

    /// Start the pinned backend (or the recommended one).
    pub async fn enable_background_effect(&self) -> Result<Selection, EffectError> {
        let choice = self.coordinator.registry().pinned().clone();
        Ok(self.coordinator.activate(&self.capture_loop, choice).await?)
    }

    pub async fn disable_background_effect(&self) -> Result<(), EffectError> {
        Ok(self.coordinator.deactivate(&self.capture_loop).await?)
    }

    pub async fn set_background_spec(&self, spec: BackgroundSpec) {
        self.capture_loop.lock().await.set_background(spec);
    }

    pub async fn set_inference_policy(&self, policy: Box<dyn InferencePolicy>) {
        self.capture_loop.lock().await.set_policy(policy);
    }

    /// Pick a backend. While the effect is off this only records the choice.
    pub async fn select_backend(&self, choice: BackendChoice) -> Result<Selection, EffectError> {
        let state = self.capture_loop.lock().await.state();
        if state == LoopState::Disabled {
            return Ok(self.coordinator.pin(choice)?);
        }
        Ok(self.coordinator.activate(&self.capture_loop, choice).await?)
    }

    pub fn device_capabilities(&self) -> Capabilities {
        self.coordinator.registry().capabilities()
    }

    pub fn backends(&self) -> Vec<BackendDescriptor> {
        self.coordinator.registry().descriptors().to_vec()
    }

    pub async fn current_metrics(&self) -> MetricsSnapshot {
        self.capture_loop.lock().await.metrics()
    }

    pub async fn comparison_table(&self) -> ComparisonTable {
        self.capture_loop.lock().await.comparison().clone()
    }

    pub async fn state(&self) -> LoopState {
        self.capture_loop.lock().await.state()
    }

    pub async fn active_selection(&self) -> Option<Selection> {
        self.capture_loop.lock().await.active_selection().cloned()
    }

    pub async fn outgoing_video_sender(&self) -> VideoSender {
        self.capture_loop.lock().await.outgoing_video_sender()
    }

    pub async fn process_errors(&self) -> u64 {
        self.capture_loop.lock().await.process_errors()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EffectEvent> {
        self.events.subscribe()
    }

    /// Run one iteration by hand, for callers that own the pacing.
    pub async fn tick(&self) -> Result<TickOutcome, MediaError> {
        self.capture_loop.lock().await.tick().await
    }

    /// Drive the loop from `ticker` on a background task until the call ends or
    /// the camera fails. The task yields the number of ticks it ran.
    pub fn spawn_driver(&mut self, mut ticker: impl FrameTicker + 'static) {
        let capture_loop = Arc::clone(&self.capture_loop);
        let mut shutdown = self.shutdown.subscribe();

        self.driver = Some(tokio::spawn(async move {
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.next_tick() => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(err) = capture_loop.lock().await.tick().await {
                    tracing::error!("Capture loop stopped: {}", err);
                    return Err(err);
                }
                ticks += 1;
            }
            Ok(ticks)
        }));
    }

    /// Whether the driver task has stopped on its own (camera or transport failure).
    pub fn driver_finished(&self) -> bool {
        self.driver.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Dispose the backend, restore the camera track and stop the driver.
    ///
    /// Returns the driver's tick count, or the media error that stopped it.
    pub async fn end_call(mut self) -> Result<u64, EffectError> {
        if let Err(err) = self.coordinator.deactivate(&self.capture_loop).await {
            tracing::warn!("Could not shut the effect down cleanly: {}", err);
        }
        let _ = self.shutdown.send(true);

        let Some(driver) = self.driver.take() else {
            return Ok(0);
        };
        match driver.await {
            Ok(result) => Ok(result?),
            Err(err) => Err(MediaError::Transport(format!("capture driver failed: {err}")).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCapture;
    use crate::error::{SelectionError, SwitchError};
    use crate::output::{RecordingTransport, TrackSource};
    use crate::registry::tests::{caps, test_registry};
    use crate::registry::{PerformanceClass, Resolution, VariantRequest};
    use crate::segmentation::stub::StubFactory;
    use crate::segmentation::DefaultBackendFactory;

    fn controller(transport: &RecordingTransport) -> EffectsController {
        EffectsController::start_call(
            Box::new(SyntheticCapture::new(16, 16, 30.0)),
            Box::new(transport.clone()),
            test_registry(caps(true, false, false, PerformanceClass::High)),
            Arc::new(StubFactory::default()),
            EffectsConfig::default(),
            &[AudioTrack { id: "mic".into() }],
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn selection_while_disabled_is_remembered() {
        let transport = RecordingTransport::new();
        let effects = controller(&transport);

        let picked = effects
            .select_backend(BackendChoice::explicit("a", None))
            .await
            .unwrap();
        assert_eq!(picked.backend_id, "a");
        assert_eq!(effects.state().await, LoopState::Disabled);
        assert_eq!(transport.log().replacements, vec![TrackSource::Camera]);

        let started = effects.enable_background_effect().await.unwrap();
        assert_eq!(started, picked);
        assert_eq!(effects.state().await, LoopState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_planned_backends_are_rejected() {
        let transport = RecordingTransport::new();
        let effects = controller(&transport);

        let err = effects
            .select_backend(BackendChoice::explicit("nope", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EffectError::Switch(SwitchError::Selection(SelectionError::UnknownBackend(_)))
        ));

        let err = effects
            .select_backend(BackendChoice::explicit("later", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EffectError::Switch(SwitchError::Selection(SelectionError::Planned(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_reset_on_switch() {
        let transport = RecordingTransport::new();
        let effects = controller(&transport);
        effects
            .select_backend(BackendChoice::explicit("a", None))
            .await
            .unwrap();
        effects.enable_background_effect().await.unwrap();
        for _ in 0..4 {
            effects.tick().await.unwrap();
        }
        assert_eq!(effects.current_metrics().await.frames_processed, 4);

        let request = VariantRequest {
            resolution: Some(Resolution::new(512, 512)),
            kind: None,
        };
        // Needs a GPU this host does not have
        assert!(effects
            .select_backend(BackendChoice::explicit("b", Some(request)))
            .await
            .is_err());
        assert_eq!(effects.current_metrics().await.frames_processed, 4);

        effects
            .select_backend(BackendChoice::explicit("b", None))
            .await
            .unwrap();
        let metrics = effects.current_metrics().await;
        assert_eq!(metrics.frames_processed, 0);
        assert_eq!(metrics.backend.as_deref(), Some("b"));
        assert!(effects.comparison_table().await.get("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn driver_runs_until_call_ends() {
        let transport = RecordingTransport::new();
        let mut effects = controller(&transport);
        effects.enable_background_effect().await.unwrap();
        effects.set_background_spec(BackgroundSpec::Blur(4)).await;
        effects.spawn_driver(IntervalTicker::new(Duration::from_millis(33)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!effects.driver_finished());

        let ticks = effects.end_call().await.unwrap();
        assert!(ticks >= 25, "{ticks}");
        let log = transport.log();
        assert!(log.published.len() as u64 >= 25);
        assert_eq!(log.replacements.last(), Some(&TrackSource::Camera));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_stops_when_camera_does() {
        let transport = RecordingTransport::new();
        let mut effects = EffectsController::start_call(
            Box::new(SyntheticCapture::new(8, 8, 30.0).with_limit(3)),
            Box::new(transport.clone()),
            test_registry(caps(true, false, false, PerformanceClass::High)),
            Arc::new(StubFactory::default()),
            EffectsConfig::default(),
            &[],
        )
        .unwrap();
        effects.spawn_driver(IntervalTicker::new(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(effects.driver_finished());
        assert!(matches!(
            effects.end_call().await,
            Err(EffectError::Media(MediaError::CameraStopped))
        ));
    }

    #[tokio::test]
    async fn difference_backend_end_to_end() {
        let transport = RecordingTransport::new();
        let effects = EffectsController::start_call(
            Box::new(SyntheticCapture::new(160, 120, 30.0)),
            Box::new(transport.clone()),
            Registry::new(caps(false, false, false, PerformanceClass::Medium)),
            Arc::new(DefaultBackendFactory::default()),
            EffectsConfig::default(),
            &[],
        )
        .unwrap();

        effects.set_background_spec(BackgroundSpec::Blur(6)).await;
        let selection = effects
            .select_backend(BackendChoice::explicit(crate::registry::DIFFERENCE, None))
            .await
            .unwrap();
        assert_eq!(selection.variant.resolution, Resolution::new(160, 120));
        effects.enable_background_effect().await.unwrap();

        for _ in 0..12 {
            let outcome = effects.tick().await.unwrap();
            assert!(matches!(outcome, TickOutcome::Published { .. }));
        }
        assert_eq!(effects.current_metrics().await.frames_processed, 12);
        assert_eq!(transport.log().published.len(), 12);
        assert_eq!(effects.process_errors().await, 0);

        effects.end_call().await.unwrap();
        assert_eq!(transport.outgoing_video_sender().source, TrackSource::Camera);
    }
}
