//! Hot-swapping the active backend while the call keeps running.
//!
//! Requests are validated against the registry before anything is torn down.
//! Valid requests bump an epoch and then queue on a single lock, so the newest
//! one always runs last; an older request notices the new epoch and backs out at
//! its next checkpoint (before teardown, or while its backend initializes).

use crate::capture_loop::{ActiveBackendSession, CaptureLoop, EffectEvent, LoopState};
use crate::config::EffectsConfig;
use crate::error::{InitError, SelectionError, SwitchError};
use crate::output::SessionId;
use crate::registry::{BackendChoice, Registry, Selection};
use crate::segmentation::{BackendFactory, SegmentationBackend};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;

#[derive(Debug, Default)]
struct SwitchLedger {
    /// Last selection that initialized successfully; the revert target.
    last_good: Option<Selection>,
    next_session: u64,
}

enum StartFailure {
    Init(InitError),
    Superseded,
}

pub struct SwitchCoordinator {
    registry: Arc<RwLock<Registry>>,
    factory: Arc<dyn BackendFactory>,
    config: EffectsConfig,
    events: broadcast::Sender<EffectEvent>,
    epoch: watch::Sender<u64>,
    ledger: Mutex<SwitchLedger>,
}

impl SwitchCoordinator {
    pub fn new(
        registry: Arc<RwLock<Registry>>,
        factory: Arc<dyn BackendFactory>,
        config: EffectsConfig,
        events: broadcast::Sender<EffectEvent>,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            registry,
            factory,
            config,
            events,
            epoch,
            ledger: Mutex::new(SwitchLedger::default()),
        }
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve and pin `choice` without starting anything.
    pub fn pin(&self, choice: BackendChoice) -> Result<Selection, SelectionError> {
        self.registry_mut().select(choice)
    }

    fn next_ticket(&self) -> u64 {
        self.epoch.send_modify(|epoch| *epoch += 1);
        *self.epoch.borrow()
    }

    fn superseded(&self, ticket: u64) -> bool {
        *self.epoch.borrow() != ticket
    }

    fn report_superseded(&self, selection: &Selection) -> SwitchError {
        tracing::info!("Switch to {} superseded by a newer request", selection);
        let _ = self.events.send(EffectEvent::SwitchSuperseded {
            requested: selection.to_string(),
        });
        SwitchError::Superseded
    }

    /// Start `choice`, replacing whatever is running.
    ///
    /// On an invalid choice nothing changes. If the new backend fails to start,
    /// the last backend that worked is brought back, or the loop falls back to
    /// the raw camera when there is none.
    pub async fn activate(
        &self,
        capture_loop: &Mutex<CaptureLoop>,
        choice: BackendChoice,
    ) -> Result<Selection, SwitchError> {
        // Fail fast while the current backend is still untouched
        let selection = self.registry().resolve(&choice)?;
        let ticket = self.next_ticket();

        let mut ledger = self.ledger.lock().await;
        if self.superseded(ticket) {
            return Err(self.report_superseded(&selection));
        }

        let (current, stranded) = {
            let capture_loop = capture_loop.lock().await;
            let state = capture_loop.state();
            let running = state == LoopState::Running;
            if running && capture_loop.active_selection() == Some(&selection) {
                drop(capture_loop);
                self.pin(choice)?;
                return Ok(selection);
            }
            let current = capture_loop
                .active_selection()
                .filter(|_| running)
                .map(|s| s.backend_id.clone());
            // A superseded request may have torn the old session down already
            (current, !running && state != LoopState::Disabled)
        };

        let backend = match self.factory.create(&selection) {
            Ok(backend) => backend,
            Err(err) => {
                self.report_unavailable(&selection, &err);
                let reverted_to = if stranded {
                    self.revert(capture_loop, &mut ledger, &selection).await?
                } else {
                    current
                };
                return Err(SwitchError::Init {
                    backend: selection.backend_id.clone(),
                    source: err,
                    reverted_to,
                });
            }
        };

        tracing::info!("Switching to {}", selection);
        self.teardown(capture_loop, false).await;

        match self.start(backend, &selection, ticket).await {
            Ok(backend) => {
                self.install(capture_loop, &mut ledger, selection.clone(), backend)
                    .await?;
                self.pin(choice)?;
                Ok(selection)
            }
            // The newer request is queued on the ledger and takes over from here
            Err(StartFailure::Superseded) => Err(self.report_superseded(&selection)),
            Err(StartFailure::Init(err)) => {
                self.report_unavailable(&selection, &err);
                let reverted_to = self.revert(capture_loop, &mut ledger, &selection).await?;
                Err(SwitchError::Init {
                    backend: selection.backend_id.clone(),
                    source: err,
                    reverted_to,
                })
            }
        }
    }

    /// Stop the effect and hand the call back to the raw camera.
    pub async fn deactivate(&self, capture_loop: &Mutex<CaptureLoop>) -> Result<(), SwitchError> {
        self.next_ticket();
        let _ledger = self.ledger.lock().await;

        if capture_loop.lock().await.state() == LoopState::Disabled {
            return Ok(());
        }
        self.teardown(capture_loop, true).await;
        capture_loop.lock().await.finish_stop()?;
        Ok(())
    }

    /// Pause the loop, settle the outstanding request and release the session.
    async fn teardown(&self, capture_loop: &Mutex<CaptureLoop>, stopping: bool) {
        let pending = {
            let mut capture_loop = capture_loop.lock().await;
            if stopping {
                capture_loop.begin_stop()
            } else {
                capture_loop.begin_switch()
            }
        };
        if let Some(pending) = pending {
            pending.drain(self.config.drain_timeout, &self.events).await;
        }

        let old = capture_loop.lock().await.take_session();
        if let Some(old) = old {
            old.dispose().await;
        }
    }

    /// Initialize within the configured bound, backing out if a newer request
    /// arrives in the meantime.
    async fn start(
        &self,
        mut backend: Box<dyn SegmentationBackend>,
        selection: &Selection,
        ticket: u64,
    ) -> Result<Box<dyn SegmentationBackend>, StartFailure> {
        let epoch = self.epoch.subscribe();
        let outcome = tokio::select! {
            result = timeout(self.config.init_timeout, backend.init()) => Some(result),
            _ = wait_for_newer(epoch, ticket) => None,
        };

        match outcome {
            Some(Ok(Ok(()))) => Ok(backend),
            Some(Ok(Err(err))) => {
                backend.dispose().await;
                Err(StartFailure::Init(err))
            }
            Some(Err(_)) => {
                tracing::warn!(
                    "{} did not initialize within {:?}",
                    selection,
                    self.config.init_timeout
                );
                backend.dispose().await;
                Err(StartFailure::Init(InitError::Timeout {
                    backend: selection.backend_id.clone(),
                    timeout: self.config.init_timeout,
                }))
            }
            None => {
                backend.dispose().await;
                Err(StartFailure::Superseded)
            }
        }
    }

    async fn install(
        &self,
        capture_loop: &Mutex<CaptureLoop>,
        ledger: &mut SwitchLedger,
        selection: Selection,
        backend: Box<dyn SegmentationBackend>,
    ) -> Result<SessionId, SwitchError> {
        ledger.next_session += 1;
        let id = SessionId(ledger.next_session);
        ledger.last_good = Some(selection.clone());
        let session = ActiveBackendSession::new(id, selection, backend);
        capture_loop.lock().await.install_session(session)?;
        Ok(id)
    }

    /// Bring back the last backend that worked. Returns its id, or `None` when
    /// the loop had to be disabled instead.
    async fn revert(
        &self,
        capture_loop: &Mutex<CaptureLoop>,
        ledger: &mut SwitchLedger,
        failed: &Selection,
    ) -> Result<Option<String>, SwitchError> {
        if let Some(previous) = ledger.last_good.clone().filter(|s| s != failed) {
            tracing::info!("Reverting to {}", previous);
            let ticket = *self.epoch.borrow();
            let restored = match self.factory.create(&previous) {
                Ok(backend) => self.start(backend, &previous, ticket).await.ok(),
                Err(_) => None,
            };
            if let Some(backend) = restored {
                let id = previous.backend_id.clone();
                self.install(capture_loop, ledger, previous, backend).await?;
                return Ok(Some(id));
            }
            tracing::warn!("{} could not be restored either", previous);
        }

        capture_loop.lock().await.finish_stop()?;
        Ok(None)
    }

    fn report_unavailable(&self, selection: &Selection, err: &InitError) {
        tracing::warn!("Could not start {}: {}", selection, err);
        let _ = self.events.send(EffectEvent::BackendUnavailable {
            backend: selection.backend_id.clone(),
            reason: err.to_string(),
        });
    }
}

/// Resolves once the epoch moves past `ticket`.
async fn wait_for_newer(mut epoch: watch::Receiver<u64>, ticket: u64) {
    while *epoch.borrow_and_update() == ticket {
        if epoch.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCapture;
    use crate::capture_loop::TickOutcome;
    use crate::output::{CallTransport, RecordingTransport, TrackSource};
    use crate::registry::tests::{caps, test_registry};
    use crate::registry::{PerformanceClass, VariantRequest};
    use crate::segmentation::stub::{Behaviour, StubFactory};
    use image::Rgb;
    use std::time::Duration;

    struct Fixture {
        coordinator: Arc<SwitchCoordinator>,
        capture_loop: Arc<Mutex<CaptureLoop>>,
        transport: RecordingTransport,
        events: broadcast::Receiver<EffectEvent>,
        factory: Arc<StubFactory>,
    }

    fn fixture(parallel: bool, factory: StubFactory) -> Fixture {
        let factory = Arc::new(factory);
        let registry = Arc::new(RwLock::new(test_registry(caps(
            parallel,
            false,
            false,
            PerformanceClass::High,
        ))));
        let (events_tx, events) = broadcast::channel(16);
        let transport = RecordingTransport::new().keeping_images();
        let mut capture_loop = CaptureLoop::new(
            Box::new(SyntheticCapture::new(16, 16, 30.0)),
            Box::new(transport.clone()),
            EffectsConfig::default(),
            events_tx.clone(),
        );
        capture_loop.start_call(&[]).unwrap();
        let coordinator = SwitchCoordinator::new(
            registry,
            factory.clone(),
            EffectsConfig::default(),
            events_tx,
        );
        Fixture {
            coordinator: Arc::new(coordinator),
            capture_loop: Arc::new(Mutex::new(capture_loop)),
            transport,
            events,
            factory,
        }
    }

    async fn ticks(f: &Fixture, n: usize) {
        for _ in 0..n {
            f.capture_loop.lock().await.tick().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn switch_is_atomic() {
        let f = fixture(
            true,
            StubFactory::default()
                .with("a", Behaviour::Solid([255, 0, 0]))
                .with("b", Behaviour::Solid([0, 0, 255])),
        );
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();
        ticks(&f, 5).await;

        let before = f.transport.outgoing_video_sender().replacements;
        let selection = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", None))
            .await
            .unwrap();
        assert_eq!(selection.backend_id, "b");
        assert_eq!(f.transport.outgoing_video_sender().replacements, before + 1);

        let published_before = f.transport.log().published.len();
        ticks(&f, 5).await;

        let capture_loop = f.capture_loop.lock().await;
        let session = capture_loop.session_id().unwrap();
        assert_eq!(capture_loop.active_selection().unwrap().backend_id, "b");
        assert_eq!(
            f.transport.outgoing_video_sender().source,
            TrackSource::Processed { session }
        );
        let log = f.transport.log();
        for published in &log.published[published_before..] {
            assert_eq!(published.source, TrackSource::Processed { session });
            let image = published.image.as_ref().unwrap();
            assert!(image.pixels().all(|p| *p == Rgb([0, 0, 255])));
        }
        assert!(f.factory.probe.max_in_flight.load(std::sync::atomic::Ordering::SeqCst) <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_away_records_comparison() {
        let f = fixture(true, StubFactory::default());
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();
        ticks(&f, 3).await;
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", None))
            .await
            .unwrap();

        let capture_loop = f.capture_loop.lock().await;
        let entry = capture_loop.comparison().get("a").copied().unwrap();
        assert!(entry.avg_segmentation_ms > 0.0);
        assert_eq!(entry.frames, 3);
        assert!(capture_loop.comparison().get("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_variant_keeps_current_backend() {
        let f = fixture(false, StubFactory::default());
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();
        let session = f.capture_loop.lock().await.session_id();

        let request = "256x256:cpu".parse::<VariantRequest>().unwrap();
        let err = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", Some(request)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SwitchError::Selection(SelectionError::CapabilityMismatch { .. })
        ));

        let mut capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.session_id(), session);
        assert_eq!(capture_loop.active_selection().unwrap().backend_id, "a");
        assert!(matches!(
            capture_loop.tick().await.unwrap(),
            TickOutcome::Published { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_reverts_to_previous() {
        let mut f = fixture(true, StubFactory::default().failing("b"));
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();

        let err = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", None))
            .await
            .unwrap_err();
        match err {
            SwitchError::Init { backend, reverted_to, .. } => {
                assert_eq!(backend, "b");
                assert_eq!(reverted_to.as_deref(), Some("a"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            f.events.try_recv(),
            Ok(EffectEvent::BackendUnavailable { .. })
        ));

        let capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.state(), LoopState::Running);
        assert_eq!(capture_loop.active_selection().unwrap().backend_id, "a");
        // The failed request does not become the pinned choice
        assert_eq!(
            *f.coordinator.registry().pinned(),
            BackendChoice::explicit("a", None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_start_stays_disabled() {
        let f = fixture(true, StubFactory::default().failing("a"));
        let err = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchError::Init { reverted_to: None, .. }));

        let capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.state(), LoopState::Disabled);
        assert_eq!(capture_loop.outgoing_video_sender().source, TrackSource::Camera);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_init_times_out() {
        let f = fixture(true, StubFactory::default());
        f.factory.set_init_delay(Some(Duration::from_secs(30)));
        let err = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SwitchError::Init {
                source: InitError::Timeout { .. },
                ..
            }
        ));
        assert_eq!(f.capture_loop.lock().await.state(), LoopState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_wins() {
        let f = fixture(true, StubFactory::default());
        f.factory.set_init_delay(Some(Duration::from_secs(1)));

        let first = {
            let coordinator = f.coordinator.clone();
            let capture_loop = f.capture_loop.clone();
            tokio::spawn(async move {
                coordinator
                    .activate(&capture_loop, BackendChoice::explicit("a", None))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", None))
            .await
            .unwrap();
        assert_eq!(second.backend_id, "b");
        assert!(matches!(first.await.unwrap(), Err(SwitchError::Superseded)));

        let capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.state(), LoopState::Running);
        assert_eq!(capture_loop.active_selection().unwrap().backend_id, "b");
        assert_eq!(
            f.factory.probe.allocations.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_request_after_superseded_switch_does_not_strand_loop() {
        let f = fixture(true, StubFactory::default());
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();
        ticks(&f, 2).await;
        f.factory.set_init_delay(Some(Duration::from_secs(1)));

        let first = {
            let coordinator = f.coordinator.clone();
            let capture_loop = f.capture_loop.clone();
            tokio::spawn(async move {
                coordinator
                    .activate(&capture_loop, BackendChoice::explicit("b", None))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.factory.set_unavailable("a");
        let second = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap_err();
        assert!(matches!(first.await.unwrap(), Err(SwitchError::Superseded)));
        assert!(matches!(second, SwitchError::Init { reverted_to: None, .. }));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.state(), LoopState::Disabled);
        assert!(capture_loop.session_id().is_none());
        assert_eq!(capture_loop.outgoing_video_sender().source, TrackSource::Camera);
        for _ in 0..3 {
            assert!(matches!(
                capture_loop.tick().await.unwrap(),
                TickOutcome::Passthrough { .. }
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_backend_keeps_current_one_running() {
        let f = fixture(true, StubFactory::default());
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();
        let session = f.capture_loop.lock().await.session_id();

        f.factory.set_unavailable("b");
        let err = f
            .coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchError::Init { reverted_to: Some(ref id), .. } if id == "a"));

        let capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.state(), LoopState::Running);
        assert_eq!(capture_loop.session_id(), session);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_is_abandoned_during_switch() {
        let mut f = fixture(
            true,
            StubFactory::default().with("a", Behaviour::HangAfterFirst),
        );
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("a", None))
            .await
            .unwrap();
        ticks(&f, 2).await;

        f.coordinator
            .activate(&f.capture_loop, BackendChoice::explicit("b", None))
            .await
            .unwrap();
        assert!(matches!(
            f.events.try_recv(),
            Ok(EffectEvent::DrainTimedOut { backend }) if backend == "a"
        ));
        assert_eq!(f.capture_loop.lock().await.state(), LoopState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_restores_camera() {
        let f = fixture(true, StubFactory::default());
        f.coordinator
            .activate(&f.capture_loop, BackendChoice::Auto)
            .await
            .unwrap();
        ticks(&f, 2).await;
        f.coordinator.deactivate(&f.capture_loop).await.unwrap();

        let capture_loop = f.capture_loop.lock().await;
        assert_eq!(capture_loop.state(), LoopState::Disabled);
        assert!(capture_loop.session_id().is_none());
        assert_eq!(capture_loop.outgoing_video_sender().source, TrackSource::Camera);
        assert_eq!(f.factory.probe.disposals.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(capture_loop.comparison().len(), 1);
    }
}
