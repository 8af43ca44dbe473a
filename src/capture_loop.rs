//! The per-frame scheduling core.
//!
//! One [`CaptureLoop`] exists per call. Each tick pulls the newest camera frame,
//! keeps at most one segmentation request in flight, composites with whatever
//! result is freshest and publishes in capture order. The switch coordinator
//! drives the state transitions through the `begin_*`/`install_session`/`finish_*`
//! hooks; everything else happens in [`CaptureLoop::tick`].

use crate::background::BackgroundSpec;
use crate::capture::CaptureSource;
use crate::compositor::{CompositeInput, Fallback, FrameCompositor};
use crate::config::EffectsConfig;
use crate::error::{MediaError, ProcessError};
use crate::frame::{Frame, FrameMarker, Mask};
use crate::metrics::{ComparisonTable, MetricSample, MetricsAggregator, MetricsSnapshot};
use crate::output::{AudioTrack, CallTransport, SessionId, TrackSource, VideoSender};
use crate::policy::{EveryFrame, InferencePolicy, TickContext};
use crate::registry::Selection;
use crate::segmentation::{ProcessOutput, SegmentationBackend, SegmentationOutput};
use image::RgbImage;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    /// No per-frame work; the raw camera feeds the call.
    Disabled,
    Starting,
    Running,
    Switching,
    Stopping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopState::Disabled => "disabled",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Switching => "switching",
            LoopState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Notifications for the UI. Per-frame failures never show up here on their own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectEvent {
    BackendUnavailable { backend: String, reason: String },
    SustainedProcessErrors { backend: String, failure_rate: f64, samples: usize },
    DrainTimedOut { backend: String },
    SwitchSuperseded { requested: String },
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// An effect frame was published.
    Published {
        marker: FrameMarker,
        /// The segmentation result came from an earlier frame.
        reused: bool,
        fallback: Option<Fallback>,
    },
    /// No session yet; the camera frame went out as is.
    Passthrough { marker: FrameMarker },
    /// A switch or shutdown is in progress; nothing was published.
    Paused,
    /// The camera has not advanced since the previous tick.
    Idle,
}

/// The live, initialized backend.
///
/// Shared with the task running the current request, which holds the lock for
/// the duration of one `process_frame` call.
pub struct ActiveBackendSession {
    id: SessionId,
    selection: Selection,
    backend: Arc<Mutex<Box<dyn SegmentationBackend>>>,
}

impl ActiveBackendSession {
    pub fn new(id: SessionId, selection: Selection, backend: Box<dyn SegmentationBackend>) -> Self {
        Self {
            id,
            selection,
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn backend_id(&self) -> &str {
        &self.selection.backend_id
    }

    /// Release the inference resource. Waits for any request still holding it.
    pub async fn dispose(self) {
        let mut backend = self.backend.lock().await;
        backend.dispose().await;
        tracing::info!("Disposed {} ({})", self.selection, self.id);
    }
}

type RequestResult = Result<ProcessOutput, ProcessError>;

/// The single outstanding segmentation request.
pub struct InFlight {
    generation: u64,
    marker: FrameMarker,
    backend: String,
    started: Instant,
    handle: JoinHandle<()>,
    result: oneshot::Receiver<RequestResult>,
}

impl InFlight {
    /// Wait up to `limit` for the request to settle, abandoning it past that.
    ///
    /// Returns false when the request had to be abandoned. The result itself is
    /// dropped: by the time a drain runs, the loop has moved to a new generation.
    pub async fn drain(mut self, limit: Duration, events: &broadcast::Sender<EffectEvent>) -> bool {
        match timeout(limit, &mut self.result).await {
            Ok(_) => {
                tracing::debug!("Drained request for {} from {}", self.marker, self.backend);
                true
            }
            Err(_) => {
                tracing::warn!(
                    "{} did not finish within {:?}, abandoning its request",
                    self.backend,
                    limit
                );
                self.handle.abort();
                let _ = events.send(EffectEvent::DrainTimedOut {
                    backend: self.backend.clone(),
                });
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
enum CachedResult {
    Mask(Mask),
    Composited(RgbImage),
}

/// Result of harvesting one request.
enum Completion {
    Fresh {
        marker: FrameMarker,
        segmentation: Duration,
        total: Duration,
    },
    Failed {
        marker: FrameMarker,
    },
    Stale,
}

/// Rolling failure rate over recent ticks; raises one warning per excursion.
#[derive(Debug)]
struct ErrorTracker {
    outcomes: VecDeque<bool>,
    capacity: usize,
    threshold: f64,
    min_samples: usize,
    raised: bool,
    total: u64,
}

impl ErrorTracker {
    fn new(config: &EffectsConfig) -> Self {
        let capacity = config.window_capacity.max(config.error_min_samples).max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            threshold: config.error_rate_threshold,
            min_samples: config.error_min_samples,
            raised: false,
            total: 0,
        }
    }

    /// Returns the failure rate the first time it crosses the threshold.
    fn record(&mut self, failed: bool) -> Option<f64> {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(failed);
        if failed {
            self.total += 1;
        }

        let samples = self.outcomes.len();
        let rate = self.outcomes.iter().filter(|&&f| f).count() as f64 / samples as f64;
        if samples < self.min_samples {
            return None;
        }
        if rate > self.threshold {
            if !self.raised {
                self.raised = true;
                return Some(rate);
            }
        } else {
            self.raised = false;
        }
        None
    }

    fn samples(&self) -> usize {
        self.outcomes.len()
    }

    fn reset(&mut self) {
        self.outcomes.clear();
        self.raised = false;
    }
}

pub struct CaptureLoop {
    capture: Box<dyn CaptureSource>,
    transport: Box<dyn CallTransport>,
    compositor: FrameCompositor,
    config: EffectsConfig,
    policy: Box<dyn InferencePolicy>,
    background: BackgroundSpec,
    state: LoopState,
    session: Option<ActiveBackendSession>,
    in_flight: Option<InFlight>,
    cache: Option<CachedResult>,
    generation: u64,
    last_marker: Option<FrameMarker>,
    frame_index: u64,
    last_inference: Option<Instant>,
    last_latency: Option<Duration>,
    metrics: MetricsAggregator,
    comparison: ComparisonTable,
    errors: ErrorTracker,
    events: broadcast::Sender<EffectEvent>,
}

impl CaptureLoop {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        transport: Box<dyn CallTransport>,
        config: EffectsConfig,
        events: broadcast::Sender<EffectEvent>,
    ) -> Self {
        let compositor = FrameCompositor::new(config.mirror).with_matte_view(config.show_matte);
        let metrics = MetricsAggregator::new(config.window_capacity, capture.native_fps());
        let errors = ErrorTracker::new(&config);
        Self {
            capture,
            transport,
            compositor,
            config,
            policy: Box::new(EveryFrame),
            background: BackgroundSpec::None,
            state: LoopState::Disabled,
            session: None,
            in_flight: None,
            cache: None,
            generation: 0,
            last_marker: None,
            frame_index: 0,
            last_inference: None,
            last_latency: None,
            metrics,
            comparison: ComparisonTable::default(),
            errors,
            events,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn InferencePolicy>) -> Self {
        self.set_policy(policy);
        self
    }

    pub fn set_policy(&mut self, policy: Box<dyn InferencePolicy>) {
        tracing::debug!("Inference policy: {}", policy.name());
        self.policy = policy;
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(ActiveBackendSession::id)
    }

    pub fn active_selection(&self) -> Option<&Selection> {
        self.session.as_ref().map(ActiveBackendSession::selection)
    }

    pub fn background(&self) -> &BackgroundSpec {
        &self.background
    }

    /// Applies from the next published frame.
    pub fn set_background(&mut self, spec: BackgroundSpec) {
        tracing::info!("Background set to {}", spec.label());
        // A self-composited result bakes in the old background
        if matches!(self.cache, Some(CachedResult::Composited(_))) {
            self.cache = None;
        }
        self.background = spec;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn comparison(&self) -> &ComparisonTable {
        &self.comparison
    }

    /// Failed or abandoned requests since the call started.
    pub fn process_errors(&self) -> u64 {
        self.errors.total
    }

    pub fn outgoing_video_sender(&self) -> VideoSender {
        self.transport.outgoing_video_sender()
    }

    pub fn events(&self) -> &broadcast::Sender<EffectEvent> {
        &self.events
    }

    /// Attach the raw camera and the call's audio.
    pub fn start_call(&mut self, audio: &[AudioTrack]) -> Result<(), MediaError> {
        let (width, height) = self.capture.resolution();
        tracing::info!("Call started with camera {}x{}", width, height);
        self.transport.replace_outgoing_video(TrackSource::Camera)?;
        self.transport.attach_audio_tracks(audio)?;
        Ok(())
    }

    /// Enter `Starting` or `Switching` and fence off the current request.
    ///
    /// The returned request, if any, should be drained before the session is taken.
    pub fn begin_switch(&mut self) -> Option<InFlight> {
        self.state = match self.state {
            LoopState::Disabled => LoopState::Starting,
            LoopState::Starting => LoopState::Starting,
            _ => LoopState::Switching,
        };
        self.fence()
    }

    /// Enter `Stopping` and fence off the current request.
    pub fn begin_stop(&mut self) -> Option<InFlight> {
        self.state = LoopState::Stopping;
        self.fence()
    }

    fn fence(&mut self) -> Option<InFlight> {
        self.generation += 1;
        self.cache = None;
        self.in_flight.take()
    }

    /// Detach the current session, recording its numbers in the comparison table.
    pub fn take_session(&mut self) -> Option<ActiveBackendSession> {
        let session = self.session.take()?;
        if let Some(entry) = self.metrics.comparison_entry() {
            if self.comparison.commit(session.backend_id(), entry) {
                tracing::info!(
                    "{}: {:.1} fps, {:.1}ms segmentation, {:.1}ms per frame over {} frames",
                    session.backend_id(),
                    entry.fps,
                    entry.avg_segmentation_ms,
                    entry.avg_processing_ms,
                    entry.frames
                );
            }
        }
        Some(session)
    }

    /// Make `session` the active one and point the outgoing track at it.
    ///
    /// This is the only place the track is switched to a processed source, so it
    /// is replaced exactly once per installed session.
    pub fn install_session(&mut self, session: ActiveBackendSession) -> Result<(), MediaError> {
        self.generation += 1;
        self.in_flight = None;
        self.cache = None;
        self.frame_index = 0;
        self.last_inference = None;
        self.last_latency = None;
        self.errors.reset();
        self.metrics.reset(Some(session.backend_id()));

        let source = TrackSource::Processed {
            session: session.id(),
        };
        tracing::info!("Running {} as {}", session.selection(), session.id());
        self.session = Some(session);
        self.state = LoopState::Running;
        self.transport.replace_outgoing_video(source)
    }

    /// Back to the raw camera with no session.
    pub fn finish_stop(&mut self) -> Result<(), MediaError> {
        self.state = LoopState::Disabled;
        self.cache = None;
        self.metrics.reset(None);
        if self.transport.outgoing_video_sender().source != TrackSource::Camera {
            self.transport.replace_outgoing_video(TrackSource::Camera)?;
        }
        tracing::info!("Background effect disabled");
        Ok(())
    }

    /// Undo a `begin_switch` that never tore anything down.
    pub fn resume(&mut self) {
        if self.state == LoopState::Switching && self.session.is_some() {
            self.state = LoopState::Running;
        } else if self.state == LoopState::Starting && self.session.is_none() {
            self.state = LoopState::Disabled;
        }
    }

    /// One capture, process, composite, publish iteration.
    ///
    /// Only camera and transport failures are returned; segmentation failures are
    /// absorbed here.
    pub async fn tick(&mut self) -> Result<TickOutcome, MediaError> {
        let started = Instant::now();
        let frame = self.capture.latest_frame()?;

        if self.last_marker == Some(frame.marker()) {
            if self.state == LoopState::Running {
                self.absorb_background_completion();
            }
            return Ok(TickOutcome::Idle);
        }
        self.last_marker = Some(frame.marker());

        match self.state {
            // The camera track stays attached until a session is installed
            LoopState::Disabled | LoopState::Starting => {
                let rendered = self
                    .compositor
                    .render(frame.image(), CompositeInput::Raw, &BackgroundSpec::None);
                self.transport.write_frame(&rendered.image, frame.marker())?;
                Ok(TickOutcome::Passthrough {
                    marker: frame.marker(),
                })
            }
            LoopState::Switching | LoopState::Stopping => Ok(TickOutcome::Paused),
            LoopState::Running => {
                let span = tracing::debug_span!("tick", marker = %frame.marker());
                self.run_iteration(frame, started).instrument(span).await
            }
        }
    }

    async fn run_iteration(&mut self, frame: Frame, started: Instant) -> Result<TickOutcome, MediaError> {
        let mut failed = false;
        let mut failed_this_frame = false;
        let mut fresh: Option<(FrameMarker, Duration, Duration)> = None;

        let mut settle = |completion: Completion, failed: &mut bool, failed_this_frame: &mut bool| {
            match completion {
                Completion::Fresh {
                    marker,
                    segmentation,
                    total,
                } => fresh = Some((marker, segmentation, total)),
                Completion::Failed { marker } => {
                    *failed = true;
                    *failed_this_frame |= marker == frame.marker();
                }
                Completion::Stale => {}
            }
        };

        // Results of earlier frames, or an overdue request
        if let Some(completion) = self.poll_in_flight() {
            settle(completion, &mut failed, &mut failed_this_frame);
        }

        if self.in_flight.is_none() {
            let ctx = TickContext {
                frame_index: self.frame_index,
                since_last_inference: self.last_inference.map(|at| at.elapsed()),
                last_latency: self.last_latency,
            };
            if self.policy.should_infer(&ctx) {
                self.submit(&frame);
            }
        }
        self.frame_index += 1;

        if let Some(in_flight) = self.in_flight.as_mut() {
            if let Ok(result) = timeout(self.config.tick_budget, &mut in_flight.result).await {
                if let Some(done) = self.in_flight.take() {
                    let completion = self.complete(&done, result.ok());
                    settle(completion, &mut failed, &mut failed_this_frame);
                }
            }
        }

        let input = match (&self.cache, failed_this_frame) {
            (_, true) | (None, _) => CompositeInput::Raw,
            (Some(CachedResult::Mask(mask)), false) => CompositeInput::Mask(mask),
            (Some(CachedResult::Composited(image)), false) => CompositeInput::Composited(image),
        };
        let rendered = self.compositor.render(frame.image(), input, &self.background);
        self.transport.write_frame(&rendered.image, frame.marker())?;

        let reused = fresh.map_or(true, |(marker, _, _)| marker != frame.marker());
        let total = match fresh {
            Some((_, _, backend_total)) => started.elapsed().max(backend_total),
            None => started.elapsed(),
        };
        self.metrics.record(MetricSample {
            segmentation: fresh.map(|(_, segmentation, _)| segmentation),
            total,
            timestamp: Instant::now(),
        });

        if let Some(rate) = self.errors.record(failed) {
            self.raise_sustained_errors(rate);
        }

        Ok(TickOutcome::Published {
            marker: frame.marker(),
            reused,
            fallback: rendered.fallback,
        })
    }

    fn submit(&mut self, frame: &Frame) {
        let Some(session) = &self.session else {
            return;
        };
        let backend = Arc::clone(&session.backend);
        let frame = frame.clone();
        let marker = frame.marker();
        let spec = self.background.clone();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut backend = backend.lock().await;
            let result = backend.process_frame(&frame, &spec).await;
            let _ = tx.send(result);
        });

        let now = Instant::now();
        self.last_inference = Some(now);
        self.in_flight = Some(InFlight {
            generation: self.generation,
            marker,
            backend: session.backend_id().to_string(),
            started: now,
            handle,
            result: rx,
        });
    }

    /// Non-blocking check on the outstanding request. Abandons it when overdue.
    fn poll_in_flight(&mut self) -> Option<Completion> {
        let in_flight = self.in_flight.as_mut()?;
        match in_flight.result.try_recv() {
            Ok(result) => {
                let done = self.in_flight.take()?;
                Some(self.complete(&done, Some(result)))
            }
            Err(oneshot::error::TryRecvError::Empty) => {
                let age = in_flight.started.elapsed();
                if age < self.config.process_timeout {
                    return None;
                }
                tracing::warn!(
                    "{} has not answered for {} in {:?}, abandoning the request",
                    in_flight.backend,
                    in_flight.marker,
                    age
                );
                in_flight.handle.abort();
                let done = self.in_flight.take()?;
                Some(self.complete(
                    &done,
                    Some(Err(ProcessError::Timeout(self.config.process_timeout))),
                ))
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                let done = self.in_flight.take()?;
                Some(self.complete(&done, None))
            }
        }
    }

    /// Harvest a result that arrived while the camera was idle, so the next
    /// frame can start a new request right away.
    fn absorb_background_completion(&mut self) {
        if let Some(Completion::Failed { .. }) = self.poll_in_flight() {
            if let Some(rate) = self.errors.record(true) {
                self.raise_sustained_errors(rate);
            }
        }
    }

    /// Apply a finished request; `None` means its worker vanished.
    fn complete(&mut self, request: &InFlight, result: Option<RequestResult>) -> Completion {
        if request.generation != self.generation {
            tracing::debug!("Dropping stale result for {} from {}", request.marker, request.backend);
            return Completion::Stale;
        }

        let result = result
            .unwrap_or_else(|| Err(ProcessError::Worker("request task ended without a result".into())));

        match result {
            Ok(output) => {
                match output.output {
                    SegmentationOutput::Mask(mask) => self.cache = Some(CachedResult::Mask(mask)),
                    SegmentationOutput::Composited(image) => {
                        self.cache = Some(CachedResult::Composited(image))
                    }
                    SegmentationOutput::ReuseLast => {}
                }
                self.last_latency = Some(output.segmentation_latency);
                Completion::Fresh {
                    marker: request.marker,
                    segmentation: output.segmentation_latency,
                    total: output.total_latency,
                }
            }
            Err(err) => {
                tracing::debug!("{} failed on {}: {}", request.backend, request.marker, err);
                Completion::Failed {
                    marker: request.marker,
                }
            }
        }
    }

    fn raise_sustained_errors(&self, rate: f64) {
        let backend = self
            .session
            .as_ref()
            .map(|s| s.backend_id().to_string())
            .unwrap_or_default();
        tracing::warn!(
            "{} failed on {:.0}% of recent frames, showing the camera instead",
            backend,
            rate * 100.0
        );
        let _ = self.events.send(EffectEvent::SustainedProcessErrors {
            backend,
            failure_rate: rate,
            samples: self.errors.samples(),
        });
    }
}
