//! Per-tick decision: run inference on this frame, or reuse the last result.

use std::time::Duration;

/// What a policy gets to look at once per tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Distinct frames seen since the backend was installed.
    pub frame_index: u64,
    /// Time since the last inference was started, if any.
    pub since_last_inference: Option<Duration>,
    /// Latency of the most recent completed inference.
    pub last_latency: Option<Duration>,
}

pub trait InferencePolicy: Send {
    fn name(&self) -> &'static str;

    fn should_infer(&mut self, ctx: &TickContext) -> bool;
}

/// Infer on every distinct frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct EveryFrame;

impl InferencePolicy for EveryFrame {
    fn name(&self) -> &'static str {
        "every-frame"
    }

    fn should_infer(&mut self, _ctx: &TickContext) -> bool {
        true
    }
}

/// Infer on one frame out of `every`.
#[derive(Debug, Clone, Copy)]
pub struct FrameSkip {
    every: u64,
}

impl FrameSkip {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl InferencePolicy for FrameSkip {
    fn name(&self) -> &'static str {
        "frame-skip"
    }

    fn should_infer(&mut self, ctx: &TickContext) -> bool {
        ctx.frame_index % self.every == 0
    }
}

/// Low-power mode: at most one inference per `interval`.
#[derive(Debug, Clone, Copy)]
pub struct MinInterval {
    interval: Duration,
}

impl MinInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl InferencePolicy for MinInterval {
    fn name(&self) -> &'static str {
        "min-interval"
    }

    fn should_infer(&mut self, ctx: &TickContext) -> bool {
        ctx.since_last_inference
            .map_or(true, |elapsed| elapsed >= self.interval)
    }
}

/// Parse `every`, `skip:<n>` or `interval:<ms>`.
pub fn parse_policy(text: &str) -> Result<Box<dyn InferencePolicy>, String> {
    let (kind, value) = text.split_once(':').unwrap_or((text, ""));
    let number = || {
        value
            .parse::<u64>()
            .map_err(|_| format!("invalid number {value:?} in policy {text:?}"))
    };
    match kind {
        "every" if value.is_empty() => Ok(Box::new(EveryFrame)),
        "skip" => Ok(Box::new(FrameSkip::new(number()?))),
        "interval" => Ok(Box::new(MinInterval::new(Duration::from_millis(number()?)))),
        _ => Err(format!(
            "unknown policy {text:?}; expected every, skip:<n> or interval:<ms>"
        )),
    }
}
