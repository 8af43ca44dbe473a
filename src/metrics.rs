//! Rolling and session-long performance statistics for the active backend.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-capacity FIFO of samples; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Timings of one completed iteration.
#[derive(Debug, Clone, Copy)]
pub struct MetricSample {
    /// `None` when the iteration reused an earlier result.
    pub segmentation: Option<Duration>,
    pub total: Duration,
    pub timestamp: Instant,
}

/// What the UI polls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub backend: Option<String>,
    pub fps: f64,
    pub segmentation_ms: f64,
    pub processing_ms: f64,
    pub avg_segmentation_ms: f64,
    pub avg_processing_ms: f64,
    pub session_duration_secs: f64,
    pub frames_processed: u64,
}

/// Aggregate kept per backend in the comparison table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonEntry {
    pub fps: f64,
    pub avg_segmentation_ms: f64,
    pub avg_processing_ms: f64,
    pub frames: u64,
}

impl ComparisonEntry {
    fn is_measured(&self) -> bool {
        self.frames > 0
            && (self.fps > 0.0 || self.avg_segmentation_ms > 0.0 || self.avg_processing_ms > 0.0)
    }
}

/// Last observed aggregates, keyed by backend id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ComparisonTable {
    entries: BTreeMap<String, ComparisonEntry>,
}

impl ComparisonTable {
    /// Returns false (and stores nothing) for entries without a real measurement.
    pub fn commit(&mut self, backend: &str, entry: ComparisonEntry) -> bool {
        if !entry.is_measured() {
            return false;
        }
        self.entries.insert(backend.to_string(), entry);
        true
    }

    pub fn get(&self, backend: &str) -> Option<&ComparisonEntry> {
        self.entries.get(backend)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ComparisonEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Statistics for the backend currently driving the loop.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    backend: Option<String>,
    segmentation: RollingWindow,
    frame_delta: RollingWindow,
    last_timestamp: Option<Instant>,
    native_fps: f64,
    session_started: Instant,
    frames: u64,
    segmented_frames: u64,
    total_segmentation_ms: f64,
    total_frame_ms: f64,
}

impl MetricsAggregator {
    pub fn new(capacity: usize, native_fps: f64) -> Self {
        Self {
            backend: None,
            segmentation: RollingWindow::new(capacity),
            frame_delta: RollingWindow::new(capacity),
            last_timestamp: None,
            native_fps,
            session_started: Instant::now(),
            frames: 0,
            segmented_frames: 0,
            total_segmentation_ms: 0.0,
            total_frame_ms: 0.0,
        }
    }

    /// Start a fresh session for `backend`: windows and sums are cleared.
    pub fn reset(&mut self, backend: Option<&str>) {
        self.backend = backend.map(str::to_string);
        self.segmentation.clear();
        self.frame_delta.clear();
        self.last_timestamp = None;
        self.session_started = Instant::now();
        self.frames = 0;
        self.segmented_frames = 0;
        self.total_segmentation_ms = 0.0;
        self.total_frame_ms = 0.0;
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn record(&mut self, sample: MetricSample) {
        if let Some(previous) = self.last_timestamp {
            let delta = sample.timestamp.saturating_duration_since(previous);
            self.frame_delta.push(delta.as_secs_f64() * 1000.0);
        }
        self.last_timestamp = Some(sample.timestamp);

        if let Some(segmentation) = sample.segmentation {
            let ms = segmentation.as_secs_f64() * 1000.0;
            self.segmentation.push(ms);
            self.total_segmentation_ms += ms;
            self.segmented_frames += 1;
        }

        self.frames += 1;
        self.total_frame_ms += sample.total.as_secs_f64() * 1000.0;
    }

    /// `1000 / mean inter-frame delta`, never above the source rate.
    pub fn fps(&self) -> f64 {
        match self.frame_delta.mean() {
            Some(mean) if mean > 0.0 => {
                let fps = 1000.0 / mean;
                if self.native_fps > 0.0 {
                    fps.min(self.native_fps)
                } else {
                    fps
                }
            }
            _ => 0.0,
        }
    }

    pub fn segmentation_window(&self) -> &RollingWindow {
        &self.segmentation
    }

    pub fn frame_delta_window(&self) -> &RollingWindow {
        &self.frame_delta
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn avg_segmentation_ms(&self) -> f64 {
        if self.segmented_frames == 0 {
            0.0
        } else {
            self.total_segmentation_ms / self.segmented_frames as f64
        }
    }

    fn avg_processing_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.total_frame_ms / self.frames as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backend: self.backend.clone(),
            fps: self.fps(),
            segmentation_ms: self.segmentation.mean().unwrap_or(0.0),
            processing_ms: self.avg_processing_ms(),
            avg_segmentation_ms: self.avg_segmentation_ms(),
            avg_processing_ms: self.avg_processing_ms(),
            session_duration_secs: self.session_started.elapsed().as_secs_f64(),
            frames_processed: self.frames,
        }
    }

    /// Entry for the comparison table, if this session measured anything.
    pub fn comparison_entry(&self) -> Option<ComparisonEntry> {
        let entry = ComparisonEntry {
            fps: self.fps(),
            avg_segmentation_ms: self.avg_segmentation_ms(),
            avg_processing_ms: self.avg_processing_ms(),
            frames: self.frames,
        };
        entry.is_measured().then_some(entry)
    }
}
