use std::time::Duration;

/// Tunables for the capture loop and the switch coordinator.
#[derive(Debug, Clone)]
pub struct EffectsConfig {
    /// Capacity of the rolling metric windows.
    pub window_capacity: usize,
    /// Upper bound on backend `init`.
    pub init_timeout: Duration,
    /// Upper bound on waiting for in-flight work during a switch.
    pub drain_timeout: Duration,
    /// An in-flight request older than this is abandoned.
    pub process_timeout: Duration,
    /// How long a tick waits for a fresh result before reusing the cached one.
    pub tick_budget: Duration,
    /// Failure rate over the error window that triggers one aggregated warning.
    pub error_rate_threshold: f64,
    /// Samples needed before the error rate is trusted.
    pub error_min_samples: usize,
    /// Flip every outgoing frame horizontally.
    pub mirror: bool,
    /// Publish the matte instead of the composite.
    pub show_matte: bool,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            window_capacity: 30,
            init_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(300),
            process_timeout: Duration::from_secs(1),
            tick_budget: Duration::from_millis(8),
            error_rate_threshold: 0.5,
            error_min_samples: 15,
            mirror: false,
            show_matte: false,
        }
    }
}
