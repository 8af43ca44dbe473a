//! Backend catalogue, host capability detection and backend selection.

use crate::error::{Feature, SelectionError};
use serde::Serialize;
use std::fmt;
use std::hint::black_box;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub const DIFFERENCE: &str = "difference";
pub const CHROMA: &str = "chroma";
pub const RVM: &str = "rvm";
pub const SELFIE: &str = "selfie";

/// Frame rate a recommendation should be able to sustain.
const TARGET_FPS: f64 = 24.0;

/// Fixed amount of work the host benchmark times.
pub const BENCHMARK_ITERATIONS: u32 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// `640x480`, or a single number for a square input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid resolution `{s}`"))
        };
        match s.split_once('x') {
            Some((w, h)) => Ok(Self::new(parse(w)?, parse(h)?)),
            None => {
                let side = parse(s)?;
                Ok(Self::new(side, side))
            }
        }
    }
}

/// Compute backend a variant runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cpu,
    Cuda,
    TensorRt,
}

impl BackendKind {
    pub fn required_features(self) -> &'static [Feature] {
        match self {
            BackendKind::Cpu => &[],
            BackendKind::Cuda => &[Feature::GpuAcceleration],
            BackendKind::TensorRt => &[Feature::GpuAcceleration, Feature::GpuTier2],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Cuda => "cuda",
            BackendKind::TensorRt => "tensorrt",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(BackendKind::Cpu),
            "cuda" | "gpu" => Ok(BackendKind::Cuda),
            "tensorrt" | "trt" => Ok(BackendKind::TensorRt),
            other => Err(format!("unknown backend kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationStatus {
    Implemented,
    Planned,
}

/// One resolution / compute configuration of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Variant {
    pub resolution: Resolution,
    pub kind: BackendKind,
    pub requires_parallel_extension: bool,
    pub expected_fps: u32,
}

impl Variant {
    pub const fn new(
        resolution: Resolution,
        kind: BackendKind,
        requires_parallel_extension: bool,
        expected_fps: u32,
    ) -> Self {
        Self {
            resolution,
            kind,
            requires_parallel_extension,
            expected_fps,
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.resolution, self.kind)
    }

    pub fn requirements(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        if self.requires_parallel_extension {
            features.push(Feature::ParallelExtension);
        }
        features.extend_from_slice(self.kind.required_features());
        features
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub status: ImplementationStatus,
    /// Eligible for automatic selection.
    pub auto: bool,
    pub variants: Vec<Variant>,
}

/// The built-in catalogue.
pub fn builtin_descriptors() -> Vec<BackendDescriptor> {
    use BackendKind::*;

    let rvm_status = if cfg!(feature = "onnx") {
        ImplementationStatus::Implemented
    } else {
        ImplementationStatus::Planned
    };

    vec![
        BackendDescriptor {
            id: DIFFERENCE,
            name: "Background difference",
            status: ImplementationStatus::Implemented,
            auto: true,
            variants: vec![
                Variant::new(Resolution::new(160, 120), Cpu, false, 60),
                Variant::new(Resolution::new(320, 240), Cpu, true, 45),
                Variant::new(Resolution::new(640, 480), Cpu, true, 24),
            ],
        },
        BackendDescriptor {
            id: CHROMA,
            name: "Chroma key",
            status: ImplementationStatus::Implemented,
            auto: false,
            variants: vec![
                Variant::new(Resolution::new(320, 180), Cpu, false, 60),
                Variant::new(Resolution::new(640, 360), Cpu, false, 40),
            ],
        },
        BackendDescriptor {
            id: RVM,
            name: "Robust Video Matting",
            status: rvm_status,
            auto: true,
            variants: vec![
                Variant::new(Resolution::new(256, 256), Cpu, true, 20),
                Variant::new(Resolution::new(512, 512), Cuda, false, 40),
                Variant::new(Resolution::new(1024, 1024), TensorRt, false, 30),
            ],
        },
        BackendDescriptor {
            id: SELFIE,
            name: "Selfie segmentation",
            status: ImplementationStatus::Planned,
            auto: true,
            variants: vec![
                Variant::new(Resolution::new(256, 144), Cpu, false, 30),
                Variant::new(Resolution::new(256, 256), Cuda, false, 60),
            ],
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceClass {
    Low,
    Medium,
    High,
}

impl PerformanceClass {
    /// Classify a run of [`BENCHMARK_ITERATIONS`].
    pub fn from_benchmark(elapsed: Duration) -> Self {
        match elapsed.as_millis() {
            0..=4 => PerformanceClass::High,
            5..=12 => PerformanceClass::Medium,
            _ => PerformanceClass::Low,
        }
    }

    fn throughput_factor(self) -> f64 {
        match self {
            PerformanceClass::Low => 0.4,
            PerformanceClass::Medium => 0.7,
            PerformanceClass::High => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capabilities {
    pub parallel_extension_supported: bool,
    pub gpu_acceleration_supported: bool,
    pub gpu_acceleration_tier2_supported: bool,
    pub estimated_performance_class: PerformanceClass,
    pub benchmark_ms: f64,
}

impl Capabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::ParallelExtension => self.parallel_extension_supported,
            Feature::GpuAcceleration => self.gpu_acceleration_supported,
            Feature::GpuTier2 => self.gpu_acceleration_tier2_supported,
        }
    }

    pub fn missing(&self, variant: &Variant) -> Option<Feature> {
        variant
            .requirements()
            .into_iter()
            .find(|feature| !self.supports(*feature))
    }
}

/// Source of raw host facts, so detection can be faked in tests.
pub trait HostProbe {
    fn parallel_extension(&self) -> bool;
    fn gpu_acceleration(&self) -> bool;
    fn gpu_tier2(&self) -> bool;
    /// Wall-clock time of the fixed micro-benchmark.
    fn benchmark(&self) -> Duration;
}

/// Probes the machine we are running on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn parallel_extension(&self) -> bool {
        std::thread::available_parallelism()
            .map(|n| n.get() >= 2)
            .unwrap_or(false)
    }

    #[cfg(feature = "onnx")]
    fn gpu_acceleration(&self) -> bool {
        use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
        CUDAExecutionProvider::default().is_available().unwrap_or(false)
    }

    #[cfg(not(feature = "onnx"))]
    fn gpu_acceleration(&self) -> bool {
        false
    }

    #[cfg(feature = "onnx")]
    fn gpu_tier2(&self) -> bool {
        use ort::execution_providers::{ExecutionProvider, TensorRTExecutionProvider};
        TensorRTExecutionProvider::default().is_available().unwrap_or(false)
    }

    #[cfg(not(feature = "onnx"))]
    fn gpu_tier2(&self) -> bool {
        false
    }

    fn benchmark(&self) -> Duration {
        run_benchmark(BENCHMARK_ITERATIONS)
    }
}

/// Time a fixed floating-point workload, roughly shaped like per-pixel blending.
pub fn run_benchmark(iterations: u32) -> Duration {
    let started = Instant::now();
    let mut acc = 0.0f32;
    for i in 0..iterations {
        let alpha = (i % 256) as f32 / 255.0;
        acc = black_box(acc * (1.0 - alpha) + (i & 0xff) as f32 * alpha);
    }
    black_box(acc);
    started.elapsed()
}

pub fn detect_capabilities(probe: &dyn HostProbe) -> Capabilities {
    let elapsed = probe.benchmark();
    let gpu = probe.gpu_acceleration();
    let capabilities = Capabilities {
        parallel_extension_supported: probe.parallel_extension(),
        gpu_acceleration_supported: gpu,
        gpu_acceleration_tier2_supported: gpu && probe.gpu_tier2(),
        estimated_performance_class: PerformanceClass::from_benchmark(elapsed),
        benchmark_ms: elapsed.as_secs_f64() * 1000.0,
    };
    tracing::info!(
        "Host capabilities: parallel={}, gpu={}, gpu_tier2={}, class={:?} ({:.1}ms benchmark)",
        capabilities.parallel_extension_supported,
        capabilities.gpu_acceleration_supported,
        capabilities.gpu_acceleration_tier2_supported,
        capabilities.estimated_performance_class,
        capabilities.benchmark_ms
    );
    capabilities
}

/// Partial variant description; unset fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantRequest {
    pub resolution: Option<Resolution>,
    pub kind: Option<BackendKind>,
}

impl VariantRequest {
    fn matches(&self, variant: &Variant) -> bool {
        self.resolution.map_or(true, |r| r == variant.resolution)
            && self.kind.map_or(true, |k| k == variant.kind)
    }
}

impl fmt::Display for VariantRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.resolution, self.kind) {
            (Some(r), Some(k)) => write!(f, "{r}:{k}"),
            (Some(r), None) => write!(f, "{r}"),
            (None, Some(k)) => write!(f, "{k}"),
            (None, None) => f.write_str("any"),
        }
    }
}

impl FromStr for VariantRequest {
    type Err = String;

    /// `512x512:cuda`, `320x240`, or `cuda`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut request = VariantRequest::default();
        for part in s.split(':').filter(|p| !p.trim().is_empty()) {
            if part.trim().starts_with(|c: char| c.is_ascii_digit()) {
                request.resolution = Some(part.parse()?);
            } else {
                request.kind = Some(part.parse()?);
            }
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendChoice {
    #[default]
    Auto,
    Explicit {
        id: String,
        variant: Option<VariantRequest>,
    },
}

impl BackendChoice {
    pub fn explicit(id: impl Into<String>, variant: Option<VariantRequest>) -> Self {
        BackendChoice::Explicit {
            id: id.into(),
            variant,
        }
    }
}

/// A backend and variant resolved against the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub backend_id: String,
    pub backend_name: String,
    pub variant: Variant,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.backend_id, self.variant.label())
    }
}

/// Catalogue plus the host it runs on and the user's pinned choice.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<BackendDescriptor>,
    capabilities: Capabilities,
    pinned: BackendChoice,
}

impl Registry {
    pub fn new(capabilities: Capabilities) -> Self {
        Self::with_descriptors(builtin_descriptors(), capabilities)
    }

    pub fn with_descriptors(descriptors: Vec<BackendDescriptor>, capabilities: Capabilities) -> Self {
        Self {
            descriptors,
            capabilities,
            pinned: BackendChoice::Auto,
        }
    }

    pub fn detect(probe: &dyn HostProbe) -> Self {
        Self::new(detect_capabilities(probe))
    }

    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: &str) -> Option<&BackendDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The user's current override, or `Auto`.
    pub fn pinned(&self) -> &BackendChoice {
        &self.pinned
    }

    /// Resolve a choice without changing the pin.
    ///
    /// An explicit variant that needs a missing host feature is an error; it is
    /// never replaced by a weaker variant.
    pub fn resolve(&self, choice: &BackendChoice) -> Result<Selection, SelectionError> {
        let (id, request) = match choice {
            BackendChoice::Auto => return self.recommend(),
            BackendChoice::Explicit { id, variant } => (id, variant),
        };

        let descriptor = self
            .descriptor(id)
            .ok_or_else(|| SelectionError::UnknownBackend(id.clone()))?;
        if descriptor.status == ImplementationStatus::Planned {
            return Err(SelectionError::Planned(id.clone()));
        }

        let request = request.unwrap_or_default();
        let candidates: Vec<&Variant> = descriptor
            .variants
            .iter()
            .filter(|v| request.matches(v))
            .collect();
        let Some(first) = candidates.first() else {
            return Err(SelectionError::UnknownVariant {
                backend: id.clone(),
                requested: request.to_string(),
            });
        };

        match candidates
            .iter()
            .find(|v| self.capabilities.missing(v).is_none())
        {
            Some(variant) => Ok(Selection {
                backend_id: descriptor.id.to_string(),
                backend_name: descriptor.name.to_string(),
                variant: **variant,
            }),
            None => Err(SelectionError::CapabilityMismatch {
                backend: id.clone(),
                variant: first.label(),
                feature: self
                    .capabilities
                    .missing(first)
                    .unwrap_or(Feature::ParallelExtension),
            }),
        }
    }

    /// Best supported variant for this host.
    ///
    /// Among implemented, auto-eligible variants the host supports, prefer the
    /// largest input whose expected rate (scaled by the performance class) still
    /// reaches the target; otherwise the fastest one.
    pub fn recommend(&self) -> Result<Selection, SelectionError> {
        let factor = self.capabilities.estimated_performance_class.throughput_factor();
        let supported = self
            .descriptors
            .iter()
            .filter(|d| d.auto && d.status == ImplementationStatus::Implemented)
            .flat_map(|d| d.variants.iter().map(move |v| (d, v)))
            .filter(|(_, v)| self.capabilities.missing(v).is_none())
            .map(|(d, v)| (d, v, v.expected_fps as f64 * factor));

        let mut best: Option<(&BackendDescriptor, &Variant, f64)> = None;
        for candidate in supported {
            let better = match best {
                None => true,
                Some((_, current, current_fps)) => {
                    let meets = candidate.2 >= TARGET_FPS;
                    let current_meets = current_fps >= TARGET_FPS;
                    match (meets, current_meets) {
                        (true, false) => true,
                        (false, true) => false,
                        (true, true) => candidate.1.resolution.area() > current.resolution.area(),
                        (false, false) => candidate.2 > current_fps,
                    }
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|(d, v, _)| Selection {
            backend_id: d.id.to_string(),
            backend_name: d.name.to_string(),
            variant: *v,
        })
        .ok_or(SelectionError::NoneSupported)
    }

    /// Resolve and pin. `Auto` clears any previous override.
    pub fn select(&mut self, choice: BackendChoice) -> Result<Selection, SelectionError> {
        let selection = self.resolve(&choice)?;
        self.pinned = choice;
        Ok(selection)
    }

    /// Selection for whatever is currently pinned.
    pub fn current(&self) -> Result<Selection, SelectionError> {
        self.resolve(&self.pinned)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn caps(parallel: bool, gpu: bool, tier2: bool, class: PerformanceClass) -> Capabilities {
        Capabilities {
            parallel_extension_supported: parallel,
            gpu_acceleration_supported: gpu,
            gpu_acceleration_tier2_supported: tier2,
            estimated_performance_class: class,
            benchmark_ms: 1.0,
        }
    }

    /// Two implemented test backends, `a` (cpu) and `b` (cpu + cuda), plus a planned one.
    pub(crate) fn test_registry(capabilities: Capabilities) -> Registry {
        Registry::with_descriptors(
            vec![
                BackendDescriptor {
                    id: "a",
                    name: "Backend A",
                    status: ImplementationStatus::Implemented,
                    auto: true,
                    variants: vec![Variant::new(Resolution::new(160, 120), BackendKind::Cpu, false, 60)],
                },
                BackendDescriptor {
                    id: "b",
                    name: "Backend B",
                    status: ImplementationStatus::Implemented,
                    auto: true,
                    variants: vec![
                        Variant::new(Resolution::new(256, 256), BackendKind::Cpu, true, 30),
                        Variant::new(Resolution::new(512, 512), BackendKind::Cuda, false, 40),
                    ],
                },
                BackendDescriptor {
                    id: "later",
                    name: "Later",
                    status: ImplementationStatus::Planned,
                    auto: true,
                    variants: vec![Variant::new(Resolution::new(64, 64), BackendKind::Cpu, false, 90)],
                },
            ],
            capabilities,
        )
    }

    struct FakeProbe(Duration);

    impl HostProbe for FakeProbe {
        fn parallel_extension(&self) -> bool {
            true
        }
        fn gpu_acceleration(&self) -> bool {
            false
        }
        fn gpu_tier2(&self) -> bool {
            true
        }
        fn benchmark(&self) -> Duration {
            self.0
        }
    }

    #[test]
    fn detection_classifies_benchmark() {
        let fast = detect_capabilities(&FakeProbe(Duration::from_millis(2)));
        assert_eq!(fast.estimated_performance_class, PerformanceClass::High);
        assert!(fast.parallel_extension_supported);
        // tier 2 implies tier 1
        assert!(!fast.gpu_acceleration_tier2_supported);

        let slow = detect_capabilities(&FakeProbe(Duration::from_millis(40)));
        assert_eq!(slow.estimated_performance_class, PerformanceClass::Low);
    }

    #[test]
    fn benchmark_is_bounded() {
        assert!(run_benchmark(10_000) < Duration::from_secs(1));
    }

    #[test]
    fn explicit_unsupported_variant_is_rejected() {
        let registry = test_registry(caps(true, false, false, PerformanceClass::High));
        let err = registry
            .resolve(&BackendChoice::explicit("b", Some("512x512:cuda".parse().unwrap())))
            .unwrap_err();
        assert_eq!(
            err,
            SelectionError::CapabilityMismatch {
                backend: "b".into(),
                variant: "512x512:cuda".into(),
                feature: Feature::GpuAcceleration,
            }
        );
    }

    #[test]
    fn explicit_without_variant_picks_first_supported() {
        let registry = test_registry(caps(false, true, false, PerformanceClass::Medium));
        let selection = registry.resolve(&BackendChoice::explicit("b", None)).unwrap();
        assert_eq!(selection.variant.kind, BackendKind::Cuda);
    }

    #[test]
    fn unknown_and_planned_backends_fail() {
        let registry = test_registry(caps(true, true, true, PerformanceClass::High));
        assert_eq!(
            registry.resolve(&BackendChoice::explicit("zzz", None)),
            Err(SelectionError::UnknownBackend("zzz".into()))
        );
        assert_eq!(
            registry.resolve(&BackendChoice::explicit("later", None)),
            Err(SelectionError::Planned("later".into()))
        );
        assert!(matches!(
            registry.resolve(&BackendChoice::explicit("a", Some("cuda".parse().unwrap()))),
            Err(SelectionError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn recommendation_follows_host_class() {
        let low = test_registry(caps(false, false, false, PerformanceClass::Low));
        assert_eq!(low.recommend().unwrap().backend_id, "a");

        let gpu = test_registry(caps(true, true, false, PerformanceClass::High));
        let pick = gpu.recommend().unwrap();
        assert_eq!(pick.backend_id, "b");
        assert_eq!(pick.variant.kind, BackendKind::Cuda);

        // 30 fps * 0.7 misses the target, 60 * 0.7 does not
        let medium = test_registry(caps(true, false, false, PerformanceClass::Medium));
        assert_eq!(medium.recommend().unwrap().backend_id, "a");
    }

    #[test]
    fn pin_persists_until_auto() {
        let mut registry = test_registry(caps(true, true, false, PerformanceClass::High));
        registry.select(BackendChoice::explicit("a", None)).unwrap();
        assert_eq!(registry.current().unwrap().backend_id, "a");
        assert_eq!(registry.current().unwrap().backend_id, "a");

        registry.select(BackendChoice::Auto).unwrap();
        assert_eq!(registry.pinned(), &BackendChoice::Auto);
        assert_eq!(registry.current().unwrap().backend_id, "b");
    }

    #[test]
    fn failed_select_keeps_previous_pin() {
        let mut registry = test_registry(caps(false, false, false, PerformanceClass::High));
        registry.select(BackendChoice::explicit("a", None)).unwrap();
        assert!(registry.select(BackendChoice::explicit("b", None)).is_err());
        assert_eq!(registry.current().unwrap().backend_id, "a");
    }

    #[test]
    fn variant_requests_parse() {
        let request: VariantRequest = "320x240:cpu".parse().unwrap();
        assert_eq!(request.resolution, Some(Resolution::new(320, 240)));
        assert_eq!(request.kind, Some(BackendKind::Cpu));
        let request: VariantRequest = "512".parse().unwrap();
        assert_eq!(request.resolution, Some(Resolution::new(512, 512)));
        assert!("fast".parse::<VariantRequest>().is_err());
    }

    #[test]
    fn builtin_catalogue_has_an_implemented_default() {
        let registry = Registry::new(caps(false, false, false, PerformanceClass::Low));
        let selection = registry.recommend().unwrap();
        assert_eq!(selection.backend_id, DIFFERENCE);
        assert_eq!(selection.variant.resolution, Resolution::new(160, 120));
    }
}
