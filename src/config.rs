//! Configuration for the rendering pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct is shared (behind an `Arc`) by
//! the pool, its workers and every processor, so a run can be logged or
//! diffed as a single value.
//!
//! Durations are stored as milliseconds so the config serialises cleanly;
//! accessor methods return [`Duration`]s.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Configuration for a [`crate::pool::WorkerPool`] and the processors using it.
///
/// # Example
/// ```rust
/// use pdfraster::{EngineStrategy, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .max_workers(2)
///     .engine_strategy(EngineStrategy::Shared)
///     .default_concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_workers, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on live workers in the pool. Default: 4.
    pub max_workers: usize,

    /// Number of coordinators (shared engines) in [`EngineStrategy::Shared`]
    /// mode. Ignored for dedicated engines. Default: 1.
    pub coordinator_count: usize,

    /// How workers obtain an engine. Default: [`EngineStrategy::Dedicated`].
    pub engine_strategy: EngineStrategy,

    /// How a new worker picks its coordinator. Default: least loaded.
    pub assignment: AssignmentPolicy,

    /// Concurrent in-flight page renders per processor. Default: 3.
    pub default_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,

    /// Inputs larger than this are rejected before reaching a worker. Default: 200 MiB.
    pub max_file_size: usize,

    /// Files up to this size use the small tier. Default: 10 MiB.
    pub small_tier_max_bytes: usize,
    /// Files up to this size (and above the small limit) use the medium tier. Default: 50 MiB.
    pub medium_tier_max_bytes: usize,

    pub small_tier: TierSettings,
    pub medium_tier: TierSettings,
    pub large_tier: TierSettings,

    /// Cached pages not accessed for this long are purged. Default: 5 min.
    pub cache_max_age_ms: u64,
    /// Period of the cache sweep. Default: 60 s.
    pub cache_sweep_interval_ms: u64,

    /// Retries per page after the first failure. Default: 3.
    pub max_retries: u32,
    /// First retry delay; doubles on every further attempt. Default: 500 ms.
    pub retry_base_delay_ms: u64,

    /// Per page-render timeout. Default: 30 s.
    pub request_timeout_ms: u64,
    /// Timeout for opening a document. Default: 60 s.
    pub init_timeout_ms: u64,

    /// How long `acquire_worker` waits for an idle worker at capacity. Default: 5 s.
    pub acquire_timeout_ms: u64,
    /// How long the pool waits for a worker to acknowledge its assignment. Default: 5 s.
    pub handshake_timeout_ms: u64,

    /// Orphaned results with no subscriber are kept this long. Default: 5 min.
    pub orphan_expiration_ms: u64,

    /// Grace window before a requested pool reset takes effect. Default: 100 ms.
    pub reset_grace_ms: u64,

    /// Hide internal worker errors behind a generic message. Default: false.
    pub mask_internal_errors: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            coordinator_count: 1,
            engine_strategy: EngineStrategy::default(),
            assignment: AssignmentPolicy::default(),
            default_concurrency: 3,
            min_concurrency: 1,
            max_concurrency: 8,
            max_file_size: 200 * MIB,
            small_tier_max_bytes: 10 * MIB,
            medium_tier_max_bytes: 50 * MIB,
            small_tier: TierSettings {
                scale: 2.0,
                quality: 90,
                max_dimension: 3000,
            },
            medium_tier: TierSettings {
                scale: 1.5,
                quality: 85,
                max_dimension: 2400,
            },
            large_tier: TierSettings {
                scale: 1.0,
                quality: 75,
                max_dimension: 2000,
            },
            cache_max_age_ms: 300_000,
            cache_sweep_interval_ms: 60_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            request_timeout_ms: 30_000,
            init_timeout_ms: 60_000,
            acquire_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            orphan_expiration_ms: 300_000,
            reset_grace_ms: 100,
            mask_internal_errors: false,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Pick the quality tier for a document of `len` bytes.
    pub fn tier_for(&self, len: usize) -> QualityTier {
        if len <= self.small_tier_max_bytes {
            QualityTier::Small
        } else if len <= self.medium_tier_max_bytes {
            QualityTier::Medium
        } else {
            QualityTier::Large
        }
    }

    pub fn tier_settings(&self, tier: QualityTier) -> TierSettings {
        match tier {
            QualityTier::Small => self.small_tier,
            QualityTier::Medium => self.medium_tier,
            QualityTier::Large => self.large_tier,
        }
    }

    /// Clamp a requested concurrency into the configured bounds.
    pub fn clamp_concurrency(&self, n: usize) -> usize {
        let min = self.min_concurrency.max(1);
        n.max(min).min(self.max_concurrency.max(min))
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_millis(self.cache_max_age_ms)
    }

    /// Never shorter than 1ms.
    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn orphan_expiration(&self) -> Duration {
        Duration::from_millis(self.orphan_expiration_ms)
    }

    pub fn reset_grace(&self) -> Duration {
        Duration::from_millis(self.reset_grace_ms)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn coordinator_count(mut self, n: usize) -> Self {
        self.config.coordinator_count = n.max(1);
        self
    }

    pub fn engine_strategy(mut self, strategy: EngineStrategy) -> Self {
        self.config.engine_strategy = strategy;
        self
    }

    pub fn assignment(mut self, policy: AssignmentPolicy) -> Self {
        self.config.assignment = policy;
        self
    }

    pub fn default_concurrency(mut self, n: usize) -> Self {
        self.config.default_concurrency = n;
        self
    }

    pub fn concurrency_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.min_concurrency = min;
        self.config.max_concurrency = max;
        self
    }

    pub fn max_file_size(mut self, bytes: usize) -> Self {
        self.config.max_file_size = bytes;
        self
    }

    pub fn tier_thresholds(mut self, small_max: usize, medium_max: usize) -> Self {
        self.config.small_tier_max_bytes = small_max;
        self.config.medium_tier_max_bytes = medium_max;
        self
    }

    pub fn tier(mut self, tier: QualityTier, settings: TierSettings) -> Self {
        match tier {
            QualityTier::Small => self.config.small_tier = settings,
            QualityTier::Medium => self.config.medium_tier = settings,
            QualityTier::Large => self.config.large_tier = settings,
        }
        self
    }

    pub fn cache_max_age_ms(mut self, ms: u64) -> Self {
        self.config.cache_max_age_ms = ms;
        self
    }

    pub fn cache_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.cache_sweep_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn init_timeout_ms(mut self, ms: u64) -> Self {
        self.config.init_timeout_ms = ms;
        self
    }

    pub fn acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.acquire_timeout_ms = ms;
        self
    }

    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.config.handshake_timeout_ms = ms;
        self
    }

    pub fn orphan_expiration_ms(mut self, ms: u64) -> Self {
        self.config.orphan_expiration_ms = ms;
        self
    }

    pub fn reset_grace_ms(mut self, ms: u64) -> Self {
        self.config.reset_grace_ms = ms;
        self
    }

    pub fn mask_internal_errors(mut self, v: bool) -> Self {
        self.config.mask_internal_errors = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl PipelineConfig {
    /// Check the constraints [`PipelineConfigBuilder::build`] enforces, for
    /// configs that did not come from the builder (e.g. deserialised ones).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = self;
        if c.min_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "minimum concurrency must be ≥ 1".into(),
            ));
        }
        if c.min_concurrency > c.max_concurrency {
            return Err(ConfigError::Invalid(format!(
                "concurrency bounds inverted: min {} > max {}",
                c.min_concurrency, c.max_concurrency
            )));
        }
        if c.default_concurrency < c.min_concurrency || c.default_concurrency > c.max_concurrency
        {
            return Err(ConfigError::Invalid(format!(
                "default concurrency {} outside {}..={}",
                c.default_concurrency, c.min_concurrency, c.max_concurrency
            )));
        }
        if c.small_tier_max_bytes > c.medium_tier_max_bytes {
            return Err(ConfigError::Invalid(
                "small tier threshold exceeds medium tier threshold".into(),
            ));
        }
        for (name, tier) in [
            ("small", c.small_tier),
            ("medium", c.medium_tier),
            ("large", c.large_tier),
        ] {
            if !(tier.scale > 0.0) || tier.max_dimension == 0 || tier.quality == 0 || tier.quality > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{name} tier settings out of range: {tier:?}"
                )));
            }
        }
        if c.cache_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cache sweep interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How workers get access to a render engine.
///
/// | Strategy | Engines | Parallelism | Memory |
/// |----------|---------|-------------|--------|
/// | `Dedicated` | one per worker | up to `max_workers` pages at once | highest |
/// | `Shared` | one per coordinator | up to `coordinator_count` pages at once | lowest |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineStrategy {
    /// Each worker owns its own engine instance.
    #[default]
    Dedicated,
    /// Workers forward to a coordinator that serialises one shared engine.
    Shared,
}

/// Coordinator selection for a newly created worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssignmentPolicy {
    RoundRobin,
    /// Fewest active requests, then fewest clients. (default)
    #[default]
    LeastLoaded,
}

/// Size bucket chosen once per document from its byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    Small,
    Medium,
    Large,
}

/// Rasterisation settings of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    /// Render scale relative to the page's natural size.
    pub scale: f32,
    /// Encoder quality, 1–100. 100 selects lossless output.
    pub quality: u8,
    /// Cap on the longest edge in pixels.
    pub max_dimension: u32,
}

/// Specifies which pages of the PDF to render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand into a sorted, deduplicated list of 1-indexed page numbers
    /// that exist in a document of `total_pages` pages.
    pub fn to_page_numbers(&self, total_pages: usize) -> Vec<usize> {
        let in_range = |p: &usize| *p >= 1 && *p <= total_pages;
        let mut pages: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => Some(*p).filter(in_range).into_iter().collect(),
            PageSelection::Range(start, end) => ((*start).max(1)..=(*end).min(total_pages)).collect(),
            PageSelection::Set(pages) => pages.iter().copied().filter(in_range).collect(),
        };
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = PipelineConfig::builder().build().expect("defaults are valid");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn tier_selection_uses_byte_thresholds() {
        let config = PipelineConfig::builder()
            .tier_thresholds(100, 1_000)
            .build()
            .unwrap();
        assert_eq!(config.tier_for(0), QualityTier::Small);
        assert_eq!(config.tier_for(100), QualityTier::Small);
        assert_eq!(config.tier_for(101), QualityTier::Medium);
        assert_eq!(config.tier_for(1_000), QualityTier::Medium);
        assert_eq!(config.tier_for(1_001), QualityTier::Large);
    }

    #[test]
    fn inverted_concurrency_bounds_rejected() {
        let err = PipelineConfig::builder()
            .concurrency_bounds(5, 2)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("inverted"), "got: {err}");
    }

    #[test]
    fn default_concurrency_must_sit_inside_bounds() {
        assert!(PipelineConfig::builder()
            .default_concurrency(20)
            .build()
            .is_err());
    }

    #[test]
    fn zero_quality_tier_rejected() {
        let result = PipelineConfig::builder()
            .tier(
                QualityTier::Large,
                TierSettings {
                    scale: 1.0,
                    quality: 0,
                    max_dimension: 1000,
                },
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn clamp_concurrency_respects_bounds() {
        let config = PipelineConfig::default();
        assert_eq!(config.clamp_concurrency(0), 1);
        assert_eq!(config.clamp_concurrency(4), 4);
        assert_eq!(config.clamp_concurrency(99), 8);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = PipelineConfig::builder()
            .engine_strategy(EngineStrategy::Shared)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn deserialised_config_is_validated_and_stays_usable() {
        let mut json = serde_json::to_value(PipelineConfig::default()).unwrap();
        json["cache_sweep_interval_ms"] = 0.into();
        json["min_concurrency"] = 6.into();
        json["max_concurrency"] = 2.into();
        let config: PipelineConfig = serde_json::from_value(json).unwrap();

        assert!(config.validate().is_err());
        assert_eq!(config.cache_sweep_interval(), Duration::from_millis(1));
        assert_eq!(config.clamp_concurrency(1), 6);
        assert_eq!(config.clamp_concurrency(10), 6);
    }

    #[test]
    fn page_selection_range_clipping() {
        assert_eq!(PageSelection::Range(3, 10).to_page_numbers(4), vec![3, 4]);
        assert_eq!(PageSelection::Single(9).to_page_numbers(4), Vec::<usize>::new());
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3, 0]).to_page_numbers(5),
            vec![1, 3]
        );
        assert_eq!(PageSelection::All.to_page_numbers(3), vec![1, 2, 3]);
    }
}
