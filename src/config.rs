//! Pipeline configuration
//!
//! All detection thresholds, windows, and TTLs are configurable; the defaults
//! match the reference deployment values.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Default rage-click detection window (milliseconds)
pub const DEFAULT_RAGE_CLICK_WINDOW_MS: i64 = 500;

/// Default minimum clicks on one target to count as a rage-click
pub const DEFAULT_RAGE_CLICK_MIN_COUNT: usize = 3;

/// Default hesitation dwell threshold (milliseconds)
pub const DEFAULT_HESITATION_THRESHOLD_MS: u64 = 3000;

/// Default friction score threshold for emitting a friction event
pub const DEFAULT_FRICTION_THRESHOLD: f64 = 0.1;

/// Default journey TTL (30 minutes)
pub const DEFAULT_JOURNEY_TTL_MS: i64 = 30 * 60 * 1000;

/// Default minimum interval between feedback prompts (milliseconds)
pub const DEFAULT_PROMPT_COOLDOWN_MS: i64 = 30_000;

/// Per-category weights for the friction score
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrictionWeights {
    pub rage_click: f64,
    pub hesitation: f64,
    pub backtrack: f64,
}

impl Default for FrictionWeights {
    fn default() -> Self {
        Self {
            rage_click: 0.3,
            hesitation: 0.2,
            backtrack: 0.2,
        }
    }
}

/// Configuration for the friction pipeline stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rage-click window, inclusive of the triggering click (milliseconds)
    pub rage_click_window_ms: i64,
    /// Minimum clicks on one target within the window
    pub rage_click_min_count: usize,
    /// Hesitation dwell threshold, boundary inclusive (milliseconds)
    pub hesitation_threshold_ms: u64,
    /// Hard cap on per-session buffered raw events
    pub buffer_max_events: usize,
    /// Age beyond which buffered events are trimmed once over the cap (milliseconds)
    pub buffer_max_age_ms: i64,
    /// Friction score weights
    pub friction_weights: FrictionWeights,
    /// Score above which a friction event is emitted
    pub friction_threshold: f64,
    /// Journey eviction TTL, measured from journey creation (milliseconds)
    pub journey_ttl_ms: i64,
    /// Minimum interval between feedback prompts per session (milliseconds)
    pub prompt_cooldown_ms: i64,
    /// Consent state attached by the enricher when none is known
    pub default_consent: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rage_click_window_ms: DEFAULT_RAGE_CLICK_WINDOW_MS,
            rage_click_min_count: DEFAULT_RAGE_CLICK_MIN_COUNT,
            hesitation_threshold_ms: DEFAULT_HESITATION_THRESHOLD_MS,
            buffer_max_events: 100,
            buffer_max_age_ms: 60_000,
            friction_weights: FrictionWeights::default(),
            friction_threshold: DEFAULT_FRICTION_THRESHOLD,
            journey_ttl_ms: DEFAULT_JOURNEY_TTL_MS,
            prompt_cooldown_ms: DEFAULT_PROMPT_COOLDOWN_MS,
            default_consent: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from JSON, validating ranges
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that thresholds and windows are usable
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.rage_click_min_count == 0 {
            return Err(PipelineError::ConfigError(
                "rage_click_min_count must be at least 1".to_string(),
            ));
        }
        if self.rage_click_window_ms <= 0 {
            return Err(PipelineError::ConfigError(
                "rage_click_window_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.friction_threshold) {
            return Err(PipelineError::ConfigError(format!(
                "friction_threshold must be within 0-1, got {}",
                self.friction_threshold
            )));
        }
        if self.journey_ttl_ms <= 0 {
            return Err(PipelineError::ConfigError(
                "journey_ttl_ms must be positive".to_string(),
            ));
        }
        if self.buffer_max_events == 0 {
            return Err(PipelineError::ConfigError(
                "buffer_max_events must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
