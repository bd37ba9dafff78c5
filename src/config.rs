//! Core configuration
//!
//! Configuration tree for the memory engine: CRS weights and decay, tier
//! thresholds, retrieval and hybrid-ranking parameters, cache TTL, rate
//! limits, retention windows, and scheduler cadences. All structs carry the
//! documented defaults and are JSON-serializable; [`CoreConfig::validate`]
//! enforces the cross-field constraints (weight sums, positive rates, budget
//! ranges) before a core is constructed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};

/// Tolerance for floating-point weight-sum checks
const WEIGHT_SUM_TOLERANCE: f32 = 1e-4;

/// CRS component weights; must sum to 1.0
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CrsWeights {
    /// Weight of topic-centroid similarity
    pub sim: f32,
    /// Weight of the recurrence (access frequency) component
    pub recurrence: f32,
    /// Weight of aggregated outcome signal
    pub outcome: f32,
    /// Weight of the corrections signal
    pub corrections: f32,
    /// Weight of creation recency
    pub recency: f32,
}

impl Default for CrsWeights {
    fn default() -> Self {
        Self {
            sim: 0.35,
            recurrence: 0.20,
            outcome: 0.25,
            corrections: 0.10,
            recency: 0.10,
        }
    }
}

impl CrsWeights {
    /// Sum of all component weights
    pub fn sum(&self) -> f32 {
        self.sim + self.recurrence + self.outcome + self.corrections + self.recency
    }
}

/// CRS engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrsConfig {
    /// Component weights
    pub weights: CrsWeights,
    /// Exponential age decay rate per day
    pub decay_lambda_per_day: f32,
    /// Soft cap K for the recurrence component: `min(1, access_count / K)`
    pub recurrence_soft_cap: u32,
    /// Per-kind PII score penalties
    pub pii_penalties: HashMap<String, f32>,
    /// Cap on the summed PII penalty
    pub pii_penalty_cap: f32,
    /// Maximum outcome events retained per item (oldest evicted)
    pub outcome_log_cap: usize,
}

impl Default for CrsConfig {
    fn default() -> Self {
        let mut pii_penalties = HashMap::new();
        pii_penalties.insert("government_id".to_string(), 0.5);
        pii_penalties.insert("credit_card".to_string(), 0.4);
        pii_penalties.insert("email".to_string(), 0.1);
        pii_penalties.insert("phone".to_string(), 0.1);
        pii_penalties.insert("ip_address".to_string(), 0.05);

        Self {
            weights: CrsWeights::default(),
            decay_lambda_per_day: 0.02,
            recurrence_soft_cap: 5,
            pii_penalties,
            pii_penalty_cap: 0.5,
            outcome_log_cap: 64,
        }
    }
}

/// Tier transition thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    /// Minimum score for SHORT → MID
    pub short_to_mid_score: f32,
    /// Minimum access count for SHORT → MID
    pub short_to_mid_uses: u64,
    /// Minimum score for MID → LONG
    pub mid_to_long_score: f32,
    /// Minimum age in days for MID → LONG
    pub mid_to_long_age_days: i64,
    /// Minimum aggregated outcome for MID → LONG
    pub mid_to_long_outcome: f32,
    /// Score below which any tier demotes one step
    pub demotion_score: f32,
    /// Days of inactivity after which any tier demotes one step
    pub demotion_inactivity_days: i64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            short_to_mid_score: 0.65,
            short_to_mid_uses: 3,
            mid_to_long_score: 0.80,
            mid_to_long_age_days: 7,
            mid_to_long_outcome: 0.7,
            demotion_score: 0.35,
            demotion_inactivity_days: 30,
        }
    }
}

/// Archived-item retention windows, per source tier, in days
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionWindows {
    /// Days an archived SHORT item is kept before erasure
    pub short_days: i64,
    /// Days an archived MID item is kept before erasure
    pub mid_days: i64,
    /// Days an archived LONG item is kept before erasure
    pub long_days: i64,
}

impl Default for RetentionWindows {
    fn default() -> Self {
        Self {
            short_days: 7,
            mid_days: 14,
            long_days: 30,
        }
    }
}

/// Hybrid ranking weights used by the rehydration pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HybridWeights {
    /// Weight of vector similarity
    pub alpha: f32,
    /// Weight of last-used recency
    pub beta: f32,
    /// Weight of the item's outcome rate
    pub gamma: f32,
    /// Weight of the item's current retention score
    pub delta: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.2,
            gamma: 0.2,
            delta: 0.1,
        }
    }
}

/// Partial override of [`HybridWeights`] for a specific intent.
///
/// Unspecified components fall back to the base weights, so an override of
/// `{ alpha: 0.4, gamma: 0.3 }` keeps the default `beta` and `delta`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HybridOverride {
    /// Override for alpha, if set
    pub alpha: Option<f32>,
    /// Override for beta, if set
    pub beta: Option<f32>,
    /// Override for gamma, if set
    pub gamma: Option<f32>,
    /// Override for delta, if set
    pub delta: Option<f32>,
}

impl HybridOverride {
    /// Apply this override on top of base weights
    pub fn apply(&self, base: HybridWeights) -> HybridWeights {
        HybridWeights {
            alpha: self.alpha.unwrap_or(base.alpha),
            beta: self.beta.unwrap_or(base.beta),
            gamma: self.gamma.unwrap_or(base.gamma),
            delta: self.delta.unwrap_or(base.delta),
        }
    }
}

/// Candidate retrieval and ranking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of candidates fetched from the vector index
    pub k_candidates: usize,
    /// Minimum retention score for a candidate
    pub min_score: f32,
    /// Minimum vector similarity for a candidate; hits below the floor are
    /// noise for the summarizer and are dropped before ranking
    pub min_similarity: f32,
    /// Base hybrid ranking weights
    pub hybrid: HybridWeights,
    /// Per-intent overrides of the hybrid weights, keyed by intent tag
    pub intent_overrides: HashMap<String, HybridOverride>,
    /// Extra intent tags contributed by deployment configuration,
    /// each with its weighted match patterns
    pub extra_intents: HashMap<String, Vec<String>>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let mut intent_overrides = HashMap::new();
        intent_overrides.insert(
            "code-assist".to_string(),
            HybridOverride {
                alpha: Some(0.4),
                gamma: Some(0.3),
                ..Default::default()
            },
        );
        intent_overrides.insert(
            "research".to_string(),
            HybridOverride {
                alpha: Some(0.6),
                beta: Some(0.1),
                ..Default::default()
            },
        );

        Self {
            k_candidates: 100,
            min_score: 0.25,
            min_similarity: 0.1,
            hybrid: HybridWeights::default(),
            intent_overrides,
            extra_intents: HashMap::new(),
        }
    }
}

/// Rehydration budget and cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RehydrationConfig {
    /// Default token budget when the caller does not supply one
    pub default_token_budget: usize,
    /// Percent of the budget reserved for bundle overhead
    pub overhead_reserve_percent: u8,
    /// Bundle cache TTL in seconds
    pub cache_ttl_seconds: u64,
    /// Maximum cached bundles
    pub cache_capacity: u64,
    /// Maximum concurrent rehydrations before queueing
    pub max_concurrent: usize,
    /// Queue depth beyond which requests are shed with `Overloaded`
    pub queue_depth: usize,
}

impl Default for RehydrationConfig {
    fn default() -> Self {
        Self {
            default_token_budget: 2000,
            overhead_reserve_percent: 10,
            cache_ttl_seconds: 300,
            cache_capacity: 1024,
            max_concurrent: 32,
            queue_depth: 64,
        }
    }
}

/// Per-user rate limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Ingests allowed per minute
    pub ingests_per_minute: u64,
    /// Queries allowed per minute
    pub queries_per_minute: u64,
    /// Exports allowed per day
    pub exports_per_day: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ingests_per_minute: 100,
            queries_per_minute: 100,
            exports_per_day: 10,
        }
    }
}

/// Scheduler cadences, as cron expressions (seconds-resolution, UTC)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// CRS batch recompute cadence
    pub crs_recompute: String,
    /// Tier evaluation cadence (runs after recompute)
    pub tier_evaluation: String,
    /// Consolidation cadence (runs after evaluation)
    pub consolidation: String,
    /// Topic key rotation cadence
    pub key_rotation: String,
    /// Archive purge cadence
    pub archive_purge: String,
    /// Maximum retry attempts for transient job failures
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            crs_recompute: "0 0 2 * * * *".to_string(),
            tier_evaluation: "0 20 2 * * * *".to_string(),
            consolidation: "0 40 2 * * * *".to_string(),
            key_rotation: "0 0 4 * * Sun *".to_string(),
            archive_purge: "0 0 5 * * * *".to_string(),
            max_retries: 5,
        }
    }
}

/// Top-level configuration for a [`crate::core::MemoryCore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// CRS engine configuration
    pub crs: CrsConfig,
    /// Tier transition thresholds
    pub tiers: TierThresholds,
    /// Archived-item retention windows
    pub retention: RetentionWindows,
    /// Candidate retrieval and ranking
    pub retrieval: RetrievalConfig,
    /// Rehydration budget and cache
    pub rehydration: RehydrationConfig,
    /// Per-user rate limits
    pub rate_limits: RateLimitConfig,
    /// Scheduler cadences
    pub scheduler: SchedulerConfig,
    /// Whether compliance mode is on by default for queries
    pub compliance_mode_default: bool,
    /// Embedding dimension produced by the configured embedder
    pub embedding_dimension: usize,
}

impl CoreConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Validation(format!("cannot read config {path}: {e}")))?;
        let config: CoreConfig = serde_json::from_str(&contents)
            .map_err(|e| CoreError::Validation(format!("invalid config {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &str) -> CoreResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(CoreError::internal)?;
        std::fs::write(path, json)
            .map_err(|e| CoreError::Validation(format!("cannot write config {path}: {e}")))?;
        Ok(())
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> CoreResult<()> {
        let sum = self.crs.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(CoreError::Validation(format!(
                "crs.weights must sum to 1.0, got {sum}"
            )));
        }
        if self.crs.decay_lambda_per_day <= 0.0 {
            return Err(CoreError::Validation(
                "crs.decay_lambda_per_day must be positive".to_string(),
            ));
        }
        if self.crs.recurrence_soft_cap == 0 {
            return Err(CoreError::Validation(
                "crs.recurrence_soft_cap must be at least 1".to_string(),
            ));
        }
        if self.tiers.short_to_mid_score >= self.tiers.mid_to_long_score {
            return Err(CoreError::Validation(
                "tier.thresholds: short_to_mid_score must be below mid_to_long_score".to_string(),
            ));
        }
        if self.tiers.demotion_score >= self.tiers.short_to_mid_score {
            return Err(CoreError::Validation(
                "tier.thresholds: demotion_score must be below short_to_mid_score".to_string(),
            ));
        }
        if self.retrieval.k_candidates == 0 {
            return Err(CoreError::Validation(
                "retrieval.k_candidates must be at least 1".to_string(),
            ));
        }
        if self.rehydration.overhead_reserve_percent >= 100 {
            return Err(CoreError::Validation(
                "rehydration.overhead_reserve_percent must be below 100".to_string(),
            ));
        }
        if self.embedding_dimension == 0 {
            return Err(CoreError::Validation(
                "embedding_dimension must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl CoreConfig {
    /// Default configuration for the given embedding dimension
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            embedding_dimension: dimension,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> CoreConfig {
        CoreConfig::with_dimension(384)
    }

    #[test]
    fn test_default_config_is_valid() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = CrsWeights::default();
        assert!((w.sum() - 1.0).abs() < WEIGHT_SUM_TOLERANCE);
    }

    #[test]
    fn test_bad_weight_sum_rejected() {
        let mut config = valid_config();
        config.crs.weights.sim = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lambda_rejected() {
        let mut config = valid_config();
        config.crs.decay_lambda_per_day = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let config = CoreConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_intent_override_partial_application() {
        let base = HybridWeights::default();
        let config = RetrievalConfig::default();
        let code = config.intent_overrides.get("code-assist").unwrap();
        let applied = code.apply(base);
        assert_eq!(applied.alpha, 0.4);
        assert_eq!(applied.gamma, 0.3);
        // Unspecified components keep their base values
        assert_eq!(applied.beta, base.beta);
        assert_eq!(applied.delta, base.delta);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.embedding_dimension, 384);
        assert_eq!(back.rate_limits.ingests_per_minute, 100);
    }
}
