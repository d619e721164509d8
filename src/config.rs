//! Hybrid shuffle configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{Result, ShuffleError};

/// Which spilling strategy a result partition runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpillingStrategyType {
    /// Spill whole subpartitions once the write pool crosses a trigger threshold.
    #[default]
    Full,
    /// Spill individual buffers farthest from their reader's progress.
    Selective,
}

/// Order in which the full strategy visits subpartitions when spilling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpillOrder {
    /// Largest backlog first, ties broken by lower index.
    #[default]
    MostBacklogFirst,
    /// Most memory-resident buffers first, ties broken by lower index.
    MostResidentFirst,
    /// Ascending subpartition index.
    IndexOrder,
}

/// Configuration of the spilling strategy.
///
/// Ratios are relative to the capacity of the partition's write buffer pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridShuffleConfig {
    pub spilling_strategy: SpillingStrategyType,
    /// Full strategy: spill once this share of the write pool is in use.
    pub full_strategy_trigger_ratio: f64,
    /// Full strategy: absolute trigger, overriding the ratio when set.
    pub full_strategy_num_buffers_trigger_spilling: Option<usize>,
    /// Full strategy: keep spilling until usage drops below this share.
    pub full_strategy_release_ratio: f64,
    pub full_strategy_spill_order: SpillOrder,
    /// Selective strategy: start spilling once this share of the write pool is in use.
    pub selective_strategy_spill_threshold_ratio: f64,
    /// Selective strategy: share of the write pool to spill per decision.
    pub selective_strategy_spill_buffer_ratio: f64,
}

impl Default for HybridShuffleConfig {
    fn default() -> Self {
        Self {
            spilling_strategy: SpillingStrategyType::Full,
            full_strategy_trigger_ratio: 1.0,
            full_strategy_num_buffers_trigger_spilling: None,
            full_strategy_release_ratio: 0.5,
            full_strategy_spill_order: SpillOrder::MostBacklogFirst,
            selective_strategy_spill_threshold_ratio: 0.7,
            selective_strategy_spill_buffer_ratio: 0.4,
        }
    }
}

impl HybridShuffleConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the spilling strategy.
    pub fn with_spilling_strategy(mut self, strategy: SpillingStrategyType) -> Self {
        self.spilling_strategy = strategy;
        self
    }

    /// Sets the full strategy trigger ratio.
    pub fn with_full_strategy_trigger_ratio(mut self, ratio: f64) -> Self {
        self.full_strategy_trigger_ratio = ratio;
        self
    }

    /// Sets an absolute number of in-use buffers that triggers full spilling.
    pub fn with_full_strategy_num_buffers_trigger_spilling(mut self, num_buffers: usize) -> Self {
        self.full_strategy_num_buffers_trigger_spilling = Some(num_buffers);
        self
    }

    /// Sets the full strategy release ratio.
    pub fn with_full_strategy_release_ratio(mut self, ratio: f64) -> Self {
        self.full_strategy_release_ratio = ratio;
        self
    }

    /// Sets the order in which the full strategy picks subpartitions.
    pub fn with_full_strategy_spill_order(mut self, order: SpillOrder) -> Self {
        self.full_strategy_spill_order = order;
        self
    }

    /// Sets the selective strategy threshold ratio.
    pub fn with_selective_strategy_spill_threshold_ratio(mut self, ratio: f64) -> Self {
        self.selective_strategy_spill_threshold_ratio = ratio;
        self
    }

    /// Sets the selective strategy per-decision spill ratio.
    pub fn with_selective_strategy_spill_buffer_ratio(mut self, ratio: f64) -> Self {
        self.selective_strategy_spill_buffer_ratio = ratio;
        self
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ShuffleError::IoWithPath {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks that all ratios are usable.
    pub fn validate(&self) -> Result<()> {
        check_ratio("full_strategy_trigger_ratio", self.full_strategy_trigger_ratio)?;
        check_ratio("full_strategy_release_ratio", self.full_strategy_release_ratio)?;
        check_ratio(
            "selective_strategy_spill_threshold_ratio",
            self.selective_strategy_spill_threshold_ratio,
        )?;
        check_ratio(
            "selective_strategy_spill_buffer_ratio",
            self.selective_strategy_spill_buffer_ratio,
        )?;

        if self.full_strategy_release_ratio > self.full_strategy_trigger_ratio {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "full_strategy_release_ratio {} exceeds full_strategy_trigger_ratio {}",
                self.full_strategy_release_ratio, self.full_strategy_trigger_ratio
            )));
        }
        if self.full_strategy_num_buffers_trigger_spilling == Some(0) {
            return Err(ShuffleError::InvalidConfiguration(
                "full_strategy_num_buffers_trigger_spilling must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ShuffleError::InvalidConfiguration(format!(
            "{} must be in (0, 1], got {}",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HybridShuffleConfig::default();
        config.validate().unwrap();
        assert_eq!(config.spilling_strategy, SpillingStrategyType::Full);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = HybridShuffleConfig::from_json_str(
            r#"{"spilling_strategy": "SELECTIVE", "selective_strategy_spill_buffer_ratio": 0.25}"#,
        )
        .unwrap();
        assert_eq!(config.spilling_strategy, SpillingStrategyType::Selective);
        assert_eq!(config.selective_strategy_spill_buffer_ratio, 0.25);
        assert_eq!(config.full_strategy_release_ratio, 0.5);
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shuffle.json");
        let config = HybridShuffleConfig::new()
            .with_full_strategy_num_buffers_trigger_spilling(8)
            .with_full_strategy_spill_order(SpillOrder::IndexOrder);
        fs::write(&path, config.to_json_string().unwrap()).unwrap();

        assert_eq!(HybridShuffleConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let config = HybridShuffleConfig::new().with_full_strategy_trigger_ratio(1.5);
        assert!(matches!(
            config.validate(),
            Err(ShuffleError::InvalidConfiguration(_))
        ));

        let config = HybridShuffleConfig::new()
            .with_full_strategy_trigger_ratio(0.3)
            .with_full_strategy_release_ratio(0.6);
        assert!(config.validate().is_err());

        assert!(HybridShuffleConfig::from_json_str(r#"{"full_strategy_release_ratio": 0}"#).is_err());
    }
}
