//! Per-match configuration (spec §6).
//!
//! Grounded in the teacher's `echo_app_core::config` module: a plain,
//! serde-derived value type plus a thin `Error` enum wrapping `toml`'s parser
//! error, rather than a bespoke config DSL.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use duel_validator::ArenaBox;

/// Errors loading a [`MatchConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The input was not valid TOML, or did not match [`MatchConfig`]'s shape.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A loaded value failed [`MatchConfig::validate`].
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

/// Match-level configuration (spec §6 "Config (enumerated, per match)").
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchConfig {
    /// Total match length, in ticks.
    pub duration_ticks: u64,
    /// Wall-clock duration of one tick, in milliseconds.
    pub tick_period_ms: u64,
    /// Rollback window for an unconfirmed optimistic update, in ticks.
    pub optimistic_ttl_ticks: u64,
    /// Pot fraction retained by the operator on settlement, in `0.0..=1.0`.
    pub house_edge: f64,
    /// Stake wagered by each player, in base units. The settled pot is `2 * bet_amount`.
    pub bet_amount: u64,
    /// Cooldown applied after a `Normal` attack, in ticks; `Heavy` doubles it.
    pub base_cooldown_ticks: u64,
    /// Upper bound on any `Combat.cooldown_until_tick` delta, regardless of variant.
    pub max_cooldown_ticks: u64,
    /// Arena bounds actions are validated against.
    pub arena_box: ArenaBox,
    /// Maximum accepted actions per session per second.
    pub max_action_rate_per_session: u32,
    /// Flat fee charged to the pot on settlement, in base units.
    pub tx_fee: u64,
    /// Bound on in-flight settlement workers.
    pub max_concurrent_settlements: usize,
    /// Settlement job deadline, in milliseconds, before it is marked `Disputed`.
    pub job_ttl_ms: u64,
    /// Backoff delay before a settlement job's first retry, in milliseconds.
    pub settlement_base_backoff_ms: u64,
    /// Backoff multiplier applied per additional settlement retry.
    pub settlement_backoff_multiplier: f64,
    /// Backoff ceiling for settlement retries, in milliseconds.
    pub settlement_max_backoff_ms: u64,
    /// Maximum settlement submission attempts before a retryable error is treated as exhausted.
    pub settlement_max_attempts: u32,
}

impl MatchConfig {
    /// Spec-default configuration: 10000 ticks at 30ms (~5 minutes), 16-tick
    /// optimistic TTL (~500ms), 5% house edge, 30 actions/s per session.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            duration_ticks: 10_000,
            tick_period_ms: 30,
            optimistic_ttl_ticks: 16,
            house_edge: 0.05,
            bet_amount: 1_000,
            base_cooldown_ticks: 20,
            max_cooldown_ticks: 200,
            arena_box: ArenaBox {
                min_x: -1000,
                min_y: -1000,
                min_z: -1000,
                max_x: 1000,
                max_y: 1000,
                max_z: 1000,
            },
            max_action_rate_per_session: 30,
            tx_fee: 0,
            max_concurrent_settlements: 8,
            job_ttl_ms: 600_000,
            settlement_base_backoff_ms: 200,
            settlement_backoff_multiplier: 2.0,
            settlement_max_backoff_ms: 30_000,
            settlement_max_attempts: 5,
        }
    }

    /// Parses a [`MatchConfig`] from TOML text, then validates it.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would make the match engine's invariants unsatisfiable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_ticks == 0 {
            return Err(ConfigError::Invalid("duration_ticks must be nonzero"));
        }
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be nonzero"));
        }
        if !(0.0..=1.0).contains(&self.house_edge) {
            return Err(ConfigError::Invalid("house_edge must be within 0.0..=1.0"));
        }
        if self.optimistic_ttl_ticks == 0 {
            return Err(ConfigError::Invalid("optimistic_ttl_ticks must be nonzero"));
        }
        if self.base_cooldown_ticks > self.max_cooldown_ticks {
            return Err(ConfigError::Invalid(
                "base_cooldown_ticks must not exceed max_cooldown_ticks",
            ));
        }
        if self.max_concurrent_settlements == 0 {
            return Err(ConfigError::Invalid("max_concurrent_settlements must be nonzero"));
        }
        if self.settlement_max_attempts == 0 {
            return Err(ConfigError::Invalid("settlement_max_attempts must be nonzero"));
        }
        let pot = self.bet_amount.saturating_mul(2);
        let house_share = ((pot as f64) * self.house_edge).floor() as u64;
        if self.tx_fee > pot.saturating_sub(house_share) {
            return Err(ConfigError::Invalid(
                "tx_fee plus the house share must not exceed the pot",
            ));
        }
        Ok(())
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(MatchConfig::defaults().validate().is_ok());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = MatchConfig::defaults();
        let text = toml::to_string(&config).expect("serialize");
        let parsed = MatchConfig::from_toml(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn house_edge_out_of_range_is_rejected() {
        let mut config = MatchConfig::defaults();
        config.house_edge = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let text = format!(
            "{}\nbogus_field = 1\n",
            toml::to_string(&MatchConfig::defaults()).expect("serialize")
        );
        assert!(MatchConfig::from_toml(&text).is_err());
    }

    #[test]
    fn tx_fee_that_would_exceed_the_pot_after_house_share_is_rejected() {
        let mut config = MatchConfig::defaults();
        config.bet_amount = 10;
        config.house_edge = 1.0;
        config.tx_fee = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
