//! Scheduler configuration.
//!
//! # Configuration Precedence
//!
//! 1. **Programmatic**: values set via builder methods (`max_fires_per_turn(10)`)
//! 2. **Environment variables**: values from `DEFERRED_*` env vars
//! 3. **Config file**: values loaded from TOML (requires `config-file` feature)
//! 4. **Defaults**: [`SchedulerConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `DEFERRED_START_TIME_NS` | `u64` | `start_time` |
//! | `DEFERRED_MAX_FIRES_PER_TURN` | `usize` | `max_fires_per_turn` |
//! | `DEFERRED_DEBUG` | `bool` | `debug_deferreds` |

use thiserror::Error;

use crate::types::Time;

/// Environment variable name for the virtual clock's start time.
pub const ENV_START_TIME_NS: &str = "DEFERRED_START_TIME_NS";
/// Environment variable name for the per-turn fire limit.
pub const ENV_MAX_FIRES_PER_TURN: &str = "DEFERRED_MAX_FIRES_PER_TURN";
/// Environment variable name for Deferred debug mode.
pub const ENV_DEBUG: &str = "DEFERRED_DEBUG";

/// Default bound on calls fired by one `advance`/`run_due` turn.
pub const DEFAULT_MAX_FIRES_PER_TURN: usize = 100_000;

/// Error raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable or key name.
        var: &'static str,
        /// Description of the accepted values.
        expected: &'static str,
        /// The rejected raw value.
        value: String,
    },
    /// The TOML document is malformed.
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Configuration for a [`Scheduler`](crate::time::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Initial reading of a virtual clock. Ignored for the wall clock.
    pub start_time: Time,
    /// Maximum calls fired by one turn; `None` means unlimited.
    pub max_fires_per_turn: Option<usize>,
    /// Record creation and resolution sites of Deferreds on this thread.
    pub debug_deferreds: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_time: Time::ZERO,
            max_fires_per_turn: Some(DEFAULT_MAX_FIRES_PER_TURN),
            debug_deferreds: false,
        }
    }
}

impl SchedulerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the virtual clock's initial reading.
    #[must_use]
    pub const fn start_time(mut self, start: Time) -> Self {
        self.start_time = start;
        self
    }

    /// Sets the per-turn fire limit; 0 removes the limit.
    #[must_use]
    pub const fn max_fires_per_turn(mut self, limit: usize) -> Self {
        self.max_fires_per_turn = if limit == 0 { None } else { Some(limit) };
        self
    }

    /// Enables or disables Deferred debug mode.
    #[must_use]
    pub const fn debug_deferreds(mut self, enabled: bool) -> Self {
        self.debug_deferreds = enabled;
        self
    }

    /// Builds a configuration from defaults plus `DEFERRED_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides read through `lookup`, which maps a variable name to
    /// its value when set.
    ///
    /// Only variables that are set are applied.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_START_TIME_NS) {
            self.start_time = Time::from_nanos(parse_u64(ENV_START_TIME_NS, &val)?);
        }
        if let Some(val) = lookup(ENV_MAX_FIRES_PER_TURN) {
            let limit = parse_usize(ENV_MAX_FIRES_PER_TURN, &val)?;
            self.max_fires_per_turn = (limit != 0).then_some(limit);
        }
        if let Some(val) = lookup(ENV_DEBUG) {
            self.debug_deferreds = parse_bool(ENV_DEBUG, &val)?;
        }
        Ok(())
    }

    /// Parses a TOML document, starting from defaults.
    ///
    /// ```toml
    /// [scheduler]
    /// start_time_ns = 1000
    /// max_fires_per_turn = 500
    /// debug_deferreds = true
    /// ```
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let parsed: TomlConfig = toml::from_str(toml_str)?;
        let mut config = Self::default();
        if let Some(v) = parsed.scheduler.start_time_ns {
            config.start_time = Time::from_nanos(v);
        }
        if let Some(v) = parsed.scheduler.max_fires_per_turn {
            config = config.max_fires_per_turn(v);
        }
        if let Some(v) = parsed.scheduler.debug_deferreds {
            config.debug_deferreds = v;
        }
        Ok(config)
    }
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
struct TomlConfig {
    #[serde(default)]
    scheduler: SchedulerToml,
}

#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
struct SchedulerToml {
    start_time_ns: Option<u64>,
    max_fires_per_turn: Option<usize>,
    debug_deferreds: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.start_time, Time::ZERO);
        assert_eq!(config.max_fires_per_turn, Some(DEFAULT_MAX_FIRES_PER_TURN));
        assert!(!config.debug_deferreds);
    }

    #[test]
    fn builder_zero_limit_means_unlimited() {
        let config = SchedulerConfig::new().max_fires_per_turn(0);
        assert_eq!(config.max_fires_per_turn, None);
        let config = config.max_fires_per_turn(7);
        assert_eq!(config.max_fires_per_turn, Some(7));
    }

    #[test]
    fn overrides_apply_only_set_vars() {
        let mut config = SchedulerConfig::new().debug_deferreds(true);
        config
            .apply_overrides(lookup_from(&[(ENV_START_TIME_NS, " 1500 ")]))
            .expect("valid overrides");
        assert_eq!(config.start_time, Time::from_nanos(1500));
        assert!(config.debug_deferreds);
        assert_eq!(config.max_fires_per_turn, Some(DEFAULT_MAX_FIRES_PER_TURN));
    }

    #[test]
    fn overrides_parse_bools_and_limits() {
        let mut config = SchedulerConfig::new();
        config
            .apply_overrides(lookup_from(&[
                (ENV_DEBUG, "yes"),
                (ENV_MAX_FIRES_PER_TURN, "0"),
            ]))
            .expect("valid overrides");
        assert!(config.debug_deferreds);
        assert_eq!(config.max_fires_per_turn, None);
    }

    #[test]
    fn invalid_value_names_variable() {
        let mut config = SchedulerConfig::new();
        let err = config
            .apply_overrides(lookup_from(&[(ENV_DEBUG, "maybe")]))
            .expect_err("invalid bool");
        let msg = err.to_string();
        assert!(msg.contains(ENV_DEBUG), "{msg}");
        assert!(msg.contains("maybe"), "{msg}");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_document_overrides_defaults() {
        let config = SchedulerConfig::from_toml_str(
            "[scheduler]\nstart_time_ns = 1000\nmax_fires_per_turn = 500\n",
        )
        .expect("valid toml");
        assert_eq!(config.start_time, Time::from_nanos(1000));
        assert_eq!(config.max_fires_per_turn, Some(500));
        assert!(!config.debug_deferreds);

        assert!(SchedulerConfig::from_toml_str("[scheduler\n").is_err());
    }
}
