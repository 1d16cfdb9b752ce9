use crate::algorithms::LoadBalancerStrategy;
use crate::splitting::SplitLimits;
use crate::types::LoadManagerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Controller configuration. Store-persisted settings (strategy,
/// thresholds, factors) override these defaults at startup and on change.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadManagerConfig {
    pub strategy: LoadBalancerStrategy,

    /// A broker above this on any resource is overloaded.
    pub overload_threshold_pct: f64,
    /// A broker below this on every resource is underloaded.
    pub underload_threshold_pct: f64,
    /// A shed target must sit below this on every resource.
    pub comfort_load_threshold_pct: f64,

    /// Load-report write-back sensitivity, percent.
    pub report_threshold_pct: f64,
    pub max_report_interval_minutes: u64,

    pub shedding_grace_minutes: u64,
    pub shedding_interval_minutes: u64,

    pub auto_bundle_split_enabled: bool,
    pub splitting_interval_minutes: u64,
    pub max_topics_per_bundle: u64,
    pub max_sessions_per_bundle: u64,
    pub max_msg_rate_per_bundle: f64,
    /// Bytes/s.
    pub max_bandwidth_per_bundle: f64,
    pub max_bundle_count: usize,

    pub quota_write_interval_minutes: u64,
    /// Reproduce the historical cross-field bandwidth comparison in the
    /// quota compare-and-write path.
    pub legacy_bandwidth_compare: bool,
}

impl Default for LoadManagerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancerStrategy::LeastLoadedServer,
            overload_threshold_pct: 85.0,
            underload_threshold_pct: 50.0,
            comfort_load_threshold_pct: 65.0,
            report_threshold_pct: 10.0,
            max_report_interval_minutes: 15,
            shedding_grace_minutes: 30,
            shedding_interval_minutes: 5,
            auto_bundle_split_enabled: false,
            splitting_interval_minutes: 5,
            max_topics_per_bundle: 1000,
            max_sessions_per_bundle: 1000,
            max_msg_rate_per_bundle: 30_000.0,
            max_bandwidth_per_bundle: 100.0 * 1024.0 * 1024.0,
            max_bundle_count: 128,
            quota_write_interval_minutes: 15,
            legacy_bandwidth_compare: false,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, LoadManagerError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| LoadManagerError::Config(format!("{key}='{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

impl LoadManagerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Result<Self, LoadManagerError> {
        let defaults = Self::default();

        let strategy = match env::var("STRATUS_LB_STRATEGY") {
            Ok(raw) => match raw.as_str() {
                "leastLoadedServer" => LoadBalancerStrategy::LeastLoadedServer,
                "weightedRandomSelection" => LoadBalancerStrategy::WeightedRandomSelection,
                other => {
                    return Err(LoadManagerError::Config(format!(
                        "STRATUS_LB_STRATEGY='{other}' is not a known strategy"
                    )))
                }
            },
            Err(_) => defaults.strategy,
        };

        let config = Self {
            strategy,
            overload_threshold_pct: parse_env(
                "STRATUS_LB_OVERLOAD_THRESHOLD",
                defaults.overload_threshold_pct,
            )?,
            underload_threshold_pct: parse_env(
                "STRATUS_LB_UNDERLOAD_THRESHOLD",
                defaults.underload_threshold_pct,
            )?,
            comfort_load_threshold_pct: parse_env(
                "STRATUS_LB_COMFORT_THRESHOLD",
                defaults.comfort_load_threshold_pct,
            )?,
            report_threshold_pct: parse_env(
                "STRATUS_LB_REPORT_THRESHOLD",
                defaults.report_threshold_pct,
            )?,
            max_report_interval_minutes: parse_env(
                "STRATUS_LB_MAX_REPORT_INTERVAL_MINUTES",
                defaults.max_report_interval_minutes,
            )?,
            shedding_grace_minutes: parse_env(
                "STRATUS_LB_SHEDDING_GRACE_MINUTES",
                defaults.shedding_grace_minutes,
            )?,
            shedding_interval_minutes: parse_env(
                "STRATUS_LB_SHEDDING_INTERVAL_MINUTES",
                defaults.shedding_interval_minutes,
            )?,
            auto_bundle_split_enabled: parse_env(
                "STRATUS_LB_AUTO_SPLIT",
                defaults.auto_bundle_split_enabled,
            )?,
            splitting_interval_minutes: parse_env(
                "STRATUS_LB_SPLITTING_INTERVAL_MINUTES",
                defaults.splitting_interval_minutes,
            )?,
            max_topics_per_bundle: parse_env(
                "STRATUS_LB_MAX_TOPICS_PER_BUNDLE",
                defaults.max_topics_per_bundle,
            )?,
            max_sessions_per_bundle: parse_env(
                "STRATUS_LB_MAX_SESSIONS_PER_BUNDLE",
                defaults.max_sessions_per_bundle,
            )?,
            max_msg_rate_per_bundle: parse_env(
                "STRATUS_LB_MAX_MSG_RATE_PER_BUNDLE",
                defaults.max_msg_rate_per_bundle,
            )?,
            max_bandwidth_per_bundle: parse_env(
                "STRATUS_LB_MAX_BANDWIDTH_PER_BUNDLE",
                defaults.max_bandwidth_per_bundle,
            )?,
            max_bundle_count: parse_env("STRATUS_LB_MAX_BUNDLE_COUNT", defaults.max_bundle_count)?,
            quota_write_interval_minutes: parse_env(
                "STRATUS_LB_QUOTA_WRITE_INTERVAL_MINUTES",
                defaults.quota_write_interval_minutes,
            )?,
            legacy_bandwidth_compare: parse_env(
                "STRATUS_LB_LEGACY_BANDWIDTH_COMPARE",
                defaults.legacy_bandwidth_compare,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LoadManagerError> {
        if self.underload_threshold_pct >= self.overload_threshold_pct {
            return Err(LoadManagerError::Config(format!(
                "underload threshold {} must be below overload threshold {}",
                self.underload_threshold_pct, self.overload_threshold_pct
            )));
        }
        if self.comfort_load_threshold_pct > self.overload_threshold_pct {
            return Err(LoadManagerError::Config(format!(
                "comfort threshold {} must not exceed overload threshold {}",
                self.comfort_load_threshold_pct, self.overload_threshold_pct
            )));
        }
        Ok(())
    }

    pub fn split_limits(&self) -> SplitLimits {
        SplitLimits {
            max_topics: self.max_topics_per_bundle,
            max_sessions: self.max_sessions_per_bundle,
            max_msg_rate: self.max_msg_rate_per_bundle,
            max_bandwidth: self.max_bandwidth_per_bundle,
            max_bundle_count: self.max_bundle_count,
        }
    }

    pub fn shedding_grace(&self) -> Duration {
        Duration::from_secs(self.shedding_grace_minutes * 60)
    }

    pub fn max_report_interval(&self) -> Duration {
        Duration::from_secs(self.max_report_interval_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = LoadManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy, LoadBalancerStrategy::LeastLoadedServer);
        assert_eq!(config.overload_threshold_pct, 85.0);
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let config = LoadManagerConfig {
            underload_threshold_pct: 90.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_limits_projection() {
        let limits = LoadManagerConfig::default().split_limits();
        assert_eq!(limits.max_topics, 1000);
        assert_eq!(limits.max_bundle_count, 128);
    }
}
