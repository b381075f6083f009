//! Configuration surface for the engine's own knobs.
//!
//! Deliberately narrow: the processor chain and the Source/Sink instances
//! are constructed by the caller and handed to [`crate::Engine::new`]
//! directly, rather than looked up from a string-keyed plugin registry, so
//! this module only covers `worker_count`/`batch_size`/`batch_timeout`.
use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration::parse(&s).map_err(serde::de::Error::custom)
}

fn default_worker_count() -> usize {
    1
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Immutable, validated configuration for an [`crate::Engine`].
///
/// ```
/// use weir::config::EngineConfig;
/// use std::str::FromStr;
///
/// let cfg = EngineConfig::from_str("worker_count: 4\nbatch_size: 500\nbatch_timeout: 250ms").unwrap();
/// assert_eq!(cfg.worker_count, 4);
/// assert_eq!(cfg.batch_size, 500);
/// assert_eq!(cfg.batch_timeout, std::time::Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent processing worker tasks.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Flush threshold, in messages.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush threshold, in wall time, as a human-readable duration string
    /// (e.g. `"250ms"`, `"1s"`, `"5m"`).
    #[serde(
        default = "default_batch_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub batch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
        }
    }
}

impl FromStr for EngineConfig {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let cfg: EngineConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl EngineConfig {
    /// Checks the invariants the engine relies on (§3/§6 of the spec):
    /// `worker_count >= 1`, `batch_size >= 1`, `batch_timeout >= 1ms`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count < 1 {
            return Err(Error::Config("worker_count must be >= 1".into()));
        }
        if self.batch_size < 1 {
            return Err(Error::Config("batch_size must be >= 1".into()));
        }
        if self.batch_timeout < Duration::from_millis(1) {
            return Err(Error::Config("batch_timeout must be >= 1ms".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.batch_timeout, Duration::from_secs(1));
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let cfg = EngineConfig::from_str("worker_count: 8").unwrap();
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.batch_timeout, Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_worker_count() {
        let cfg = EngineConfig {
            worker_count: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let cfg = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sub_millisecond_timeout() {
        let cfg = EngineConfig {
            batch_timeout: Duration::from_micros(1),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_malformed_duration_string() {
        let result = EngineConfig::from_str("batch_timeout: not-a-duration");
        assert!(result.is_err());
    }
}
