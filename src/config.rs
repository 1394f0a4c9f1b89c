use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StatsError;

const ENV_PREFIX: &str = "BATCH_STATS_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_cas_attempts: u32,
    pub cas_base_backoff_ms: u64,
    pub fallback_max_attempts: u32,
    pub fallback_backoff_ms: u64,
    /// Extra recompute passes allowed while ground truth keeps moving
    pub fallback_settle_rounds: u32,
    pub max_message_write_attempts: u32,
    pub audit_interval_ms: u64,
    pub audit_jitter_ms: u64,
    /// Terminal batches untouched for longer than this are skipped by the auditor
    pub retention_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 3,
            cas_base_backoff_ms: 10,
            fallback_max_attempts: 3,
            fallback_backoff_ms: 50,
            fallback_settle_rounds: 5,
            max_message_write_attempts: 3,
            audit_interval_ms: 5 * 60 * 1000,
            audit_jitter_ms: 0,
            retention_window_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), StatsError> {
        if self.max_cas_attempts == 0 {
            return Err(StatsError::Config("max_cas_attempts must be > 0".into()));
        }
        if self.fallback_max_attempts == 0 {
            return Err(StatsError::Config("fallback_max_attempts must be > 0".into()));
        }
        if self.fallback_settle_rounds == 0 {
            return Err(StatsError::Config("fallback_settle_rounds must be > 0".into()));
        }
        if self.max_message_write_attempts == 0 {
            return Err(StatsError::Config(
                "max_message_write_attempts must be > 0".into(),
            ));
        }
        if self.audit_interval_ms == 0 {
            return Err(StatsError::Config("audit_interval_ms must be > 0".into()));
        }
        if self.audit_jitter_ms >= self.audit_interval_ms {
            return Err(StatsError::Config(
                "audit_jitter_ms must be smaller than audit_interval_ms".into(),
            ));
        }
        Ok(())
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, StatsError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StatsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `BATCH_STATS_*` variables over the defaults.
    pub fn from_env() -> Result<Self, StatsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StatsError> {
        let mut config = Self::default();

        let read = |name: &str| -> Result<Option<u64>, StatsError> {
            let key = format!("{ENV_PREFIX}{name}");
            match lookup(&key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| StatsError::Config(format!("{key}: {e}"))),
            }
        };
        let read_u32 = |name: &str| -> Result<Option<u32>, StatsError> {
            read(name)?
                .map(|v| {
                    u32::try_from(v).map_err(|_| StatsError::Config(format!("{name} out of range")))
                })
                .transpose()
        };

        if let Some(v) = read_u32("MAX_CAS_ATTEMPTS")? {
            config.max_cas_attempts = v;
        }
        if let Some(v) = read("CAS_BASE_BACKOFF_MS")? {
            config.cas_base_backoff_ms = v;
        }
        if let Some(v) = read_u32("FALLBACK_MAX_ATTEMPTS")? {
            config.fallback_max_attempts = v;
        }
        if let Some(v) = read("FALLBACK_BACKOFF_MS")? {
            config.fallback_backoff_ms = v;
        }
        if let Some(v) = read_u32("FALLBACK_SETTLE_ROUNDS")? {
            config.fallback_settle_rounds = v;
        }
        if let Some(v) = read_u32("MAX_MESSAGE_WRITE_ATTEMPTS")? {
            config.max_message_write_attempts = v;
        }
        if let Some(v) = read("AUDIT_INTERVAL_MS")? {
            config.audit_interval_ms = v;
        }
        if let Some(v) = read("AUDIT_JITTER_MS")? {
            config.audit_jitter_ms = v;
        }
        if let Some(v) = read("RETENTION_WINDOW_MS")? {
            config.retention_window_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sleep before retry `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn cas_backoff(&self, attempt: u32) -> Duration {
        exponential(self.cas_base_backoff_ms, attempt)
    }

    pub fn fallback_backoff(&self, attempt: u32) -> Duration {
        exponential(self.fallback_backoff_ms, attempt)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.audit_interval_ms)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention_window_ms)
    }
}

fn exponential(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audit_interval(), Duration::from_secs(300));
    }

    #[test]
    fn cas_backoff_doubles() {
        let config = EngineConfig::default();
        assert_eq!(config.cas_backoff(1), Duration::from_millis(10));
        assert_eq!(config.cas_backoff(2), Duration::from_millis(20));
        assert_eq!(config.cas_backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn json_fills_in_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "max_cas_attempts": 5 }"#).unwrap();
        assert_eq!(config.max_cas_attempts, 5);
        assert_eq!(config.fallback_max_attempts, 3);

        assert!(EngineConfig::from_json_str(r#"{ "max_cas_attempts": 0 }"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("BATCH_STATS_AUDIT_INTERVAL_MS", "1000"),
            ("BATCH_STATS_AUDIT_JITTER_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config =
            EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.audit_interval_ms, 1000);
        assert_eq!(config.audit_jitter_ms, 250);
        assert_eq!(config.max_cas_attempts, 3);
    }

    #[test]
    fn env_rejects_garbage() {
        let result = EngineConfig::from_lookup(|key| {
            (key == "BATCH_STATS_MAX_CAS_ATTEMPTS").then(|| "three".to_string())
        });
        assert!(matches!(result, Err(StatsError::Config(_))));
    }
}
