//! Controller configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::factory::UnitTemplate;
use crate::store::DEFAULT_EVENTS_CAPACITY;

/// Configuration for the controller driving the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// First retry delay after a failed reconcile.
    #[serde(with = "duration_millis", default = "default_backoff_base")]
    pub backoff_base: Duration,

    /// Upper bound on the retry delay.
    #[serde(with = "duration_millis", default = "default_backoff_max")]
    pub backoff_max: Duration,

    /// Re-enqueue every task at this interval, in seconds.
    #[serde(with = "optional_duration_secs", default)]
    pub resync_interval: Option<Duration>,

    /// Buffer size of the store change feed.
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,

    /// Container settings for created units.
    #[serde(default)]
    pub unit: UnitTemplate,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            resync_interval: None,
            events_capacity: default_events_capacity(),
            unit: UnitTemplate::default(),
        }
    }
}

const fn default_workers() -> usize {
    4
}

const fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

const fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}

const fn default_events_capacity() -> usize {
    DEFAULT_EVENTS_CAPACITY
}

impl ControllerConfig {
    /// Set the number of workers.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry backoff bounds.
    #[must_use]
    pub const fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Enable periodic resync.
    #[must_use]
    pub const fn resync_every(mut self, interval: Duration) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the document does not parse or
    /// fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the file cannot be read, does not
    /// parse, or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `CNAT_*` environment overrides.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(workers) = env_parse::<usize>("CNAT_WORKERS") {
            self.workers = workers;
        }

        if let Ok(image) = std::env::var("CNAT_IMAGE") {
            self.unit.image = image;
        }

        if let Some(secs) = env_parse::<u64>("CNAT_RESYNC_SECS") {
            self.resync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        self
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Check the configuration for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::invalid_config("backoff_base must be positive"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::invalid_config(
                "backoff_base must not exceed backoff_max",
            ));
        }
        if self.events_capacity == 0 {
            return Err(Error::invalid_config("events_capacity must be at least 1"));
        }
        if self.resync_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::invalid_config("resync_interval must be positive"));
        }
        if self.unit.image.trim().is_empty() {
            return Err(Error::invalid_config("unit.image must not be empty"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %raw, "Ignoring unparseable override");
    }
    parsed
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
        assert_eq!(config.unit.image, "busybox");
        assert_eq!(config.resync_interval, None);
    }

    #[test]
    fn test_parse_toml() {
        let config = ControllerConfig::from_toml_str(
            r#"
            workers = 2
            backoff_base = 50
            backoff_max = 5000
            resync_interval = 30

            [unit]
            image = "alpine:3.20"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.backoff_base, Duration::from_millis(50));
        assert_eq!(config.backoff_max, Duration::from_secs(5));
        assert_eq!(config.resync_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.unit.image, "alpine:3.20");
        assert_eq!(config.unit.container_name, "busybox");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ControllerConfig::from_toml_str("workers = 0").is_err());
        assert!(ControllerConfig::from_toml_str("backoff_base = 10\nbackoff_max = 5").is_err());
        assert!(ControllerConfig::from_toml_str("resync_interval = 0").is_err());
        assert!(ControllerConfig::from_toml_str("workers = \"many\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers = 8").unwrap();

        let config = ControllerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 8);

        assert!(ControllerConfig::from_file("/nonexistent/cnat.toml").is_err());
    }

    #[test]
    fn test_toml_roundtrip_of_builder() {
        let config = ControllerConfig::default()
            .workers(3)
            .backoff(Duration::from_millis(10), Duration::from_secs(1))
            .resync_every(Duration::from_secs(15));
        let raw = toml::to_string(&config).unwrap();
        assert_eq!(ControllerConfig::from_toml_str(&raw).unwrap(), config);
    }
}
