//! Configuration loader with hierarchical merging.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. Config file (`apiary.toml` by default)
//! 3. Environment variables (`APIARY_*`)
//!
//! Each layer overrides the previous. A missing config file is silently
//! ignored; a present-but-broken one is an error.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ApiaryConfig, ConfigError};

/// Helper macro for parsing numeric environment variables.
macro_rules! parse_env_number {
    ($field:expr, $var:literal, $ty:ty) => {
        if let Ok(val) = std::env::var($var) {
            $field = val
                .trim()
                .parse::<$ty>()
                .map_err(|_| ConfigError::invalid_env_var($var, "expected number"))?;
        }
    };
}

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```
/// use apiary_runtime::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .skip_env_vars() // deterministic in tests
///     .load()
///     .expect("defaults always load");
/// assert_eq!(config.scheduling.ack_timeout_sec, 20);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Config file path; `apiary.toml` in the working directory when unset.
    config_path: Option<PathBuf>,
    /// Skip environment variable loading.
    skip_env: bool,
    /// Skip config file loading.
    skip_file: bool,
}

impl ConfigLoader {
    /// Creates a loader with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a custom config file path.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Skips environment variable loading. Useful for tests.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Skips config file loading.
    #[must_use]
    pub fn skip_config_file(mut self) -> Self {
        self.skip_file = true;
        self
    }

    /// Loads and merges configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a config file exists but cannot be
    /// read or parsed, or when an `APIARY_*` variable holds an
    /// unparsable value.
    pub fn load(&self) -> Result<ApiaryConfig, ConfigError> {
        let mut config = ApiaryConfig::default();

        if !self.skip_file {
            let path = self
                .config_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("apiary.toml"));
            if let Some(file_config) = Self::load_file(&path)? {
                debug!(path = %path.display(), "loaded config file");
                config.merge(&file_config);
            }
        }

        if !self.skip_env {
            Self::apply_env(&mut config)?;
        }

        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Option<ApiaryConfig>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = ApiaryConfig::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }

    fn apply_env(config: &mut ApiaryConfig) -> Result<(), ConfigError> {
        parse_env_number!(
            config.scheduling.ready_queue_capacity,
            "APIARY_READY_QUEUE_CAPACITY",
            usize
        );
        parse_env_number!(
            config.scheduling.per_drone_queue_capacity,
            "APIARY_PER_DRONE_QUEUE_CAPACITY",
            usize
        );
        parse_env_number!(
            config.scheduling.ack_timeout_sec,
            "APIARY_ACK_TIMEOUT_SEC",
            u64
        );
        parse_env_number!(
            config.scheduling.persona_missing_max_retries,
            "APIARY_PERSONA_MISSING_MAX_RETRIES",
            u32
        );
        parse_env_number!(
            config.limits.max_concurrent_sessions,
            "APIARY_MAX_CONCURRENT_SESSIONS",
            u32
        );
        parse_env_number!(config.limits.qps_per_drone, "APIARY_QPS_PER_DRONE", f64);
        if let Ok(val) = std::env::var("APIARY_API_KEY") {
            config.server.api_key = val;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file_or_env() {
        let config = ConfigLoader::new()
            .skip_env_vars()
            .skip_config_file()
            .load()
            .expect("load defaults");
        assert_eq!(config, ApiaryConfig::default());
    }

    #[test]
    fn missing_file_is_ignored() {
        let config = ConfigLoader::new()
            .with_config_path("/nonexistent/apiary.toml")
            .skip_env_vars()
            .load()
            .expect("missing file tolerated");
        assert_eq!(config, ApiaryConfig::default());
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("apiary-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("apiary.toml");
        std::fs::write(
            &path,
            r#"
            [scheduling]
            ack_timeout_sec = 2

            [server]
            api_key = "k"
            "#,
        )
        .expect("write temp config");

        let config = ConfigLoader::new()
            .with_config_path(&path)
            .skip_env_vars()
            .load()
            .expect("load file config");
        assert_eq!(config.scheduling.ack_timeout_sec, 2);
        assert_eq!(config.server.api_key, "k");
        assert_eq!(config.limits, ApiaryConfig::default().limits);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("apiary-config-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("apiary.toml");
        std::fs::write(&path, "scheduling = 3").expect("write temp config");

        let err = ConfigLoader::new()
            .with_config_path(&path)
            .skip_env_vars()
            .load()
            .expect_err("broken file rejected");
        assert!(matches!(err, ConfigError::Parse { .. }));

        std::fs::remove_dir_all(&dir).ok();
    }
}
