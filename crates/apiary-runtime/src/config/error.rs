//! Configuration layer errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`ConfigError::Io`] | `CONFIG_IO` | No |
//! | [`ConfigError::Parse`] | `CONFIG_PARSE` | No |
//! | [`ConfigError::InvalidEnvVar`] | `CONFIG_INVALID_ENV_VAR` | No |

use std::path::PathBuf;

use apiary_types::ErrorCode;
use thiserror::Error;

/// Failure loading or merging configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A config file exists but is not valid TOML for [`super::ApiaryConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },

    /// An `APIARY_*` environment variable held an unparsable value.
    #[error("invalid environment variable {var}: {reason}")]
    InvalidEnvVar {
        /// Variable name.
        var: &'static str,
        /// What was expected.
        reason: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid_env_var(var: &'static str, reason: &'static str) -> Self {
        Self::InvalidEnvVar { var, reason }
    }
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "CONFIG_IO",
            Self::Parse { .. } => "CONFIG_PARSE",
            Self::InvalidEnvVar { .. } => "CONFIG_INVALID_ENV_VAR",
        }
    }

    fn is_recoverable(&self) -> bool {
        // Bad config needs a human, not a retry.
        false
    }
}
