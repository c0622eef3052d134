//! Engine configuration and declarative data objects.
//!
//! Environment lookup is confined to this module: an [`EngineConfig`] is
//! read once and threaded explicitly to whoever needs a default. YAML data
//! objects ([`DataObject`]) provide the shared `kind`/`metadata`/`spec`
//! envelope used by the LLM, prompt and dataset configurations.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::budget::Budget;

/// Environment variable holding the default budget duration in seconds.
pub const ENV_DEFAULT_BUDGET: &str = "COUNCIL_DEFAULT_BUDGET";

/// Environment variable holding the default LLM provider name.
pub const ENV_DEFAULT_LLM_PROVIDER: &str = "COUNCIL_DEFAULT_LLM_PROVIDER";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading a file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing YAML failed.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Serializing or parsing JSON failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A data object declared an unexpected kind.
    #[error("expected kind '{expected}', found '{actual}'")]
    UnexpectedKind {
        /// The kind required by the loader.
        expected: String,
        /// The kind found in the document.
        actual: String,
    },

    /// A required environment variable is not set.
    #[error("missing required environment variable: {0}")]
    MissingEnvVariable(String),

    /// An environment variable holds a value of the wrong type.
    #[error("environment variable {name} value '{value}' has invalid type, expected {expected}")]
    EnvVariableValue {
        /// The variable's name.
        name: String,
        /// The offending value.
        value: String,
        /// The expected type.
        expected: &'static str,
    },

    /// A configuration value is out of range or malformed.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Read an optional string environment variable.
#[must_use]
pub fn read_env_str(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Read a required string environment variable.
pub fn require_env_str(name: &str) -> Result<String, ConfigError> {
    read_env_str(name).ok_or_else(|| ConfigError::MissingEnvVariable(name.to_string()))
}

fn parse_env<T: std::str::FromStr>(
    name: &str,
    value: String,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::EnvVariableValue {
        name: name.to_string(),
        value,
        expected,
    })
}

/// Read an optional integer environment variable.
pub fn read_env_int(name: &str) -> Result<Option<i64>, ConfigError> {
    read_env_str(name)
        .map(|value| parse_env(name, value, "int"))
        .transpose()
}

/// Read an optional float environment variable.
pub fn read_env_float(name: &str) -> Result<Option<f64>, ConfigError> {
    read_env_str(name)
        .map(|value| parse_env(name, value, "float"))
        .transpose()
}

/// Read an optional boolean environment variable.
///
/// Accepts `true`/`false`, `1`/`0` and `t`/`f`, case-insensitively.
pub fn read_env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    read_env_str(name)
        .map(|value| match value.trim().to_lowercase().as_str() {
            "true" | "1" | "t" => Ok(true),
            "false" | "0" | "f" => Ok(false),
            _ => Err(ConfigError::EnvVariableValue {
                name: name.to_string(),
                value,
                expected: "bool",
            }),
        })
        .transpose()
}

/// Engine-wide defaults, read from the environment once and threaded
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Default budget duration in seconds.
    pub default_budget_secs: u64,
    /// Default LLM provider name, if configured.
    pub default_llm_provider: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_budget_secs: 30,
            default_llm_provider: None,
        }
    }
}

impl EngineConfig {
    /// Build the configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default_budget_secs = read_env_int(ENV_DEFAULT_BUDGET)?
            .map_or(Ok(30), |value| {
                u64::try_from(value).map_err(|_| ConfigError::EnvVariableValue {
                    name: ENV_DEFAULT_BUDGET.to_string(),
                    value: value.to_string(),
                    expected: "non-negative int",
                })
            })?;
        let default_llm_provider = read_env_str(ENV_DEFAULT_LLM_PROVIDER);
        Ok(Self {
            default_budget_secs,
            default_llm_provider,
        })
    }

    /// The default budget derived from this configuration.
    #[must_use]
    pub fn default_budget(&self) -> Budget {
        Budget::from_secs(self.default_budget_secs)
    }
}

/// Name and labels identifying a data object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObjectMetadata {
    /// The object's name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Declarative YAML envelope shared by the engine's configuration objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject<S> {
    /// The object kind, e.g. `LLMConfig`.
    pub kind: String,
    /// Optional schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Identity of the object.
    pub metadata: DataObjectMetadata,
    /// The kind-specific payload.
    pub spec: S,
}

impl<S: DeserializeOwned> DataObject<S> {
    /// Parse a data object from YAML text, checking its kind.
    pub fn from_yaml_str(text: &str, expected_kind: &str) -> Result<Self, ConfigError> {
        let object: Self = serde_yaml::from_str(text)?;
        if object.kind != expected_kind {
            return Err(ConfigError::UnexpectedKind {
                expected: expected_kind.to_string(),
                actual: object.kind,
            });
        }
        Ok(object)
    }

    /// Load a data object from a YAML file, checking its kind.
    pub async fn from_yaml_file(
        path: impl AsRef<Path>,
        expected_kind: &str,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        debug!(path = %path.display(), kind = expected_kind, "loaded data object");
        Self::from_yaml_str(&text, expected_kind)
    }
}
