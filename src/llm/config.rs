//! Declarative LLM configuration.
//!
//! An [`LlmConfigObject`] is the YAML description of a model wrapper: a
//! provider block with provider-specific settings, optional sampling
//! parameters and an optional fallback provider. Provider settings may
//! point at environment variables; values written in YAML override what
//! the environment provides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, DataObject, read_env_float, read_env_int, read_env_str};

/// The `kind` declared by LLM configuration documents.
pub const KIND: &str = "LLMConfig";

/// Sampling parameters recognized by the engine.
///
/// Ranges follow the chat-completion conventions: `temperature` in
/// `[0, 2]`, `top_p` in `[0, 1]`, penalties in `[-2, 2]`, counts positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParameters {
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling probability mass.
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff.
    pub top_k: Option<u32>,
    /// Number of choices to generate.
    pub n: u32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Presence penalty.
    pub presence_penalty: Option<f64>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmParameters {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: None,
            top_k: None,
            n: 1,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            timeout_secs: 30,
        }
    }
}

impl LlmParameters {
    /// Read parameter defaults from prefixed environment variables, e.g.
    /// `MYPROVIDER_TEMPERATURE` or `MYPROVIDER_MAX_TOKENS`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let mut parameters = Self::default();
        if let Some(value) = read_env_float(&format!("{prefix}_TEMPERATURE"))? {
            parameters.temperature = value;
        }
        parameters.top_p = read_env_float(&format!("{prefix}_TOP_P"))?;
        parameters.top_k = read_env_int(&format!("{prefix}_TOP_K"))?.map(|v| v.max(0) as u32);
        if let Some(value) = read_env_int(&format!("{prefix}_N"))? {
            parameters.n = value.max(0) as u32;
        }
        parameters.max_tokens =
            read_env_int(&format!("{prefix}_MAX_TOKENS"))?.map(|v| v.max(0) as u32);
        parameters.presence_penalty = read_env_float(&format!("{prefix}_PRESENCE_PENALTY"))?;
        parameters.frequency_penalty = read_env_float(&format!("{prefix}_FREQUENCY_PENALTY"))?;
        if let Some(value) = read_env_int(&format!("{prefix}_TIMEOUT"))? {
            parameters.timeout_secs = value.max(0) as u64;
        }
        parameters.validate()?;
        Ok(parameters)
    }

    /// Override these parameters with every value set in the spec.
    #[must_use]
    pub fn overridden_by(mut self, spec: &LlmParametersSpec) -> Self {
        if let Some(value) = spec.temperature {
            self.temperature = value;
        }
        if spec.top_p.is_some() {
            self.top_p = spec.top_p;
        }
        if spec.top_k.is_some() {
            self.top_k = spec.top_k;
        }
        if let Some(value) = spec.n {
            self.n = value;
        }
        if spec.max_tokens.is_some() {
            self.max_tokens = spec.max_tokens;
        }
        if spec.presence_penalty.is_some() {
            self.presence_penalty = spec.presence_penalty;
        }
        if spec.frequency_penalty.is_some() {
            self.frequency_penalty = spec.frequency_penalty;
        }
        if let Some(value) = spec.timeout {
            self.timeout_secs = value;
        }
        self
    }

    /// Check every parameter against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(condition: bool, message: &str) -> Result<(), ConfigError> {
            if condition {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue(message.to_string()))
            }
        }

        check(
            (0.0..=2.0).contains(&self.temperature),
            "temperature must be in [0, 2]",
        )?;
        if let Some(top_p) = self.top_p {
            check((0.0..=1.0).contains(&top_p), "top_p must be in [0, 1]")?;
        }
        if let Some(top_k) = self.top_k {
            check(top_k > 0, "top_k must be positive")?;
        }
        check(self.n > 0, "n must be positive")?;
        if let Some(max_tokens) = self.max_tokens {
            check(max_tokens > 0, "max_tokens must be positive")?;
        }
        if let Some(penalty) = self.presence_penalty {
            check(
                (-2.0..=2.0).contains(&penalty),
                "presence_penalty must be in [-2, 2]",
            )?;
        }
        if let Some(penalty) = self.frequency_penalty {
            check(
                (-2.0..=2.0).contains(&penalty),
                "frequency_penalty must be in [-2, 2]",
            )?;
        }
        check(self.timeout_secs > 0, "timeout must be positive")
    }
}

/// Sampling parameters as written in a configuration document.
///
/// Every field is optional so unset values fall back to environment or
/// built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmParametersSpec {
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Nucleus sampling probability mass.
    #[serde(alias = "top_p")]
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff.
    #[serde(alias = "top_k")]
    pub top_k: Option<u32>,
    /// Number of choices to generate.
    pub n: Option<u32>,
    /// Maximum tokens to generate.
    #[serde(alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    /// Presence penalty.
    #[serde(alias = "presence_penalty")]
    pub presence_penalty: Option<f64>,
    /// Frequency penalty.
    #[serde(alias = "frequency_penalty")]
    pub frequency_penalty: Option<f64>,
    /// Request timeout in seconds.
    pub timeout: Option<u64>,
}

/// Provider block of a configuration document.
///
/// The provider-specific settings live under a single provider key, e.g.
/// `openAISpec` or `mockSpec`; the engine treats the key as the provider's
/// kind and the nested mapping as its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProvider {
    /// The provider's display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Provider-specific settings keyed by provider kind.
    #[serde(flatten)]
    pub specs: BTreeMap<String, serde_yaml::Value>,
}

impl LlmProvider {
    /// The provider key of this block.
    pub fn provider_key(&self) -> Result<&str, ConfigError> {
        self.specs
            .keys()
            .next()
            .map(String::as_str)
            .ok_or_else(|| ConfigError::InvalidValue("provider block has no provider key".into()))
    }

    fn settings(&self) -> Result<&serde_yaml::Mapping, ConfigError> {
        let key = self.provider_key()?;
        self.specs
            .get(key)
            .and_then(serde_yaml::Value::as_mapping)
            .ok_or_else(|| {
                ConfigError::InvalidValue(format!("provider settings under '{key}' must be a map"))
            })
    }

    /// Look up a provider setting, resolving `fromEnvVar`/`default` blocks
    /// against the environment. YAML scalars win over environment values.
    pub fn get_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let settings = self.settings()?;
        let Some(value) = settings.get(key) else {
            return Ok(None);
        };

        if let Some(mapping) = value.as_mapping() {
            let default = mapping
                .get("default")
                .and_then(serde_yaml::Value::as_str)
                .map(str::to_string);
            let from_env = mapping
                .get("fromEnvVar")
                .and_then(serde_yaml::Value::as_str)
                .and_then(read_env_str);
            return Ok(from_env.or(default));
        }

        Ok(scalar_to_string(value))
    }

    /// Look up a required provider setting.
    pub fn must_get_value(&self, key: &str) -> Result<String, ConfigError> {
        self.get_value(key)?.ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "provider '{}' is missing required key '{key}'",
                self.name
            ))
        })
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text.clone()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Payload of an `LLMConfig` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfigSpec {
    /// What the configuration is for.
    #[serde(default)]
    pub description: String,
    /// The primary provider.
    pub provider: LlmProvider,
    /// Optional sampling parameters.
    #[serde(default)]
    pub parameters: Option<LlmParametersSpec>,
    /// Optional fallback provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<LlmProvider>,
}

/// A parsed `LLMConfig` document.
pub type LlmConfigObject = DataObject<LlmConfigSpec>;

impl LlmConfigObject {
    /// Parse an `LLMConfig` document from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Self::from_yaml_str(text, KIND)
    }
}

/// Runtime configuration snapshot of a model wrapper.
///
/// The snapshot participates in cache keys through
/// [`LlmConfiguration::as_string_map`], so every value that influences a
/// call's outcome belongs here.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfiguration {
    /// The provider kind, e.g. `mockSpec`.
    pub provider: String,
    /// The model identifier.
    pub model: String,
    /// Sampling parameters.
    pub parameters: LlmParameters,
    /// Additional provider settings.
    pub extra: BTreeMap<String, String>,
}

impl LlmConfiguration {
    /// Create a configuration with default parameters.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            parameters: LlmParameters::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Build a configuration from a parsed `LLMConfig` document.
    ///
    /// Parameter defaults come from environment variables prefixed with the
    /// upper-cased provider name; values set in the document override them.
    pub fn from_config(object: &LlmConfigObject) -> Result<Self, ConfigError> {
        let provider = &object.spec.provider;
        let key = provider.provider_key()?.to_string();
        let model = provider.must_get_value("model")?;

        let prefix = provider.name.to_uppercase().replace([' ', '-'], "_");
        let mut parameters = LlmParameters::from_env(&prefix)?;
        if let Some(spec) = &object.spec.parameters {
            parameters = parameters.overridden_by(spec);
        }
        parameters.validate()?;

        let mut extra = BTreeMap::new();
        for setting in provider.settings()?.keys() {
            if let Some(name) = setting.as_str() {
                if name == "model" {
                    continue;
                }
                if let Some(value) = provider.get_value(name)? {
                    extra.insert(name.to_string(), value);
                }
            }
        }

        Ok(Self {
            provider: key,
            model,
            parameters,
            extra,
        })
    }

    /// Flatten the configuration into the string map used by cache keys.
    #[must_use]
    pub fn as_string_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("provider".to_string(), self.provider.clone());
        map.insert("model".to_string(), self.model.clone());
        map.insert("temperature".to_string(), self.parameters.temperature.to_string());
        map.insert("n".to_string(), self.parameters.n.to_string());
        map.insert("timeout".to_string(), self.parameters.timeout_secs.to_string());
        if let Some(top_p) = self.parameters.top_p {
            map.insert("top_p".to_string(), top_p.to_string());
        }
        if let Some(top_k) = self.parameters.top_k {
            map.insert("top_k".to_string(), top_k.to_string());
        }
        if let Some(max_tokens) = self.parameters.max_tokens {
            map.insert("max_tokens".to_string(), max_tokens.to_string());
        }
        if let Some(penalty) = self.parameters.presence_penalty {
            map.insert("presence_penalty".to_string(), penalty.to_string());
        }
        if let Some(penalty) = self.parameters.frequency_penalty {
            map.insert("frequency_penalty".to_string(), penalty.to_string());
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
kind: LLMConfig
version: '0.1'
metadata:
  name: answering-model
spec:
  description: model used to answer user questions
  provider:
    name: mock
    description: scripted provider
    mockSpec:
      model: mock-small
      apiKey:
        fromEnvVar: COUNCIL_TEST_MOCK_KEY
        default: fallback-key
  parameters:
    temperature: 0.7
    maxTokens: 512
  fallbackProvider:
    name: backup
    mockSpec:
      model: mock-backup
";

    #[test]
    fn test_parse_llm_config_document() {
        let object = LlmConfigObject::from_yaml(SAMPLE).expect("parses");
        assert_eq!(object.metadata.name, "answering-model");
        assert_eq!(object.spec.provider.provider_key().expect("key"), "mockSpec");
        assert!(object.spec.fallback_provider.is_some());
    }

    #[test]
    fn test_configuration_resolution_and_env_fallback() {
        let object = LlmConfigObject::from_yaml(SAMPLE).expect("parses");
        let configuration = LlmConfiguration::from_config(&object).expect("resolves");
        assert_eq!(configuration.model, "mock-small");
        assert_eq!(configuration.parameters.temperature, 0.7);
        assert_eq!(configuration.parameters.max_tokens, Some(512));
        // Unset in YAML and env, so the built-in default applies.
        assert_eq!(configuration.parameters.n, 1);
        assert_eq!(configuration.parameters.timeout_secs, 30);
        // The env var is not set, so the declared default wins.
        assert_eq!(configuration.extra.get("apiKey").map(String::as_str), Some("fallback-key"));
    }

    #[test]
    fn test_parameter_validation() {
        let parameters = LlmParameters {
            temperature: 3.0,
            ..LlmParameters::default()
        };
        assert!(parameters.validate().is_err());

        let parameters = LlmParameters {
            top_p: Some(1.5),
            ..LlmParameters::default()
        };
        assert!(parameters.validate().is_err());

        assert!(LlmParameters::default().validate().is_ok());
    }

    #[test]
    fn test_string_map_is_deterministic() {
        let configuration = LlmConfiguration::new("mockSpec", "mock-small");
        let first = configuration.as_string_map();
        let second = configuration.as_string_map();
        assert_eq!(first, second);
        assert_eq!(first.get("model").map(String::as_str), Some("mock-small"));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let text = SAMPLE.replace("kind: LLMConfig", "kind: LLMPrompt");
        assert!(LlmConfigObject::from_yaml(&text).is_err());
    }
}
