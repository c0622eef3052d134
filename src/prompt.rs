//! Declarative prompt templates.
//!
//! An `LLMPrompt` document holds system and user prompt templates keyed by
//! model. Selection returns the first template whose `model` matches
//! exactly, else the first whose `model-family` is a prefix of the model,
//! else the template registered for the synthetic model `"default"`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, DataObject};

/// The `kind` declared by prompt documents.
pub const KIND: &str = "LLMPrompt";

/// Model name selecting a template when nothing else matches.
pub const DEFAULT_MODEL: &str = "default";

/// One prompt template with its model selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// The template text.
    pub template: String,
    /// Exact model the template applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Model-family prefix the template applies to.
    #[serde(
        default,
        rename = "model-family",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_family: Option<String>,
}

impl PromptTemplate {
    /// Create a template bound to an exact model.
    #[must_use]
    pub fn for_model(model: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            model: Some(model.into()),
            model_family: None,
        }
    }

    /// Check the template's selectors are present and consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.is_none() && self.model_family.is_none() {
            return Err(ConfigError::InvalidValue(
                "at least one of `model` or `model-family` must be defined".to_string(),
            ));
        }
        if let (Some(model), Some(family)) = (&self.model, &self.model_family) {
            if !model.starts_with(family) {
                return Err(ConfigError::InvalidValue(format!(
                    "model `{model}` and model-family `{family}` are not compliant; use separate templates"
                )));
            }
        }
        Ok(())
    }

    /// Whether the template applies to the given model.
    #[must_use]
    pub fn is_compatible(&self, model: &str) -> bool {
        if self.model.as_deref() == Some(model) {
            return true;
        }
        self.model_family
            .as_deref()
            .is_some_and(|family| model.starts_with(family))
    }
}

/// Payload of an `LLMPrompt` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfigSpec {
    /// System prompt templates, most specific first.
    pub system: Vec<PromptTemplate>,
    /// Optional user prompt templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Vec<PromptTemplate>>,
}

/// A parsed `LLMPrompt` document.
pub type PromptConfigObject = DataObject<PromptConfigSpec>;

impl PromptConfigObject {
    /// Parse an `LLMPrompt` document from YAML text, validating every
    /// template selector.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let object = Self::from_yaml_str(text, KIND)?;
        if object.spec.system.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one system prompt must be defined".to_string(),
            ));
        }
        for template in object
            .spec
            .system
            .iter()
            .chain(object.spec.user.iter().flatten())
        {
            template.validate()?;
        }
        Ok(object)
    }

    /// Whether the document carries user prompt templates.
    #[must_use]
    pub fn has_user_prompt_template(&self) -> bool {
        self.spec.user.as_ref().is_some_and(|user| !user.is_empty())
    }

    /// The system prompt template for the given model.
    pub fn system_prompt_template(&self, model: &str) -> Result<&str, ConfigError> {
        select_template(&self.spec.system, model)
    }

    /// The user prompt template for the given model.
    pub fn user_prompt_template(&self, model: &str) -> Result<&str, ConfigError> {
        let user = self.spec.user.as_deref().unwrap_or_default();
        if user.is_empty() {
            return Err(ConfigError::InvalidValue(
                "no user prompt template provided".to_string(),
            ));
        }
        select_template(user, model)
    }
}

fn select_template<'a>(
    templates: &'a [PromptTemplate],
    model: &str,
) -> Result<&'a str, ConfigError> {
    // Exact model match wins over a family match, regardless of order.
    templates
        .iter()
        .find(|template| template.model.as_deref() == Some(model))
        .or_else(|| {
            templates.iter().find(|template| {
                template
                    .model_family
                    .as_deref()
                    .is_some_and(|family| model.starts_with(family))
            })
        })
        .or_else(|| {
            templates
                .iter()
                .find(|template| template.is_compatible(DEFAULT_MODEL))
        })
        .map(|template| template.template.as_str())
        .ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "no prompt template for model `{model}` nor a default one"
            ))
        })
}

/// Substitute `{name}` placeholders in a template.
#[must_use]
pub fn render_template(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (name, value) in variables {
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
kind: LLMPrompt
metadata:
  name: grading-prompts
spec:
  system:
    - model: gpt-4o
      template: exact template
    - model-family: gpt-4
      template: family template
    - model: default
      template: default template
  user:
    - model: default
      template: 'question: {question}'
";

    #[test]
    fn test_selection_prefers_exact_then_family_then_default() {
        let object = PromptConfigObject::from_yaml(SAMPLE).expect("parses");
        assert_eq!(
            object.system_prompt_template("gpt-4o").expect("exact"),
            "exact template"
        );
        assert_eq!(
            object.system_prompt_template("gpt-4-turbo").expect("family"),
            "family template"
        );
        assert_eq!(
            object.system_prompt_template("claude-3").expect("default"),
            "default template"
        );
    }

    #[test]
    fn test_exact_match_wins_over_an_earlier_family_match() {
        let text = r"
kind: LLMPrompt
metadata:
  name: ordering
spec:
  system:
    - model-family: gpt-4
      template: family template
    - model: gpt-4o
      template: exact template
";
        let object = PromptConfigObject::from_yaml(text).expect("parses");
        assert_eq!(
            object.system_prompt_template("gpt-4o").expect("exact"),
            "exact template"
        );
    }

    #[test]
    fn test_missing_default_fails() {
        let text = r"
kind: LLMPrompt
metadata:
  name: narrow
spec:
  system:
    - model: gpt-4o
      template: only
";
        let object = PromptConfigObject::from_yaml(text).expect("parses");
        assert!(object.system_prompt_template("other-model").is_err());
    }

    #[test]
    fn test_inconsistent_selectors_are_rejected() {
        let template = PromptTemplate {
            template: "x".to_string(),
            model: Some("claude-3".to_string()),
            model_family: Some("gpt".to_string()),
        };
        assert!(template.validate().is_err());

        let missing = PromptTemplate {
            template: "x".to_string(),
            model: None,
            model_family: None,
        };
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_user_template_and_rendering() {
        let object = PromptConfigObject::from_yaml(SAMPLE).expect("parses");
        assert!(object.has_user_prompt_template());
        let template = object.user_prompt_template("any-model").expect("default");

        let mut variables = BTreeMap::new();
        variables.insert("question".to_string(), "why?".to_string());
        assert_eq!(render_template(template, &variables), "question: why?");
    }
}
