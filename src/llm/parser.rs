//! Typed parsing of LLM responses.
//!
//! A [`ResponseParser`] turns the free-form text of an [`LlmResponse`]
//! into a typed record. Schemas are described by explicit
//! [`FieldDescriptor`] lists rather than runtime reflection; each parser
//! derives a deterministic response template from its schema so prompts
//! and parsing cannot drift apart. Parse failures carry model-friendly
//! messages and feed the self-correction loop of
//! [`LlmFunction`](crate::llm::LlmFunction).

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::error::{FunctionError, LlmError};
use crate::llm::middleware::LlmResponse;

/// A fenced code block found in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// The fence language tag.
    pub language: String,
    /// The block body, without the fences.
    pub code: String,
}

/// Extract every fenced code block from a text.
#[must_use]
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut language: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match language.take() {
                Some(tag) => {
                    blocks.push(CodeBlock {
                        language: tag,
                        code: body.join("\n"),
                    });
                    body.clear();
                }
                None => {
                    language = Some(rest.trim().to_string());
                }
            }
        } else if language.is_some() {
            body.push(line);
        }
    }
    blocks
}

/// Find the first fenced block with the given language tag.
#[must_use]
pub fn find_code_block(text: &str, language: &str) -> Option<CodeBlock> {
    extract_code_blocks(text)
        .into_iter()
        .find(|block| block.language == language)
}

/// Render field values as fenced code blocks, one block per field.
#[must_use]
pub fn format_code_blocks(values: &[(String, String)]) -> String {
    let mut parts = Vec::with_capacity(values.len());
    for (name, value) in values {
        parts.push(format!("```{name}\n{value}\n```"));
    }
    parts.join("\n\n")
}

/// The primitive or composite type of a response field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// A boolean.
    Bool,
    /// An integer.
    Int,
    /// A float.
    Float,
    /// A free-form string.
    String,
    /// One of a fixed set of string values.
    Literal(Vec<String>),
    /// An optional value of the inner kind.
    Optional(Box<FieldKind>),
    /// A nested object described by its own fields.
    Nested(Vec<FieldDescriptor>),
    /// A list of values of the inner kind.
    List(Box<FieldKind>),
}

impl FieldKind {
    /// Whether the kind is representable as a single code block value.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        match self {
            Self::Bool | Self::Int | Self::Float | Self::String | Self::Literal(_) => true,
            Self::Optional(inner) => inner.is_primitive(),
            Self::Nested(_) | Self::List(_) => false,
        }
    }
}

/// Description of one field of a response schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// The field name, also used as the code-block language tag.
    pub name: String,
    /// What the model should put in the field.
    pub description: String,
    /// The field's type.
    pub kind: FieldKind,
}

impl FieldDescriptor {
    /// Create a field descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
        }
    }
}

/// A coerced field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    String(String),
    /// An absent optional value.
    Null,
}

fn coerce(name: &str, kind: &FieldKind, raw: &str) -> Result<FieldValue, LlmError> {
    let text = raw.trim();
    match kind {
        FieldKind::Bool => match text.to_lowercase().as_str() {
            "true" | "yes" => Ok(FieldValue::Bool(true)),
            "false" | "no" => Ok(FieldValue::Bool(false)),
            _ => Err(LlmError::parsing(format!(
                "field `{name}` must be a boolean (true or false), got `{text}`"
            ))),
        },
        FieldKind::Int => text.parse().map(FieldValue::Int).map_err(|_| {
            LlmError::parsing(format!("field `{name}` must be an integer, got `{text}`"))
        }),
        FieldKind::Float => text.parse().map(FieldValue::Float).map_err(|_| {
            LlmError::parsing(format!("field `{name}` must be a number, got `{text}`"))
        }),
        FieldKind::String => Ok(FieldValue::String(text.to_string())),
        FieldKind::Literal(allowed) => {
            if allowed.iter().any(|candidate| candidate == text) {
                Ok(FieldValue::String(text.to_string()))
            } else {
                Err(LlmError::parsing(format!(
                    "field `{name}` must be one of [{}], got `{text}`",
                    allowed.join(", ")
                )))
            }
        }
        FieldKind::Optional(inner) => {
            if text.is_empty() || text.eq_ignore_ascii_case("none") {
                Ok(FieldValue::Null)
            } else {
                coerce(name, inner, text)
            }
        }
        FieldKind::Nested(_) | FieldKind::List(_) => Err(LlmError::parsing(format!(
            "field `{name}` has a composite type and cannot be read from a code block"
        ))),
    }
}

/// The coerced fields of a code-blocks response.
#[derive(Debug, Clone, Default)]
pub struct ParsedFields {
    values: BTreeMap<String, FieldValue>,
}

impl ParsedFields {
    /// The raw value of a field, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    /// Read a required string field.
    pub fn get_str(&self, name: &str) -> Result<&str, LlmError> {
        match self.values.get(name) {
            Some(FieldValue::String(value)) => Ok(value),
            _ => Err(LlmError::parsing(format!("`{name}` block is not found"))),
        }
    }

    /// Read a required boolean field.
    pub fn get_bool(&self, name: &str) -> Result<bool, LlmError> {
        match self.values.get(name) {
            Some(FieldValue::Bool(value)) => Ok(*value),
            _ => Err(LlmError::parsing(format!("`{name}` block is not found"))),
        }
    }

    /// Read a required integer field.
    pub fn get_int(&self, name: &str) -> Result<i64, LlmError> {
        match self.values.get(name) {
            Some(FieldValue::Int(value)) => Ok(*value),
            _ => Err(LlmError::parsing(format!("`{name}` block is not found"))),
        }
    }

    /// Read a required float field, accepting integer values.
    pub fn get_float(&self, name: &str) -> Result<f64, LlmError> {
        match self.values.get(name) {
            Some(FieldValue::Float(value)) => Ok(*value),
            Some(FieldValue::Int(value)) => Ok(*value as f64),
            _ => Err(LlmError::parsing(format!("`{name}` block is not found"))),
        }
    }

    /// Read an optional string field.
    #[must_use]
    pub fn get_optional_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(FieldValue::String(value)) => Some(value),
            _ => None,
        }
    }
}

/// Turns an LLM response into a typed value.
pub trait ResponseParser<T>: Send + Sync {
    /// Parse the response.
    fn parse(&self, response: &LlmResponse) -> Result<T, FunctionError>;

    /// The response template this parser expects, when it has a schema.
    fn response_template(&self) -> Option<String> {
        None
    }
}

/// Parser returning the response's first choice verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringResponseParser;

impl ResponseParser<String> for StringResponseParser {
    fn parse(&self, response: &LlmResponse) -> Result<String, FunctionError> {
        Ok(response.first_choice().to_string())
    }
}

type BuildFn<T> = Box<dyn Fn(&ParsedFields) -> Result<T, LlmError> + Send + Sync>;
type Validator<T> = Box<dyn Fn(&T) -> Result<(), LlmError> + Send + Sync>;

/// Parser expecting one fenced code block per schema field, with the block
/// language equal to the field name. Only primitive field kinds are
/// supported.
pub struct CodeBlocksResponseParser<T> {
    fields: Vec<FieldDescriptor>,
    build: BuildFn<T>,
    validator: Option<Validator<T>>,
}

impl<T> std::fmt::Debug for CodeBlocksResponseParser<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBlocksResponseParser")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl<T> CodeBlocksResponseParser<T> {
    /// Create a parser from a schema and a record constructor.
    ///
    /// Every descriptor must have a primitive kind.
    pub fn new(
        fields: Vec<FieldDescriptor>,
        build: impl Fn(&ParsedFields) -> Result<T, LlmError> + Send + Sync + 'static,
    ) -> Result<Self, LlmError> {
        if let Some(composite) = fields.iter().find(|field| !field.kind.is_primitive()) {
            return Err(LlmError::parsing(format!(
                "field `{}` has a composite type; only primitive fields are supported in code blocks",
                composite.name
            )));
        }
        Ok(Self {
            fields,
            build: Box::new(build),
            validator: None,
        })
    }

    /// Attach a record validator running after construction.
    #[must_use]
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

impl<T: Send + Sync> ResponseParser<T> for CodeBlocksResponseParser<T> {
    fn parse(&self, response: &LlmResponse) -> Result<T, FunctionError> {
        let text = response.first_choice();
        let mut parsed = ParsedFields::default();
        for field in &self.fields {
            let block = match find_code_block(text, &field.name) {
                Some(block) => block,
                None => {
                    if matches!(field.kind, FieldKind::Optional(_)) {
                        parsed.values.insert(field.name.clone(), FieldValue::Null);
                        continue;
                    }
                    return Err(
                        LlmError::parsing(format!("`{}` block is not found", field.name)).into()
                    );
                }
            };
            let value = coerce(&field.name, &field.kind, &block.code)?;
            parsed.values.insert(field.name.clone(), value);
        }

        let record = (self.build)(&parsed)?;
        if let Some(validator) = &self.validator {
            validator(&record)?;
        }
        Ok(record)
    }

    fn response_template(&self) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            parts.push(format!("```{}\n{}\n```", field.name, field.description));
        }
        Some(parts.join("\n\n"))
    }
}

fn yaml_template(fields: &[FieldDescriptor], indent_level: usize) -> String {
    let indent = "  ".repeat(indent_level);
    let mut lines = Vec::new();
    for field in fields {
        match &field.kind {
            FieldKind::Nested(nested) => {
                lines.push(format!("{indent}{}: # {}", field.name, field.description));
                lines.push(yaml_template(nested, indent_level + 1));
            }
            FieldKind::List(inner) => match inner.as_ref() {
                FieldKind::Nested(nested) => {
                    lines.push(format!("{indent}{}: # {}", field.name, field.description));
                    lines.push(format!("{indent}- # Each element being:"));
                    lines.push(yaml_template(nested, indent_level + 1));
                }
                _ => {
                    lines.push(format!("{indent}{}: # {}", field.name, field.description));
                    lines.push(format!("{indent}- # One value per element"));
                }
            },
            _ if field.description.contains('\n') => {
                lines.push(format!("{indent}{}: |", field.name));
                for description_line in field.description.lines() {
                    lines.push(format!("{indent}  # {description_line}"));
                }
            }
            _ => {
                lines.push(format!("{indent}{}: # {}", field.name, field.description));
            }
        }
    }
    lines.join("\n")
}

/// Parser deserializing YAML responses into a typed record.
///
/// Expects a ```` ```yaml ```` block when `block_only` is set; otherwise
/// falls back to treating the entire response as YAML.
pub struct YamlResponseParser<T> {
    fields: Vec<FieldDescriptor>,
    block_only: bool,
    validator: Option<Validator<T>>,
    marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for YamlResponseParser<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YamlResponseParser")
            .field("block_only", &self.block_only)
            .finish_non_exhaustive()
    }
}

impl<T> YamlResponseParser<T> {
    /// Create a parser requiring a fenced `yaml` block.
    #[must_use]
    pub fn block(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            block_only: true,
            validator: None,
            marker: PhantomData,
        }
    }

    /// Create a parser accepting raw YAML or a fenced block.
    #[must_use]
    pub fn raw(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            block_only: false,
            validator: None,
            marker: PhantomData,
        }
    }

    /// Attach a record validator running after deserialization.
    #[must_use]
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

impl<T: DeserializeOwned + Send + Sync> ResponseParser<T> for YamlResponseParser<T> {
    fn parse(&self, response: &LlmResponse) -> Result<T, FunctionError> {
        let text = response.first_choice();
        let body = match find_code_block(text, "yaml") {
            Some(block) => block.code,
            None if self.block_only => {
                return Err(LlmError::parsing("```yaml``` block is not found").into());
            }
            None => text.to_string(),
        };

        let record: T = serde_yaml::from_str(&body)
            .map_err(|error| LlmError::parsing(format!("Error while parsing yaml: {error}")))?;
        if let Some(validator) = &self.validator {
            validator(&record)?;
        }
        Ok(record)
    }

    fn response_template(&self) -> Option<String> {
        let body = yaml_template(&self.fields, 0);
        if self.block_only {
            Some(format!("```yaml\n{body}\n```"))
        } else {
            Some(body)
        }
    }
}

fn json_template(fields: &[FieldDescriptor]) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for field in fields {
        let value = match &field.kind {
            FieldKind::Nested(nested) => json_template(nested),
            FieldKind::List(inner) => match inner.as_ref() {
                FieldKind::Nested(nested) => serde_json::json!([json_template(nested)]),
                _ => serde_json::json!([field.description.clone()]),
            },
            _ => serde_json::Value::String(field.description.clone()),
        };
        object.insert(field.name.clone(), value);
    }
    serde_json::Value::Object(object)
}

/// Parser deserializing JSON responses into a typed record.
///
/// Expects a ```` ```json ```` block when `block_only` is set; otherwise
/// falls back to treating the entire response as JSON.
pub struct JsonResponseParser<T> {
    fields: Vec<FieldDescriptor>,
    block_only: bool,
    validator: Option<Validator<T>>,
    marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for JsonResponseParser<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonResponseParser")
            .field("block_only", &self.block_only)
            .finish_non_exhaustive()
    }
}

impl<T> JsonResponseParser<T> {
    /// Create a parser requiring a fenced `json` block.
    #[must_use]
    pub fn block(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            block_only: true,
            validator: None,
            marker: PhantomData,
        }
    }

    /// Create a parser accepting raw JSON or a fenced block.
    #[must_use]
    pub fn raw(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields,
            block_only: false,
            validator: None,
            marker: PhantomData,
        }
    }

    /// Attach a record validator running after deserialization.
    #[must_use]
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

impl<T: DeserializeOwned + Send + Sync> ResponseParser<T> for JsonResponseParser<T> {
    fn parse(&self, response: &LlmResponse) -> Result<T, FunctionError> {
        let text = response.first_choice();
        let body = match find_code_block(text, "json") {
            Some(block) => block.code,
            None if self.block_only => {
                return Err(LlmError::parsing("```json``` block is not found").into());
            }
            None => text.to_string(),
        };

        let record: T = serde_json::from_str(body.trim())
            .map_err(|error| LlmError::parsing(format!("Error while parsing json: {error}")))?;
        if let Some(validator) = &self.validator {
            validator(&record)?;
        }
        Ok(record)
    }

    fn response_template(&self) -> Option<String> {
        let body = serde_json::to_string_pretty(&json_template(&self.fields)).ok()?;
        if self.block_only {
            Some(format!("```json\n{body}\n```"))
        } else {
            Some(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResult;
    use serde::Deserialize;
    use std::time::Duration;

    fn response(text: &str) -> LlmResponse {
        LlmResponse::new(LlmResult::new(vec![text.to_string()]), Duration::from_millis(1))
    }

    #[derive(Debug, PartialEq)]
    struct Verdict {
        keep: bool,
        score: f64,
        reason: String,
    }

    fn verdict_parser() -> CodeBlocksResponseParser<Verdict> {
        CodeBlocksResponseParser::new(
            vec![
                FieldDescriptor::new("keep", "true to keep the answer", FieldKind::Bool),
                FieldDescriptor::new("score", "score from 0 to 10", FieldKind::Float),
                FieldDescriptor::new("reason", "short justification", FieldKind::String),
            ],
            |fields| {
                Ok(Verdict {
                    keep: fields.get_bool("keep")?,
                    score: fields.get_float("score")?,
                    reason: fields.get_str("reason")?.to_string(),
                })
            },
        )
        .expect("primitive schema")
    }

    #[test]
    fn test_code_blocks_round_trip() {
        let parser = verdict_parser();
        let record = Verdict {
            keep: true,
            score: 7.5,
            reason: "relevant and specific".to_string(),
        };
        let formatted = format_code_blocks(&[
            ("keep".to_string(), record.keep.to_string()),
            ("score".to_string(), record.score.to_string()),
            ("reason".to_string(), record.reason.clone()),
        ]);

        let parsed = parser.parse(&response(&formatted)).expect("parses");
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_code_blocks_missing_field() {
        let parser = verdict_parser();
        let text = "```keep\ntrue\n```\n\n```score\n5\n```";
        let error = parser.parse(&response(text)).expect_err("missing reason");
        assert!(error.to_string().contains("`reason` block is not found"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_code_blocks_rejects_composite_fields() {
        let result = CodeBlocksResponseParser::<Verdict>::new(
            vec![FieldDescriptor::new(
                "nested",
                "a nested object",
                FieldKind::Nested(vec![]),
            )],
            |_| unreachable!("never built"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_literal_field_is_checked() {
        let parser = CodeBlocksResponseParser::new(
            vec![FieldDescriptor::new(
                "mode",
                "one of fast, thorough",
                FieldKind::Literal(vec!["fast".to_string(), "thorough".to_string()]),
            )],
            |fields| Ok(fields.get_str("mode")?.to_string()),
        )
        .expect("primitive schema");

        assert_eq!(
            parser.parse(&response("```mode\nfast\n```")).expect("parses"),
            "fast"
        );
        assert!(parser.parse(&response("```mode\nslow\n```")).is_err());
    }

    #[test]
    fn test_optional_field_defaults_to_null() {
        let parser = CodeBlocksResponseParser::new(
            vec![FieldDescriptor::new(
                "note",
                "optional note",
                FieldKind::Optional(Box::new(FieldKind::String)),
            )],
            |fields| Ok(fields.get_optional_str("note").map(str::to_string)),
        )
        .expect("primitive schema");

        assert_eq!(parser.parse(&response("no blocks at all")).expect("parses"), None);
    }

    #[test]
    fn test_template_is_deterministic() {
        let parser = verdict_parser();
        let template = parser.response_template().expect("template");
        assert!(template.contains("```keep"));
        assert!(template.contains("score from 0 to 10"));
        assert_eq!(parser.response_template().expect("template"), template);
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
    struct Plan {
        goal: String,
        steps: Vec<String>,
    }

    #[test]
    fn test_yaml_block_round_trip() {
        let parser: YamlResponseParser<Plan> = YamlResponseParser::block(vec![
            FieldDescriptor::new("goal", "what to achieve", FieldKind::String),
            FieldDescriptor::new("steps", "ordered steps", FieldKind::List(Box::new(FieldKind::String))),
        ]);
        let record = Plan {
            goal: "answer".to_string(),
            steps: vec!["search".to_string(), "summarize".to_string()],
        };
        let yaml = serde_yaml::to_string(&record).expect("serializes");
        let parsed = parser
            .parse(&response(&format!("```yaml\n{yaml}\n```")))
            .expect("parses");
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_yaml_block_required() {
        let parser: YamlResponseParser<Plan> = YamlResponseParser::block(vec![]);
        let error = parser.parse(&response("goal: x\nsteps: []")).expect_err("no block");
        assert!(error.to_string().contains("```yaml``` block is not found"));
    }

    #[test]
    fn test_raw_yaml_accepted_without_block() {
        let parser: YamlResponseParser<Plan> = YamlResponseParser::raw(vec![]);
        let parsed = parser
            .parse(&response("goal: x\nsteps:\n- a\n"))
            .expect("parses");
        assert_eq!(parsed.goal, "x");
    }

    #[test]
    fn test_json_round_trip_and_validator() {
        let parser: JsonResponseParser<Plan> = JsonResponseParser::raw(vec![])
            .with_validator(|plan: &Plan| {
                if plan.steps.is_empty() {
                    Err(LlmError::parsing("steps must not be empty"))
                } else {
                    Ok(())
                }
            });
        let record = Plan {
            goal: "answer".to_string(),
            steps: vec!["search".to_string()],
        };
        let json = serde_json::to_string(&record).expect("serializes");
        assert_eq!(parser.parse(&response(&json)).expect("parses"), record);

        let empty = serde_json::to_string(&Plan {
            goal: "answer".to_string(),
            steps: Vec::new(),
        })
        .expect("serializes");
        assert!(parser.parse(&response(&empty)).is_err());
    }

    #[test]
    fn test_yaml_template_nests_objects() {
        let parser: YamlResponseParser<Plan> = YamlResponseParser::block(vec![
            FieldDescriptor::new(
                "plan",
                "the plan",
                FieldKind::Nested(vec![FieldDescriptor::new(
                    "goal",
                    "what to achieve",
                    FieldKind::String,
                )]),
            ),
        ]);
        let template = parser.response_template().expect("template");
        assert!(template.contains("plan: # the plan"));
        assert!(template.contains("  goal: # what to achieve"));
    }

    #[test]
    fn test_extract_code_blocks_handles_multiple() {
        let text = "intro\n```a\n1\n```\nmiddle\n```b\n2\n3\n```\n";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "a");
        assert_eq!(blocks[1].code, "2\n3");
    }
}
