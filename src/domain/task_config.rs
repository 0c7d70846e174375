//! Typed task configuration and parameter validation.
//!
//! A `TaskConfig` can only be obtained from `TaskConfigBuilder::build`, which
//! validates every supplied value against its declared definition and fills in
//! defaults. A built configuration is therefore always valid and immutable.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::scheduler::RetryPolicy;

/// Declared type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Integer,
    Float,
    String,
    Boolean,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A parameter value, tagged with its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Integer(_) => ParamType::Integer,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::String(_) => ParamType::String,
            ParamValue::Boolean(_) => ParamType::Boolean,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce to the declared type. Integers widen to floats; nothing else converts.
    fn coerce(self, expected: ParamType) -> std::result::Result<ParamValue, String> {
        match (self, expected) {
            (ParamValue::Integer(v), ParamType::Float) => Ok(ParamValue::Float(v as f64)),
            (ParamValue::Float(v), ParamType::Float) if !v.is_finite() => Err(format!("{} is not a finite number", v)),
            (value, expected) if value.param_type() == expected => Ok(value),
            (value, expected) => Err(format!("expected {}, got {}", expected, value.param_type())),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::String(v) => write!(f, "{:?}", v),
            ParamValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Integer(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Boolean(value)
    }
}

/// Constraints checked against a parameter's value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Inclusive numeric lower bound
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    pub max: Option<f64>,
    /// If non-empty, the value must equal one of these
    pub allowed: Vec<ParamValue>,
    /// Regex the whole string value must match
    pub pattern: Option<String>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.allowed.is_empty() && self.pattern.is_none()
    }
}

/// Definition of one named parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDefinition {
    pub name: String,
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    /// Parameters without a default are required
    #[serde(default)]
    pub default: Option<ParamValue>,
    #[serde(default)]
    pub constraints: Constraints,
}

impl ParamDefinition {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            default: None,
            constraints: Constraints::default(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn default_value(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.constraints.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.constraints.max = Some(max);
        self
    }

    pub fn allowed<V: Into<ParamValue>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.constraints.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.constraints.pattern = Some(pattern.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    /// Check the constraint set itself is coherent for this type.
    fn check_definition(&self) -> Result<Option<Regex>> {
        let numeric = matches!(self.param_type, ParamType::Integer | ParamType::Float);
        let c = &self.constraints;

        if (c.min.is_some() || c.max.is_some()) && !numeric {
            return Err(QueueError::validation(
                &self.name,
                format!("min/max constraints do not apply to {} parameters", self.param_type),
            ));
        }
        if let (Some(min), Some(max)) = (c.min, c.max)
            && min > max
        {
            return Err(QueueError::validation(
                &self.name,
                format!("min {} is greater than max {}", min, max),
            ));
        }

        match &c.pattern {
            Some(_) if self.param_type != ParamType::String => Err(QueueError::validation(
                &self.name,
                format!("pattern constraint does not apply to {} parameters", self.param_type),
            )),
            Some(pattern) => Regex::new(&format!("^(?:{})$", pattern))
                .map(Some)
                .map_err(|e| QueueError::validation(&self.name, format!("invalid pattern: {}", e))),
            None => Ok(None),
        }
    }

    /// Validate a value against type and constraints, returning the coerced value
    fn check_value(&self, value: ParamValue, pattern: Option<&Regex>) -> Result<ParamValue> {
        let value = value
            .coerce(self.param_type)
            .map_err(|reason| QueueError::validation(&self.name, reason))?;
        let c = &self.constraints;

        if let Some(number) = value.as_f64() {
            if let Some(min) = c.min
                && number < min
            {
                return Err(QueueError::validation(
                    &self.name,
                    format!("value {} is below minimum {}", value, min),
                ));
            }
            if let Some(max) = c.max
                && number > max
            {
                return Err(QueueError::validation(
                    &self.name,
                    format!("value {} is above maximum {}", value, max),
                ));
            }
        }

        if !c.allowed.is_empty() {
            let permitted = c.allowed.iter().any(|allowed| {
                allowed
                    .clone()
                    .coerce(self.param_type)
                    .map(|allowed| allowed == value)
                    .unwrap_or(false)
            });
            if !permitted {
                let choices: Vec<String> = c.allowed.iter().map(ToString::to_string).collect();
                return Err(QueueError::validation(
                    &self.name,
                    format!("value {} is not one of [{}]", value, choices.join(", ")),
                ));
            }
        }

        if let (Some(regex), Some(text)) = (pattern, value.as_str())
            && !regex.is_match(text)
        {
            return Err(QueueError::validation(
                &self.name,
                format!("value {} does not match pattern {:?}", value, c.pattern.as_deref().unwrap_or_default()),
            ));
        }

        Ok(value)
    }
}

/// A validated, immutable parameter set attached to a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    name: String,
    description: String,
    definitions: Vec<ParamDefinition>,
    values: BTreeMap<String, ParamValue>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl Default for TaskConfig {
    /// Parameterless configuration used when a task declares none
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: String::new(),
            definitions: Vec::new(),
            values: BTreeMap::new(),
            retry: None,
            timeout: None,
        }
    }
}

impl TaskConfig {
    pub fn builder(name: impl Into<String>) -> TaskConfigBuilder {
        TaskConfigBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Parameter definitions in declaration order
    pub fn definitions(&self) -> &[ParamDefinition] {
        &self.definitions
    }

    /// Resolved values, defaults included
    pub fn values(&self) -> &BTreeMap<String, ParamValue> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParamValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ParamValue::as_bool)
    }

    /// Per-task retry override; the scheduler default applies when absent
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Per-attempt execution deadline
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Collects definitions and inputs, then validates them in `build`
#[derive(Debug, Clone, Default)]
pub struct TaskConfigBuilder {
    name: String,
    description: String,
    definitions: Vec<ParamDefinition>,
    inputs: BTreeMap<String, ParamValue>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl TaskConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(mut self, definition: ParamDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn values<K, V>(mut self, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<ParamValue>,
    {
        for (name, value) in values {
            self.inputs.insert(name.into(), value.into());
        }
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate everything and produce an immutable configuration.
    ///
    /// All-or-nothing: on any error no configuration is produced.
    pub fn build(self) -> Result<TaskConfig> {
        if self.name.trim().is_empty() {
            return Err(QueueError::validation("name", "configuration name must not be empty"));
        }

        let mut seen = HashSet::new();
        for definition in &self.definitions {
            if !seen.insert(definition.name.as_str()) {
                return Err(QueueError::validation(&definition.name, "duplicate parameter definition"));
            }
        }

        if let Some(unknown) = self.inputs.keys().find(|name| !seen.contains(name.as_str())) {
            return Err(QueueError::validation(unknown, "unknown parameter"));
        }

        if let Some(policy) = &self.retry {
            policy.validate()?;
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(QueueError::validation("timeout", "timeout must be greater than zero"));
        }

        let mut values = BTreeMap::new();
        for definition in &self.definitions {
            let pattern = definition.check_definition()?;

            if let Some(default) = &definition.default {
                definition.check_value(default.clone(), pattern.as_ref()).map_err(|e| match e {
                    QueueError::Validation { param, reason } => {
                        QueueError::validation(param, format!("invalid default: {}", reason))
                    }
                    other => other,
                })?;
            }

            let value = match self.inputs.get(&definition.name) {
                Some(value) => value.clone(),
                None => match &definition.default {
                    Some(default) => default.clone(),
                    None => return Err(QueueError::validation(&definition.name, "missing required parameter")),
                },
            };

            let value = definition.check_value(value, pattern.as_ref())?;
            values.insert(definition.name.clone(), value);
        }

        Ok(TaskConfig {
            name: self.name,
            description: self.description,
            definitions: self.definitions,
            values,
            retry: self.retry,
            timeout: self.timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resize_builder() -> TaskConfigBuilder {
        TaskConfig::builder("resize")
            .param(ParamDefinition::new("width", ParamType::Integer).min(1.0).max(4096.0))
            .param(ParamDefinition::new("quality", ParamType::Float).default_value(0.8).min(0.0).max(1.0))
            .param(
                ParamDefinition::new("format", ParamType::String)
                    .default_value("png")
                    .allowed(["png", "jpeg", "webp"]),
            )
            .param(ParamDefinition::new("strip_metadata", ParamType::Boolean).default_value(true))
    }

    fn assert_validation(result: Result<TaskConfig>, expected_param: &str, reason_fragment: &str) {
        match result {
            Err(QueueError::Validation { param, reason }) => {
                assert_eq!(param, expected_param);
                assert!(reason.contains(reason_fragment), "reason was: {}", reason);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_build_fills_defaults() {
        let config = resize_builder().value("width", 800).build().unwrap();
        assert_eq!(config.name(), "resize");
        assert_eq!(config.get_i64("width"), Some(800));
        assert_eq!(config.get_f64("quality"), Some(0.8));
        assert_eq!(config.get_str("format"), Some("png"));
        assert_eq!(config.get_bool("strip_metadata"), Some(true));
        assert_eq!(config.values().len(), 4);
    }

    #[test]
    fn test_missing_required_parameter() {
        assert_validation(resize_builder().build(), "width", "missing required");
    }

    #[test]
    fn test_type_mismatch() {
        assert_validation(
            resize_builder().value("width", "wide").build(),
            "width",
            "expected integer, got string",
        );
    }

    #[test]
    fn test_integer_widens_to_float() {
        let config = resize_builder().value("width", 10).value("quality", 1).build().unwrap();
        assert_eq!(config.get("quality"), Some(&ParamValue::Float(1.0)));
    }

    #[test]
    fn test_min_and_max() {
        assert_validation(resize_builder().value("width", 0).build(), "width", "below minimum 1");
        assert_validation(resize_builder().value("width", 5000).build(), "width", "above maximum 4096");
    }

    #[test]
    fn test_allowed_values() {
        assert_validation(
            resize_builder().value("width", 10).value("format", "bmp").build(),
            "format",
            "not one of",
        );
    }

    #[test]
    fn test_pattern_must_match_whole_value() {
        let builder = || {
            TaskConfig::builder("tag").param(ParamDefinition::new("label", ParamType::String).pattern("[a-z]+-[0-9]+"))
        };
        assert!(builder().value("label", "build-42").build().is_ok());
        assert_validation(builder().value("label", "xbuild-42!").build(), "label", "does not match");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = TaskConfig::builder("bad")
            .param(ParamDefinition::new("label", ParamType::String).pattern("("))
            .value("label", "x")
            .build();
        assert_validation(result, "label", "invalid pattern");
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let result = TaskConfig::builder("dup")
            .param(ParamDefinition::new("n", ParamType::Integer).default_value(1))
            .param(ParamDefinition::new("n", ParamType::Float).default_value(1.0))
            .build();
        assert_validation(result, "n", "duplicate");
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        assert_validation(
            resize_builder().value("width", 1).value("height", 2).build(),
            "height",
            "unknown parameter",
        );
    }

    #[test]
    fn test_invalid_default_rejected() {
        let result = TaskConfig::builder("bad-default")
            .param(ParamDefinition::new("ratio", ParamType::Float).default_value(2.0).max(1.0))
            .build();
        assert_validation(result, "ratio", "invalid default");
    }

    #[test]
    fn test_min_on_string_rejected() {
        let result = TaskConfig::builder("x")
            .param(ParamDefinition::new("s", ParamType::String).min(1.0).default_value("a"))
            .build();
        assert_validation(result, "s", "do not apply");
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert_validation(
            resize_builder().value("width", 1).value("quality", f64::NAN).build(),
            "quality",
            "not a finite number",
        );
    }

    #[test]
    fn test_timeout_and_retry_carried() {
        let config = resize_builder()
            .value("width", 1)
            .timeout(Duration::from_millis(250))
            .retry(RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(100)))
            .build()
            .unwrap();
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.retry_policy().unwrap().max_retries, 5);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_validation(
            resize_builder().value("width", 1).timeout(Duration::ZERO).build(),
            "timeout",
            "greater than zero",
        );
    }

    #[test]
    fn test_param_value_deserializes_untagged() {
        let values: Vec<ParamValue> = serde_json::from_str(r#"[3, 2.5, "x", false]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ParamValue::Integer(3),
                ParamValue::Float(2.5),
                ParamValue::String("x".into()),
                ParamValue::Boolean(false)
            ]
        );
    }
}
