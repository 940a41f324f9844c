// ABOUTME: Environment creation request accepted by the environment manager
// ABOUTME: Serde model for the JSON request body plus structural validation

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub templates: Vec<TemplateRequest>,
    #[serde(default)]
    pub options: EnvironmentOptions,
}

/// One template invocation inside an environment request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub template: String,
    /// Fail unless the template's `info()` declares exactly this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentOptions {
    /// Terminate the environment unless kept alive within this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_secs: Option<u64>,
}

impl TemplateRequest {
    /// Invocation of `template`; non-object `parameters` count as none
    pub fn new(template: impl Into<String>, parameters: Value) -> Self {
        Self {
            template: template.into(),
            version: None,
            parameters: match parameters {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

/// At least one template, none of them unnamed
pub fn validate_templates(templates: &[TemplateRequest]) -> Result<()> {
    if templates.is_empty() {
        return Err(EngineError::Request(
            "at least one template is required".to_string(),
        ));
    }

    if let Some(t) = templates.iter().find(|t| t.template.trim().is_empty()) {
        return Err(EngineError::Request(format!(
            "template name is empty (parameters: {})",
            Value::Object(t.parameters.clone())
        )));
    }

    Ok(())
}

impl EnvironmentRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_template(mut self, template: impl Into<String>, parameters: Value) -> Self {
        self.templates.push(TemplateRequest::new(template, parameters));
        self
    }

    pub fn from_json(body: &str) -> Result<Self> {
        let request: Self =
            serde_json::from_str(body).map_err(|e| EngineError::Request(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(EngineError::Request("environment name is empty".to_string()));
        }

        let valid_name = name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid_name {
            return Err(EngineError::Request(format!(
                "environment name '{}' may only contain letters, digits, '_', '.' and '-'",
                self.name
            )));
        }

        validate_templates(&self.templates)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.options
            .keep_alive_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
